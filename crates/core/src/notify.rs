//! Builds notifications for lifecycle transitions and credential health.
//!
//! Emission is pure; persistence and dedup enforcement live in storage.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::token::ExpiryWindow;
use crate::types::{
    MentionState, NewNotification, NotificationKind, NotificationPriority, SocialMention,
};

pub const TARGET_MENTION: &str = "social_mention";
pub const TARGET_TOKEN: &str = "instagram_token";

/// Notification for a mention that just entered `state`. Completions stay silent.
pub fn for_mention_transition(
    mention: &SocialMention,
    state: MentionState,
) -> Option<NewNotification> {
    let handle = mention
        .instagram_username
        .as_deref()
        .map(|name| format!("@{name}"))
        .unwrap_or_else(|| mention.instagram_user_id.clone());

    let (kind, message) = match state {
        MentionState::FlaggedEarlyDelete => (
            NotificationKind::MentionEarlyDelete,
            format!("Story mention by {handle} was deleted before its 24h window ended"),
        ),
        MentionState::ExpiredUnknown => (
            NotificationKind::MentionExpiredUnknown,
            format!("Story mention by {handle} could not be verified after it expired"),
        ),
        MentionState::New | MentionState::Completed => return None,
    };

    Some(NewNotification {
        organization_id: mention.organization_id.clone(),
        kind,
        message,
        priority: NotificationPriority::Normal,
        target_type: Some(TARGET_MENTION),
        target_id: Some(mention.id.clone()),
        dedup_key: Some(format!("mention:{}:{}", mention.id, state.as_str())),
    })
}

/// Threshold notification for the organization's credential, if its window warrants one.
pub fn for_token_window(
    organization_id: &str,
    expiry: Option<DateTime<Utc>>,
    window: ExpiryWindow,
    days_left: Option<i64>,
) -> Option<NewNotification> {
    let (kind, priority, message) = match window {
        ExpiryWindow::Healthy => return None,
        ExpiryWindow::Warning => (
            NotificationKind::TokenExpiring,
            NotificationPriority::Normal,
            format!(
                "Instagram connection expires in {} days",
                days_left.unwrap_or_default()
            ),
        ),
        ExpiryWindow::Critical => (
            NotificationKind::TokenExpiring,
            NotificationPriority::High,
            "Instagram connection expires within a day".to_string(),
        ),
        ExpiryWindow::Expired => (
            NotificationKind::TokenExpired,
            NotificationPriority::High,
            "Instagram connection has expired; reconnect to resume tracking".to_string(),
        ),
    };

    Some(NewNotification {
        organization_id: organization_id.to_string(),
        kind,
        message,
        priority,
        target_type: Some(TARGET_TOKEN),
        target_id: None,
        dedup_key: Some(format!("token:{}:{}", window.as_str(), expiry_key(expiry))),
    })
}

/// High-priority notification raised when refreshing the credential failed.
pub fn for_refresh_failure(
    organization_id: &str,
    expiry: Option<DateTime<Utc>>,
    reason: &str,
) -> NewNotification {
    NewNotification {
        organization_id: organization_id.to_string(),
        kind: NotificationKind::TokenRefreshFailed,
        message: format!("Refreshing the Instagram connection failed: {reason}"),
        priority: NotificationPriority::High,
        target_type: Some(TARGET_TOKEN),
        target_id: None,
        dedup_key: Some(format!("token_refresh_failed:{}", expiry_key(expiry))),
    }
}

fn expiry_key(expiry: Option<DateTime<Utc>>) -> String {
    expiry
        .map(|value| value.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "none".to_string())
}
