use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifetime of an Instagram story; a mention expires exactly this long after it was posted.
pub const MENTION_TTL_HOURS: i64 = 24;

/// Upper bound for `checks_count`; reaching it without a resolution forces `expired_unknown`.
pub const MAX_MENTION_CHECKS: u32 = 3;

/// Computes the immutable expiry for a mention posted at `mentioned_at`.
pub fn mention_expires_at(mentioned_at: DateTime<Utc>) -> DateTime<Utc> {
    mentioned_at + Duration::hours(MENTION_TTL_HOURS)
}

/// Lifecycle state of a tracked mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionState {
    New,
    Completed,
    FlaggedEarlyDelete,
    ExpiredUnknown,
}

impl MentionState {
    /// Returns the canonical database representation for the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Completed => "completed",
            Self::FlaggedEarlyDelete => "flagged_early_delete",
            Self::ExpiredUnknown => "expired_unknown",
        }
    }

    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::New)
    }

    /// Returns `true` when a row in `self` may be rewritten to `next`.
    ///
    /// `new -> new` is allowed so that a check can be recorded without resolving the mention.
    pub fn can_transition_to(self, next: MentionState) -> bool {
        matches!((self, next), (Self::New, _))
    }
}

impl fmt::Display for MentionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MentionState {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "new" => Ok(Self::New),
            "completed" => Ok(Self::Completed),
            "flagged_early_delete" => Ok(Self::FlaggedEarlyDelete),
            "expired_unknown" => Ok(Self::ExpiredUnknown),
            other => Err(UnknownVariant::new("mention_state", other)),
        }
    }
}

/// How the account was referenced by the author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionType {
    Mention,
    Hashtag,
    Story,
    StoryReferral,
}

impl MentionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mention => "mention",
            Self::Hashtag => "hashtag",
            Self::Story => "story",
            Self::StoryReferral => "story_referral",
        }
    }
}

impl FromStr for MentionType {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "mention" => Ok(Self::Mention),
            "hashtag" => Ok(Self::Hashtag),
            "story" => Ok(Self::Story),
            "story_referral" => Ok(Self::StoryReferral),
            other => Err(UnknownVariant::new("mention_type", other)),
        }
    }
}

/// Error returned when a persisted enum column carries an unexpected value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Canonical story-mention record produced by the webhook normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct MentionEvent {
    /// External story/media identifier, the deduplication key within an organization.
    pub external_id: String,
    pub sender_id: String,
    pub sender_username: Option<String>,
    pub mention_type: MentionType,
    pub content: Option<String>,
    pub mentioned_at: DateTime<Utc>,
    /// `false` when `external_id` is not a story object the Graph API can resolve, e.g. a
    /// message id used as a fallback key. Such mentions complete on expiry without a probe.
    pub story_verifiable: bool,
    /// Original messaging item, retained for audit only.
    pub raw: Value,
}

/// Persisted mention tracked through the lifecycle state machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SocialMention {
    pub id: String,
    pub organization_id: String,
    pub instagram_story_id: String,
    pub instagram_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instagram_username: Option<String>,
    pub mention_type: MentionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip)]
    pub raw_data: String,
    pub story_verifiable: bool,
    pub mentioned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: MentionState,
    pub checks_count: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub reported_deleted_at: Option<DateTime<Utc>>,
    pub matched_ambassador_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SocialMention {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_reported_deleted(&self) -> bool {
        self.reported_deleted_at.is_some()
    }
}

/// Priority attached to a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
}

impl NotificationPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl FromStr for NotificationPriority {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(UnknownVariant::new("notification_priority", other)),
        }
    }
}

/// Kinds of notifications produced by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TokenExpiring,
    TokenExpired,
    TokenRefreshFailed,
    MentionEarlyDelete,
    MentionExpiredUnknown,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TokenExpiring => "token_expiring",
            Self::TokenExpired => "token_expired",
            Self::TokenRefreshFailed => "token_refresh_failed",
            Self::MentionEarlyDelete => "mention_early_delete",
            Self::MentionExpiredUnknown => "mention_expired_unknown",
        }
    }
}

/// Notification ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub organization_id: String,
    pub kind: NotificationKind,
    pub message: String,
    pub priority: NotificationPriority,
    pub target_type: Option<&'static str>,
    pub target_id: Option<String>,
    /// Identifies the condition that produced the notification; the store keeps one row per key.
    pub dedup_key: Option<String>,
}

/// Notification as read back from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: String,
    pub organization_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub priority: NotificationPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub read_status: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_exactly_one_day_after_mention() {
        let mentioned_at = DateTime::parse_from_rfc3339("2024-03-01T10:15:30Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        let expires_at = mention_expires_at(mentioned_at);
        assert_eq!(expires_at - mentioned_at, Duration::hours(24));
    }

    #[test]
    fn terminal_states_reject_every_transition() {
        let terminal = [
            MentionState::Completed,
            MentionState::FlaggedEarlyDelete,
            MentionState::ExpiredUnknown,
        ];
        for from in terminal {
            assert!(from.is_terminal());
            for to in terminal.iter().copied().chain([MentionState::New]) {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
        assert!(MentionState::New.can_transition_to(MentionState::Completed));
        assert!(MentionState::New.can_transition_to(MentionState::New));
    }

    #[test]
    fn state_parses_database_values() {
        for state in [
            MentionState::New,
            MentionState::Completed,
            MentionState::FlaggedEarlyDelete,
            MentionState::ExpiredUnknown,
        ] {
            assert_eq!(state.as_str().parse::<MentionState>(), Ok(state));
        }
        let err = "archived".parse::<MentionState>().unwrap_err();
        assert_eq!(err.value, "archived");
    }
}
