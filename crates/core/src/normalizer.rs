use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::{MentionEvent, MentionType};

/// Errors that make the whole payload unusable.
///
/// Individual entries that cannot be used are reported through [`DroppedEntry`] instead.
#[derive(Debug, Error)]
pub enum NormalizerError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("unsupported webhook object: {0}")]
    UnsupportedObject(String),
    #[error("payload has no entry array")]
    MissingEntries,
}

/// Why a messaging item was not turned into a [`MentionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Story-mention item without a sender id.
    MissingSender,
    /// Story-mention item without a story/media id.
    MissingStoryId,
    /// Same story id already emitted from this payload.
    DuplicateInPayload,
    /// Entry or messaging item with a shape we could not decode.
    Undecodable,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingSender => "missing_sender",
            Self::MissingStoryId => "missing_story_id",
            Self::DuplicateInPayload => "duplicate_in_payload",
            Self::Undecodable => "undecodable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedEntry {
    pub entry_index: usize,
    pub messaging_index: Option<usize>,
    pub reason: DropReason,
}

/// Output of [`Normalizer::normalize`].
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub events: Vec<MentionEvent>,
    pub dropped: Vec<DroppedEntry>,
    /// Messaging items that were well-formed but not story mentions.
    pub ignored: usize,
}

/// Converts verified Instagram messaging webhooks into canonical [`MentionEvent`] values.
pub struct Normalizer;

impl Normalizer {
    /// Normalizes a parsed webhook body. `received_at` backs up missing timestamps.
    pub fn normalize(
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> Result<NormalizedBatch, NormalizerError> {
        let object = payload.as_object().ok_or(NormalizerError::NotAnObject)?;
        if let Some(kind) = object.get("object").and_then(Value::as_str) {
            if !matches!(kind, "instagram" | "page") {
                return Err(NormalizerError::UnsupportedObject(kind.to_string()));
            }
        }
        let entries = object
            .get("entry")
            .and_then(Value::as_array)
            .ok_or(NormalizerError::MissingEntries)?;

        let mut batch = NormalizedBatch::default();
        let mut seen = HashSet::new();

        for (entry_index, entry_value) in entries.iter().enumerate() {
            let entry: RawEntry = match serde_json::from_value(entry_value.clone()) {
                Ok(entry) => entry,
                Err(_) => {
                    batch.dropped.push(DroppedEntry {
                        entry_index,
                        messaging_index: None,
                        reason: DropReason::Undecodable,
                    });
                    continue;
                }
            };
            let entry_time = entry.time.and_then(DateTime::from_timestamp_millis);

            for (messaging_index, item_value) in entry.messaging.iter().enumerate() {
                let dropped_at = |reason| DroppedEntry {
                    entry_index,
                    messaging_index: Some(messaging_index),
                    reason,
                };
                let item: RawMessaging = match serde_json::from_value(item_value.clone()) {
                    Ok(item) => item,
                    Err(_) => {
                        batch.dropped.push(dropped_at(DropReason::Undecodable));
                        continue;
                    }
                };

                let Some(candidate) = classify(&item) else {
                    batch.ignored += 1;
                    continue;
                };

                let Some(sender_id) = item.sender_id() else {
                    batch.dropped.push(dropped_at(DropReason::MissingSender));
                    continue;
                };
                let Some(external_id) = candidate.story_id else {
                    batch.dropped.push(dropped_at(DropReason::MissingStoryId));
                    continue;
                };
                if !seen.insert(external_id.clone()) {
                    batch.dropped.push(dropped_at(DropReason::DuplicateInPayload));
                    continue;
                }

                let mentioned_at = item
                    .timestamp
                    .and_then(DateTime::from_timestamp_millis)
                    .or(entry_time)
                    .unwrap_or(received_at);

                batch.events.push(MentionEvent {
                    external_id,
                    sender_id,
                    sender_username: item.sender_username(),
                    mention_type: candidate.mention_type,
                    content: candidate.content,
                    mentioned_at,
                    story_verifiable: candidate.story_verifiable,
                    raw: item_value.clone(),
                });
            }
        }

        Ok(batch)
    }

    /// Returns the account id of the first entry, used to route the webhook to its tenant.
    pub fn recipient_account_id(payload: &Value) -> Option<&str> {
        payload
            .get("entry")
            .and_then(Value::as_array)
            .and_then(|entries| entries.first())
            .and_then(|entry| entry.get("id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }
}

/// A messaging item recognised as a story mention, before mandatory fields are enforced.
struct Candidate {
    mention_type: MentionType,
    story_id: Option<String>,
    /// `story_id` names a Graph story object rather than a fallback message id.
    story_verifiable: bool,
    content: Option<String>,
}

fn classify(item: &RawMessaging) -> Option<Candidate> {
    let text = item
        .message
        .as_ref()
        .and_then(|message| non_empty(message.text.as_deref()));

    if let Some(referral) = item.referral.as_ref().filter(|r| r.is_story()) {
        let story_id = referral
            .story
            .as_ref()
            .and_then(|story| non_empty(story.id.as_deref()))
            .or_else(|| non_empty(referral.story_id.as_deref()));
        return Some(Candidate {
            mention_type: MentionType::StoryReferral,
            story_id,
            story_verifiable: true,
            content: text.or_else(|| non_empty(referral.r#ref.as_deref())),
        });
    }

    let message = item.message.as_ref()?;
    let attachment = message
        .attachments
        .iter()
        .find(|attachment| attachment.kind.as_deref() == Some("story_mention"))?;
    let story_object = attachment
        .payload
        .as_ref()
        .and_then(|payload| non_empty(payload.id.as_deref()));
    let story_verifiable = story_object.is_some();
    let story_id = story_object.or_else(|| non_empty(message.mid.as_deref()));

    Some(Candidate {
        mention_type: MentionType::Story,
        story_id,
        story_verifiable,
        content: text,
    })
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    messaging: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawMessaging {
    #[serde(default)]
    sender: Option<RawParticipant>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    referral: Option<RawReferral>,
}

impl RawMessaging {
    fn sender_id(&self) -> Option<String> {
        self.sender
            .as_ref()
            .and_then(|sender| non_empty(sender.id.as_deref()))
    }

    fn sender_username(&self) -> Option<String> {
        self.sender
            .as_ref()
            .and_then(|sender| non_empty(sender.username.as_deref()))
    }
}

#[derive(Debug, Deserialize)]
struct RawParticipant {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    mid: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    attachments: Vec<RawAttachment>,
}

#[derive(Debug, Deserialize)]
struct RawAttachment {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    payload: Option<RawAttachmentPayload>,
}

#[derive(Debug, Deserialize)]
struct RawAttachmentPayload {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReferral {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    r#ref: Option<String>,
    #[serde(default)]
    story_id: Option<String>,
    #[serde(default)]
    story: Option<RawStory>,
}

impl RawReferral {
    fn is_story(&self) -> bool {
        let is_story = |value: &Option<String>| {
            value
                .as_deref()
                .map(|v| v.eq_ignore_ascii_case("story") || v.eq_ignore_ascii_case("story_mention"))
                .unwrap_or(false)
        };
        is_story(&self.kind) || is_story(&self.source)
    }
}

#[derive(Debug, Deserialize)]
struct RawStory {
    #[serde(default)]
    id: Option<String>,
}
