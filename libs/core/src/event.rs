use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{Activity, activity_subject};

/// Normalized record handed to the bus for one accepted activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    /// Stable identifier, also used by the broker for duplicate suppression.
    pub event_id: String,
    pub subject: String,
    pub tenant: String,
    pub conversation_id: String,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// The original activity, untouched.
    pub payload: Value,
    /// Position of this activity within its conversation.
    pub turn: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

impl OutboundEvent {
    /// Builds the event for `activity`. Pure for activities that carry an id: identical inputs
    /// give identical events.
    pub fn from_activity(
        activity: &Activity,
        subject_prefix: &str,
        turn: u64,
        received_at: OffsetDateTime,
    ) -> Self {
        let tenant = activity.tenant_id().to_string();
        let subject = activity_subject(
            subject_prefix,
            &tenant,
            &activity.channel_id,
            activity.conversation_id(),
        );
        Self {
            event_id: event_id_for(activity),
            subject,
            tenant,
            conversation_id: activity.conversation_id().to_string(),
            channel_id: activity.channel_id.clone(),
            sender_id: activity.sender_id().map(str::to_string),
            kind: activity.kind().as_str().to_string(),
            text: activity.text.clone(),
            payload: serde_json::to_value(activity).unwrap_or(Value::Null),
            turn,
            received_at,
        }
    }
}

/// Platform activity ids are reused as event ids so redeliveries of the same webhook dedupe on
/// the broker. An activity without an id gets a fresh one, so it can never collide with another
/// event; callers that need a stable id call [`Activity::ensure_id`] first.
pub fn event_id_for(activity: &Activity) -> String {
    match activity.activity_id() {
        Some(id) => format!("{}:{}", activity.channel_id, id),
        None => format!(
            "{}:{}:{}",
            activity.channel_id,
            activity.conversation_id(),
            Uuid::new_v4()
        ),
    }
}
