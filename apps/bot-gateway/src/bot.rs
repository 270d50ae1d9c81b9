use std::collections::VecDeque;

use gsm_core::{Activity, OutboundEvent};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::oauth::CredentialRef;

/// How many recent activity ids a conversation remembers.
pub const RECENT_ACTIVITY_LIMIT: usize = 20;

/// Per-conversation bot state, stored as JSON in the conversation state blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotState {
    pub turns: u64,
    #[serde(default)]
    pub recent_activity_ids: VecDeque<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialRef>,
}

impl BotState {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a stored blob. Unreadable blobs are logged and treated as a fresh conversation.
    pub fn decode(conversation_id: &str, blob: &str) -> Option<Self> {
        match serde_json::from_str(blob) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(conversation_id, error = %err, "discarding unreadable bot state");
                None
            }
        }
    }

    /// Turn at which `activity_id` was handled, if it is among the remembered ids.
    pub fn turn_of(&self, activity_id: &str) -> Option<u64> {
        let position = self
            .recent_activity_ids
            .iter()
            .rposition(|seen| seen == activity_id)?;
        let newer = (self.recent_activity_ids.len() - 1 - position) as u64;
        self.turns.checked_sub(newer)
    }

    fn remember(&mut self, activity_id: &str) {
        if self.recent_activity_ids.len() == RECENT_ACTIVITY_LIMIT {
            self.recent_activity_ids.pop_front();
        }
        self.recent_activity_ids.push_back(activity_id.to_string());
    }
}

/// Result of running the bot logic over one activity.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub state: BotState,
    pub event: OutboundEvent,
}

/// The bot-logic hook: a pure function of the activity and the prior state.
pub trait BotLogic: Send + Sync {
    fn step(&self, activity: &Activity, prior: Option<&BotState>, now: OffsetDateTime) -> Step;
}

/// Counts turns, remembers recent activity ids and forwards every activity to the bus. A
/// redelivered activity keeps the turn it was first given.
#[derive(Debug, Clone)]
pub struct ForwardingBot {
    subject_prefix: String,
}

impl ForwardingBot {
    pub fn new(subject_prefix: impl Into<String>) -> Self {
        Self {
            subject_prefix: subject_prefix.into(),
        }
    }
}

impl BotLogic for ForwardingBot {
    fn step(&self, activity: &Activity, prior: Option<&BotState>, now: OffsetDateTime) -> Step {
        let mut state = prior.cloned().unwrap_or_default();
        state.last_seen = Some(now);
        if let Some(turn) = activity.activity_id().and_then(|id| state.turn_of(id)) {
            let event = OutboundEvent::from_activity(activity, &self.subject_prefix, turn, now);
            return Step { state, event };
        }
        state.turns += 1;
        let event = OutboundEvent::from_activity(activity, &self.subject_prefix, state.turns, now);
        let remembered = activity.id.clone().unwrap_or_else(|| event.event_id.clone());
        state.remember(&remembered);
        Step { state, event }
    }
}
