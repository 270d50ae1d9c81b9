//! Inbound chat-platform activities in the Bot Framework JSON shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Tenant id assigned to activities that carry no tenant information.
pub const UNKNOWN_TENANT: &str = "unknown";

const OAUTH_INVOKE_NAMES: [&str; 2] = ["signin/verifyState", "signin/tokenExchange"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ActivityError {
    #[error("activity is missing a conversation id")]
    MissingConversation,
    #[error("activity is missing a type")]
    MissingType,
}

/// Coarse classification used to route an activity through the bot manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Message,
    ConversationUpdate,
    EndOfConversation,
    OAuthCallback,
    Other,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Message => "message",
            ActivityKind::ConversationUpdate => "conversation_update",
            ActivityKind::EndOfConversation => "end_of_conversation",
            ActivityKind::OAuthCallback => "oauth_callback",
            ActivityKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One inbound event delivered by the chat platform.
///
/// Fields the gateway does not interpret are dropped on deserialization; `channel_data` and
/// `value` stay opaque and travel to the bus untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type", default)]
    pub activity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub conversation: ConversationAccount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Activity {
    pub fn validate(&self) -> Result<(), ActivityError> {
        if self.activity_type.trim().is_empty() {
            return Err(ActivityError::MissingType);
        }
        if self.conversation.id.trim().is_empty() {
            return Err(ActivityError::MissingConversation);
        }
        Ok(())
    }

    pub fn kind(&self) -> ActivityKind {
        match self.activity_type.as_str() {
            "message" => ActivityKind::Message,
            "conversationUpdate" => ActivityKind::ConversationUpdate,
            "endOfConversation" => ActivityKind::EndOfConversation,
            "invoke"
                if self
                    .name
                    .as_deref()
                    .is_some_and(|name| OAUTH_INVOKE_NAMES.contains(&name)) =>
            {
                ActivityKind::OAuthCallback
            }
            _ => ActivityKind::Other,
        }
    }

    pub fn conversation_id(&self) -> &str {
        self.conversation.id.as_str()
    }

    /// Resolves the originating tenant: `conversation.tenantId`, then `channelData.tenant.id`.
    pub fn tenant_id(&self) -> &str {
        self.conversation
            .tenant_id
            .as_deref()
            .or_else(|| {
                self.channel_data
                    .as_ref()
                    .and_then(|data| data.get("tenant"))
                    .and_then(|tenant| tenant.get("id"))
                    .and_then(Value::as_str)
            })
            .map(str::trim)
            .filter(|tenant| !tenant.is_empty())
            .unwrap_or(UNKNOWN_TENANT)
    }

    /// The platform-assigned activity id, if it carries a non-blank one.
    pub fn activity_id(&self) -> Option<&str> {
        self.id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Assigns a fresh id to an activity the platform sent without one. Returns whether an id
    /// was minted.
    pub fn ensure_id(&mut self) -> bool {
        if self.activity_id().is_some() {
            return false;
        }
        self.id = Some(Uuid::new_v4().to_string());
        true
    }

    pub fn sender_id(&self) -> Option<&str> {
        self.from.as_ref().map(|from| from.id.as_str())
    }

    /// Authorization code carried by an OAuth callback invoke.
    pub fn authorization_code(&self) -> Option<&str> {
        let value = self.value.as_ref()?;
        ["code", "state", "token"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str))
            .filter(|code| !code.trim().is_empty())
    }
}
