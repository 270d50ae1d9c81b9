//! Conversation state stores.
//!
//! A [`ConversationStateStore`] maps a conversation id to the bot's serialized state for that
//! conversation. Entries expire a fixed TTL after their last write; reads after expiry behave
//! as if the entry was never written, whether or not an eviction pass has run. Two backends
//! honor the same contract: [`MemoryStateStore`] (process local, lost on restart) and, with the
//! `redis-store` feature, `RedisStateStore` (shared, native key expiry).
mod clock;
mod memory;
#[cfg(feature = "redis-store")]
mod redis_store;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use memory::{MemoryStateStore, spawn_eviction};
#[cfg(feature = "redis-store")]
pub use redis_store::RedisStateStore;

/// Default time-to-live for conversation state (30 minutes).
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(30 * 60);

/// Shared store handle used across services.
pub type SharedStateStore = Arc<dyn ConversationStateStore>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conversation state store unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("invalid store configuration: {0}")]
    Config(String),
}

impl StoreError {
    pub fn unavailable<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Unavailable(Box::new(err))
    }
}

/// Cached state for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    pub conversation_id: String,
    pub blob: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_touched: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl ConversationState {
    pub fn new(
        conversation_id: impl Into<String>,
        blob: impl Into<String>,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            blob: blob.into(),
            last_touched: now,
            expires_at: now + ttl,
        }
    }

    /// An entry is live strictly before its expiry instant.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

#[async_trait]
pub trait ConversationStateStore: Send + Sync {
    /// Returns the live entry for `conversation_id`, or `None` when absent or expired.
    async fn get(&self, conversation_id: &str) -> Result<Option<ConversationState>, StoreError>;
    /// Upserts the entry and resets its expiry to now + TTL. Last write wins.
    async fn put(&self, conversation_id: &str, blob: &str)
    -> Result<ConversationState, StoreError>;
    /// Drops the entry, if any.
    async fn delete(&self, conversation_id: &str) -> Result<(), StoreError>;
    /// The TTL applied on every write.
    fn ttl(&self) -> Duration;
}

/// Backend selection resolved from gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Networked { url: String, namespace: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub ttl: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            ttl: DEFAULT_STATE_TTL,
        }
    }
}

/// Returns an in-memory store wrapped in an [`Arc`].
pub fn shared_memory_store(ttl: Duration, clock: SharedClock) -> SharedStateStore {
    Arc::new(MemoryStateStore::with_clock(ttl, clock))
}

/// Builds the configured store.
///
/// Selecting the networked backend in a build without the `redis-store` feature is a
/// configuration error; the gateway never silently degrades to process-local state.
pub async fn store_from_settings(
    settings: &StoreSettings,
    clock: SharedClock,
) -> Result<SharedStateStore, StoreError> {
    if settings.ttl.is_zero() {
        return Err(StoreError::Config("ttl must be greater than zero".into()));
    }
    match &settings.backend {
        StoreBackend::Memory => Ok(shared_memory_store(settings.ttl, clock)),
        StoreBackend::Networked { url, namespace } => {
            build_redis_store(url, namespace, settings.ttl, clock).await
        }
    }
}

#[cfg(feature = "redis-store")]
async fn build_redis_store(
    url: &str,
    namespace: &str,
    ttl: Duration,
    clock: SharedClock,
) -> Result<SharedStateStore, StoreError> {
    let store = RedisStateStore::connect(url, namespace, ttl, clock).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis-store"))]
async fn build_redis_store(
    _url: &str,
    _namespace: &str,
    _ttl: Duration,
    _clock: SharedClock,
) -> Result<SharedStateStore, StoreError> {
    Err(StoreError::Config(
        "networked store selected but gsm-session was built without the redis-store feature"
            .into(),
    ))
}
