use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    ConversationState, ConversationStateStore, SharedClock, StoreError, clock::system_clock,
};

pub struct MemoryStateStore {
    entries: DashMap<String, ConversationState>,
    ttl: Duration,
    clock: SharedClock,
}

impl MemoryStateStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, system_clock())
    }

    pub fn with_clock(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            clock,
        }
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, state| !state.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ConversationStateStore for MemoryStateStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<ConversationState>, StoreError> {
        let now = self.clock.now();
        if let Some(entry) = self.entries.get(conversation_id) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.value().clone()));
            }
        }
        // Expired entries are purged lazily; a concurrent put may have refreshed it meanwhile.
        self.entries
            .remove_if(conversation_id, |_, state| state.is_expired(now));
        Ok(None)
    }

    async fn put(
        &self,
        conversation_id: &str,
        blob: &str,
    ) -> Result<ConversationState, StoreError> {
        let state = ConversationState::new(conversation_id, blob, self.clock.now(), self.ttl);
        self.entries
            .insert(conversation_id.to_string(), state.clone());
        Ok(state)
    }

    async fn delete(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.entries.remove(conversation_id);
        Ok(())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Runs [`MemoryStateStore::evict_expired`] every `interval` until `cancel` fires.
pub fn spawn_eviction(
    store: Arc<MemoryStateStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the first immediate tick.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = store.evict_expired();
                    if evicted > 0 {
                        debug!(evicted, remaining = store.len(), "evicted expired conversation state");
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("conversation state eviction stopped");
                    break;
                }
            }
        }
    })
}
