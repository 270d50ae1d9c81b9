use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::warn;

use crate::{ConversationState, ConversationStateStore, SharedClock, StoreError};

/// Redis-backed store. Expiry is delegated to Redis (`SET .. EX`), and reads re-check the
/// recorded expiry so both backends agree at the TTL boundary.
pub struct RedisStateStore {
    namespace: String,
    connection: redis::aio::ConnectionManager,
    ttl: Duration,
    clock: SharedClock,
}

impl RedisStateStore {
    pub async fn connect(
        url: &str,
        namespace: impl Into<String>,
        ttl: Duration,
        clock: SharedClock,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::unavailable)?;
        let connection = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(StoreError::unavailable)?;
        Ok(Self {
            namespace: namespace.into(),
            connection,
            ttl,
            clock,
        })
    }

    fn conversation_key(&self, conversation_id: &str) -> String {
        format!("{}:conversation:{}", self.namespace, conversation_id)
    }

    fn ttl_secs(&self) -> u64 {
        // Redis rejects EX 0; round sub-second TTLs up.
        self.ttl.as_secs().max(1)
    }
}

#[async_trait]
impl ConversationStateStore for RedisStateStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<ConversationState>, StoreError> {
        let key = self.conversation_key(conversation_id);
        let mut conn = self.connection.clone();
        let payload: Option<String> = conn.get(&key).await.map_err(StoreError::unavailable)?;
        let Some(raw) = payload else {
            return Ok(None);
        };
        let state: ConversationState = match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(err) => {
                warn!(%key, error = %err, "discarding unreadable conversation state");
                return Ok(None);
            }
        };
        if state.is_expired(self.clock.now()) {
            return Ok(None);
        }
        Ok(Some(state))
    }

    async fn put(
        &self,
        conversation_id: &str,
        blob: &str,
    ) -> Result<ConversationState, StoreError> {
        let state = ConversationState::new(conversation_id, blob, self.clock.now(), self.ttl);
        let payload = serde_json::to_string(&state).map_err(StoreError::unavailable)?;
        let key = self.conversation_key(conversation_id);
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(&key, payload, self.ttl_secs())
            .await
            .map_err(StoreError::unavailable)?;
        Ok(state)
    }

    async fn delete(&self, conversation_id: &str) -> Result<(), StoreError> {
        let key = self.conversation_key(conversation_id);
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(&key)
            .await
            .map_err(StoreError::unavailable)?;
        Ok(())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}
