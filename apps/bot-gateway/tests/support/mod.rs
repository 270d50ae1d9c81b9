#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use gsm_bot_gateway::{BotManager, ForwardingBot};
use gsm_bus::{MemoryTransport, MessageBroker, RetryPolicy, Topology};
use gsm_core::{ACTIVITY_SUBJECT_PREFIX, Activity, TenantGate, activity_stream_subject};
use gsm_session::{
    ConversationState, ConversationStateStore, MemoryStateStore, StoreError, DEFAULT_STATE_TTL,
};
use serde_json::json;

pub type TestBroker = MessageBroker<MemoryTransport>;

/// Wraps the memory store and records every call; can be switched to fail every call.
pub struct RecordingStore {
    inner: MemoryStateStore,
    pub gets: AtomicUsize,
    pub puts: AtomicUsize,
    pub deletes: AtomicUsize,
    failing: AtomicBool,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStateStore::new(DEFAULT_STATE_TTL),
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn fail_all(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn mutations(&self) -> usize {
        self.puts.load(Ordering::SeqCst) + self.deletes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(std::io::Error::other(
                "simulated store outage",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStateStore for RecordingStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<ConversationState>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.get(conversation_id).await
    }

    async fn put(
        &self,
        conversation_id: &str,
        blob: &str,
    ) -> Result<ConversationState, StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.put(conversation_id, blob).await
    }

    async fn delete(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.delete(conversation_id).await
    }

    fn ttl(&self) -> Duration {
        self.inner.ttl()
    }
}

pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

pub async fn ready_broker(transport: MemoryTransport, max_retries: u32) -> Arc<TestBroker> {
    let broker = MessageBroker::new(
        transport,
        Topology::new(
            "BOT_ACTIVITIES",
            vec![activity_stream_subject(ACTIVITY_SUBJECT_PREFIX)],
        ),
    )
    .with_retry(fast_retry(max_retries));
    broker.setup().await.expect("broker setup");
    Arc::new(broker)
}

pub fn manager(gate: TenantGate, store: Arc<RecordingStore>, broker: Arc<TestBroker>) -> BotManager {
    BotManager::new(
        gate,
        store,
        broker,
        Arc::new(ForwardingBot::new(ACTIVITY_SUBJECT_PREFIX)),
    )
}

pub fn message(tenant: &str, conversation: &str, id: &str) -> Activity {
    activity("message", tenant, conversation, id)
}

pub fn activity(kind: &str, tenant: &str, conversation: &str, id: &str) -> Activity {
    serde_json::from_value(json!({
        "type": kind,
        "id": id,
        "channelId": "msteams",
        "conversation": { "id": conversation, "tenantId": tenant },
        "from": { "id": "user-1", "name": "Ada" },
        "text": format!("text for {id}")
    }))
    .expect("activity")
}
