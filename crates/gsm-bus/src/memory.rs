use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::transport::{BusTransport, Topology};

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub subject: String,
    pub msg_id: String,
    pub payload: Bytes,
}

impl PublishedMessage {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }
}

/// In-process transport that records publishes. Failures and latency can be injected to
/// exercise the broker's retry and drain paths.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    published: Mutex<Vec<PublishedMessage>>,
    topology: Mutex<Option<Topology>>,
    connected: AtomicBool,
    fail_connects: AtomicU32,
    fail_publishes: AtomicU32,
    latency_ms: AtomicU64,
    publish_attempts: AtomicU32,
    reconnects: AtomicU32,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` connection attempts fail.
    pub fn fail_connects(&self, n: u32) {
        self.inner.fail_connects.store(n, Ordering::SeqCst);
    }

    /// The next `n` publish attempts fail as if the connection dropped.
    pub fn fail_next_publishes(&self, n: u32) {
        self.inner.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Every publish attempt fails until reset with `fail_next_publishes(0)`.
    pub fn fail_all_publishes(&self) {
        self.inner.fail_publishes.store(u32::MAX, Ordering::SeqCst);
    }

    pub fn set_publish_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.inner.latency_ms.store(ms, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn publish_attempts(&self) -> u32 {
        self.inner.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> u32 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    pub async fn declared_topology(&self) -> Option<Topology> {
        self.inner.topology.lock().await.clone()
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.inner.published.lock().await.clone()
    }

    pub async fn take_published(&self) -> Vec<PublishedMessage> {
        let mut guard = self.inner.published.lock().await;
        std::mem::take(&mut *guard)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl BusTransport for MemoryTransport {
    async fn connect(&self) -> anyhow::Result<()> {
        if Self::take_failure(&self.inner.fail_connects) {
            return Err(anyhow!("simulated connection refused"));
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ensure_topology(&self, topology: &Topology) -> anyhow::Result<()> {
        if !self.is_connected() {
            return Err(anyhow!("not connected"));
        }
        *self.inner.topology.lock().await = Some(topology.clone());
        Ok(())
    }

    async fn publish(&self, subject: &str, msg_id: &str, payload: Bytes) -> anyhow::Result<()> {
        self.inner.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(anyhow!("not connected"));
        }
        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if Self::take_failure(&self.inner.fail_publishes) {
            return Err(anyhow!("simulated connection reset"));
        }
        self.inner.published.lock().await.push(PublishedMessage {
            subject: subject.to_string(),
            msg_id: msg_id.to_string(),
            payload,
        });
        Ok(())
    }

    async fn reconnect(&self) -> anyhow::Result<()> {
        self.inner.reconnects.fetch_add(1, Ordering::SeqCst);
        self.connect().await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
