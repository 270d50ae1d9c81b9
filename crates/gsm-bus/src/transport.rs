use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// Queues/streams the broker must find in place before it accepts publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub stream_name: String,
    pub subjects: Vec<String>,
    pub max_age: Duration,
    pub duplicate_window: Duration,
}

impl Topology {
    pub fn new(stream_name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            subjects,
            max_age: Duration::from_secs(24 * 60 * 60),
            duplicate_window: Duration::from_secs(120),
        }
    }
}

/// Wire-level operations the broker state machine drives. Implementations hold the
/// connection handle; retries, state, and draining live in [`crate::MessageBroker`].
#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn connect(&self) -> anyhow::Result<()>;
    async fn ensure_topology(&self, topology: &Topology) -> anyhow::Result<()>;
    /// Sends one message and waits for the broker's acknowledgement.
    async fn publish(&self, subject: &str, msg_id: &str, payload: Bytes) -> anyhow::Result<()>;
    async fn reconnect(&self) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
}
