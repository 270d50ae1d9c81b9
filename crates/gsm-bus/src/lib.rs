//! Outbound message broker for the bot gateway.
//!
//! [`MessageBroker`] owns the single connection to the queueing system through a
//! [`BusTransport`] and layers the delivery rules on top: idempotent topology setup, publish
//! with bounded reconnect-and-retry, and a drain-then-close shutdown that never outlives its
//! timeout. The bot manager only sees [`EventPublisher`]; shutdown code only sees
//! [`BrokerLifecycle`].
mod broker;
mod error;
mod memory;
mod nats;
mod retry;
mod transport;

use std::time::Duration;

use async_trait::async_trait;
use gsm_core::OutboundEvent;

pub use broker::{BrokerState, CloseReport, Delivery, MessageBroker};
pub use error::BusError;
pub use memory::{MemoryTransport, PublishedMessage};
pub use nats::NatsTransport;
pub use retry::RetryPolicy;
pub use transport::{BusTransport, Topology};

/// Publishing half of the broker, as seen by the bot manager.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &OutboundEvent) -> Result<Delivery, BusError>;
}

/// Lifecycle half of the broker, as seen by the shutdown coordinator.
#[async_trait]
pub trait BrokerLifecycle: Send + Sync {
    async fn close(&self, timeout: Duration) -> Result<CloseReport, BusError>;
    fn state(&self) -> BrokerState;
}

pub fn to_payload<T: serde::Serialize>(payload: &T) -> Result<bytes::Bytes, BusError> {
    Ok(serde_json::to_vec(payload)?.into())
}
