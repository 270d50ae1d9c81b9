//! Greentic bot gateway core contracts and value types.
//!
//! This crate holds the data exchanged between the webhook transport, the bot manager and the
//! bus: inbound [`Activity`] records, the normalized [`OutboundEvent`] handed to the broker,
//! tenant admission via [`TenantGate`], and subject naming helpers.
pub mod activity;
pub mod event;
pub mod subjects;
pub mod tenant;

pub use activity::*;
pub use event::*;
pub use subjects::*;
pub use tenant::*;
