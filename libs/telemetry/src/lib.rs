//! Tracing setup shared by the gateway binaries.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` (defaults to `info`), JSON or
//! plain formatting, and an OTLP span exporter when an endpoint is configured.

mod config;
mod tracing_init;

pub use config::{TelemetryConfig, TelemetryProtocol};
pub use tracing_init::{init_telemetry, shutdown_telemetry, telemetry_enabled, with_common_fields};

/// Installs the subscriber for `cfg`. Safe to call more than once; later calls are no-ops.
pub fn install(cfg: &TelemetryConfig) -> anyhow::Result<()> {
    init_telemetry(cfg.clone())
}
