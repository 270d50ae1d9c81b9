use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TelemetryProtocol {
    #[default]
    Grpc,
    #[serde(alias = "http")]
    HttpProtobuf,
}

/// Logging and trace-export settings, resolved by the caller's configuration layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    pub json_logs: bool,
    /// OTLP collector endpoint; span export is disabled when unset or blank.
    pub otlp_endpoint: Option<String>,
    pub protocol: TelemetryProtocol,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "bot-gateway".into(),
            service_version: env!("CARGO_PKG_VERSION").into(),
            environment: "dev".into(),
            json_logs: true,
            otlp_endpoint: None,
            protocol: TelemetryProtocol::Grpc,
        }
    }
}

impl TelemetryConfig {
    pub fn exporter_enabled(&self) -> bool {
        self.endpoint().is_some()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.otlp_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
    }
}
