use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use gsm_bus::{RetryPolicy, Topology};
use gsm_core::{ACTIVITY_SUBJECT_PREFIX, TenantGate, TenantPolicy, activity_stream_subject};
use gsm_session::{DEFAULT_STATE_TTL, StoreBackend, StoreSettings};
use gsm_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};

/// Environment variables with this prefix override file settings; nested keys use `__`
/// (`GSM_OAUTH__CLIENT_ID`).
pub const ENV_PREFIX: &str = "GSM_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {0} not found")]
    MissingFile(PathBuf),
    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    #[default]
    Memory,
    Networked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthSettings {
    /// Identity provider name recorded on credential references.
    pub provider: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

/// Every option the gateway understands, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub broker_url: String,
    pub subject_prefix: String,
    pub stream_name: String,
    pub store_backend: StoreBackendKind,
    pub redis_url: Option<String>,
    pub store_namespace: String,
    pub ttl_seconds: u64,
    pub eviction_interval_seconds: u64,
    pub allowed_tenants: TenantPolicy,
    pub bind_address: String,
    pub port: u16,
    pub shutdown_timeout_seconds: u64,
    pub publish_max_retries: u32,
    pub setup_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub oauth: Option<OAuthSettings>,
    pub telemetry: TelemetryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            broker_url: "nats://127.0.0.1:4222".into(),
            subject_prefix: ACTIVITY_SUBJECT_PREFIX.into(),
            stream_name: "BOT_ACTIVITIES".into(),
            store_backend: StoreBackendKind::Memory,
            redis_url: None,
            store_namespace: "gsm".into(),
            ttl_seconds: DEFAULT_STATE_TTL.as_secs(),
            eviction_interval_seconds: 60,
            allowed_tenants: TenantPolicy::default(),
            bind_address: "0.0.0.0".into(),
            port: 3978,
            shutdown_timeout_seconds: 10,
            publish_max_retries: retry.max_retries,
            setup_attempts: 5,
            retry_base_delay_ms: retry.base_delay.as_millis() as u64,
            retry_max_delay_ms: retry.max_delay.as_millis() as u64,
            oauth: None,
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Defaults, then the optional TOML file, then `GSM_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(GatewayConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::MissingFile(path.to_path_buf()));
            }
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_seconds == 0 {
            return Err(ConfigError::Invalid("ttl_seconds must be greater than zero".into()));
        }
        if self.broker_url.trim().is_empty() {
            return Err(ConfigError::Invalid("broker_url must be set".into()));
        }
        if self.subject_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("subject_prefix must be set".into()));
        }
        if self.store_backend == StoreBackendKind::Networked
            && self
                .redis_url
                .as_deref()
                .is_none_or(|url| url.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "store_backend = \"networked\" requires redis_url".into(),
            ));
        }
        self.socket_addr()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = IpAddr::from_str(self.bind_address.trim()).map_err(|err| {
            ConfigError::Invalid(format!("invalid bind_address `{}`: {err}", self.bind_address))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_seconds.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn store_settings(&self) -> StoreSettings {
        let backend = match self.store_backend {
            StoreBackendKind::Memory => StoreBackend::Memory,
            StoreBackendKind::Networked => StoreBackend::Networked {
                url: self.redis_url.clone().unwrap_or_default(),
                namespace: self.store_namespace.clone(),
            },
        };
        StoreSettings {
            backend,
            ttl: self.ttl(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.publish_max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn topology(&self) -> Topology {
        Topology::new(
            self.stream_name.clone(),
            vec![activity_stream_subject(&self.subject_prefix)],
        )
    }

    pub fn tenant_gate(&self) -> TenantGate {
        TenantGate::new(self.allowed_tenants.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn jail_error(err: ConfigError) -> figment::Error {
        figment::Error::from(err.to_string())
    }

    #[test]
    fn defaults_are_valid_and_deny_all() {
        let config = GatewayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ttl(), Duration::from_secs(1800));
        assert_eq!(config.allowed_tenants, TenantPolicy::default());
        assert_eq!(config.socket_addr().unwrap().port(), 3978);
        assert_eq!(config.topology().subjects, vec!["greentic.bot.activity.>"]);
    }

    #[test]
    fn file_then_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "gateway.toml",
                r#"
                broker_url = "nats://broker:4222"
                store_backend = "networked"
                redis_url = "redis://cache:6379"
                ttl_seconds = 900
                allowed_tenants = ["tenantX", "tenantZ"]
                port = 8080

                [oauth]
                provider = "entra"
                token_url = "https://login.example.com/token"
                client_id = "client"
                client_secret = "secret"
                "#,
            )?;
            jail.set_env("GSM_PORT", "9090");
            jail.set_env("GSM_TELEMETRY__JSON_LOGS", "false");

            let config =
                GatewayConfig::load(Some(Path::new("gateway.toml"))).map_err(jail_error)?;
            assert_eq!(config.broker_url, "nats://broker:4222");
            assert_eq!(config.port, 9090);
            assert_eq!(config.ttl(), Duration::from_secs(900));
            assert_eq!(
                config.allowed_tenants,
                TenantPolicy::allow_list(["tenantX", "tenantZ"])
            );
            assert!(!config.telemetry.json_logs);
            assert_eq!(
                config.store_settings().backend,
                StoreBackend::Networked {
                    url: "redis://cache:6379".into(),
                    namespace: "gsm".into(),
                }
            );
            assert_eq!(config.oauth.as_ref().map(|o| o.provider.as_str()), Some("entra"));
            Ok(())
        });
    }

    #[test]
    fn allow_all_from_env() {
        Jail::expect_with(|jail| {
            jail.set_env("GSM_ALLOWED_TENANTS", "allow-all");
            let config = GatewayConfig::load(None).map_err(jail_error)?;
            assert_eq!(config.allowed_tenants, TenantPolicy::AllowAll);
            Ok(())
        });
    }

    #[test]
    fn deployment_environment_is_a_telemetry_setting() {
        Jail::expect_with(|jail| {
            jail.set_env("GSM_TELEMETRY__ENVIRONMENT", "staging");
            let config = GatewayConfig::load(None).map_err(jail_error)?;
            assert_eq!(config.telemetry.environment, "staging");
            Ok(())
        });
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = GatewayConfig::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile(_)));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = GatewayConfig {
            ttl_seconds: 0,
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());

        config.ttl_seconds = 60;
        config.store_backend = StoreBackendKind::Networked;
        assert!(config.validate().is_err());

        config.store_backend = StoreBackendKind::Memory;
        config.bind_address = "not-an-ip".into();
        assert!(config.validate().is_err());
    }
}
