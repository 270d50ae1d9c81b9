use std::sync::Arc;

use anyhow::Context as _;
use axum::Router;
use gsm_bus::{BrokerLifecycle, BusTransport, MessageBroker, NatsTransport};
use gsm_session::{
    MemoryStateStore, SharedClock, SharedStateStore, StoreBackend, spawn_eviction,
    store_from_settings, system_clock,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    bot::ForwardingBot,
    config::GatewayConfig,
    http::{GatewayState, router},
    manager::BotManager,
    oauth::{DisabledTokenExchanger, HttpTokenExchanger, TokenExchanger},
    shutdown::ShutdownCoordinator,
};

/// Everything the gateway builds once at startup and shares across requests.
pub struct GatewayContext {
    config: GatewayConfig,
    broker: Arc<dyn BrokerLifecycle>,
    state: GatewayState,
}

impl GatewayContext {
    /// Connects to NATS, declares the activity stream and builds the configured store.
    pub async fn from_config(config: GatewayConfig) -> anyhow::Result<Self> {
        let transport = NatsTransport::new(
            config.broker_url.clone(),
            config.telemetry.service_name.clone(),
        );
        Self::with_transport(config, transport, system_clock()).await
    }

    pub async fn with_transport<T>(
        config: GatewayConfig,
        transport: T,
        clock: SharedClock,
    ) -> anyhow::Result<Self>
    where
        T: BusTransport + 'static,
    {
        let broker = Arc::new(
            MessageBroker::new(transport, config.topology())
                .with_retry(config.retry_policy())
                .with_setup_attempts(config.setup_attempts),
        );
        broker
            .setup()
            .await
            .with_context(|| format!("broker setup failed for {}", config.broker_url))?;

        let intake = CancellationToken::new();
        let store = build_store(&config, clock.clone(), &intake).await?;
        let exchanger: Arc<dyn TokenExchanger> = match config.oauth.clone() {
            Some(settings) => {
                info!(provider = %settings.provider, "oauth token exchange enabled");
                Arc::new(HttpTokenExchanger::new(reqwest::Client::new(), settings))
            }
            None => Arc::new(DisabledTokenExchanger),
        };
        let manager = BotManager::new(
            config.tenant_gate(),
            store,
            broker.clone(),
            Arc::new(ForwardingBot::new(config.subject_prefix.clone())),
        )
        .with_exchanger(exchanger)
        .with_clock(clock);

        let mut state = GatewayState::new(Arc::new(manager));
        state.intake = intake;
        Ok(Self {
            config,
            broker,
            state,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Cancelled once shutdown begins.
    pub fn intake(&self) -> CancellationToken {
        self.state.intake.clone()
    }

    pub fn shutdown_coordinator(&self) -> ShutdownCoordinator {
        ShutdownCoordinator::new(
            self.state.intake.clone(),
            self.state.tracker.clone(),
            self.broker.clone(),
            self.config.shutdown_timeout(),
        )
    }
}

async fn build_store(
    config: &GatewayConfig,
    clock: SharedClock,
    intake: &CancellationToken,
) -> anyhow::Result<SharedStateStore> {
    let settings = config.store_settings();
    match &settings.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStateStore::with_clock(settings.ttl, clock));
            spawn_eviction(store.clone(), config.eviction_interval(), intake.clone());
            info!(ttl = ?settings.ttl, "using in-memory conversation state");
            Ok(store)
        }
        StoreBackend::Networked { .. } => {
            let store = store_from_settings(&settings, clock)
                .await
                .context("failed to build networked conversation store")?;
            info!(ttl = ?settings.ttl, "using networked conversation state");
            Ok(store)
        }
    }
}
