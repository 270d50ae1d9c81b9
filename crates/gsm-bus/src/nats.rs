use anyhow::{Context, anyhow};
use async_nats::connection::State;
use async_nats::jetstream::{self, stream::Config as StreamConfig};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::transport::{BusTransport, Topology};

const MSG_ID_HEADER: &str = "Nats-Msg-Id";

struct NatsConnection {
    client: async_nats::Client,
    js: jetstream::Context,
}

/// JetStream transport: publishes are acknowledged by the stream and deduplicated on
/// `Nats-Msg-Id` within the stream's duplicate window.
pub struct NatsTransport {
    url: String,
    client_name: String,
    connection: RwLock<Option<NatsConnection>>,
}

impl NatsTransport {
    pub fn new(url: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_name: client_name.into(),
            connection: RwLock::new(None),
        }
    }

    async fn jetstream(&self) -> anyhow::Result<jetstream::Context> {
        self.connection
            .read()
            .await
            .as_ref()
            .map(|conn| conn.js.clone())
            .ok_or_else(|| anyhow!("nats connection not established"))
    }
}

#[async_trait]
impl BusTransport for NatsTransport {
    async fn connect(&self) -> anyhow::Result<()> {
        let client = async_nats::ConnectOptions::new()
            .name(self.client_name.clone())
            .connect(self.url.as_str())
            .await
            .with_context(|| format!("connect to nats at {}", self.url))?;
        let js = jetstream::new(client.clone());
        *self.connection.write().await = Some(NatsConnection { client, js });
        info!(url = %self.url, "connected to nats");
        Ok(())
    }

    async fn ensure_topology(&self, topology: &Topology) -> anyhow::Result<()> {
        let js = self.jetstream().await?;
        let cfg = StreamConfig {
            name: topology.stream_name.clone(),
            subjects: topology.subjects.clone(),
            max_age: topology.max_age,
            duplicate_window: topology.duplicate_window,
            description: Some("Greentic bot gateway activities".into()),
            ..StreamConfig::default()
        };
        js.get_or_create_stream(cfg)
            .await
            .with_context(|| format!("declare stream {}", topology.stream_name))?;
        debug!(stream = %topology.stream_name, subjects = ?topology.subjects, "stream ready");
        Ok(())
    }

    async fn publish(&self, subject: &str, msg_id: &str, payload: Bytes) -> anyhow::Result<()> {
        let js = self.jetstream().await?;
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(MSG_ID_HEADER, msg_id);
        let ack = js
            .publish_with_headers(subject.to_string(), headers, payload)
            .await
            .with_context(|| format!("publish to {subject}"))?;
        let ack = ack
            .await
            .with_context(|| format!("await jetstream ack for {subject}"))?;
        if ack.duplicate {
            counter!("bus_duplicate_publishes_total").increment(1);
            warn!(
                subject,
                msg_id,
                stream = %ack.stream,
                sequence = ack.sequence,
                "stream reported duplicate message id; event was not stored again"
            );
        }
        Ok(())
    }

    async fn reconnect(&self) -> anyhow::Result<()> {
        let connected = self
            .connection
            .read()
            .await
            .as_ref()
            .is_some_and(|conn| matches!(conn.client.connection_state(), State::Connected));
        if connected {
            return Ok(());
        }
        self.connect().await
    }

    async fn close(&self) -> anyhow::Result<()> {
        let Some(conn) = self.connection.write().await.take() else {
            return Ok(());
        };
        conn.client.flush().await.context("flush nats connection")?;
        info!(url = %self.url, "nats connection closed");
        Ok(())
    }
}
