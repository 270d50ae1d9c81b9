use std::sync::Arc;

use async_trait::async_trait;
use gsm_bus::{BusError, EventPublisher};
use gsm_core::{Activity, ActivityError, ActivityKind, TenantGate};
use gsm_session::{SharedClock, SharedStateStore, system_clock};
use gsm_telemetry::with_common_fields;
use metrics::counter;
use tracing::{Instrument, Span, debug, field::Empty, info, info_span, warn};

use crate::{
    bot::{BotLogic, BotState},
    oauth::{CredentialRef, DisabledTokenExchanger, OAuthCallback, TokenExchanger},
    ordering::ConversationLocks,
};

/// How the webhook transport hands work to the gateway core.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn handle_activity(&self, activity: Activity) -> Result<ActivityOutcome, ManagerError>;
    async fn handle_oauth_callback(
        &self,
        callback: OAuthCallback,
    ) -> Result<ActivityOutcome, ManagerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityOutcome {
    /// Published. `state_cached` is false when the state write failed or the state was dropped.
    Accepted {
        subject: String,
        event_id: String,
        attempts: u32,
        state_cached: bool,
    },
    /// The tenant is not admitted; nothing was stored or published.
    Rejected { tenant: String },
    SignedIn {
        credential: CredentialRef,
        state_cached: bool,
    },
}

impl ActivityOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityOutcome::Accepted { .. } => "accepted",
            ActivityOutcome::Rejected { .. } => "rejected",
            ActivityOutcome::SignedIn { .. } => "signed_in",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("invalid activity: {0}")]
    InvalidActivity(#[from] ActivityError),
    #[error("oauth callback carries no authorization code")]
    MissingAuthorizationCode,
    #[error("token exchange failed")]
    TokenExchange(#[source] anyhow::Error),
    #[error("failed to publish activity")]
    Publish(#[from] BusError),
}

impl ManagerError {
    fn as_str(&self) -> &'static str {
        match self {
            ManagerError::InvalidActivity(_) | ManagerError::MissingAuthorizationCode => "invalid",
            ManagerError::TokenExchange(_) => "oauth_failed",
            ManagerError::Publish(_) => "publish_failed",
        }
    }
}

/// Admits, tracks and forwards activities.
pub struct BotManager {
    gate: TenantGate,
    store: SharedStateStore,
    publisher: Arc<dyn EventPublisher>,
    logic: Arc<dyn BotLogic>,
    exchanger: Arc<dyn TokenExchanger>,
    clock: SharedClock,
    locks: ConversationLocks,
}

impl BotManager {
    pub fn new(
        gate: TenantGate,
        store: SharedStateStore,
        publisher: Arc<dyn EventPublisher>,
        logic: Arc<dyn BotLogic>,
    ) -> Self {
        Self {
            gate,
            store,
            publisher,
            logic,
            exchanger: Arc::new(DisabledTokenExchanger),
            clock: system_clock(),
            locks: ConversationLocks::new(),
        }
    }

    pub fn with_exchanger(mut self, exchanger: Arc<dyn TokenExchanger>) -> Self {
        self.exchanger = exchanger;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn gate(&self) -> &TenantGate {
        &self.gate
    }

    async fn process(&self, mut activity: Activity) -> Result<ActivityOutcome, ManagerError> {
        if !self.gate.check(activity.tenant_id()).is_allowed() {
            info!("tenant not admitted; ignoring activity");
            return Ok(ActivityOutcome::Rejected {
                tenant: activity.tenant_id().to_string(),
            });
        }
        activity.validate()?;
        if activity.ensure_id() {
            let minted = activity.activity_id().unwrap_or_default();
            Span::current().record("activity_id", minted);
            debug!(activity_id = minted, "assigned id to activity without one");
        }
        let tenant = activity.tenant_id();

        let kind = activity.kind();
        if kind == ActivityKind::OAuthCallback {
            let code = activity
                .authorization_code()
                .ok_or(ManagerError::MissingAuthorizationCode)?;
            let callback = OAuthCallback {
                tenant: tenant.to_string(),
                conversation_id: activity.conversation_id().to_string(),
                code: code.to_string(),
            };
            return self.sign_in(callback).await;
        }

        let conversation_id = activity.conversation_id();
        let turn = self.locks.lock(conversation_id).await;
        let prior = self.load(conversation_id).await;
        let step = self
            .logic
            .step(&activity, prior.as_ref(), self.clock.now());
        let state_cached = if kind == ActivityKind::EndOfConversation {
            self.forget(conversation_id).await;
            false
        } else {
            self.persist(conversation_id, &step.state).await
        };

        let _publish = turn.begin_publish().await;
        let delivery = self.publisher.publish(&step.event).await?;
        info!(
            subject = %delivery.subject,
            event_id = %delivery.event_id,
            attempts = delivery.attempts,
            turn = step.state.turns,
            "activity forwarded"
        );
        Ok(ActivityOutcome::Accepted {
            subject: delivery.subject,
            event_id: delivery.event_id,
            attempts: delivery.attempts,
            state_cached,
        })
    }

    /// Exchanges the code first so no conversation waits on the identity provider, then records
    /// the credential reference in order with the conversation's other activities.
    async fn sign_in(&self, callback: OAuthCallback) -> Result<ActivityOutcome, ManagerError> {
        let grant = self
            .exchanger
            .exchange(&callback.code)
            .await
            .map_err(ManagerError::TokenExchange)?;
        let credential = grant.credential_ref(self.exchanger.provider(), self.clock.now());

        let _turn = self.locks.lock(&callback.conversation_id).await;
        let mut state = self
            .load(&callback.conversation_id)
            .await
            .unwrap_or_default();
        state.credential = Some(credential.clone());
        let state_cached = self.persist(&callback.conversation_id, &state).await;
        info!(provider = %credential.provider, "credential recorded");
        Ok(ActivityOutcome::SignedIn {
            credential,
            state_cached,
        })
    }

    async fn load(&self, conversation_id: &str) -> Option<BotState> {
        match self.store.get(conversation_id).await {
            Ok(Some(entry)) => BotState::decode(conversation_id, &entry.blob),
            Ok(None) => None,
            Err(err) => {
                counter!("bot_state_store_errors_total", "op" => "get").increment(1);
                warn!(error = %err, "state load failed; continuing as a fresh conversation");
                None
            }
        }
    }

    async fn persist(&self, conversation_id: &str, state: &BotState) -> bool {
        let blob = match state.encode() {
            Ok(blob) => blob,
            Err(err) => {
                warn!(error = %err, "failed to encode bot state");
                return false;
            }
        };
        match self.store.put(conversation_id, &blob).await {
            Ok(_) => true,
            Err(err) => {
                counter!("bot_state_store_errors_total", "op" => "put").increment(1);
                warn!(error = %err, "state write failed; forwarding anyway");
                false
            }
        }
    }

    async fn forget(&self, conversation_id: &str) {
        if let Err(err) = self.store.delete(conversation_id).await {
            counter!("bot_state_store_errors_total", "op" => "delete").increment(1);
            warn!(error = %err, "state delete failed");
        }
    }
}

fn record_outcome(result: &Result<ActivityOutcome, ManagerError>) {
    let outcome = match result {
        Ok(outcome) => outcome.as_str(),
        Err(err) => err.as_str(),
    };
    counter!("bot_activities_total", "outcome" => outcome).increment(1);
    if let Err(err) = result {
        warn!(outcome, error = %err, "activity failed");
    }
}

#[async_trait]
impl ActivityHandler for BotManager {
    async fn handle_activity(&self, activity: Activity) -> Result<ActivityOutcome, ManagerError> {
        let span = info_span!(
            "bot.handle_activity",
            kind = activity.kind().as_str(),
            tenant = Empty,
            conversation_id = Empty,
            activity_id = Empty
        );
        with_common_fields(
            &span,
            activity.tenant_id(),
            Some(activity.conversation_id()),
            activity.id.as_deref(),
        );
        let result = self.process(activity).instrument(span.clone()).await;
        span.in_scope(|| record_outcome(&result));
        result
    }

    async fn handle_oauth_callback(
        &self,
        callback: OAuthCallback,
    ) -> Result<ActivityOutcome, ManagerError> {
        let span = info_span!(
            "bot.handle_oauth_callback",
            tenant = Empty,
            conversation_id = Empty,
            activity_id = Empty
        );
        with_common_fields(
            &span,
            &callback.tenant,
            Some(&callback.conversation_id),
            None,
        );
        let result = async {
            if !self.gate.check(&callback.tenant).is_allowed() {
                info!("tenant not admitted; ignoring oauth callback");
                return Ok(ActivityOutcome::Rejected {
                    tenant: callback.tenant.clone(),
                });
            }
            if callback.code.trim().is_empty() {
                return Err(ManagerError::MissingAuthorizationCode);
            }
            self.sign_in(callback).await
        }
        .instrument(span.clone())
        .await;
        span.in_scope(|| record_outcome(&result));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::ForwardingBot;
    use gsm_bus::{MemoryTransport, MessageBroker, RetryPolicy, Topology};
    use gsm_core::{ACTIVITY_SUBJECT_PREFIX, TenantPolicy};
    use gsm_session::{ConversationStateStore, ManualClock, MemoryStateStore};
    use serde_json::json;
    use std::time::Duration;
    use time::macros::datetime;
    use tracing_test::traced_test;

    async fn broker(transport: MemoryTransport) -> Arc<MessageBroker<MemoryTransport>> {
        let broker = MessageBroker::new(
            transport,
            Topology::new("ACTIVITIES", vec!["greentic.bot.activity.>".into()]),
        )
        .with_retry(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        });
        broker.setup().await.unwrap();
        Arc::new(broker)
    }

    fn activity(kind: &str, id: &str, tenant: &str) -> Activity {
        serde_json::from_value(json!({
            "type": kind,
            "id": id,
            "channelId": "msteams",
            "conversation": { "id": "conv-1", "tenantId": tenant },
            "from": { "id": "user-1" },
            "text": "hello"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn accepted_activity_is_cached_and_published() {
        let transport = MemoryTransport::new();
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        let store = Arc::new(MemoryStateStore::with_clock(
            Duration::from_secs(1800),
            clock.clone(),
        ));
        let manager = BotManager::new(
            TenantGate::new(TenantPolicy::allow_list(["acme"])),
            store.clone(),
            broker(transport.clone()).await,
            Arc::new(ForwardingBot::new(ACTIVITY_SUBJECT_PREFIX)),
        )
        .with_clock(clock);

        let outcome = manager
            .handle_activity(activity("message", "a1", "acme"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ActivityOutcome::Accepted {
                subject: "greentic.bot.activity.acme.msteams.conv-1".into(),
                event_id: "msteams:a1".into(),
                attempts: 1,
                state_cached: true,
            }
        );
        let cached = store.get("conv-1").await.unwrap().unwrap();
        let state = BotState::decode("conv-1", &cached.blob).unwrap();
        assert_eq!(state.turns, 1);
        let published = transport.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].json()["sender_id"], "user-1");
    }

    #[tokio::test]
    #[traced_test]
    async fn rejection_is_logged_and_nothing_is_published() {
        let transport = MemoryTransport::new();
        let manager = BotManager::new(
            TenantGate::new(TenantPolicy::allow_list(["tenantX"])),
            Arc::new(MemoryStateStore::new(Duration::from_secs(60))),
            broker(transport.clone()).await,
            Arc::new(ForwardingBot::new(ACTIVITY_SUBJECT_PREFIX)),
        );
        let outcome = manager
            .handle_activity(activity("message", "a1", "tenantY"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ActivityOutcome::Rejected {
                tenant: "tenantY".into()
            }
        );
        assert!(logs_contain("tenant not admitted"));
        assert_eq!(transport.publish_attempts(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn store_failure_is_logged_but_not_fatal() {
        struct Down;

        #[async_trait]
        impl gsm_session::ConversationStateStore for Down {
            async fn get(
                &self,
                _conversation_id: &str,
            ) -> Result<Option<gsm_session::ConversationState>, gsm_session::StoreError> {
                Err(gsm_session::StoreError::unavailable(std::io::Error::other(
                    "connection refused",
                )))
            }

            async fn put(
                &self,
                _conversation_id: &str,
                _blob: &str,
            ) -> Result<gsm_session::ConversationState, gsm_session::StoreError> {
                Err(gsm_session::StoreError::unavailable(std::io::Error::other(
                    "connection refused",
                )))
            }

            async fn delete(&self, _conversation_id: &str) -> Result<(), gsm_session::StoreError> {
                Ok(())
            }

            fn ttl(&self) -> Duration {
                Duration::from_secs(60)
            }
        }

        let transport = MemoryTransport::new();
        let manager = BotManager::new(
            TenantGate::allow_all(),
            Arc::new(Down),
            broker(transport.clone()).await,
            Arc::new(ForwardingBot::new(ACTIVITY_SUBJECT_PREFIX)),
        );
        let outcome = manager
            .handle_activity(activity("message", "a1", "acme"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ActivityOutcome::Accepted {
                state_cached: false,
                ..
            }
        ));
        assert!(logs_contain("state write failed"));
        assert_eq!(transport.published().await.len(), 1);
    }

    #[tokio::test]
    async fn invalid_activity_is_an_error() {
        let manager = BotManager::new(
            TenantGate::allow_all(),
            Arc::new(MemoryStateStore::new(Duration::from_secs(60))),
            broker(MemoryTransport::new()).await,
            Arc::new(ForwardingBot::new(ACTIVITY_SUBJECT_PREFIX)),
        );
        let mut bad = activity("message", "a1", "acme");
        bad.conversation.id.clear();
        let err = manager.handle_activity(bad).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::InvalidActivity(ActivityError::MissingConversation)
        ));
    }

    #[tokio::test]
    async fn malformed_activity_from_unlisted_tenant_is_dropped_silently() {
        let transport = MemoryTransport::new();
        let manager = BotManager::new(
            TenantGate::new(TenantPolicy::allow_list(["tenantX"])),
            Arc::new(MemoryStateStore::new(Duration::from_secs(60))),
            broker(transport.clone()).await,
            Arc::new(ForwardingBot::new(ACTIVITY_SUBJECT_PREFIX)),
        );
        let mut bad = activity("message", "a1", "tenantY");
        bad.conversation.id.clear();
        let outcome = manager.handle_activity(bad).await.unwrap();
        assert_eq!(
            outcome,
            ActivityOutcome::Rejected {
                tenant: "tenantY".into()
            }
        );
        assert_eq!(transport.publish_attempts(), 0);
    }

    #[tokio::test]
    async fn oauth_invoke_without_code_is_rejected_as_invalid() {
        let transport = MemoryTransport::new();
        let manager = BotManager::new(
            TenantGate::allow_all(),
            Arc::new(MemoryStateStore::new(Duration::from_secs(60))),
            broker(transport.clone()).await,
            Arc::new(ForwardingBot::new(ACTIVITY_SUBJECT_PREFIX)),
        );
        let mut invoke = activity("invoke", "a1", "acme");
        invoke.name = Some("signin/verifyState".into());
        let err = manager.handle_activity(invoke).await.unwrap_err();
        assert!(matches!(err, ManagerError::MissingAuthorizationCode));
        assert!(transport.published().await.is_empty());
    }
}
