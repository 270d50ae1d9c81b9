use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use gsm_core::OutboundEvent;
use metrics::counter;
use tokio::sync::{Mutex, Notify, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    BrokerLifecycle, BusError, EventPublisher, RetryPolicy, to_payload,
    transport::{BusTransport, Topology},
};

const DEFAULT_SETUP_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Unconnected,
    Connecting,
    Ready,
    Reconnecting,
    Draining,
    Closed,
}

impl BrokerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerState::Unconnected => "unconnected",
            BrokerState::Connecting => "connecting",
            BrokerState::Ready => "ready",
            BrokerState::Reconnecting => "reconnecting",
            BrokerState::Draining => "draining",
            BrokerState::Closed => "closed",
        }
    }

    fn accepts_publish(&self) -> Result<(), BusError> {
        match self {
            BrokerState::Ready | BrokerState::Reconnecting => Ok(()),
            BrokerState::Unconnected | BrokerState::Connecting => Err(BusError::NotConnected),
            BrokerState::Draining | BrokerState::Closed => Err(BusError::BrokerClosed),
        }
    }
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub subject: String,
    pub event_id: String,
    pub attempts: u32,
}

/// What `close` left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseReport {
    /// Every in-flight publish settled before the deadline.
    pub drained: bool,
    /// Event ids of publishes still in flight at the deadline.
    pub abandoned: Vec<String>,
    /// The transport finished closing before the deadline.
    pub transport_closed: bool,
}

/// Owns the broker connection and enforces the publish/drain rules.
///
/// State machine: `Unconnected -> Connecting -> Ready <-> Reconnecting -> Draining -> Closed`.
/// Publishes are accepted in `Ready` and `Reconnecting` only.
pub struct MessageBroker<T: BusTransport> {
    transport: T,
    topology: Topology,
    retry: RetryPolicy,
    setup_attempts: u32,
    state: watch::Sender<BrokerState>,
    setup_lock: Mutex<()>,
    in_flight: DashMap<u64, String>,
    next_publish: AtomicU64,
    settled: Notify,
    abandon: CancellationToken,
}

impl<T: BusTransport> MessageBroker<T> {
    pub fn new(transport: T, topology: Topology) -> Self {
        let (state, _) = watch::channel(BrokerState::Unconnected);
        Self {
            transport,
            topology,
            retry: RetryPolicy::default(),
            setup_attempts: DEFAULT_SETUP_ATTEMPTS,
            state,
            setup_lock: Mutex::new(()),
            in_flight: DashMap::new(),
            next_publish: AtomicU64::new(0),
            settled: Notify::new(),
            abandon: CancellationToken::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_setup_attempts(mut self, attempts: u32) -> Self {
        self.setup_attempts = attempts.max(1);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn state(&self) -> BrokerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BrokerState> {
        self.state.subscribe()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Connects and declares topology. Calling it again once ready is a no-op. A `close` that
    /// lands while setup is still retrying wins: setup stops and reports `BrokerClosed`.
    pub async fn setup(&self) -> Result<(), BusError> {
        let _guard = self.setup_lock.lock().await;
        let started = self.state.send_if_modified(|state| match state {
            BrokerState::Unconnected | BrokerState::Connecting => {
                *state = BrokerState::Connecting;
                true
            }
            _ => false,
        });
        if !started {
            return match self.state() {
                BrokerState::Draining | BrokerState::Closed => Err(BusError::BrokerClosed),
                _ => Ok(()),
            };
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.connect_and_declare().await;
            if self.state() != BrokerState::Connecting {
                return self.abandon_setup(attempt, result.is_ok()).await;
            }
            match result {
                Ok(()) => {
                    if !self.leave_connecting(BrokerState::Ready) {
                        return self.abandon_setup(attempt, true).await;
                    }
                    info!(
                        stream = %self.topology.stream_name,
                        attempt,
                        "broker ready"
                    );
                    return Ok(());
                }
                Err(err) if attempt >= self.setup_attempts => {
                    self.leave_connecting(BrokerState::Unconnected);
                    return Err(BusError::SetupFailed {
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    warn!(attempt, error = %err, "broker setup attempt failed");
                    self.retry.sleep(attempt - 1).await;
                }
            }
        }
    }

    async fn abandon_setup(&self, attempt: u32, connected: bool) -> Result<(), BusError> {
        if connected {
            if let Err(err) = self.transport.close().await {
                warn!(error = %err, "failed to close connection opened during shutdown");
            }
        }
        info!(attempt, "broker closed during setup");
        Err(BusError::BrokerClosed)
    }

    /// Moves `Connecting` to `next`; false when a close already took over.
    fn leave_connecting(&self, next: BrokerState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == BrokerState::Connecting {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    async fn connect_and_declare(&self) -> anyhow::Result<()> {
        self.transport.connect().await?;
        self.transport.ensure_topology(&self.topology).await
    }

    /// Publishes `event` and waits for the broker acknowledgement, reconnecting and retrying
    /// transient failures up to the retry budget.
    pub async fn publish(&self, event: &OutboundEvent) -> Result<Delivery, BusError> {
        // Register before checking state so a concurrent close either rejects us or waits.
        let _in_flight = self.track(&event.event_id);
        self.state().accepts_publish()?;
        let payload = to_payload(event)?;

        let span = info_span!(
            "bus.publish",
            subject = %event.subject,
            event_id = %event.event_id
        );
        async move {
            let mut attempt = 0;
            loop {
                attempt += 1;
                counter!("bus_publish_attempts_total").increment(1);
                let result = tokio::select! {
                    biased;
                    _ = self.abandon.cancelled() => return Err(BusError::BrokerClosed),
                    result = self.transport.publish(&event.subject, &event.event_id, payload.clone()) => result,
                };
                match result {
                    Ok(()) => {
                        self.mark_recovered();
                        debug!(attempt, "event published");
                        return Ok(Delivery {
                            subject: event.subject.clone(),
                            event_id: event.event_id.clone(),
                            attempts: attempt,
                        });
                    }
                    Err(err) if attempt > self.retry.max_retries => {
                        counter!("bus_publish_failures_total").increment(1);
                        return Err(BusError::PublishFailed {
                            subject: event.subject.clone(),
                            attempts: attempt,
                            source: err,
                        });
                    }
                    Err(err) => {
                        warn!(attempt, error = %err, "publish failed; reconnecting");
                        self.mark_reconnecting();
                        tokio::select! {
                            biased;
                            _ = self.abandon.cancelled() => return Err(BusError::BrokerClosed),
                            _ = self.retry.sleep(attempt - 1) => {}
                        }
                        if let Err(err) = self.transport.reconnect().await {
                            warn!(attempt, error = %err, "reconnect failed");
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Stops accepting publishes, waits up to `timeout` for in-flight publishes to settle,
    /// then closes the transport. Publishes still running at the deadline are abandoned and
    /// listed in the report; only a transport error makes this fail.
    pub async fn close(&self, timeout: Duration) -> Result<CloseReport, BusError> {
        let deadline = Instant::now() + timeout;
        let previous = self.state.send_replace(BrokerState::Draining);
        if previous == BrokerState::Closed {
            self.state.send_replace(BrokerState::Closed);
            return Ok(CloseReport {
                drained: true,
                abandoned: Vec::new(),
                transport_closed: true,
            });
        }
        info!(in_flight = self.in_flight.len(), ?timeout, "draining broker");

        let drained = tokio::time::timeout_at(deadline, self.wait_settled())
            .await
            .is_ok();
        let mut abandoned: Vec<String> = self
            .in_flight
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        abandoned.sort();
        self.abandon.cancel();
        if !abandoned.is_empty() {
            counter!("bus_abandoned_total").increment(abandoned.len() as u64);
            warn!(abandoned = ?abandoned, "drain deadline reached; abandoning in-flight publishes");
        }

        let closed = tokio::time::timeout_at(deadline, self.transport.close()).await;
        self.state.send_replace(BrokerState::Closed);
        let transport_closed = match closed {
            Ok(Ok(())) => true,
            Ok(Err(err)) => return Err(BusError::Close(err)),
            Err(_) => {
                warn!("transport close did not finish before the deadline");
                false
            }
        };
        info!(drained, transport_closed, "broker closed");
        Ok(CloseReport {
            drained,
            abandoned,
            transport_closed,
        })
    }

    async fn wait_settled(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn track(&self, event_id: &str) -> InFlight<'_> {
        let id = self.next_publish.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(id, event_id.to_string());
        InFlight {
            map: &self.in_flight,
            settled: &self.settled,
            id,
        }
    }

    fn mark_reconnecting(&self) {
        self.state.send_if_modified(|state| {
            if *state == BrokerState::Ready {
                *state = BrokerState::Reconnecting;
                true
            } else {
                false
            }
        });
    }

    fn mark_recovered(&self) {
        self.state.send_if_modified(|state| {
            if *state == BrokerState::Reconnecting {
                *state = BrokerState::Ready;
                true
            } else {
                false
            }
        });
    }
}

struct InFlight<'a> {
    map: &'a DashMap<u64, String>,
    settled: &'a Notify,
    id: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.id);
        self.settled.notify_waiters();
    }
}

#[async_trait]
impl<T: BusTransport> EventPublisher for MessageBroker<T> {
    async fn publish(&self, event: &OutboundEvent) -> Result<Delivery, BusError> {
        MessageBroker::publish(self, event).await
    }
}

#[async_trait]
impl<T: BusTransport> BrokerLifecycle for MessageBroker<T> {
    async fn close(&self, timeout: Duration) -> Result<CloseReport, BusError> {
        MessageBroker::close(self, timeout).await
    }

    fn state(&self) -> BrokerState {
        MessageBroker::state(self)
    }
}
