//! Graceful shutdown.
//!
//! One deadline bounds the whole sequence: stop intake, wait for in-flight activities, close
//! the broker with whatever time is left, then report.

use std::sync::Arc;
use std::time::Duration;

use gsm_bus::BrokerLifecycle;
use tokio::time::Instant;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every activity finished and the broker drained before the deadline.
    Clean,
    /// Something was still running at the deadline and was abandoned.
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub outcome: ShutdownOutcome,
    /// Activity tasks still running when the deadline passed.
    pub abandoned_activities: usize,
    /// Event ids of publishes the broker abandoned.
    pub abandoned_publishes: Vec<String>,
    pub broker_error: Option<String>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// Non-zero only when the broker failed to close.
    pub fn exit_code(&self) -> i32 {
        if self.broker_error.is_some() { 1 } else { 0 }
    }
}

pub struct ShutdownCoordinator {
    intake: CancellationToken,
    tracker: TaskTracker,
    broker: Arc<dyn BrokerLifecycle>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(
        intake: CancellationToken,
        tracker: TaskTracker,
        broker: Arc<dyn BrokerLifecycle>,
        timeout: Duration,
    ) -> Self {
        Self {
            intake,
            tracker,
            broker,
            timeout,
        }
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        let started = Instant::now();
        let deadline = started + self.timeout;
        info!(
            timeout = ?self.timeout,
            in_flight = self.tracker.len(),
            "shutdown started"
        );

        self.intake.cancel();
        self.tracker.close();
        let abandoned_activities = match tokio::time::timeout_at(deadline, self.tracker.wait()).await
        {
            Ok(()) => 0,
            Err(_) => {
                let remaining = self.tracker.len();
                warn!(remaining, "activities still running at the shutdown deadline");
                remaining
            }
        };

        let budget = deadline.saturating_duration_since(Instant::now());
        debug!(?budget, "closing broker");
        let (abandoned_publishes, broker_error, transport_closed) =
            match self.broker.close(budget).await {
                Ok(report) => (report.abandoned, None, report.transport_closed),
                Err(err) => {
                    warn!(error = %err, "broker close failed");
                    (Vec::new(), Some(err.to_string()), false)
                }
            };

        let outcome = if abandoned_activities == 0
            && abandoned_publishes.is_empty()
            && broker_error.is_none()
            && transport_closed
        {
            ShutdownOutcome::Clean
        } else {
            ShutdownOutcome::Forced
        };
        let report = ShutdownReport {
            outcome,
            abandoned_activities,
            abandoned_publishes,
            broker_error,
            elapsed: started.elapsed(),
        };
        info!(
            outcome = ?report.outcome,
            abandoned_activities = report.abandoned_activities,
            abandoned_publishes = report.abandoned_publishes.len(),
            elapsed = ?report.elapsed,
            "shutdown finished"
        );
        report
    }
}

/// Returns a token cancelled on SIGINT or SIGTERM.
pub fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("received SIGINT, shutting down"),
                        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                        _ = cancel.cancelled() => return,
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler; listening for SIGINT only");
                    tokio::select! {
                        _ = ctrl_c => info!("received SIGINT, shutting down"),
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = ctrl_c => info!("received Ctrl+C, shutting down"),
                _ = cancel.cancelled() => return,
            }
        }

        cancel.cancel();
    });

    token
}
