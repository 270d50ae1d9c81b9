use std::time::Duration;

use anyhow::Result;
use axum::serve;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{config::GatewayConfig, context::GatewayContext, shutdown::install_signal_handler};

/// How long the HTTP server may take to close its connections after the shutdown report.
const SERVER_STOP_GRACE: Duration = Duration::from_secs(1);

/// Starts the gateway and blocks until SIGINT/SIGTERM has been handled. Returns the process
/// exit code.
pub async fn run(config: GatewayConfig) -> Result<i32> {
    let addr = config.socket_addr()?;
    let context = GatewayContext::from_config(config).await?;
    let listener = TcpListener::bind(addr).await?;
    serve_until(context, listener, install_signal_handler()).await
}

/// Serves `context` on `listener` until `stop` fires, then runs the shutdown sequence.
pub async fn serve_until(
    context: GatewayContext,
    listener: TcpListener,
    stop: CancellationToken,
) -> Result<i32> {
    let intake = context.intake();
    let router = context.router();
    info!(addr = %listener.local_addr()?, "bot-gateway listening");

    let server_intake = intake.clone();
    let mut server = tokio::spawn(async move {
        serve(listener, router)
            .with_graceful_shutdown(async move { server_intake.cancelled().await })
            .await
    });

    let mut server_failed = false;
    let mut server_done = false;
    tokio::select! {
        _ = stop.cancelled() => {}
        _ = intake.cancelled() => {}
        result = &mut server => {
            server_done = true;
            match result {
                Ok(Ok(())) => warn!("http server stopped unexpectedly"),
                Ok(Err(err)) => {
                    server_failed = true;
                    error!(error = %err, "http server failed");
                }
                Err(err) => {
                    server_failed = true;
                    error!(error = %err, "http server task panicked");
                }
            }
        }
    }

    let report = context.shutdown_coordinator().shutdown().await;

    if !server_done {
        let abort = server.abort_handle();
        if tokio::time::timeout(SERVER_STOP_GRACE, server).await.is_err() {
            warn!("http server did not stop in time; aborting open connections");
            abort.abort();
        }
    }

    let code = if server_failed {
        1
    } else {
        report.exit_code()
    };
    info!(code, outcome = ?report.outcome, "bot-gateway exiting");
    Ok(code)
}
