use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use gsm_bot_gateway::{GatewayConfig, run};
use gsm_telemetry::{install as init_telemetry, shutdown_telemetry};

#[derive(Parser, Debug)]
#[command(author, version, about = "Greentic bot activity gateway")]
struct Cli {
    /// TOML config file; `GSM_*` environment variables override it
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::load(cli.config.as_deref())?;
    init_telemetry(&config.telemetry)?;

    let result = run(config).await;
    // `process::exit` skips destructors, so batched spans are flushed here.
    tokio::task::spawn_blocking(shutdown_telemetry).await?;
    let code = result?;
    std::process::exit(code);
}
