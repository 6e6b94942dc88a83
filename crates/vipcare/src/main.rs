use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use vipcare::cli::Cli;
use vipcare::runner::{Runner, shutdown_signal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.log_json {
        common::logging::init_json();
    } else {
        common::logging::init();
    }

    let config = cli.into_config().context("invalid configuration")?;
    let runner = Runner::new(config).context("failed to initialize")?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    runner.run(cancel).await.context("vipcare failed")?;
    Ok(())
}
