use anyhow::{Context, Result};
use staking_indexer::{config, runner};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = config::load_config()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("staking indexer starting");
    tracing::info!(
        chain_id = cfg.ethereum.chain_id,
        contract = %cfg.ethereum.contract_address,
        rpc_urls = cfg.ethereum.rpc_urls.len(),
        confirmations = cfg.ethereum.confirmations,
        batch_size = cfg.scanner.batch_size,
        "config loaded"
    );

    let shutdown = CancellationToken::new();

    let mut tasks: tokio::task::JoinSet<Result<()>> = tokio::task::JoinSet::new();
    let scanner_shutdown = shutdown.clone();
    tasks.spawn(async move { runner::run(cfg, scanner_shutdown).await });

    tracing::info!("staking indexer started");

    let mut fatal: Option<anyhow::Error> = None;
    tokio::select! {
        res = interrupted() => {
            res?;
            tracing::info!("shutdown requested");
        },
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res.context("scanner task panicked")? {
                    Ok(()) => fatal = Some(anyhow::anyhow!("scanner task exited unexpectedly")),
                    Err(e) => fatal = Some(e.context("scanner task failed")),
                }
            }
        }
    }

    shutdown.cancel();

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined.context("scanner task panicked")? {
            fatal.get_or_insert(e.context("scanner task failed"));
        }
    }

    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Resolves once the process is asked to stop.
#[cfg(unix)]
async fn interrupted() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt()).context("listen for SIGINT")?;
    let mut terminate = signal(SignalKind::terminate()).context("listen for SIGTERM")?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn interrupted() -> Result<()> {
    tokio::signal::ctrl_c().await.context("listen for ctrl-c")
}
