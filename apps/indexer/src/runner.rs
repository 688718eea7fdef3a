use crate::chain::ChainClient;
use crate::config::{AppConfig, EthereumConfig, ScannerConfig};
use crate::db::{self, Db};
use crate::metrics::ScannerTelemetry;
use crate::processor;
use crate::reorg;
use crate::repo::{Repository, ScanCursor};
use crate::rpc::{self, RpcClient};
use anyhow::{Context, Result};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Migration version this binary expects to find applied.
pub const SCHEMA_VERSION: i64 = 1;

pub async fn run(cfg: AppConfig, shutdown: CancellationToken) -> Result<()> {
    let dbh = Db::connect(&cfg.database).await?;
    db::ensure_schema_version(&dbh, SCHEMA_VERSION).await?;

    let chain = RpcClient::new(cfg.ethereum.rpc_urls.clone()).context("build rpc client")?;
    let telemetry = ScannerTelemetry::new(cfg.ethereum.chain_id, &cfg.ethereum.contract_address);

    run_scanner(
        &dbh,
        &chain,
        &telemetry,
        &cfg.ethereum,
        &cfg.scanner,
        &shutdown,
    )
    .await
}

/// What a single tick did. Surfaced for tests and progress logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The safe head has not moved past the cursor.
    Idle,
    /// Blocks were processed and the cursor now sits at `to`.
    Advanced { to: i64 },
    /// A reorg was unwound; the next tick restarts from the new cursor.
    ReorgHandled { ancestor: i64 },
}

/// Drives the cursor until cancelled. Every error below bootstrap is
/// absorbed here: transient ones at warn, the rest at error, and the next
/// tick retries from the last committed cursor.
pub async fn run_scanner<R: Repository, C: ChainClient>(
    repo: &R,
    chain: &C,
    telemetry: &ScannerTelemetry,
    eth: &EthereumConfig,
    scan: &ScannerConfig,
    shutdown: &CancellationToken,
) -> Result<()> {
    let cursor = bootstrap_cursor(repo, eth).await?;

    info!(
        chain_id = eth.chain_id,
        contract = %eth.contract_address,
        last_scanned_block = cursor.last_scanned_block,
        confirmations = eth.confirmations,
        batch_size = scan.batch_size,
        scan_interval_secs = scan.scan_interval.as_secs(),
        scan_timeout_secs = scan.scan_timeout.as_secs(),
        "scanner starting"
    );

    let mut ticker = time::interval(scan.scan_interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(chain_id = eth.chain_id, contract = %eth.contract_address, "scanner stopped");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        match scan_tick(repo, chain, telemetry, eth, scan, shutdown).await {
            Ok(TickOutcome::Idle) => {}
            Ok(TickOutcome::Advanced { to }) => {
                debug!(
                    chain_id = eth.chain_id,
                    contract = %eth.contract_address,
                    last_scanned_block = to,
                    "tick advanced"
                );
            }
            Ok(TickOutcome::ReorgHandled { ancestor }) => {
                info!(
                    chain_id = eth.chain_id,
                    contract = %eth.contract_address,
                    ancestor,
                    "reorg handled, restarting scan from new cursor"
                );
            }
            Err(e) if rpc::is_transient(&e) => {
                warn!(
                    chain_id = eth.chain_id,
                    contract = %eth.contract_address,
                    err = %e,
                    "transient scan error, retrying next tick"
                );
            }
            Err(e) => {
                error!(
                    chain_id = eth.chain_id,
                    contract = %eth.contract_address,
                    err = ?e,
                    "scan tick failed"
                );
            }
        }
    }
}

/// Ensures the scope's cursor row exists, seeding it at the configured start
/// block on first run.
pub async fn bootstrap_cursor<R: Repository>(
    repo: &R,
    eth: &EthereumConfig,
) -> Result<ScanCursor> {
    if let Some(cursor) = repo.get_cursor(eth.chain_id, &eth.contract_address).await? {
        return Ok(cursor);
    }

    repo.init_cursor(eth.chain_id, &eth.contract_address, eth.start_block)
        .await
        .context("bootstrap scan cursor")?;
    info!(
        chain_id = eth.chain_id,
        contract = %eth.contract_address,
        start_block = eth.start_block,
        "scan cursor initialized"
    );

    repo.get_cursor(eth.chain_id, &eth.contract_address)
        .await?
        .context("scan cursor missing after bootstrap")
}

/// One pass of the scan loop: read the cursor, compute the confirmed window,
/// and process at most `batch_size` blocks, advancing the cursor after each
/// commit. A handled reorg aborts the tick so the next one re-reads the
/// rewound cursor.
///
/// All chain and repository calls except the post-commit cursor update run
/// under the tick deadline; the cursor write deliberately does not, so a
/// slow tick can never strand an already committed block.
pub async fn scan_tick<R: Repository, C: ChainClient>(
    repo: &R,
    chain: &C,
    telemetry: &ScannerTelemetry,
    eth: &EthereumConfig,
    scan: &ScannerConfig,
    shutdown: &CancellationToken,
) -> Result<TickOutcome> {
    let deadline = Instant::now() + scan.scan_timeout;

    let cursor = repo
        .get_cursor(eth.chain_id, &eth.contract_address)
        .await?
        .context("scan cursor missing for scope")?;

    let rpc_start = std::time::Instant::now();
    let latest_height = with_deadline(deadline, chain.latest_height())
        .await
        .inspect_err(|_| telemetry.rpc_error("latest_height"))
        .context("fetch latest height")?;
    telemetry.observe_rpc_latency_ms("latest_height", rpc_start.elapsed().as_millis() as u64);
    let latest = i64::try_from(latest_height).context("latest height out of i64 range")?;

    let safe = latest - eth.confirmations;
    telemetry.set_chain_position(
        latest_height,
        safe.max(0) as u64,
        cursor.last_scanned_block.max(0) as u64,
    );

    if safe <= cursor.last_scanned_block {
        return Ok(TickOutcome::Idle);
    }

    let end = safe.min(cursor.last_scanned_block + scan.batch_size);
    info!(
        chain_id = eth.chain_id,
        contract = %eth.contract_address,
        from = cursor.last_scanned_block + 1,
        to = end,
        latest,
        safe,
        "scanning blocks"
    );

    let mut last_scanned = cursor.last_scanned_block;
    for n in (cursor.last_scanned_block + 1)..=end {
        if shutdown.is_cancelled() {
            break;
        }

        let header = with_deadline(
            deadline,
            chain.header_at(u64::try_from(n).context("block number out of range")?),
        )
        .await
        .with_context(|| format!("fetch header for block {n}"))?
        .with_context(|| format!("header not found for block {n}"))?;

        let handled = with_deadline(
            deadline,
            reorg::check_and_handle_reorg(
                repo,
                chain,
                telemetry,
                eth.chain_id,
                &eth.contract_address,
                n,
                &header.parent_hash,
            ),
        )
        .await
        .with_context(|| format!("reorg check at block {n}"))?;
        if let Some(ancestor) = handled {
            return Ok(TickOutcome::ReorgHandled { ancestor });
        }

        with_deadline(
            deadline,
            processor::process_block(
                repo,
                chain,
                telemetry,
                eth.chain_id,
                &eth.contract_address,
                n,
            ),
        )
        .await?;

        repo.update_cursor(eth.chain_id, &eth.contract_address, n, n)
            .await
            .with_context(|| format!("update cursor at block {n}"))?;
        telemetry.set_chain_position(latest_height, safe.max(0) as u64, n.max(0) as u64);
        last_scanned = n;
    }

    Ok(if last_scanned == cursor.last_scanned_block {
        TickOutcome::Idle
    } else {
        TickOutcome::Advanced { to: last_scanned }
    })
}

async fn with_deadline<T>(
    deadline: Instant,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match time::timeout_at(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(anyhow::anyhow!("scan tick deadline exceeded")),
    }
}
