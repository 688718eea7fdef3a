use crate::chain::ChainClient;
use crate::metrics::ScannerTelemetry;
use crate::repo::Repository;
use anyhow::{Context, Result};
use tracing::{info, warn};

/// Compares the stored hash of block `n-1` against block `n`'s parent hash.
/// On divergence, walks back to the common ancestor and atomically unwinds
/// everything above it. Returns the ancestor height when a rollback happened.
///
/// The walk is O(reorg depth); a reorg deeper than the confirmation window is
/// a chain-safety violation this system does not try to survive.
pub async fn check_and_handle_reorg<R: Repository, C: ChainClient>(
    repo: &R,
    chain: &C,
    telemetry: &ScannerTelemetry,
    chain_id: i64,
    contract_address: &str,
    block_number: i64,
    parent_hash: &str,
) -> Result<Option<i64>> {
    let Some(prev) = repo.get_block(chain_id, block_number - 1).await? else {
        // Nothing stored to compare against (first block of the scope).
        return Ok(None);
    };

    if prev.block_hash == parent_hash {
        return Ok(None);
    }

    warn!(
        chain_id,
        contract = %contract_address,
        block = block_number,
        prev_block = block_number - 1,
        db_hash = %prev.block_hash,
        parent_hash = %parent_hash,
        "reorg detected"
    );

    let ancestor = find_common_ancestor(repo, chain, chain_id, block_number - 1)
        .await
        .context("find common ancestor")?;

    info!(
        chain_id,
        contract = %contract_address,
        ancestor,
        "found common ancestor, rolling back"
    );

    repo.handle_reorg(chain_id, contract_address, ancestor)
        .await
        .inspect_err(|_| telemetry.db_error("handle_reorg"))
        .context("reorg rollback")?;

    let rolled_back = (block_number - 1 - ancestor).max(0) as u64;
    telemetry.reorg_detected(rolled_back);

    Ok(Some(ancestor))
}

/// Walks down from `start_block` until a stored block hash matches the live
/// chain. A height we never stored terminates the walk there; height 0 is the
/// floor.
async fn find_common_ancestor<R: Repository, C: ChainClient>(
    repo: &R,
    chain: &C,
    chain_id: i64,
    start_block: i64,
) -> Result<i64> {
    let mut current = start_block;
    while current > 0 {
        let Some(stored) = repo.get_block(chain_id, current).await? else {
            return Ok(current);
        };

        let header = chain
            .header_at(u64::try_from(current).context("block number out of range")?)
            .await
            .with_context(|| format!("fetch header for block {current}"))?
            .with_context(|| format!("header not found for block {current}"))?;

        if stored.block_hash == header.hash {
            return Ok(current);
        }
        current -= 1;
    }
    Ok(0)
}
