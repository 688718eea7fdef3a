use alloy::primitives::B256;
use anyhow::{Context, Result};

/// A log whose positional fields (block number, tx hash, log index) are known
/// to be present. Pending or removed logs never make it past validation.
#[derive(Debug, Clone)]
pub struct ValidatedLog {
    pub log: alloy::rpc::types::Log,
    pub block_number: u64,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub log_index: u64,
}

/// Rejects logs missing positional metadata and orders the rest ascending by
/// `(block_number, log_index)`. Projection folds depend on this ordering.
pub fn validate_and_sort_logs(raw: Vec<alloy::rpc::types::Log>) -> Result<Vec<ValidatedLog>> {
    let mut out = Vec::with_capacity(raw.len());
    for log in raw {
        if log.removed {
            anyhow::bail!("eth_getLogs returned a removed log");
        }
        let block_number = log.block_number.context("log missing blockNumber")?;
        let block_hash = log.block_hash.context("log missing blockHash")?;
        let tx_hash = log.transaction_hash.context("log missing transactionHash")?;
        let log_index = log.log_index.context("log missing logIndex")?;
        out.push(ValidatedLog {
            log,
            block_number,
            block_hash,
            tx_hash,
            log_index,
        });
    }
    out.sort_by_key(|l| (l.block_number, l.log_index));
    Ok(out)
}
