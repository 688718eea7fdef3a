use crate::chain::ChainClient;
use crate::decode::{self, DecodedEvent, PoolInit};
use crate::logs;
use crate::metrics::ScannerTelemetry;
use crate::repo::{ChainBlock, EventType, Repository, StakingEvent, StakingPool};
use alloy::primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use std::time::Instant;
use tracing::{debug, error};

/// Fetches one block's header and logs, decodes them, and persists the
/// header plus the journaled events and their projections. Safe to re-run
/// for the same block: both writes are keyed upserts.
pub async fn process_block<R: Repository, C: ChainClient>(
    repo: &R,
    chain: &C,
    telemetry: &ScannerTelemetry,
    chain_id: i64,
    contract_address: &str,
    block_number: i64,
) -> Result<()> {
    let start = Instant::now();
    let block_u64 = u64::try_from(block_number).context("block_number out of range")?;

    let rpc_start = Instant::now();
    let header = chain
        .header_at(block_u64)
        .await
        .inspect_err(|_| telemetry.rpc_error("header_at"))
        .with_context(|| format!("fetch header for block {block_number}"))?
        .with_context(|| format!("header not found for block {block_number}"))?;
    telemetry.observe_rpc_latency_ms("header_at", rpc_start.elapsed().as_millis() as u64);

    let rpc_start = Instant::now();
    let raw_logs = chain
        .logs_in_range(block_u64, block_u64, contract_address)
        .await
        .inspect_err(|_| telemetry.rpc_error("logs_in_range"))
        .with_context(|| format!("fetch logs for block {block_number}"))?;
    telemetry.observe_rpc_latency_ms("logs_in_range", rpc_start.elapsed().as_millis() as u64);

    let validated = logs::validate_and_sort_logs(raw_logs)?;

    let mut events: Vec<StakingEvent> = Vec::with_capacity(validated.len());
    for l in &validated {
        let topics = l.log.inner.data.topics();
        let data = l.log.inner.data.data.as_ref();

        let decoded = match decode::decode_log(topics, data) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => {
                debug!(
                    chain_id,
                    contract = %contract_address,
                    block = block_number,
                    tx_hash = %hex_hash(&l.tx_hash),
                    log_index = l.log_index,
                    "untracked event, skipping"
                );
                continue;
            }
            Err(e) => {
                // A malformed tracked log is dropped; the block still commits.
                error!(
                    chain_id,
                    contract = %contract_address,
                    block = block_number,
                    tx_hash = %hex_hash(&l.tx_hash),
                    log_index = l.log_index,
                    err = %e,
                    "failed to decode tracked event, dropping log"
                );
                telemetry.decode_failure();
                continue;
            }
        };

        match decoded {
            DecodedEvent::Deposit {
                user,
                pool_id,
                amount,
            } => {
                events.push(event_row(
                    chain_id,
                    contract_address,
                    block_number,
                    l.tx_hash,
                    l.log_index,
                    user,
                    pool_id,
                    EventType::Deposit,
                    amount,
                )?);
            }
            DecodedEvent::RequestUnstake {
                user,
                pool_id,
                amount,
            } => {
                events.push(event_row(
                    chain_id,
                    contract_address,
                    block_number,
                    l.tx_hash,
                    l.log_index,
                    user,
                    pool_id,
                    EventType::Withdraw,
                    amount,
                )?);
            }
            DecodedEvent::Claim {
                user,
                pool_id,
                reward,
            } => {
                events.push(event_row(
                    chain_id,
                    contract_address,
                    block_number,
                    l.tx_hash,
                    l.log_index,
                    user,
                    pool_id,
                    EventType::Claim,
                    reward,
                )?);
            }
            DecodedEvent::Withdraw {
                user,
                pool_id,
                amount,
                block_number: _,
            } => {
                events.push(event_row(
                    chain_id,
                    contract_address,
                    block_number,
                    l.tx_hash,
                    l.log_index,
                    user,
                    pool_id,
                    EventType::WithdrawExecuted,
                    amount,
                )?);
            }
            DecodedEvent::AddPool(init) => {
                save_pool_from_event(repo, chain_id, contract_address, init).await?;
            }
            DecodedEvent::Ignored { name } => {
                debug!(
                    chain_id,
                    contract = %contract_address,
                    block = block_number,
                    event = name,
                    "admin event, not journaled"
                );
            }
        }
    }

    repo.save_block(&ChainBlock {
        chain_id,
        block_number,
        block_hash: header.hash.clone(),
        parent_hash: header.parent_hash.clone(),
        is_confirmed: true,
    })
    .await
    .inspect_err(|_| telemetry.db_error("save_block"))
    .with_context(|| format!("save block {block_number}"))?;

    repo.save_events_and_project(&events)
        .await
        .inspect_err(|_| telemetry.db_error("save_events_and_project"))
        .with_context(|| format!("save events for block {block_number}"))?;

    telemetry.block_processed();
    for ty in [
        EventType::Deposit,
        EventType::Withdraw,
        EventType::Claim,
        EventType::WithdrawExecuted,
    ] {
        let count = events.iter().filter(|e| e.event_type == ty).count() as u64;
        telemetry.events_indexed(ty.as_str(), count);
    }
    telemetry.observe_block_ms(start.elapsed().as_millis() as u64);

    debug!(
        chain_id,
        contract = %contract_address,
        block = block_number,
        logs = validated.len(),
        events = events.len(),
        "block processed"
    );

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn event_row(
    chain_id: i64,
    contract_address: &str,
    block_number: i64,
    tx_hash: B256,
    log_index: u64,
    user: Address,
    pool_id: U256,
    event_type: EventType,
    amount: U256,
) -> Result<StakingEvent> {
    Ok(StakingEvent {
        chain_id,
        contract_address: contract_address.to_string(),
        pool_id: u256_to_i64(pool_id, "poolId")?,
        user_address: format!("0x{}", hex::encode(user.as_slice())),
        block_number,
        tx_hash: hex_hash(&tx_hash),
        log_index: i32::try_from(log_index).context("log_index out of range")?,
        event_type,
        amount,
    })
}

async fn save_pool_from_event<R: Repository>(
    repo: &R,
    chain_id: i64,
    contract_address: &str,
    init: PoolInit,
) -> Result<()> {
    let pool = StakingPool {
        chain_id,
        contract_address: contract_address.to_string(),
        pool_id: u256_to_i64(init.pool_id, "poolId")?,
        stake_token: format!("0x{}", hex::encode(init.stake_token.as_slice())),
        pool_weight: init.pool_weight,
        last_reward_block: u256_to_i64(init.last_reward_block, "lastRewardBlock")?,
        min_deposit_amount: init.min_deposit_amount,
        unstake_locked_blocks: u256_to_i64(init.unstake_locked_blocks, "unstakeLockedBlocks")?,
        acc_reward_per_share: U256::ZERO,
        total_staked: U256::ZERO,
    };
    repo.save_pool(&pool)
        .await
        .with_context(|| format!("save pool {}", pool.pool_id))
}

fn u256_to_i64(value: U256, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow::anyhow!("{field} out of i64 range: {value}"))
}

fn hex_hash(hash: &B256) -> String {
    format!("0x{}", hex::encode(hash.as_slice()))
}
