use alloy::primitives::{Address, B256, LogData, U256};
use anyhow::{Context, Result};
use staking_indexer::chain::{BlockHeader, ChainClient};
use staking_indexer::repo::{
    ChainBlock, EventType, Repository, ScanCursor, StakingEvent, StakingPool, UserPosition,
};
use std::collections::BTreeMap;
use std::sync::Mutex;

pub const CHAIN_ID: i64 = 31337;
pub const CONTRACT: &str = "0x5151515151515151515151515151515151515151";

/// Everything the in-memory repository holds, keyed the way the schema keys
/// its tables. Cloneable so tests can snapshot and compare whole states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreState {
    pub cursors: BTreeMap<(i64, String), ScanCursor>,
    pub blocks: BTreeMap<(i64, i64), ChainBlock>,
    pub events: BTreeMap<(String, i32), StakingEvent>,
    pub pools: BTreeMap<(i64, String, i64), StakingPool>,
    pub positions: BTreeMap<(i64, String, i64, String), UserPosition>,
}

/// In-memory `Repository` with the same transactional behavior as the
/// Postgres implementation: multi-step operations apply to a copy of the
/// state and publish only on success.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<StoreState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StoreState {
        self.state.lock().unwrap().clone()
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().unwrap().events.len()
    }

    pub fn position(&self, pool_id: i64, user_address: &str) -> Option<UserPosition> {
        self.state
            .lock()
            .unwrap()
            .positions
            .get(&(
                CHAIN_ID,
                CONTRACT.to_string(),
                pool_id,
                user_address.to_string(),
            ))
            .cloned()
    }

    pub fn cursor(&self) -> Option<ScanCursor> {
        self.state
            .lock()
            .unwrap()
            .cursors
            .get(&(CHAIN_ID, CONTRACT.to_string()))
            .copied()
    }
}

fn fold_event(state: &mut StoreState, ev: &StakingEvent, invert: bool) -> Result<bool> {
    if ev.event_type == EventType::WithdrawExecuted {
        return Ok(true);
    }

    let key = (
        ev.chain_id,
        ev.contract_address.clone(),
        ev.pool_id,
        ev.user_address.clone(),
    );
    let existing = state.positions.get(&key).cloned();
    let mut position = match existing {
        Some(p) => p,
        None if invert => return Ok(false),
        None => UserPosition {
            chain_id: ev.chain_id,
            contract_address: ev.contract_address.clone(),
            pool_id: ev.pool_id,
            user_address: ev.user_address.clone(),
            staked_amount: U256::ZERO,
            reward_debt: U256::ZERO,
        },
    };

    match (ev.event_type, invert) {
        (EventType::Deposit, false) | (EventType::Withdraw, true) => {
            position.staked_amount = position
                .staked_amount
                .checked_add(ev.amount)
                .context("staked_amount overflow")?;
        }
        (EventType::Withdraw, false) | (EventType::Deposit, true) => {
            position.staked_amount = position
                .staked_amount
                .checked_sub(ev.amount)
                .context("staked_amount would go negative")?;
        }
        (EventType::Claim, false) => {
            position.reward_debt = position
                .reward_debt
                .checked_add(ev.amount)
                .context("reward_debt overflow")?;
        }
        (EventType::Claim, true) => {
            position.reward_debt = position
                .reward_debt
                .checked_sub(ev.amount)
                .context("reward_debt would go negative")?;
        }
        (EventType::WithdrawExecuted, _) => unreachable!("filtered above"),
    }

    state.positions.insert(key, position);
    Ok(true)
}

impl Repository for MemoryRepository {
    async fn get_cursor(&self, chain_id: i64, contract_address: &str) -> Result<Option<ScanCursor>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .cursors
            .get(&(chain_id, contract_address.to_string()))
            .copied())
    }

    async fn init_cursor(
        &self,
        chain_id: i64,
        contract_address: &str,
        start_block: i64,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .cursors
            .entry((chain_id, contract_address.to_string()))
            .or_insert(ScanCursor {
                last_scanned_block: start_block,
                last_confirmed_block: start_block,
            });
        Ok(())
    }

    async fn update_cursor(
        &self,
        chain_id: i64,
        contract_address: &str,
        last_scanned: i64,
        last_confirmed: i64,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let cursor = state
            .cursors
            .get_mut(&(chain_id, contract_address.to_string()))
            .context("cursor not initialized")?;
        cursor.last_scanned_block = last_scanned;
        cursor.last_confirmed_block = last_confirmed;
        Ok(())
    }

    async fn get_block(&self, chain_id: i64, block_number: i64) -> Result<Option<ChainBlock>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .blocks
            .get(&(chain_id, block_number))
            .cloned())
    }

    async fn save_block(&self, block: &ChainBlock) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .blocks
            .insert((block.chain_id, block.block_number), block.clone());
        Ok(())
    }

    async fn save_pool(&self, pool: &StakingPool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = (pool.chain_id, pool.contract_address.clone(), pool.pool_id);
        match state.pools.get_mut(&key) {
            Some(existing) => {
                existing.stake_token = pool.stake_token.clone();
                existing.pool_weight = pool.pool_weight;
                existing.last_reward_block = pool.last_reward_block;
                existing.min_deposit_amount = pool.min_deposit_amount;
                existing.unstake_locked_blocks = pool.unstake_locked_blocks;
            }
            None => {
                state.pools.insert(key, pool.clone());
            }
        }
        Ok(())
    }

    async fn save_events_and_project(&self, events: &[StakingEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().unwrap();
        let mut next = state.clone();

        for ev in events {
            let key = (ev.tx_hash.clone(), ev.log_index);
            let replay = next.events.contains_key(&key);
            next.events.insert(key, ev.clone());
            // A replayed event refreshes its journal row but must not fold
            // into the position a second time.
            if !replay {
                fold_event(&mut next, ev, false)?;
            }
        }

        *state = next;
        Ok(())
    }

    async fn handle_reorg(
        &self,
        chain_id: i64,
        contract_address: &str,
        rollback_to: i64,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut next = state.clone();

        let mut doomed: Vec<StakingEvent> = next
            .events
            .values()
            .filter(|ev| {
                ev.chain_id == chain_id
                    && ev.contract_address == contract_address
                    && ev.block_number > rollback_to
            })
            .cloned()
            .collect();
        doomed.sort_by_key(|ev| std::cmp::Reverse((ev.block_number, ev.log_index)));

        for ev in &doomed {
            fold_event(&mut next, ev, true)?;
        }
        for ev in &doomed {
            next.events.remove(&(ev.tx_hash.clone(), ev.log_index));
        }

        for block in next.blocks.values_mut() {
            if block.chain_id == chain_id && block.block_number > rollback_to {
                block.is_confirmed = false;
            }
        }

        let cursor = next
            .cursors
            .get_mut(&(chain_id, contract_address.to_string()))
            .context("cursor not initialized")?;
        cursor.last_scanned_block = rollback_to;
        cursor.last_confirmed_block = cursor.last_confirmed_block.min(rollback_to);

        *state = next;
        Ok(())
    }
}

#[derive(Default)]
struct ChainState {
    latest: u64,
    headers: BTreeMap<u64, BlockHeader>,
    logs: BTreeMap<u64, Vec<alloy::rpc::types::Log>>,
}

/// Scripted chain: tests stage headers and logs, then rewrite history to
/// simulate reorgs.
#[derive(Default)]
pub struct ScriptedChain {
    state: Mutex<ChainState>,
}

impl ScriptedChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_latest(&self, latest: u64) {
        self.state.lock().unwrap().latest = latest;
    }

    pub fn put_header(&self, number: u64, hash: &str, parent_hash: &str) {
        self.state.lock().unwrap().headers.insert(
            number,
            BlockHeader {
                number,
                hash: hash.to_string(),
                parent_hash: parent_hash.to_string(),
            },
        );
    }

    /// Stages a canonical chain of empty blocks spanning `numbers`.
    pub fn put_canonical_range(&self, numbers: std::ops::RangeInclusive<u64>) {
        for n in numbers {
            self.put_header(n, &block_hash(n, 0), &block_hash(n.saturating_sub(1), 0));
        }
    }

    pub fn put_log(&self, block_number: u64, log: alloy::rpc::types::Log) {
        self.state
            .lock()
            .unwrap()
            .logs
            .entry(block_number)
            .or_default()
            .push(log);
    }

}

impl ChainClient for ScriptedChain {
    async fn latest_height(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().latest)
    }

    async fn header_at(&self, block_number: u64) -> Result<Option<BlockHeader>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .headers
            .get(&block_number)
            .cloned())
    }

    async fn logs_in_range(
        &self,
        from_block: u64,
        to_block: u64,
        _address: &str,
    ) -> Result<Vec<alloy::rpc::types::Log>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .logs
            .range(from_block..=to_block)
            .flat_map(|(_, logs)| logs.iter().cloned())
            .collect())
    }
}

/// Deterministic block hash for test chains; `fork` distinguishes competing
/// histories at the same height.
pub fn block_hash(number: u64, fork: u8) -> String {
    format!("0x{:062x}{:02x}", number, fork)
}

pub fn tx_hash(block_number: u64, log_index: u64) -> B256 {
    B256::from(U256::from(block_number * 1_000 + log_index))
}

pub fn tx_hash_hex(block_number: u64, log_index: u64) -> String {
    format!("0x{}", hex::encode(tx_hash(block_number, log_index).as_slice()))
}

/// A journal row as the processor would have written it.
pub fn journal_event(
    block_number: i64,
    log_index: i32,
    user_byte: u8,
    pool_id: i64,
    event_type: EventType,
    amount: u64,
) -> StakingEvent {
    StakingEvent {
        chain_id: CHAIN_ID,
        contract_address: CONTRACT.to_string(),
        pool_id,
        user_address: user_hex(user_byte),
        block_number,
        tx_hash: tx_hash_hex(block_number as u64, log_index as u64),
        log_index,
        event_type,
        amount: U256::from(amount),
    }
}

pub fn user_addr(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

pub fn user_hex(byte: u8) -> String {
    format!("0x{}", hex::encode(user_addr(byte).as_slice()))
}

/// Builds a raw log carrying the given topics/data, positioned in `block_number`.
pub fn raw_log(
    block_number: u64,
    log_index: u64,
    topics: Vec<B256>,
    data: Vec<u8>,
) -> alloy::rpc::types::Log {
    alloy::rpc::types::Log {
        inner: alloy::primitives::Log {
            address: CONTRACT.parse().unwrap(),
            data: LogData::new_unchecked(topics, data.into()),
        },
        block_hash: Some(B256::repeat_byte(0xbb)),
        block_number: Some(block_number),
        block_timestamp: None,
        transaction_hash: Some(tx_hash(block_number, log_index)),
        transaction_index: Some(0),
        log_index: Some(log_index),
        removed: false,
    }
}
