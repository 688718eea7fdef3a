use alloy::primitives::U256;
use anyhow::Result;

/// Scope-scoped marker of the highest processed block. One row per
/// `(chain_id, contract_address)`; `last_confirmed_block` never exceeds
/// `last_scanned_block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCursor {
    pub last_scanned_block: i64,
    pub last_confirmed_block: i64,
}

/// Durable record of a processed block, kept for reorg detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBlock {
    pub chain_id: i64,
    pub block_number: i64,
    pub block_hash: String,
    pub parent_hash: String,
    pub is_confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Deposit,
    Withdraw,
    Claim,
    /// Journaled for the record; never applied to positions.
    WithdrawExecuted,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            EventType::Deposit => "Deposit",
            EventType::Withdraw => "Withdraw",
            EventType::Claim => "Claim",
            EventType::WithdrawExecuted => "WithdrawExecuted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "Deposit" => Ok(EventType::Deposit),
            "Withdraw" => Ok(EventType::Withdraw),
            "Claim" => Ok(EventType::Claim),
            "WithdrawExecuted" => Ok(EventType::WithdrawExecuted),
            other => anyhow::bail!("unknown event_type in storage: {other}"),
        }
    }
}

/// One immutable journal row per recognized on-chain log.
/// `(tx_hash, log_index)` is globally unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakingEvent {
    pub chain_id: i64,
    pub contract_address: String,
    pub pool_id: i64,
    pub user_address: String,
    pub block_number: i64,
    pub tx_hash: String,
    pub log_index: i32,
    pub event_type: EventType,
    pub amount: U256,
}

/// Pool catalog row. Running aggregates default to zero and are not touched
/// by the event projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakingPool {
    pub chain_id: i64,
    pub contract_address: String,
    pub pool_id: i64,
    pub stake_token: String,
    pub pool_weight: U256,
    pub last_reward_block: i64,
    pub min_deposit_amount: U256,
    pub unstake_locked_blocks: i64,
    pub acc_reward_per_share: U256,
    pub total_staked: U256,
}

/// Per-user balance within one pool, derived by folding the event journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPosition {
    pub chain_id: i64,
    pub contract_address: String,
    pub pool_id: i64,
    pub user_address: String,
    pub staked_amount: U256,
    pub reward_debt: U256,
}

/// Persistence surface of the scanner. The Postgres implementation lives in
/// `db.rs`; tests run against an in-memory implementation with the same
/// transactional semantics.
pub trait Repository {
    fn get_cursor(
        &self,
        chain_id: i64,
        contract_address: &str,
    ) -> impl Future<Output = Result<Option<ScanCursor>>> + Send;

    /// Bootstrap insert; a no-op when the cursor already exists.
    fn init_cursor(
        &self,
        chain_id: i64,
        contract_address: &str,
        start_block: i64,
    ) -> impl Future<Output = Result<()>> + Send;

    fn update_cursor(
        &self,
        chain_id: i64,
        contract_address: &str,
        last_scanned: i64,
        last_confirmed: i64,
    ) -> impl Future<Output = Result<()>> + Send;

    fn get_block(
        &self,
        chain_id: i64,
        block_number: i64,
    ) -> impl Future<Output = Result<Option<ChainBlock>>> + Send;

    /// Upsert on `(chain_id, block_number)`; conflict updates hashes and the
    /// confirmation flag.
    fn save_block(&self, block: &ChainBlock) -> impl Future<Output = Result<()>> + Send;

    /// Upsert on `(chain_id, contract_address, pool_id)`; conflict updates
    /// the mutable catalog fields, never the running aggregates.
    fn save_pool(&self, pool: &StakingPool) -> impl Future<Output = Result<()>> + Send;

    /// Atomically journals `events` and folds them into user positions in
    /// input order. Re-running the same batch is idempotent under the
    /// `(tx_hash, log_index)` upsert. An empty batch is a no-op success.
    fn save_events_and_project(
        &self,
        events: &[StakingEvent],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Atomically reverses all derived state above `rollback_to`: inverse
    /// projection in descending `(block_number, log_index)` order, journal
    /// rows deleted, blocks marked unconfirmed, cursor pulled back.
    fn handle_reorg(
        &self,
        chain_id: i64,
        contract_address: &str,
        rollback_to: i64,
    ) -> impl Future<Output = Result<()>> + Send;
}
