use crate::config::DatabaseConfig;
use crate::repo::{ChainBlock, EventType, Repository, ScanCursor, StakingEvent, StakingPool};
use alloy::primitives::U256;
use anyhow::{Context, Result};
use sqlx::{
    ConnectOptions, PgPool, Postgres, QueryBuilder,
    postgres::{PgConnectOptions, PgPoolOptions},
    query_scalar,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self> {
        let statement_level = if cfg.debug {
            tracing::log::LevelFilter::Info
        } else {
            tracing::log::LevelFilter::Trace
        };
        let opts = PgConnectOptions::from_str(&cfg.url)
            .context("parse DATABASE_URL")?
            .log_statements(statement_level)
            .log_slow_statements(tracing::log::LevelFilter::Warn, Duration::from_millis(200));

        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect_with(opts)
            .await
            .context("connect to database")?;

        Ok(Self { pool })
    }
}

pub async fn ensure_schema_version(db: &Db, min_version: i64) -> Result<i64> {
    let version: i64 = query_scalar::<Postgres, i64>(
        "select coalesce(max(version), 0) from _sqlx_migrations",
    )
    .fetch_one(&db.pool)
    .await
    .map_err(|e| {
        if let Some(db_err) = e.as_database_error()
            && db_err.code().as_deref() == Some("42P01")
        {
            return anyhow::anyhow!(
                "missing _sqlx_migrations (run `cargo run -p staking-indexer --bin migrate` against the same DATABASE_URL)"
            );
        }
        anyhow::Error::new(e).context("read _sqlx_migrations version")
    })?;

    if version < min_version {
        anyhow::bail!(
            "database schema version is {version}, but the scanner expects >= {min_version} (run `cargo run -p staking-indexer --bin migrate` against the same DATABASE_URL)"
        );
    }

    Ok(version)
}

fn numeric_to_u256(s: &str) -> Result<U256> {
    U256::from_str_radix(s.trim(), 10).with_context(|| format!("numeric out of u256 range: {s}"))
}

/// Whether a projection fold applies an event or reverses it.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Fold {
    Apply,
    Invert,
}

/// Folds one event into its user position inside `tx`. Returns false when
/// the fold is an inversion and the position row does not exist (the caller
/// decides whether that is tolerable).
async fn fold_position(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    ev: &StakingEvent,
    fold: Fold,
) -> Result<bool> {
    // Journaled only; the executed withdrawal was already projected from the
    // preceding unstake request.
    if ev.event_type == EventType::WithdrawExecuted {
        return Ok(true);
    }

    let existing = sqlx::query_as::<Postgres, (String, String)>(
        "select staked_amount::text, reward_debt::text from staking_user_positions \
         where chain_id = $1 and contract_address = $2 and pool_id = $3 and user_address = $4 \
         for update",
    )
    .bind(ev.chain_id)
    .bind(&ev.contract_address)
    .bind(ev.pool_id)
    .bind(&ev.user_address)
    .fetch_optional(&mut **tx)
    .await
    .context("select staking_user_positions")?;

    let (mut staked_amount, mut reward_debt) = match existing {
        Some((staked, debt)) => (numeric_to_u256(&staked)?, numeric_to_u256(&debt)?),
        None if fold == Fold::Invert => return Ok(false),
        None => (U256::ZERO, U256::ZERO),
    };

    let overflow = || {
        format!(
            "position balance overflow (chain_id={}, pool_id={}, user={})",
            ev.chain_id, ev.pool_id, ev.user_address
        )
    };
    let underflow = || {
        format!(
            "position balance would go negative (chain_id={}, pool_id={}, user={})",
            ev.chain_id, ev.pool_id, ev.user_address
        )
    };

    match (ev.event_type, fold) {
        (EventType::Deposit, Fold::Apply) | (EventType::Withdraw, Fold::Invert) => {
            staked_amount = staked_amount.checked_add(ev.amount).with_context(overflow)?;
        }
        (EventType::Withdraw, Fold::Apply) | (EventType::Deposit, Fold::Invert) => {
            staked_amount = staked_amount.checked_sub(ev.amount).with_context(underflow)?;
        }
        (EventType::Claim, Fold::Apply) => {
            reward_debt = reward_debt.checked_add(ev.amount).with_context(overflow)?;
        }
        (EventType::Claim, Fold::Invert) => {
            reward_debt = reward_debt.checked_sub(ev.amount).with_context(underflow)?;
        }
        (EventType::WithdrawExecuted, _) => unreachable!("filtered above"),
    }

    sqlx::query(
        "insert into staking_user_positions \
         (chain_id, contract_address, pool_id, user_address, staked_amount, reward_debt, updated_at) \
         values ($1, $2, $3, $4, $5::numeric, $6::numeric, now()) \
         on conflict (chain_id, contract_address, pool_id, user_address) do update set \
           staked_amount = excluded.staked_amount, \
           reward_debt = excluded.reward_debt, \
           updated_at = now()",
    )
    .bind(ev.chain_id)
    .bind(&ev.contract_address)
    .bind(ev.pool_id)
    .bind(&ev.user_address)
    .bind(staked_amount.to_string())
    .bind(reward_debt.to_string())
    .execute(&mut **tx)
    .await
    .context("upsert staking_user_positions")?;

    Ok(true)
}

impl Repository for Db {
    async fn get_cursor(&self, chain_id: i64, contract_address: &str) -> Result<Option<ScanCursor>> {
        let row = sqlx::query_as::<Postgres, (i64, i64)>(
            "select last_scanned_block, last_confirmed_block from chain_scan_cursor \
             where chain_id = $1 and contract_address = $2",
        )
        .bind(chain_id)
        .bind(contract_address)
        .fetch_optional(&self.pool)
        .await
        .context("select chain_scan_cursor")?;

        Ok(row.map(|(last_scanned_block, last_confirmed_block)| ScanCursor {
            last_scanned_block,
            last_confirmed_block,
        }))
    }

    async fn init_cursor(
        &self,
        chain_id: i64,
        contract_address: &str,
        start_block: i64,
    ) -> Result<()> {
        sqlx::query(
            "insert into chain_scan_cursor \
             (chain_id, contract_address, last_scanned_block, last_confirmed_block) \
             values ($1, $2, $3, $3) \
             on conflict (chain_id, contract_address) do nothing",
        )
        .bind(chain_id)
        .bind(contract_address)
        .bind(start_block)
        .execute(&self.pool)
        .await
        .context("insert chain_scan_cursor")?;
        Ok(())
    }

    async fn update_cursor(
        &self,
        chain_id: i64,
        contract_address: &str,
        last_scanned: i64,
        last_confirmed: i64,
    ) -> Result<()> {
        sqlx::query(
            "update chain_scan_cursor set \
               last_scanned_block = $3, \
               last_confirmed_block = $4, \
               updated_at = now() \
             where chain_id = $1 and contract_address = $2",
        )
        .bind(chain_id)
        .bind(contract_address)
        .bind(last_scanned)
        .bind(last_confirmed)
        .execute(&self.pool)
        .await
        .context("update chain_scan_cursor")?;
        Ok(())
    }

    async fn get_block(&self, chain_id: i64, block_number: i64) -> Result<Option<ChainBlock>> {
        let row = sqlx::query_as::<Postgres, (String, String, bool)>(
            "select block_hash, parent_hash, is_confirmed from chain_blocks \
             where chain_id = $1 and block_number = $2",
        )
        .bind(chain_id)
        .bind(block_number)
        .fetch_optional(&self.pool)
        .await
        .context("select chain_blocks")?;

        Ok(row.map(|(block_hash, parent_hash, is_confirmed)| ChainBlock {
            chain_id,
            block_number,
            block_hash,
            parent_hash,
            is_confirmed,
        }))
    }

    async fn save_block(&self, block: &ChainBlock) -> Result<()> {
        sqlx::query(
            "insert into chain_blocks (chain_id, block_number, block_hash, parent_hash, is_confirmed) \
             values ($1, $2, $3, $4, $5) \
             on conflict (chain_id, block_number) do update set \
               block_hash = excluded.block_hash, \
               parent_hash = excluded.parent_hash, \
               is_confirmed = excluded.is_confirmed",
        )
        .bind(block.chain_id)
        .bind(block.block_number)
        .bind(&block.block_hash)
        .bind(&block.parent_hash)
        .bind(block.is_confirmed)
        .execute(&self.pool)
        .await
        .context("upsert chain_blocks")?;
        Ok(())
    }

    async fn save_pool(&self, pool: &StakingPool) -> Result<()> {
        sqlx::query(
            "insert into staking_pools \
             (chain_id, contract_address, pool_id, stake_token, pool_weight, last_reward_block, \
              min_deposit_amount, unstake_locked_blocks, acc_reward_per_share, total_staked, updated_at) \
             values ($1, $2, $3, $4, $5::numeric, $6, $7::numeric, $8, $9::numeric, $10::numeric, now()) \
             on conflict (chain_id, contract_address, pool_id) do update set \
               stake_token = excluded.stake_token, \
               pool_weight = excluded.pool_weight, \
               last_reward_block = excluded.last_reward_block, \
               min_deposit_amount = excluded.min_deposit_amount, \
               unstake_locked_blocks = excluded.unstake_locked_blocks, \
               updated_at = now()",
        )
        .bind(pool.chain_id)
        .bind(&pool.contract_address)
        .bind(pool.pool_id)
        .bind(&pool.stake_token)
        .bind(pool.pool_weight.to_string())
        .bind(pool.last_reward_block)
        .bind(pool.min_deposit_amount.to_string())
        .bind(pool.unstake_locked_blocks)
        .bind(pool.acc_reward_per_share.to_string())
        .bind(pool.total_staked.to_string())
        .execute(&self.pool)
        .await
        .context("upsert staking_pools")?;
        Ok(())
    }

    async fn save_events_and_project(&self, events: &[StakingEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.context("begin transaction")?;

        // Keys already journaled are a replay (a retried block); they refresh
        // the journal row below but must not fold into positions again.
        let mut keys_qb = QueryBuilder::new(
            "select tx_hash, log_index from staking_events where (tx_hash, log_index) in ",
        );
        keys_qb.push_tuples(events, |mut b, ev| {
            b.push_bind(&ev.tx_hash);
            b.push_bind(ev.log_index);
        });
        let replayed: std::collections::HashSet<(String, i32)> = keys_qb
            .build_query_as::<(String, i32)>()
            .fetch_all(&mut *tx)
            .await
            .context("select existing staking_events keys")?
            .into_iter()
            .collect();

        let mut qb = QueryBuilder::new(
            "insert into staking_events (\
             tx_hash, log_index, chain_id, contract_address, \
             pool_id, user_address, block_number, event_type, amount\
             ) ",
        );
        qb.push_values(events, |mut b, ev| {
            b.push_bind(&ev.tx_hash);
            b.push_bind(ev.log_index);
            b.push_bind(ev.chain_id);
            b.push_bind(&ev.contract_address);
            b.push_bind(ev.pool_id);
            b.push_bind(&ev.user_address);
            b.push_bind(ev.block_number);
            b.push_bind(ev.event_type.as_str());
            b.push_bind(ev.amount.to_string()).push_unseparated("::numeric");
        });
        qb.push(
            " on conflict (tx_hash, log_index) do update set \
              amount = excluded.amount, \
              event_type = excluded.event_type, \
              block_number = excluded.block_number",
        );
        qb.build()
            .execute(&mut *tx)
            .await
            .context("insert staking_events")?;

        for ev in events {
            if replayed.contains(&(ev.tx_hash.clone(), ev.log_index)) {
                continue;
            }
            fold_position(&mut tx, ev, Fold::Apply).await?;
        }

        tx.commit().await.context("commit events and projections")?;
        Ok(())
    }

    async fn handle_reorg(
        &self,
        chain_id: i64,
        contract_address: &str,
        rollback_to: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin reorg transaction")?;

        let rows = sqlx::query_as::<Postgres, (String, i32, i64, String, String, String, i64)>(
            "select tx_hash, log_index, pool_id, user_address, event_type, amount::text, block_number \
             from staking_events \
             where chain_id = $1 and contract_address = $2 and block_number > $3 \
             order by block_number desc, log_index desc",
        )
        .bind(chain_id)
        .bind(contract_address)
        .bind(rollback_to)
        .fetch_all(&mut *tx)
        .await
        .context("select staking_events for rollback")?;

        for (tx_hash, log_index, pool_id, user_address, event_type, amount, block_number) in rows {
            let ev = StakingEvent {
                chain_id,
                contract_address: contract_address.to_string(),
                pool_id,
                user_address,
                block_number,
                tx_hash,
                log_index,
                event_type: EventType::parse(&event_type)?,
                amount: numeric_to_u256(&amount)?,
            };
            let found = fold_position(&mut tx, &ev, Fold::Invert).await?;
            if !found {
                warn!(
                    chain_id,
                    contract = %ev.contract_address,
                    pool_id = ev.pool_id,
                    user = %ev.user_address,
                    tx_hash = %ev.tx_hash,
                    log_index = ev.log_index,
                    "position missing during rollback; already reconciled, skipping"
                );
            }
        }

        sqlx::query(
            "delete from staking_events \
             where chain_id = $1 and contract_address = $2 and block_number > $3",
        )
        .bind(chain_id)
        .bind(contract_address)
        .bind(rollback_to)
        .execute(&mut *tx)
        .await
        .context("delete rolled-back staking_events")?;

        sqlx::query(
            "update chain_blocks set is_confirmed = false \
             where chain_id = $1 and block_number > $2",
        )
        .bind(chain_id)
        .bind(rollback_to)
        .execute(&mut *tx)
        .await
        .context("mark rolled-back chain_blocks unconfirmed")?;

        sqlx::query(
            "update chain_scan_cursor set \
               last_scanned_block = $3, \
               last_confirmed_block = least(last_confirmed_block, $3), \
               updated_at = now() \
             where chain_id = $1 and contract_address = $2",
        )
        .bind(chain_id)
        .bind(contract_address)
        .bind(rollback_to)
        .execute(&mut *tx)
        .await
        .context("rewind chain_scan_cursor")?;

        tx.commit().await.context("commit reorg rollback")?;
        Ok(())
    }
}
