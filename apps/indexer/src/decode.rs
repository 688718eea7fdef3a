use alloy::{
    primitives::{Address, B256, U256},
    sol,
    sol_types::SolEvent,
};
use anyhow::{Context, Result};

// Event surface of the staking contract. Selectors are keccak256 of the
// canonical signature, derived by the sol! macro; parameter names follow the
// contract ABI.
sol! {
    interface StakingContract {
        event Deposit(address indexed user, uint256 indexed poolId, uint256 amount);
        event RequestUnstake(address indexed user, uint256 indexed poolId, uint256 amount);
        event Claim(address indexed user, uint256 indexed poolId, uint256 reward);
        event Withdraw(address indexed user, uint256 indexed poolId, uint256 amount, uint256 indexed blockNumber);
        event AddPool(
            uint256 indexed poolId,
            address indexed stakeToken,
            uint256 indexed poolWeight,
            uint256 lastRewardBlock,
            uint256 minDepositAmount,
            uint256 unstakeLockedBlocks
        );

        // Admin surface: decoded so malformed logs surface, then dropped.
        event SetRewardToken(address token);
        event SetRewardPerBlock(uint256 rewardPerBlock);
        event SetStartBlock(uint256 startBlock);
        event SetEndBlock(uint256 endBlock);
        event PauseWithdraw();
        event UnpauseWithdraw();
        event PauseClaim();
        event UnpauseClaim();
        event UpdatePoolInfo(uint256 poolId, uint256 minDepositAmount, uint256 unstakeLockedBlocks);
        event SetPoolWeight(uint256 poolId, uint256 poolWeight, uint256 totalPoolWeight);
    }
}

use self::StakingContract as sc;

/// Pool catalog fields carried by an `AddPool` emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInit {
    pub pool_id: U256,
    pub stake_token: Address,
    pub pool_weight: U256,
    pub last_reward_block: U256,
    pub min_deposit_amount: U256,
    pub unstake_locked_blocks: U256,
}

/// One decoded contract log. Adding an event means adding a variant here and
/// a case to the processor's match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    Deposit {
        user: Address,
        pool_id: U256,
        amount: U256,
    },
    RequestUnstake {
        user: Address,
        pool_id: U256,
        amount: U256,
    },
    Claim {
        user: Address,
        pool_id: U256,
        reward: U256,
    },
    Withdraw {
        user: Address,
        pool_id: U256,
        amount: U256,
        block_number: U256,
    },
    AddPool(PoolInit),
    /// Recognized but not journaled (admin setters, pause toggles).
    Ignored { name: &'static str },
}

/// Maps a raw log to a typed event.
///
/// `Ok(None)` means the selector is not part of the contract surface we track
/// (skipped silently). A recognized selector with malformed topics or data is
/// an error; the caller drops the log and keeps the block.
pub fn decode_log(topics: &[B256], data: &[u8]) -> Result<Option<DecodedEvent>> {
    let Some(&selector) = topics.first() else {
        anyhow::bail!("log has no topics");
    };

    let decoded = if selector == sc::Deposit::SIGNATURE_HASH {
        let ev = decode_event::<sc::Deposit>(topics, data)?;
        DecodedEvent::Deposit {
            user: ev.user,
            pool_id: ev.poolId,
            amount: ev.amount,
        }
    } else if selector == sc::RequestUnstake::SIGNATURE_HASH {
        let ev = decode_event::<sc::RequestUnstake>(topics, data)?;
        DecodedEvent::RequestUnstake {
            user: ev.user,
            pool_id: ev.poolId,
            amount: ev.amount,
        }
    } else if selector == sc::Claim::SIGNATURE_HASH {
        let ev = decode_event::<sc::Claim>(topics, data)?;
        DecodedEvent::Claim {
            user: ev.user,
            pool_id: ev.poolId,
            reward: ev.reward,
        }
    } else if selector == sc::Withdraw::SIGNATURE_HASH {
        let ev = decode_event::<sc::Withdraw>(topics, data)?;
        DecodedEvent::Withdraw {
            user: ev.user,
            pool_id: ev.poolId,
            amount: ev.amount,
            block_number: ev.blockNumber,
        }
    } else if selector == sc::AddPool::SIGNATURE_HASH {
        let ev = decode_event::<sc::AddPool>(topics, data)?;
        DecodedEvent::AddPool(PoolInit {
            pool_id: ev.poolId,
            stake_token: ev.stakeToken,
            pool_weight: ev.poolWeight,
            last_reward_block: ev.lastRewardBlock,
            min_deposit_amount: ev.minDepositAmount,
            unstake_locked_blocks: ev.unstakeLockedBlocks,
        })
    } else if selector == sc::SetRewardToken::SIGNATURE_HASH {
        decode_ignored::<sc::SetRewardToken>(topics, data, "SetRewardToken")?
    } else if selector == sc::SetRewardPerBlock::SIGNATURE_HASH {
        decode_ignored::<sc::SetRewardPerBlock>(topics, data, "SetRewardPerBlock")?
    } else if selector == sc::SetStartBlock::SIGNATURE_HASH {
        decode_ignored::<sc::SetStartBlock>(topics, data, "SetStartBlock")?
    } else if selector == sc::SetEndBlock::SIGNATURE_HASH {
        decode_ignored::<sc::SetEndBlock>(topics, data, "SetEndBlock")?
    } else if selector == sc::PauseWithdraw::SIGNATURE_HASH {
        decode_ignored::<sc::PauseWithdraw>(topics, data, "PauseWithdraw")?
    } else if selector == sc::UnpauseWithdraw::SIGNATURE_HASH {
        decode_ignored::<sc::UnpauseWithdraw>(topics, data, "UnpauseWithdraw")?
    } else if selector == sc::PauseClaim::SIGNATURE_HASH {
        decode_ignored::<sc::PauseClaim>(topics, data, "PauseClaim")?
    } else if selector == sc::UnpauseClaim::SIGNATURE_HASH {
        decode_ignored::<sc::UnpauseClaim>(topics, data, "UnpauseClaim")?
    } else if selector == sc::UpdatePoolInfo::SIGNATURE_HASH {
        decode_ignored::<sc::UpdatePoolInfo>(topics, data, "UpdatePoolInfo")?
    } else if selector == sc::SetPoolWeight::SIGNATURE_HASH {
        decode_ignored::<sc::SetPoolWeight>(topics, data, "SetPoolWeight")?
    } else {
        return Ok(None);
    };

    Ok(Some(decoded))
}

fn decode_event<E: SolEvent>(topics: &[B256], data: &[u8]) -> Result<E> {
    E::decode_raw_log(topics.iter().copied(), data)
        .with_context(|| format!("decode {} log", E::SIGNATURE))
}

fn decode_ignored<E: SolEvent>(
    topics: &[B256],
    data: &[u8],
    name: &'static str,
) -> Result<DecodedEvent> {
    decode_event::<E>(topics, data)?;
    Ok(DecodedEvent::Ignored { name })
}
