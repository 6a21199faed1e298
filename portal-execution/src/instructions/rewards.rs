//! Custodian rewards: fee splits, epoch rewards and withdrawals.

use crate::accounting::{action_rejected, custodian_mut, expect_status, record_status, split_fatal, status_of};
use crate::ExecutionContext;
use portal_oracles::{mul_div, ExchangeRateTool};
use portal_types::action::{PortalAction, WithdrawRewardAction};
use portal_types::error::{PortalError, PortalResult};
use portal_types::instruction::{
    CustodianRewardContent, Instruction, InstructionStatus, PortalInstruction, WithdrawRewardContent,
};
use portal_types::params::PortalParams;
use portal_types::scratch::ScratchState;
use portal_types::state::{LockedCollateralForRewards, RequestKind};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// A fee paid this block and the custodians serving the request, weighted
/// by the amount each one covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeeShare {
    pub fee: u64,
    pub shares: Vec<(String, u64)>,
}

/// Host-supplied reward for the epoch that ends at this block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpochReward {
    /// reward asset -> amount to split
    pub total: BTreeMap<String, u64>,
    /// Optional uptime score per custodian, in percent.
    pub performance: BTreeMap<String, u64>,
}

type RewardTable = BTreeMap<String, BTreeMap<String, u64>>;

fn add_reward(table: &mut RewardTable, custodian: &str, asset: &str, amount: u64) -> PortalResult<()> {
    if amount == 0 {
        return Ok(());
    }
    let slot = table
        .entry(custodian.to_string())
        .or_default()
        .entry(asset.to_string())
        .or_default();
    *slot = slot
        .checked_add(amount)
        .ok_or_else(|| PortalError::Overflow { context: "custodian reward".into() })?;
    Ok(())
}

/// Splits `fee` by share; the last custodian takes the rounding remainder.
pub fn split_fee(fee: u64, shares: &[(String, u64)]) -> PortalResult<Vec<(String, u64)>> {
    let total: u64 = shares.iter().map(|(_, s)| *s).sum();
    if total == 0 {
        return Ok(Vec::new());
    }
    let mut paid = 0u64;
    let mut out = Vec::with_capacity(shares.len());
    for (i, (custodian, share)) in shares.iter().enumerate() {
        let amount = if i + 1 == shares.len() {
            fee - paid
        } else {
            mul_div(fee, *share, total)?
        };
        paid += amount;
        out.push((custodian.clone(), amount));
    }
    Ok(out)
}

/// Each custodian gets `R * locked_i / total_locked`, truncated, optionally
/// scaled by its clamped performance over the maximum.
pub fn split_epoch_reward(
    reward: &EpochReward,
    snapshot: &LockedCollateralForRewards,
    params: &PortalParams,
) -> PortalResult<RewardTable> {
    let mut out = RewardTable::new();
    if snapshot.total == 0 {
        return Ok(out);
    }
    let (min, max) = (
        params.min_percent_custodian_rewards,
        params.max_percent_custodian_rewards,
    );
    for (custodian, locked) in &snapshot.per_custodian {
        let factor = reward
            .performance
            .get(custodian)
            .filter(|_| max > 0)
            .map(|p| (*p).clamp(min, max));
        for (asset, total) in &reward.total {
            let mut amount = mul_div(*total, *locked, snapshot.total)?;
            if let Some(factor) = factor {
                amount = mul_div(amount, factor, max)?;
            }
            add_reward(&mut out, custodian, asset, amount)?;
        }
    }
    Ok(out)
}

/// Percent of the beacon reward that goes to custodians: the minimum while
/// the average locked value is below the threshold, rising linearly to the
/// maximum at ten times the threshold.
pub fn custodian_reward_percent(avg_locked_usd: u64, params: &PortalParams) -> u64 {
    let (min, max) = (
        params.min_percent_custodian_rewards,
        params.max_percent_custodian_rewards,
    );
    let floor = params.min_lock_collateral_amount_in_epoch;
    if floor == 0 {
        return max;
    }
    if avg_locked_usd <= floor {
        return min;
    }
    let span = floor.saturating_mul(9);
    let extra = (avg_locked_usd - floor).min(span);
    min + mul_div(max.saturating_sub(min), extra, span).unwrap_or(0)
}

/// Custodian share of a per-epoch beacon reward, from this epoch's snapshot.
pub fn epoch_reward_for(
    beacon_reward: &BTreeMap<String, u64>,
    snapshot: &LockedCollateralForRewards,
    params: &PortalParams,
) -> PortalResult<EpochReward> {
    let avg = snapshot.total / params.epoch_length.max(1);
    let percent = custodian_reward_percent(avg, params);
    let mut total = BTreeMap::new();
    for (asset, amount) in beacon_reward {
        total.insert(asset.clone(), mul_div(*amount, percent, 100)?);
    }
    Ok(EpochReward {
        total,
        performance: BTreeMap::new(),
    })
}

/// Credits this block's fees and, on an epoch boundary, the epoch reward.
pub fn build_custodian_rewards(
    scratch: &ScratchState<'_>,
    ctx: &ExecutionContext,
    fees: &[FeeShare],
    epoch: Option<&EpochReward>,
) -> PortalResult<Option<Instruction>> {
    let native = &ctx.params.native_collateral;
    let mut rewards = RewardTable::new();
    for fee in fees {
        for (custodian, amount) in split_fee(fee.fee, &fee.shares)? {
            add_reward(&mut rewards, &custodian, native, amount)?;
        }
    }

    let mut epoch_total = BTreeMap::new();
    if let Some(epoch) = epoch.filter(|_| ctx.height % ctx.params.epoch_length.max(1) == 0) {
        let split = split_epoch_reward(epoch, &scratch.locked_collateral_for_rewards, ctx.params)?;
        if !split.is_empty() {
            for (custodian, assets) in split {
                for (asset, amount) in assets {
                    add_reward(&mut rewards, &custodian, &asset, amount)?;
                }
            }
            epoch_total = epoch.total.clone();
        }
    }

    if rewards.is_empty() {
        return Ok(None);
    }
    Ok(Some(Instruction::new(
        None,
        InstructionStatus::Accepted,
        PortalInstruction::CustodianReward(CustodianRewardContent {
            beacon_height: ctx.height,
            rewards,
            epoch_total,
        }),
    )))
}

pub fn apply_custodian_rewards(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    status: InstructionStatus,
    c: &CustodianRewardContent,
) -> PortalResult<()> {
    expect_status(status, InstructionStatus::Accepted)?;
    if c.beacon_height != ctx.height {
        return Err(PortalError::Inconsistent(format!(
            "reward for height {} replayed at {}",
            c.beacon_height, ctx.height
        )));
    }
    for (custodian, assets) in &c.rewards {
        let record = custodian_mut(scratch, custodian)?;
        for (asset, amount) in assets {
            let slot = record.reward_amount.entry(asset.clone()).or_default();
            *slot = slot
                .checked_add(*amount)
                .ok_or_else(|| PortalError::Overflow { context: "custodian reward".into() })?;
        }
    }
    info!("Credited rewards to {} custodians at height {}", c.rewards.len(), ctx.height);
    Ok(())
}

// ── Withdraw ──────────────────────────────────────────────────

pub fn build_withdraw_reward(
    scratch: &ScratchState<'_>,
    action: &PortalAction,
    a: &WithdrawRewardAction,
) -> PortalResult<Instruction> {
    let check = || -> PortalResult<u64> {
        let record = scratch
            .custodians
            .get(&a.custodian)
            .ok_or_else(|| PortalError::CustodianNotFound {
                custodian: a.custodian.clone(),
            })?;
        match record.reward_amount.get(&a.asset) {
            Some(amount) if *amount > 0 => Ok(*amount),
            _ => Err(PortalError::NoReward {
                custodian: a.custodian.clone(),
                asset: a.asset.clone(),
            }),
        }
    };
    let (amount, reason) = match split_fatal(check())? {
        Ok(amount) => (amount, None),
        Err(e) => (0, Some(e)),
    };
    let content = WithdrawRewardContent {
        custodian: a.custodian.clone(),
        asset: a.asset.clone(),
        amount,
        tx_req_id: action.tx_req_id.clone(),
        reason,
    };
    Ok(Instruction::new(
        Some(action.shard_id),
        status_of(&content.reason),
        PortalInstruction::WithdrawReward(content),
    ))
}

pub fn apply_withdraw_reward(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    status: InstructionStatus,
    c: &WithdrawRewardContent,
) -> PortalResult<()> {
    if !action_rejected(status, &c.reason)? {
        let record = custodian_mut(scratch, &c.custodian)?;
        match record.reward_amount.remove(&c.asset) {
            Some(amount) if amount == c.amount => {}
            other => {
                return Err(PortalError::Inconsistent(format!(
                    "{} withdraws {} {} but holds {:?}",
                    c.custodian, c.amount, c.asset, other
                )))
            }
        }
    }
    record_status(scratch, ctx, RequestKind::RewardWithdraw, &c.tx_req_id, status, c)?;
    Ok(())
}

// ── Epoch snapshot ────────────────────────────────────────────

/// Starts a fresh snapshot when this block closes an epoch.
pub fn reset_epoch_snapshot(scratch: &mut ScratchState<'_>, ctx: &ExecutionContext) {
    let boundary = ctx.height % ctx.params.epoch_length.max(1) == 0;
    if boundary && *scratch.locked_collateral_for_rewards != LockedCollateralForRewards::default() {
        debug!("Epoch closed at height {}", ctx.height);
        *scratch.locked_collateral_for_rewards.to_mut() = LockedCollateralForRewards::default();
    }
}

/// Adds each custodian's locked collateral value (micro-USD) at the end of
/// this block to the epoch snapshot.
pub fn accumulate_locked_for_rewards(scratch: &mut ScratchState<'_>) -> PortalResult<()> {
    let Some(rates) = scratch.rates().cloned() else {
        return Ok(());
    };
    let tool = ExchangeRateTool::new(&rates);
    let mut per_custodian = BTreeMap::new();
    for record in scratch.custodians.values() {
        let mut value = 0u64;
        for locks in record.locked_collaterals.values() {
            for (kind, amount) in locks {
                if tool.has_price(kind) {
                    value = value.saturating_add(tool.convert_to_usd(kind, *amount)?);
                }
            }
        }
        if value > 0 {
            per_custodian.insert(record.address.clone(), value);
        }
    }
    if per_custodian.is_empty() {
        return Ok(());
    }
    let snapshot = scratch.locked_collateral_for_rewards.to_mut();
    for (custodian, value) in per_custodian {
        let slot = snapshot.per_custodian.entry(custodian).or_default();
        *slot = slot.saturating_add(value);
        snapshot.total = snapshot.total.saturating_add(value);
    }
    Ok(())
}
