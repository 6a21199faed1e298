//! Automatic liquidations and the liquidation pool.
//!
//! Two triggers move custodian collateral into the per-asset pool: a
//! custodian that never proves a redeem payout, and a collateral ratio that
//! has fallen below `tp120`. Public-token holders later swap against the pool.

use crate::accounting::{
    action_rejected, custodian_mut, expect_status, invalid, record_status, seize_locked, split_fatal,
    status_of, sub_holding, unlock, RequestExposure,
};
use crate::instructions::redeem::release_matched_custodian;
use crate::ExecutionContext;
use portal_oracles::{mul_div, up_percent, ExchangeRateTool};
use portal_types::action::{PoolRedeemAction, PortalAction};
use portal_types::error::{PortalError, PortalResult};
use portal_types::instruction::{
    Instruction, InstructionStatus, PoolRedeemContent, PortalInstruction, RatesLiquidationContent,
    RunAwayLiquidationContent,
};
use portal_types::scratch::ScratchState;
use portal_types::state::{LiquidationPoolEntry, RequestKind};
use std::collections::BTreeMap;
use tracing::warn;

fn pool_entry<'s>(scratch: &'s mut ScratchState<'_>, token: &str) -> PortalResult<&'s mut LiquidationPoolEntry> {
    let key = token.to_string();
    if !scratch.liquidation_pool.contains_key(&key) {
        scratch
            .liquidation_pool
            .insert(key.clone(), LiquidationPoolEntry::default());
    }
    scratch
        .liquidation_pool
        .get_mut(&key)
        .ok_or_else(|| PortalError::Inconsistent(format!("liquidation pool for {token} vanished")))
}

fn fill_pool(
    scratch: &mut ScratchState<'_>,
    token: &str,
    public_tokens: u64,
    collaterals: &BTreeMap<String, u64>,
) -> PortalResult<()> {
    let overflow = || PortalError::Overflow { context: "liquidation pool".into() };
    let entry = pool_entry(scratch, token)?;
    entry.public_token_amount = entry
        .public_token_amount
        .checked_add(public_tokens)
        .ok_or_else(overflow)?;
    for (kind, amount) in collaterals {
        let held = entry.collaterals.entry(kind.clone()).or_default();
        *held = held.checked_add(*amount).ok_or_else(overflow)?;
    }
    Ok(())
}

/// `amount * part / whole` for u128 ratios with `part <= whole`, shifting
/// both down until the product fits.
fn share_of(amount: u64, mut part: u128, mut whole: u128) -> u64 {
    while part > u64::MAX as u128 {
        part >>= 1;
        whole >>= 1;
    }
    if whole == 0 {
        return 0;
    }
    (amount as u128 * part / whole).min(amount as u128) as u64
}

// ── Run-away custodians ───────────────────────────────────────

/// Liquidates one custodian that let a matched redeem time out without a
/// payout proof. The penalty is taken from the collateral the payout would
/// have unlocked, native first; the redeemer is refunded the public tokens.
pub fn build_run_away_liquidation(
    scratch: &ScratchState<'_>,
    ctx: &ExecutionContext,
    redeem_id: &str,
    custodian: &str,
) -> PortalResult<Option<Instruction>> {
    let Some(req) = scratch.matched_redeems.get(&redeem_id.to_string()) else {
        return Ok(None);
    };
    if !req.is_expired(ctx.height, ctx.params.timeout_custodian_return_pub_token) {
        return Ok(None);
    }
    let Some(matched) = req.matched_to(custodian) else {
        return Ok(None);
    };
    let Some(rates) = scratch.rates() else {
        warn!("Cannot price run-away penalty for redeem {}: no exchange rates", redeem_id);
        return Ok(None);
    };
    let tool = ExchangeRateTool::new(rates);
    if !tool.has_price(&req.token_id) {
        warn!("Cannot price run-away penalty for redeem {}: no {} rate", redeem_id, req.token_id);
        return Ok(None);
    }
    let record = scratch
        .custodians
        .get(&custodian.to_string())
        .ok_or_else(|| PortalError::Inconsistent(format!("matched custodian {custodian} missing")))?;

    let unlockable = RequestExposure::of(scratch, custodian, &req.token_id).proportional_unlock(
        record,
        &req.token_id,
        matched.amount,
    )?;
    let mut owed = tool.value_of(
        &req.token_id,
        up_percent(matched.amount, ctx.params.max_percent_liquidated_collateral_amount)?,
    )?;

    let mut order: Vec<String> = ctx
        .params
        .collateral_order()
        .into_iter()
        .filter(|k| unlockable.contains_key(k))
        .collect();
    order.extend(unlockable.keys().filter(|k| !order.contains(k)).cloned().collect::<Vec<_>>());

    let mut liquidated = BTreeMap::new();
    let mut remain_unlocked = BTreeMap::new();
    for kind in order {
        let available = unlockable.get(&kind).copied().unwrap_or(0);
        let take = if owed == 0 || !tool.has_price(&kind) {
            0
        } else if tool.value_of(&kind, available)? <= owed {
            available
        } else {
            tool.amount_for_value_ceil(&kind, owed)?.min(available)
        };
        if take > 0 {
            owed = owed.saturating_sub(tool.value_of(&kind, take)?);
            liquidated.insert(kind.clone(), take);
        }
        if available > take {
            remain_unlocked.insert(kind, available - take);
        }
    }

    Ok(Some(Instruction::new(
        None,
        InstructionStatus::Liquidated,
        PortalInstruction::LiquidateRunAway(RunAwayLiquidationContent {
            redeem_id: req.redeem_id.clone(),
            token_id: req.token_id.clone(),
            redeemer: req.redeemer.clone(),
            custodian: custodian.to_string(),
            matched_amount: matched.amount,
            liquidated,
            remain_unlocked,
        }),
    )))
}

pub fn apply_run_away_liquidation(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    status: InstructionStatus,
    c: &RunAwayLiquidationContent,
) -> PortalResult<()> {
    expect_status(status, InstructionStatus::Liquidated)?;
    let record = custodian_mut(scratch, &c.custodian)?;
    for (kind, amount) in &c.liquidated {
        seize_locked(record, &c.token_id, kind, *amount)?;
    }
    for (kind, amount) in &c.remain_unlocked {
        unlock(record, &c.token_id, kind, *amount)?;
    }
    release_matched_custodian(scratch, &c.redeem_id, &c.custodian, c.matched_amount)?;
    fill_pool(scratch, &c.token_id, c.matched_amount, &c.liquidated)?;
    warn!(
        "Custodian {} ran away from redeem {}: {:?} moved to the {} pool, {} refunded to {}",
        c.custodian, c.redeem_id, c.liquidated, c.token_id, c.matched_amount, c.redeemer
    );
    record_status(scratch, ctx, RequestKind::Redeem, &c.redeem_id, status, c)?;
    Ok(())
}

// ── Collateral ratio collapse ─────────────────────────────────

/// Liquidates part of a custodian's `token` position when its collateral
/// ratio is below `tp120`. Enough free holding is moved, with collateral
/// worth `percent_collateral_liquidated_by_rates` of it, to bring the ratio
/// back to `tp130`; everything goes when the position cannot cover that rate.
///
/// `exposure` may come from an earlier scan: rates liquidations change no
/// request, so one scan serves a whole sweep.
pub fn build_rates_liquidation(
    scratch: &ScratchState<'_>,
    ctx: &ExecutionContext,
    exposure: &RequestExposure,
    custodian: &str,
    token: &str,
) -> PortalResult<Option<Instruction>> {
    let Some(rates) = scratch.rates() else {
        return Ok(None);
    };
    let tool = ExchangeRateTool::new(rates);
    if !tool.has_price(token) {
        return Ok(None);
    }
    let Some(record) = scratch.custodians.get(&custodian.to_string()) else {
        return Ok(None);
    };
    let free_holding = record.holding(token);
    if free_holding == 0 {
        return Ok(None);
    }

    let holding = exposure.total_holding(record, token);
    let backing = exposure.backing_collateral(record, token)?;
    let mut locked_value: u128 = 0;
    for (kind, amount) in &backing {
        if tool.has_price(kind) {
            locked_value += tool.value_of(kind, *amount)?;
        }
    }
    let holding_value = tool.value_of(token, holding)?;
    let params = ctx.params;
    if 100 * locked_value >= params.tp120 as u128 * holding_value {
        return Ok(None);
    }
    let ratio_before = (locked_value * 100 / holding_value) as u64;

    let q = params.percent_collateral_liquidated_by_rates as u128;
    let mut liquidated = BTreeMap::new();
    let tokens = if 100 * locked_value <= q * holding_value {
        for (kind, amount) in &backing {
            let share = mul_div(*amount, free_holding, holding)?;
            if share > 0 {
                liquidated.insert(kind.clone(), share);
            }
        }
        free_holding
    } else {
        let tp130 = params.tp130 as u128;
        let needed = (tp130 * holding_value - 100 * locked_value).div_ceil(tp130 - q);
        let tokens = tool.amount_for_value_ceil(token, needed)?.min(free_holding);
        let moved_value = q * tool.value_of(token, tokens)? / 100;
        for (kind, amount) in &backing {
            if !tool.has_price(kind) {
                continue;
            }
            let share = share_of(*amount, moved_value.min(locked_value), locked_value);
            if share > 0 {
                liquidated.insert(kind.clone(), share);
            }
        }
        tokens
    };

    Ok(Some(Instruction::new(
        None,
        InstructionStatus::Liquidated,
        PortalInstruction::LiquidateByRates(RatesLiquidationContent {
            custodian: custodian.to_string(),
            token_id: token.to_string(),
            liquidated_public_tokens: tokens,
            liquidated,
            ratio_before,
        }),
    )))
}

pub fn apply_rates_liquidation(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    status: InstructionStatus,
    c: &RatesLiquidationContent,
) -> PortalResult<()> {
    expect_status(status, InstructionStatus::Liquidated)?;
    let record = custodian_mut(scratch, &c.custodian)?;
    sub_holding(record, &c.token_id, c.liquidated_public_tokens)?;
    for (kind, amount) in &c.liquidated {
        seize_locked(record, &c.token_id, kind, *amount)?;
    }
    fill_pool(scratch, &c.token_id, c.liquidated_public_tokens, &c.liquidated)?;
    warn!(
        "Custodian {} liquidated at {}% collateral: {} {} and {:?} to the pool (height {})",
        c.custodian, c.ratio_before, c.liquidated_public_tokens, c.token_id, c.liquidated, ctx.height
    );
    Ok(())
}

// ── Pool redeem ───────────────────────────────────────────────

/// Swaps public tokens for a pro-rata share of the pool's collateral.
pub fn build_pool_redeem(
    scratch: &ScratchState<'_>,
    ctx: &ExecutionContext,
    action: &PortalAction,
    a: &PoolRedeemAction,
) -> PortalResult<Instruction> {
    let (payout, reason) = match split_fatal(check_pool_redeem(scratch, ctx, action, a))? {
        Ok(payout) => (payout, None),
        Err(e) => (BTreeMap::new(), Some(e)),
    };
    let content = PoolRedeemContent {
        redeemer: a.redeemer.clone(),
        token_id: a.token_id.clone(),
        amount: a.amount,
        payout,
        tx_req_id: action.tx_req_id.clone(),
        reason,
    };
    Ok(Instruction::new(
        Some(action.shard_id),
        status_of(&content.reason),
        PortalInstruction::PoolRedeem(content),
    ))
}

fn check_pool_redeem(
    scratch: &ScratchState<'_>,
    ctx: &ExecutionContext,
    action: &PortalAction,
    a: &PoolRedeemAction,
) -> PortalResult<BTreeMap<String, u64>> {
    if !ctx.params.is_portal_token(&a.token_id) {
        return Err(PortalError::UnsupportedAsset {
            asset: a.token_id.clone(),
        });
    }
    if a.amount == 0 {
        return Err(invalid(&action.tx_req_id, "pool redeem amount is zero"));
    }
    let pool = scratch
        .liquidation_pool
        .get(&a.token_id)
        .filter(|p| p.public_token_amount > 0)
        .ok_or_else(|| PortalError::LiquidationPoolEmpty {
            asset: a.token_id.clone(),
        })?;
    if a.amount > pool.public_token_amount {
        return Err(PortalError::InsufficientPoolTokens {
            asset: a.token_id.clone(),
            requested: a.amount,
            available: pool.public_token_amount,
        });
    }
    let mut payout = BTreeMap::new();
    for (kind, held) in &pool.collaterals {
        let share = mul_div(*held, a.amount, pool.public_token_amount)?;
        if share > 0 {
            payout.insert(kind.clone(), share);
        }
    }
    Ok(payout)
}

pub fn apply_pool_redeem(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    status: InstructionStatus,
    c: &PoolRedeemContent,
) -> PortalResult<()> {
    if !action_rejected(status, &c.reason)? {
        let short = || PortalError::Inconsistent(format!("{} pool cannot pay {}", c.token_id, c.amount));
        let key = c.token_id.clone();
        let entry = scratch.liquidation_pool.get_mut(&key).ok_or_else(short)?;
        entry.public_token_amount = entry.public_token_amount.checked_sub(c.amount).ok_or_else(short)?;
        for (kind, amount) in &c.payout {
            let held = entry.collaterals.entry(kind.clone()).or_default();
            *held = held.checked_sub(*amount).ok_or_else(short)?;
            if *held == 0 {
                entry.collaterals.remove(kind);
            }
        }
        if entry.public_token_amount == 0 && entry.collaterals.is_empty() {
            scratch.liquidation_pool.remove(&key);
        }
    }
    record_status(scratch, ctx, RequestKind::PoolRedeem, &c.tx_req_id, status, c)?;
    Ok(())
}
