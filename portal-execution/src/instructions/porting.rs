//! Porting: users lock wrapped assets with custodians and receive the
//! public token once the external payment is proven.

use crate::accounting::{
    action_rejected, add_holding, check_proof, consume_external_tx, custodian_mut, expect_status,
    history_contains, invalid, lock, min_fee, rate_tool, record_status, record_status_if_absent,
    reject_replayed, require_prices, split_fatal, status_of, unlock,
};
use crate::verifier::ProofVerdict;
use crate::ExecutionContext;
use portal_oracles::{up_percent, ExchangeRateTool};
use portal_types::action::{PortalAction, PortingProofAction, PortingRequestAction};
use portal_types::custodian::CustodianRecord;
use portal_types::error::{PortalError, PortalResult};
use portal_types::instruction::{
    ExpiredPortingContent, Instruction, InstructionStatus, PortalInstruction, PortingProofContent,
    PortingRequestContent,
};
use portal_types::params::PortalParams;
use portal_types::request::{MatchingPortingCustodian, WaitingPortingRequest};
use portal_types::scratch::ScratchState;
use portal_types::state::RequestKind;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Value of everything the custodian could still lock, over priced kinds.
fn free_value(tool: &ExchangeRateTool<'_>, params: &PortalParams, c: &CustodianRecord) -> PortalResult<u128> {
    let mut total: u128 = 0;
    for kind in params.collateral_order() {
        if tool.has_price(&kind) {
            total = total
                .checked_add(tool.value_of(&kind, c.free(&kind))?)
                .ok_or_else(|| PortalError::Overflow { context: "free value".into() })?;
        }
    }
    Ok(total)
}

/// Collateral to lock for `amount` of `token`, native first then token
/// collaterals in ID order.
pub fn lock_plan(
    tool: &ExchangeRateTool<'_>,
    params: &PortalParams,
    c: &CustodianRecord,
    token: &str,
    amount: u64,
) -> PortalResult<BTreeMap<String, u64>> {
    let mut remaining = tool.value_of(token, up_percent(amount, params.min_percent_locked_collateral)?)?;
    let mut plan = BTreeMap::new();
    for kind in params.collateral_order() {
        if remaining == 0 {
            break;
        }
        let free = c.free(&kind);
        if free == 0 || !tool.has_price(&kind) {
            continue;
        }
        let take = if tool.value_of(&kind, free)? <= remaining {
            free
        } else {
            tool.amount_for_value_ceil(&kind, remaining)?.min(free)
        };
        remaining = remaining.saturating_sub(tool.value_of(&kind, take)?);
        plan.insert(kind, take);
    }
    if remaining > 0 {
        return Err(PortalError::InsufficientFreeCollateral {
            custodian: c.address.clone(),
            collateral: params.native_collateral.clone(),
            requested: amount,
            free: c.free(&params.native_collateral),
        });
    }
    Ok(plan)
}

/// Splits `amount` across custodians with an address for `token`, taking
/// the smallest free collateral first so large custodians stay available.
pub fn pick_porting_custodians(
    scratch: &ScratchState<'_>,
    ctx: &ExecutionContext,
    tool: &ExchangeRateTool<'_>,
    token: &str,
    amount: u64,
) -> PortalResult<Vec<MatchingPortingCustodian>> {
    let price = tool.price(token)? as u128;
    let per_unit = price * ctx.params.min_percent_locked_collateral as u128;

    let mut candidates = Vec::new();
    for (address, c) in scratch.custodians.entries() {
        let Some(remote) = c.remote_addresses.get(token) else {
            continue;
        };
        let value = free_value(tool, ctx.params, c)?;
        if value > 0 {
            candidates.push((value, address, c, remote));
        }
    }
    candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));

    let mut remaining = amount;
    let mut matched = Vec::new();
    for (value, address, c, remote) in candidates {
        if remaining == 0 {
            break;
        }
        let capacity = value * 100 / per_unit;
        let take = capacity.min(remaining as u128) as u64;
        if take == 0 {
            continue;
        }
        matched.push(MatchingPortingCustodian {
            custodian: address.clone(),
            remote_address: remote.clone(),
            amount: take,
            locked_collaterals: lock_plan(tool, ctx.params, c, token, take)?,
        });
        remaining -= take;
    }

    if remaining > 0 {
        return Err(PortalError::InsufficientCollateral {
            asset: token.to_string(),
            requested: amount,
            available: amount - remaining,
        });
    }
    Ok(matched)
}

// ── Request ───────────────────────────────────────────────────

pub fn build_porting_request(
    scratch: &ScratchState<'_>,
    ctx: &ExecutionContext,
    action: &PortalAction,
    a: &PortingRequestAction,
) -> PortalResult<Instruction> {
    let (custodians, reason) = match split_fatal(check_porting_request(scratch, ctx, a))? {
        Ok(custodians) => (custodians, None),
        Err(e) => (Vec::new(), Some(e)),
    };
    let content = PortingRequestContent {
        porting_id: a.porting_id.clone(),
        token_id: a.token_id.clone(),
        porter: a.porter.clone(),
        amount: a.amount,
        porting_fee: a.porting_fee,
        custodians,
        tx_req_id: action.tx_req_id.clone(),
        shard_height: action.shard_height,
        reason,
    };
    Ok(Instruction::new(
        Some(action.shard_id),
        status_of(&content.reason),
        PortalInstruction::PortingRequest(content),
    ))
}

fn check_porting_request(
    scratch: &ScratchState<'_>,
    ctx: &ExecutionContext,
    a: &PortingRequestAction,
) -> PortalResult<Vec<MatchingPortingCustodian>> {
    if scratch.waiting_portings.contains_key(&a.porting_id)
        || history_contains(scratch, RequestKind::Porting, &a.porting_id)
    {
        return Err(PortalError::DuplicateId {
            id: a.porting_id.clone(),
        });
    }
    if !ctx.params.is_portal_token(&a.token_id) {
        return Err(PortalError::UnsupportedAsset {
            asset: a.token_id.clone(),
        });
    }
    if a.amount == 0 {
        return Err(invalid(&a.porting_id, "porting amount is zero"));
    }

    let tool = rate_tool(scratch)?;
    require_prices(&tool, &[&a.token_id, &ctx.params.native_collateral])?;
    let expected = min_fee(&tool, ctx, &a.token_id, a.amount, ctx.params.min_porting_fee_bps)?;
    if a.porting_fee < expected {
        return Err(PortalError::FeeTooLow {
            id: a.porting_id.clone(),
            expected,
            got: a.porting_fee,
        });
    }
    pick_porting_custodians(scratch, ctx, &tool, &a.token_id, a.amount)
}

pub fn apply_porting_request(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    shard_id: Option<u8>,
    status: InstructionStatus,
    c: &PortingRequestContent,
) -> PortalResult<()> {
    if action_rejected(status, &c.reason)? {
        record_status_if_absent(scratch, ctx, RequestKind::Porting, &c.porting_id, status, c)?;
        return Ok(());
    }
    if scratch.waiting_portings.contains_key(&c.porting_id) {
        return Err(PortalError::Inconsistent(format!("porting {} already waiting", c.porting_id)));
    }
    let matched: u64 = c.custodians.iter().map(|d| d.amount).sum();
    if matched != c.amount {
        return Err(PortalError::Inconsistent(format!(
            "porting {} matches {matched} of {}",
            c.porting_id, c.amount
        )));
    }

    for detail in &c.custodians {
        let record = custodian_mut(scratch, &detail.custodian)?;
        for (kind, amount) in &detail.locked_collaterals {
            lock(record, &c.token_id, kind, *amount)?;
        }
    }
    scratch.waiting_portings.insert(
        c.porting_id.clone(),
        WaitingPortingRequest {
            porting_id: c.porting_id.clone(),
            token_id: c.token_id.clone(),
            porter: c.porter.clone(),
            amount: c.amount,
            custodians: c.custodians.clone(),
            porting_fee: c.porting_fee,
            beacon_height: ctx.height,
            shard_id: shard_id.unwrap_or_default(),
            shard_height: c.shard_height,
            tx_req_id: c.tx_req_id.clone(),
        },
    );
    info!(
        "Porting {} accepted: {} {} across {} custodians",
        c.porting_id,
        c.amount,
        c.token_id,
        c.custodians.len()
    );
    record_status(scratch, ctx, RequestKind::Porting, &c.porting_id, status, c)?;
    Ok(())
}

// ── Proof ─────────────────────────────────────────────────────

pub fn build_porting_proof(
    scratch: &ScratchState<'_>,
    action: &PortalAction,
    a: &PortingProofAction,
    verdict: Option<ProofVerdict>,
) -> PortalResult<Instruction> {
    let (custodians, reason) = match split_fatal(check_porting_proof(scratch, a, verdict.as_ref()))? {
        Ok(custodians) => (custodians, None),
        Err(e) => (Vec::new(), Some(e)),
    };
    let content = PortingProofContent {
        porting_id: a.porting_id.clone(),
        token_id: a.token_id.clone(),
        porter: a.porter.clone(),
        amount: a.amount,
        external_tx: verdict.map(|v| v.external_tx),
        custodians,
        tx_req_id: action.tx_req_id.clone(),
        reason,
    };
    Ok(Instruction::new(
        Some(action.shard_id),
        status_of(&content.reason),
        PortalInstruction::PortingProof(content),
    ))
}

fn check_porting_proof(
    scratch: &ScratchState<'_>,
    a: &PortingProofAction,
    verdict: Option<&ProofVerdict>,
) -> PortalResult<Vec<MatchingPortingCustodian>> {
    reject_replayed(scratch, &a.porting_id, verdict)?;
    let porting = scratch
        .waiting_portings
        .get(&a.porting_id)
        .ok_or_else(|| PortalError::RequestNotFound {
            id: a.porting_id.clone(),
        })?;
    if porting.token_id != a.token_id || porting.porter != a.porter || porting.amount != a.amount {
        return Err(invalid(&a.porting_id, "proof does not match the waiting porting"));
    }
    check_proof(scratch, &a.porting_id, verdict)?;
    Ok(porting.custodians.clone())
}

pub fn apply_porting_proof(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    status: InstructionStatus,
    c: &PortingProofContent,
) -> PortalResult<()> {
    if action_rejected(status, &c.reason)? {
        record_status(scratch, ctx, RequestKind::PortingProof, &c.tx_req_id, status, c)?;
        return Ok(());
    }
    let porting = scratch
        .waiting_portings
        .remove(&c.porting_id)
        .ok_or_else(|| PortalError::Inconsistent(format!("porting {} not waiting", c.porting_id)))?;
    if porting.custodians != c.custodians {
        return Err(PortalError::Inconsistent(format!(
            "porting {} custodians changed since the proof was accepted",
            c.porting_id
        )));
    }
    for detail in &porting.custodians {
        add_holding(custodian_mut(scratch, &detail.custodian)?, &porting.token_id, detail.amount)?;
    }
    consume_external_tx(scratch, &c.porting_id, c.external_tx)?;
    debug!("Porting {} minted {} {}", c.porting_id, c.amount, c.token_id);
    record_status(scratch, ctx, RequestKind::Porting, &c.porting_id, InstructionStatus::Success, c)?;
    record_status(scratch, ctx, RequestKind::PortingProof, &c.tx_req_id, status, c)?;
    Ok(())
}

// ── Expiry ────────────────────────────────────────────────────

pub fn build_expired_porting(
    scratch: &ScratchState<'_>,
    ctx: &ExecutionContext,
    porting_id: &str,
) -> PortalResult<Option<Instruction>> {
    let Some(p) = scratch.waiting_portings.get(&porting_id.to_string()) else {
        return Ok(None);
    };
    if !p.is_expired(ctx.height, ctx.params.timeout_waiting_porting_request) {
        return Ok(None);
    }
    Ok(Some(Instruction::new(
        None,
        InstructionStatus::Expired,
        PortalInstruction::ExpiredWaitingPorting(ExpiredPortingContent {
            porting_id: p.porting_id.clone(),
            token_id: p.token_id.clone(),
            porter: p.porter.clone(),
            amount: p.amount,
            custodians: p.custodians.clone(),
        }),
    )))
}

pub fn apply_expired_porting(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    status: InstructionStatus,
    c: &ExpiredPortingContent,
) -> PortalResult<()> {
    expect_status(status, InstructionStatus::Expired)?;
    let porting = scratch
        .waiting_portings
        .remove(&c.porting_id)
        .ok_or_else(|| PortalError::Inconsistent(format!("porting {} not waiting", c.porting_id)))?;
    for detail in &porting.custodians {
        let record = custodian_mut(scratch, &detail.custodian)?;
        for (kind, amount) in &detail.locked_collaterals {
            unlock(record, &porting.token_id, kind, *amount)?;
        }
    }
    info!("Porting {} expired at height {}", c.porting_id, ctx.height);
    record_status(scratch, ctx, RequestKind::Porting, &c.porting_id, status, c)?;
    Ok(())
}
