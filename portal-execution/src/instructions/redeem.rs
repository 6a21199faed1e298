//! Redeeming: users burn public tokens and custodians pay out on the
//! external chain, getting their collateral back once the payment is proven.
//!
//! Matching reserves the custodian's holding immediately, so a holding can
//! never be promised to two redeems.

use crate::accounting::{
    action_rejected, add_holding, check_proof, consume_external_tx, custodian_mut, expect_status,
    history_contains, invalid, min_fee, rate_tool, record_status, record_status_if_absent, reject_replayed,
    require_prices, split_fatal, status_of, sub_holding, unlock, RequestExposure,
};
use crate::verifier::ProofVerdict;
use crate::ExecutionContext;
use portal_types::action::{
    PortalAction, RedeemMatchingAction, RedeemProofAction, RedeemRequestAction,
};
use portal_types::error::{PortalError, PortalResult};
use portal_types::instruction::{
    Instruction, InstructionStatus, PickMoreCustodiansContent, PortalInstruction,
    RedeemMatchingContent, RedeemProofContent, RedeemRequestContent,
};
use portal_types::request::{MatchingRedeemCustodian, RedeemRequest};
use portal_types::scratch::ScratchState;
use portal_types::state::RequestKind;
use std::collections::BTreeMap;
use tracing::info;

/// Moves a fully covered request from the waiting to the matched set.
fn promote_if_matched(scratch: &mut ScratchState<'_>, redeem_id: &str) -> bool {
    let key = redeem_id.to_string();
    let ready = scratch
        .waiting_redeems
        .get(&key)
        .map(RedeemRequest::is_fully_matched)
        .unwrap_or(false);
    if ready {
        if let Some(req) = scratch.waiting_redeems.remove(&key) {
            info!("Redeem {} fully matched to {} custodians", redeem_id, req.custodians.len());
            scratch.matched_redeems.insert(key, req);
        }
    }
    ready
}

/// Drops one custodian from a matched request. Returns the request when that
/// was its last custodian and it left the matched set.
pub(crate) fn release_matched_custodian(
    scratch: &mut ScratchState<'_>,
    redeem_id: &str,
    custodian: &str,
    amount: u64,
) -> PortalResult<Option<RedeemRequest>> {
    let key = redeem_id.to_string();
    let req = scratch
        .matched_redeems
        .get_mut(&key)
        .ok_or_else(|| PortalError::Inconsistent(format!("redeem {redeem_id} not matched")))?;
    match req.matched_to(custodian) {
        Some(m) if m.amount == amount => {}
        _ => {
            return Err(PortalError::Inconsistent(format!(
                "{custodian} does not owe {amount} on redeem {redeem_id}"
            )))
        }
    }
    req.custodians.retain(|m| m.custodian != custodian);
    if req.custodians.is_empty() {
        return Ok(scratch.matched_redeems.remove(&key));
    }
    Ok(None)
}

// ── Request ───────────────────────────────────────────────────

pub fn build_redeem_request(
    scratch: &ScratchState<'_>,
    ctx: &ExecutionContext,
    action: &PortalAction,
    a: &RedeemRequestAction,
) -> PortalResult<Instruction> {
    let reason = split_fatal(check_redeem_request(scratch, ctx, a))?.err();
    let content = RedeemRequestContent {
        redeem_id: a.redeem_id.clone(),
        token_id: a.token_id.clone(),
        redeemer: a.redeemer.clone(),
        redeemer_remote_address: a.redeemer_remote_address.clone(),
        amount: a.amount,
        redeem_fee: a.redeem_fee,
        tx_req_id: action.tx_req_id.clone(),
        shard_height: action.shard_height,
        reason,
    };
    Ok(Instruction::new(
        Some(action.shard_id),
        status_of(&content.reason),
        PortalInstruction::RedeemRequest(content),
    ))
}

fn check_redeem_request(
    scratch: &ScratchState<'_>,
    ctx: &ExecutionContext,
    a: &RedeemRequestAction,
) -> PortalResult<()> {
    if scratch.waiting_redeems.contains_key(&a.redeem_id)
        || scratch.matched_redeems.contains_key(&a.redeem_id)
        || history_contains(scratch, RequestKind::Redeem, &a.redeem_id)
    {
        return Err(PortalError::DuplicateId {
            id: a.redeem_id.clone(),
        });
    }
    if !ctx.params.is_portal_token(&a.token_id) {
        return Err(PortalError::UnsupportedAsset {
            asset: a.token_id.clone(),
        });
    }
    if a.amount == 0 {
        return Err(invalid(&a.redeem_id, "redeem amount is zero"));
    }
    if a.redeemer_remote_address.is_empty() {
        return Err(invalid(&a.redeem_id, "missing redeemer remote address"));
    }

    let tool = rate_tool(scratch)?;
    require_prices(&tool, &[&a.token_id, &ctx.params.native_collateral])?;
    let expected = min_fee(&tool, ctx, &a.token_id, a.amount, ctx.params.min_redeem_fee_bps)?;
    if a.redeem_fee < expected {
        return Err(PortalError::FeeTooLow {
            id: a.redeem_id.clone(),
            expected,
            got: a.redeem_fee,
        });
    }

    let available: u64 = scratch
        .custodians
        .values()
        .map(|c| c.holding(&a.token_id))
        .sum();
    if available < a.amount {
        return Err(PortalError::InsufficientPublicTokens {
            asset: a.token_id.clone(),
            requested: a.amount,
            available,
        });
    }
    Ok(())
}

pub fn apply_redeem_request(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    shard_id: Option<u8>,
    status: InstructionStatus,
    c: &RedeemRequestContent,
) -> PortalResult<()> {
    if action_rejected(status, &c.reason)? {
        record_status_if_absent(scratch, ctx, RequestKind::Redeem, &c.redeem_id, status, c)?;
        return Ok(());
    }
    if scratch.waiting_redeems.contains_key(&c.redeem_id) || scratch.matched_redeems.contains_key(&c.redeem_id) {
        return Err(PortalError::Inconsistent(format!("redeem {} already open", c.redeem_id)));
    }
    scratch.waiting_redeems.insert(
        c.redeem_id.clone(),
        RedeemRequest {
            redeem_id: c.redeem_id.clone(),
            token_id: c.token_id.clone(),
            redeemer: c.redeemer.clone(),
            redeemer_remote_address: c.redeemer_remote_address.clone(),
            amount: c.amount,
            custodians: Vec::new(),
            redeem_fee: c.redeem_fee,
            beacon_height: ctx.height,
            shard_id: shard_id.unwrap_or_default(),
            shard_height: c.shard_height,
            tx_req_id: c.tx_req_id.clone(),
        },
    );
    record_status(scratch, ctx, RequestKind::Redeem, &c.redeem_id, status, c)?;
    Ok(())
}

// ── Custodian matching ────────────────────────────────────────

pub fn build_redeem_matching(
    scratch: &ScratchState<'_>,
    action: &PortalAction,
    a: &RedeemMatchingAction,
) -> PortalResult<Instruction> {
    let (remote_address, matched_amount, reason) = match split_fatal(check_redeem_matching(scratch, a))? {
        Ok((remote, amount)) => (remote, amount, None),
        Err(e) => (String::new(), 0, Some(e)),
    };
    let content = RedeemMatchingContent {
        redeem_id: a.redeem_id.clone(),
        custodian: a.custodian.clone(),
        remote_address,
        matched_amount,
        tx_req_id: action.tx_req_id.clone(),
        reason,
    };
    Ok(Instruction::new(
        Some(action.shard_id),
        status_of(&content.reason),
        PortalInstruction::RedeemMatching(content),
    ))
}

fn check_redeem_matching(scratch: &ScratchState<'_>, a: &RedeemMatchingAction) -> PortalResult<(String, u64)> {
    if scratch.matched_redeems.contains_key(&a.redeem_id) {
        return Err(invalid(&a.redeem_id, "redeem is already fully matched"));
    }
    let req = scratch
        .waiting_redeems
        .get(&a.redeem_id)
        .ok_or_else(|| PortalError::RequestNotFound {
            id: a.redeem_id.clone(),
        })?;
    let custodian = scratch
        .custodians
        .get(&a.custodian)
        .ok_or_else(|| PortalError::CustodianNotFound {
            custodian: a.custodian.clone(),
        })?;
    if req.matched_to(&a.custodian).is_some() {
        return Err(PortalError::CustodianAlreadyMatched {
            id: a.redeem_id.clone(),
            custodian: a.custodian.clone(),
        });
    }
    let remote = custodian
        .remote_addresses
        .get(&req.token_id)
        .ok_or_else(|| invalid(&a.redeem_id, "custodian has no address for this asset"))?;

    let holding = custodian.holding(&req.token_id);
    let cover = holding
        .min(req.remaining())
        .min(a.amount.unwrap_or(u64::MAX));
    if cover == 0 {
        return Err(PortalError::InsufficientPublicTokens {
            asset: req.token_id.clone(),
            requested: req.remaining(),
            available: holding,
        });
    }
    Ok((remote.clone(), cover))
}

pub fn apply_redeem_matching(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    status: InstructionStatus,
    c: &RedeemMatchingContent,
) -> PortalResult<()> {
    if !action_rejected(status, &c.reason)? {
        let req = scratch
            .waiting_redeems
            .get_mut(&c.redeem_id)
            .ok_or_else(|| PortalError::Inconsistent(format!("redeem {} not waiting", c.redeem_id)))?;
        if c.matched_amount == 0 || req.remaining() < c.matched_amount || req.matched_to(&c.custodian).is_some() {
            return Err(PortalError::Inconsistent(format!(
                "cannot match {} of redeem {} to {}",
                c.matched_amount, c.redeem_id, c.custodian
            )));
        }
        req.custodians.push(MatchingRedeemCustodian {
            custodian: c.custodian.clone(),
            remote_address: c.remote_address.clone(),
            amount: c.matched_amount,
        });
        let token = req.token_id.clone();
        sub_holding(custodian_mut(scratch, &c.custodian)?, &token, c.matched_amount)?;
        promote_if_matched(scratch, &c.redeem_id);
    }
    record_status(scratch, ctx, RequestKind::RedeemMatching, &c.tx_req_id, status, c)?;
    Ok(())
}

// ── Forced matching after timeout ─────────────────────────────

/// Covers the rest of a timed-out waiting redeem from the smallest holdings
/// up. `None` when not expired or the holdings cannot cover it yet; the
/// request then stays waiting and is retried next block.
pub fn build_pick_more_custodians(
    scratch: &ScratchState<'_>,
    ctx: &ExecutionContext,
    redeem_id: &str,
) -> PortalResult<Option<Instruction>> {
    let Some(req) = scratch.waiting_redeems.get(&redeem_id.to_string()) else {
        return Ok(None);
    };
    if !req.is_expired(ctx.height, ctx.params.timeout_waiting_redeem_request) {
        return Ok(None);
    }

    let mut candidates: Vec<(u64, &String, &String)> = scratch
        .custodians
        .entries()
        .filter(|(address, _)| req.matched_to(address).is_none())
        .filter_map(|(address, c)| {
            let holding = c.holding(&req.token_id);
            let remote = c.remote_addresses.get(&req.token_id)?;
            (holding > 0).then_some((holding, address, remote))
        })
        .collect();
    candidates.sort();

    let mut remaining = req.remaining();
    let mut picked = Vec::new();
    for (holding, address, remote) in candidates {
        if remaining == 0 {
            break;
        }
        let take = holding.min(remaining);
        picked.push(MatchingRedeemCustodian {
            custodian: address.clone(),
            remote_address: remote.clone(),
            amount: take,
        });
        remaining -= take;
    }
    if remaining > 0 {
        // Nobody can cover the rest: hand reserved holdings back and refund.
        info!(
            "Redeem {} short by {} after timeout, refunding {}",
            redeem_id, remaining, req.redeemer
        );
        return Ok(Some(Instruction::new(
            None,
            InstructionStatus::Refunded,
            PortalInstruction::PickMoreCustodians(PickMoreCustodiansContent {
                redeem_id: req.redeem_id.clone(),
                token_id: req.token_id.clone(),
                custodians: req.custodians.clone(),
            }),
        )));
    }
    if picked.is_empty() {
        return Ok(None);
    }

    Ok(Some(Instruction::new(
        None,
        InstructionStatus::Accepted,
        PortalInstruction::PickMoreCustodians(PickMoreCustodiansContent {
            redeem_id: req.redeem_id.clone(),
            token_id: req.token_id.clone(),
            custodians: picked,
        }),
    )))
}

/// Cancels a timed-out waiting redeem. `c.custodians` are the matches made
/// before the timeout; their holdings are restored.
fn apply_cancel_waiting_redeem(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    c: &PickMoreCustodiansContent,
) -> PortalResult<()> {
    let key = c.redeem_id.clone();
    let req = scratch
        .waiting_redeems
        .get(&key)
        .ok_or_else(|| PortalError::Inconsistent(format!("redeem {} not waiting", c.redeem_id)))?;
    if req.custodians != c.custodians || req.token_id != c.token_id {
        return Err(PortalError::Inconsistent(format!(
            "refund of redeem {} does not name its matched custodians",
            c.redeem_id
        )));
    }
    for m in &c.custodians {
        add_holding(custodian_mut(scratch, &m.custodian)?, &c.token_id, m.amount)?;
    }
    scratch.waiting_redeems.remove(&key);
    record_status(scratch, ctx, RequestKind::Redeem, &c.redeem_id, InstructionStatus::Refunded, c)?;
    Ok(())
}

pub fn apply_pick_more_custodians(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    status: InstructionStatus,
    c: &PickMoreCustodiansContent,
) -> PortalResult<()> {
    if status == InstructionStatus::Refunded {
        return apply_cancel_waiting_redeem(scratch, ctx, c);
    }
    expect_status(status, InstructionStatus::Accepted)?;
    let req = scratch
        .waiting_redeems
        .get_mut(&c.redeem_id)
        .ok_or_else(|| PortalError::Inconsistent(format!("redeem {} not waiting", c.redeem_id)))?;
    for m in &c.custodians {
        if req.matched_to(&m.custodian).is_some() {
            return Err(PortalError::Inconsistent(format!(
                "{} already matched to redeem {}",
                m.custodian, c.redeem_id
            )));
        }
        req.custodians.push(m.clone());
    }
    if req.matched_amount() != req.amount {
        return Err(PortalError::Inconsistent(format!(
            "forced matching leaves redeem {} at {} of {}",
            c.redeem_id,
            req.matched_amount(),
            req.amount
        )));
    }
    for m in &c.custodians {
        sub_holding(custodian_mut(scratch, &m.custodian)?, &c.token_id, m.amount)?;
    }
    promote_if_matched(scratch, &c.redeem_id);
    record_status(scratch, ctx, RequestKind::RedeemMatching, &c.redeem_id, status, c)?;
    Ok(())
}

// ── Payout proof ──────────────────────────────────────────────

pub fn build_redeem_proof(
    scratch: &ScratchState<'_>,
    action: &PortalAction,
    a: &RedeemProofAction,
    verdict: Option<ProofVerdict>,
) -> PortalResult<Instruction> {
    let (redeem_amount, unlocked, reason) = match split_fatal(check_redeem_proof(scratch, a, verdict.as_ref()))? {
        Ok((amount, unlocked)) => (amount, unlocked, None),
        Err(e) => (0, BTreeMap::new(), Some(e)),
    };
    let content = RedeemProofContent {
        redeem_id: a.redeem_id.clone(),
        token_id: a.token_id.clone(),
        custodian: a.custodian.clone(),
        redeem_amount,
        unlocked,
        external_tx: verdict.map(|v| v.external_tx),
        tx_req_id: action.tx_req_id.clone(),
        reason,
    };
    Ok(Instruction::new(
        Some(action.shard_id),
        status_of(&content.reason),
        PortalInstruction::RedeemProof(content),
    ))
}

fn check_redeem_proof(
    scratch: &ScratchState<'_>,
    a: &RedeemProofAction,
    verdict: Option<&ProofVerdict>,
) -> PortalResult<(u64, BTreeMap<String, u64>)> {
    reject_replayed(scratch, &a.redeem_id, verdict)?;
    if scratch.waiting_redeems.contains_key(&a.redeem_id) {
        return Err(invalid(&a.redeem_id, "redeem is not fully matched yet"));
    }
    let req = scratch
        .matched_redeems
        .get(&a.redeem_id)
        .ok_or_else(|| PortalError::RequestNotFound {
            id: a.redeem_id.clone(),
        })?;
    if req.token_id != a.token_id {
        return Err(invalid(&a.redeem_id, "token does not match the redeem"));
    }
    let matched = req
        .matched_to(&a.custodian)
        .ok_or_else(|| invalid(&a.redeem_id, "custodian is not matched to this redeem"))?;
    check_proof(scratch, &a.redeem_id, verdict)?;

    let custodian = scratch
        .custodians
        .get(&a.custodian)
        .ok_or_else(|| PortalError::CustodianNotFound {
            custodian: a.custodian.clone(),
        })?;
    let unlocked = RequestExposure::of(scratch, &a.custodian, &req.token_id).proportional_unlock(
        custodian,
        &req.token_id,
        matched.amount,
    )?;
    Ok((matched.amount, unlocked))
}

pub fn apply_redeem_proof(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    status: InstructionStatus,
    c: &RedeemProofContent,
) -> PortalResult<()> {
    if action_rejected(status, &c.reason)? {
        record_status(scratch, ctx, RequestKind::RedeemProof, &c.tx_req_id, status, c)?;
        return Ok(());
    }
    let record = custodian_mut(scratch, &c.custodian)?;
    for (kind, amount) in &c.unlocked {
        unlock(record, &c.token_id, kind, *amount)?;
    }
    if let Some(done) = release_matched_custodian(scratch, &c.redeem_id, &c.custodian, c.redeem_amount)? {
        info!("Redeem {} completed: {} {}", done.redeem_id, done.amount, done.token_id);
        record_status(scratch, ctx, RequestKind::Redeem, &c.redeem_id, InstructionStatus::Success, c)?;
    }
    consume_external_tx(scratch, &c.redeem_id, c.external_tx)?;
    record_status(scratch, ctx, RequestKind::RedeemProof, &c.tx_req_id, status, c)?;
    Ok(())
}
