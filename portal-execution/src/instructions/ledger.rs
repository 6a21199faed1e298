//! Custodian collateral: deposits, withdrawals and top-ups.

use crate::accounting::{
    action_rejected, check_proof, consume_external_tx, credit_collateral, custodian_mut,
    debit_free_collateral, invalid, lock, record_status, split_fatal, status_of, RequestExposure,
};
use crate::verifier::ProofVerdict;
use crate::ExecutionContext;
use portal_types::action::{
    CustodianDepositAction, CustodianTopupAction, CustodianWithdrawAction, PortalAction,
    PortingTopupAction,
};
use portal_types::custodian::CustodianRecord;
use portal_types::error::{PortalError, PortalResult};
use portal_types::instruction::{
    CustodianTopupContent, DepositContent, Instruction, InstructionStatus, PortalInstruction,
    PortingTopupContent, WithdrawContent,
};
use portal_types::scratch::ScratchState;
use portal_types::state::RequestKind;

fn check_collateral(ctx: &ExecutionContext, collateral: &str) -> PortalResult<()> {
    if !ctx.params.is_collateral(collateral) {
        return Err(PortalError::UnsupportedCollateral {
            collateral: collateral.to_string(),
        });
    }
    Ok(())
}

fn existing<'s>(scratch: &'s ScratchState<'_>, custodian: &str) -> PortalResult<&'s CustodianRecord> {
    scratch
        .custodians
        .get(&custodian.to_string())
        .ok_or_else(|| PortalError::CustodianNotFound {
            custodian: custodian.to_string(),
        })
}

fn check_free(c: &CustodianRecord, collateral: &str, amount: u64) -> PortalResult<()> {
    let free = c.free(collateral);
    if free < amount {
        return Err(PortalError::InsufficientFreeCollateral {
            custodian: c.address.clone(),
            collateral: collateral.to_string(),
            requested: amount,
            free,
        });
    }
    Ok(())
}

// ── Deposit ───────────────────────────────────────────────────

pub fn build_deposit(
    scratch: &ScratchState<'_>,
    ctx: &ExecutionContext,
    action: &PortalAction,
    a: &CustodianDepositAction,
    verdict: Option<ProofVerdict>,
) -> PortalResult<Instruction> {
    let external_tx = if a.collateral == ctx.params.native_collateral {
        None
    } else {
        verdict.map(|v| v.external_tx)
    };
    let reason = split_fatal(check_deposit(scratch, ctx, action, a, verdict.as_ref()))?.err();
    let content = DepositContent {
        custodian: a.custodian.clone(),
        collateral: a.collateral.clone(),
        amount: a.amount,
        remote_addresses: a.remote_addresses.clone(),
        external_tx,
        tx_req_id: action.tx_req_id.clone(),
        reason,
    };
    Ok(Instruction::new(
        Some(action.shard_id),
        status_of(&content.reason),
        PortalInstruction::CustodianDeposit(content),
    ))
}

fn check_deposit(
    scratch: &ScratchState<'_>,
    ctx: &ExecutionContext,
    action: &PortalAction,
    a: &CustodianDepositAction,
    verdict: Option<&ProofVerdict>,
) -> PortalResult<()> {
    let id = &action.tx_req_id;
    if a.amount == 0 {
        return Err(invalid(id, "deposit amount is zero"));
    }
    check_collateral(ctx, &a.collateral)?;
    if let Some(token) = a.remote_addresses.keys().find(|t| !ctx.params.is_portal_token(t)) {
        return Err(PortalError::UnsupportedAsset { asset: token.clone() });
    }
    if a.remote_addresses.values().any(|addr| addr.is_empty()) {
        return Err(invalid(id, "empty remote address"));
    }
    let known_addresses = scratch
        .custodians
        .get(&a.custodian)
        .map(|c| !c.remote_addresses.is_empty())
        .unwrap_or(false);
    if !known_addresses && a.remote_addresses.is_empty() {
        return Err(invalid(id, "custodian has no remote address"));
    }
    if a.collateral != ctx.params.native_collateral {
        if a.proof.is_none() {
            return Err(PortalError::InvalidProof {
                id: id.clone(),
                reason: "token collateral needs a vault payment proof".to_string(),
            });
        }
        check_proof(scratch, id, verdict)?;
    }
    Ok(())
}

pub fn apply_deposit(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    status: InstructionStatus,
    c: &DepositContent,
) -> PortalResult<()> {
    if action_rejected(status, &c.reason)? {
        record_status(scratch, ctx, RequestKind::Deposit, &c.tx_req_id, status, c)?;
        return Ok(());
    }
    if !scratch.custodians.contains_key(&c.custodian) {
        scratch
            .custodians
            .insert(c.custodian.clone(), CustodianRecord::new(&c.custodian));
    }
    let record = custodian_mut(scratch, &c.custodian)?;
    // A custodian holding nothing may re-register its addresses; otherwise
    // only assets without an address gain one.
    if !record.has_any_collateral() && !c.remote_addresses.is_empty() {
        record.remote_addresses = c.remote_addresses.clone();
    } else {
        for (token, address) in &c.remote_addresses {
            record
                .remote_addresses
                .entry(token.clone())
                .or_insert_with(|| address.clone());
        }
    }
    credit_collateral(record, &c.collateral, c.amount)?;
    if c.collateral != ctx.params.native_collateral {
        consume_external_tx(scratch, &c.tx_req_id, c.external_tx)?;
    }
    record_status(scratch, ctx, RequestKind::Deposit, &c.tx_req_id, status, c)?;
    Ok(())
}

// ── Withdraw ──────────────────────────────────────────────────

pub fn build_withdraw(
    scratch: &ScratchState<'_>,
    ctx: &ExecutionContext,
    action: &PortalAction,
    a: &CustodianWithdrawAction,
) -> PortalResult<Instruction> {
    let check = || -> PortalResult<()> {
        if a.amount == 0 {
            return Err(invalid(&action.tx_req_id, "withdraw amount is zero"));
        }
        check_collateral(ctx, &a.collateral)?;
        check_free(existing(scratch, &a.custodian)?, &a.collateral, a.amount)
    };
    let reason = split_fatal(check())?.err();
    let content = WithdrawContent {
        custodian: a.custodian.clone(),
        collateral: a.collateral.clone(),
        amount: a.amount,
        tx_req_id: action.tx_req_id.clone(),
        reason,
    };
    Ok(Instruction::new(
        Some(action.shard_id),
        status_of(&content.reason),
        PortalInstruction::CustodianWithdraw(content),
    ))
}

pub fn apply_withdraw(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    status: InstructionStatus,
    c: &WithdrawContent,
) -> PortalResult<()> {
    if !action_rejected(status, &c.reason)? {
        debit_free_collateral(custodian_mut(scratch, &c.custodian)?, &c.collateral, c.amount)?;
    }
    record_status(scratch, ctx, RequestKind::Withdraw, &c.tx_req_id, status, c)?;
    Ok(())
}

// ── Custodian top-up ──────────────────────────────────────────

/// Moves free collateral into the locks backing an asset the custodian
/// already holds, raising its collateral ratio.
pub fn build_custodian_topup(
    scratch: &ScratchState<'_>,
    ctx: &ExecutionContext,
    action: &PortalAction,
    a: &CustodianTopupAction,
) -> PortalResult<Instruction> {
    let check = || -> PortalResult<()> {
        if a.amount == 0 {
            return Err(invalid(&action.tx_req_id, "top-up amount is zero"));
        }
        if !ctx.params.is_portal_token(&a.token_id) {
            return Err(PortalError::UnsupportedAsset {
                asset: a.token_id.clone(),
            });
        }
        check_collateral(ctx, &a.collateral)?;
        let custodian = existing(scratch, &a.custodian)?;
        let exposure = RequestExposure::of(scratch, &a.custodian, &a.token_id);
        if exposure.total_holding(custodian, &a.token_id) == 0
            && custodian.locked_for_token(&a.token_id).is_empty()
        {
            return Err(invalid(&action.tx_req_id, "custodian backs nothing in this asset"));
        }
        check_free(custodian, &a.collateral, a.amount)
    };
    let reason = split_fatal(check())?.err();
    let content = CustodianTopupContent {
        custodian: a.custodian.clone(),
        token_id: a.token_id.clone(),
        collateral: a.collateral.clone(),
        amount: a.amount,
        tx_req_id: action.tx_req_id.clone(),
        reason,
    };
    Ok(Instruction::new(
        Some(action.shard_id),
        status_of(&content.reason),
        PortalInstruction::CustodianTopup(content),
    ))
}

pub fn apply_custodian_topup(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    status: InstructionStatus,
    c: &CustodianTopupContent,
) -> PortalResult<()> {
    if !action_rejected(status, &c.reason)? {
        lock(custodian_mut(scratch, &c.custodian)?, &c.token_id, &c.collateral, c.amount)?;
    }
    record_status(scratch, ctx, RequestKind::Topup, &c.tx_req_id, status, c)?;
    Ok(())
}

// ── Waiting-porting top-up ────────────────────────────────────

pub fn build_porting_topup(
    scratch: &ScratchState<'_>,
    ctx: &ExecutionContext,
    action: &PortalAction,
    a: &PortingTopupAction,
) -> PortalResult<Instruction> {
    let check = || -> PortalResult<()> {
        if a.amount == 0 {
            return Err(invalid(&action.tx_req_id, "top-up amount is zero"));
        }
        check_collateral(ctx, &a.collateral)?;
        let porting = scratch
            .waiting_portings
            .get(&a.porting_id)
            .ok_or_else(|| PortalError::RequestNotFound {
                id: a.porting_id.clone(),
            })?;
        if !porting.custodians.iter().any(|d| d.custodian == a.custodian) {
            return Err(invalid(&a.porting_id, "custodian is not matched to this porting"));
        }
        check_free(existing(scratch, &a.custodian)?, &a.collateral, a.amount)
    };
    let reason = split_fatal(check())?.err();
    let content = PortingTopupContent {
        porting_id: a.porting_id.clone(),
        custodian: a.custodian.clone(),
        collateral: a.collateral.clone(),
        amount: a.amount,
        tx_req_id: action.tx_req_id.clone(),
        reason,
    };
    Ok(Instruction::new(
        Some(action.shard_id),
        status_of(&content.reason),
        PortalInstruction::PortingTopup(content),
    ))
}

pub fn apply_porting_topup(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    status: InstructionStatus,
    c: &PortingTopupContent,
) -> PortalResult<()> {
    if !action_rejected(status, &c.reason)? {
        let porting = scratch
            .waiting_portings
            .get_mut(&c.porting_id)
            .ok_or_else(|| PortalError::Inconsistent(format!("porting {} missing", c.porting_id)))?;
        let token = porting.token_id.clone();
        let detail = porting
            .custodians
            .iter_mut()
            .find(|d| d.custodian == c.custodian)
            .ok_or_else(|| {
                PortalError::Inconsistent(format!("{} not matched to {}", c.custodian, c.porting_id))
            })?;
        *detail.locked_collaterals.entry(c.collateral.clone()).or_default() += c.amount;
        lock(custodian_mut(scratch, &c.custodian)?, &token, &c.collateral, c.amount)?;
    }
    record_status(scratch, ctx, RequestKind::PortingTopup, &c.tx_req_id, status, c)?;
    Ok(())
}
