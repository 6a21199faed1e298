//! Ledger primitives shared by every flow.
//!
//! These run on the replay path, so a failed precondition here means the
//! instruction disagrees with the state it is applied to: always `Inconsistent`.

use crate::verifier::ProofVerdict;
use crate::ExecutionContext;
use portal_oracles::ExchangeRateTool;
use portal_types::custodian::CustodianRecord;
use portal_types::error::{PortalError, PortalResult};
use portal_types::instruction::InstructionStatus;
use portal_types::scratch::ScratchState;
use portal_types::state::{status_key, RequestKind, RequestStatus};
use serde::Serialize;
use std::collections::BTreeMap;

/// Separates soft rejections from fatal errors: fatal ones propagate, soft
/// ones come back as the inner `Err` for the caller to record.
pub fn split_fatal<T>(result: PortalResult<T>) -> PortalResult<Result<T, PortalError>> {
    match result {
        Ok(v) => Ok(Ok(v)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => Ok(Err(e)),
    }
}

pub fn status_of(reason: &Option<PortalError>) -> InstructionStatus {
    match reason {
        Some(_) => InstructionStatus::Rejected,
        None => InstructionStatus::Accepted,
    }
}

/// Whether an action instruction is a rejection. Errors when the status and
/// the carried reason disagree.
pub fn action_rejected(status: InstructionStatus, reason: &Option<PortalError>) -> PortalResult<bool> {
    match (status, reason.is_some()) {
        (InstructionStatus::Rejected, true) => Ok(true),
        (InstructionStatus::Accepted, false) => Ok(false),
        (status, has_reason) => Err(PortalError::Inconsistent(format!(
            "status {} with rejection reason present = {has_reason}",
            status.as_str()
        ))),
    }
}

pub fn expect_status(status: InstructionStatus, expected: InstructionStatus) -> PortalResult<()> {
    if status != expected {
        return Err(PortalError::Inconsistent(format!(
            "expected status {}, got {}",
            expected.as_str(),
            status.as_str()
        )));
    }
    Ok(())
}

pub fn invalid(id: &str, reason: &str) -> PortalError {
    PortalError::InvalidRequest {
        id: id.to_string(),
        reason: reason.to_string(),
    }
}

/// `DuplicateProof` when the external transaction behind a proof has
/// already settled a request.
pub fn reject_replayed(scratch: &ScratchState<'_>, id: &str, verdict: Option<&ProofVerdict>) -> PortalResult<()> {
    match verdict {
        Some(v) if scratch.is_proof_used(&v.external_tx) => Err(PortalError::DuplicateProof { id: id.to_string() }),
        _ => Ok(()),
    }
}

/// Replay protection plus the verifier's verdict for one proof.
pub fn check_proof(scratch: &ScratchState<'_>, id: &str, verdict: Option<&ProofVerdict>) -> PortalResult<()> {
    reject_replayed(scratch, id, verdict)?;
    let reason = match verdict {
        Some(v) if v.paid => return Ok(()),
        Some(_) => "verifier rejected the proof",
        None => "proof could not be verified against the block's starting state",
    };
    Err(PortalError::InvalidProof {
        id: id.to_string(),
        reason: reason.to_string(),
    })
}

/// Records the external transaction an accepted proof settled. Each one
/// settles at most once.
pub fn consume_external_tx(scratch: &mut ScratchState<'_>, id: &str, external_tx: Option<[u8; 32]>) -> PortalResult<()> {
    let tx = external_tx.ok_or_else(|| PortalError::Inconsistent(format!("{id} accepted without an external tx")))?;
    if scratch.is_proof_used(&tx) {
        return Err(PortalError::Inconsistent(format!(
            "{id} settles external tx {} a second time",
            hex::encode(&tx[..8])
        )));
    }
    scratch.mark_proof_used(tx);
    Ok(())
}

/// Soft `NoExchangeRate` unless every asset has a usable price.
pub fn require_prices(tool: &ExchangeRateTool<'_>, assets: &[&str]) -> PortalResult<()> {
    if assets.iter().all(|a| tool.has_price(a)) {
        Ok(())
    } else {
        Err(PortalError::NoExchangeRate)
    }
}

pub fn rate_tool<'s>(scratch: &'s ScratchState<'_>) -> PortalResult<ExchangeRateTool<'s>> {
    scratch
        .rates()
        .map(ExchangeRateTool::new)
        .ok_or(PortalError::NoExchangeRate)
}

pub fn custodian_mut<'s>(
    scratch: &'s mut ScratchState<'_>,
    address: &str,
) -> PortalResult<&'s mut CustodianRecord> {
    scratch
        .custodians
        .get_mut(&address.to_string())
        .ok_or_else(|| PortalError::Inconsistent(format!("custodian {address} missing")))
}

fn sub(value: &mut u64, amount: u64, what: &str) -> PortalResult<()> {
    *value = value
        .checked_sub(amount)
        .ok_or_else(|| PortalError::Inconsistent(format!("{what} underflow by {amount}")))?;
    Ok(())
}

fn add(value: &mut u64, amount: u64, what: &str) -> PortalResult<()> {
    *value = value
        .checked_add(amount)
        .ok_or_else(|| PortalError::Overflow { context: what.to_string() })?;
    Ok(())
}

pub fn credit_collateral(c: &mut CustodianRecord, kind: &str, amount: u64) -> PortalResult<()> {
    let balance = c.collaterals.entry(kind.to_string()).or_default();
    add(&mut balance.total, amount, "collateral total")?;
    add(&mut balance.free, amount, "collateral free")
}

pub fn debit_free_collateral(c: &mut CustodianRecord, kind: &str, amount: u64) -> PortalResult<()> {
    let balance = c.collaterals.entry(kind.to_string()).or_default();
    sub(&mut balance.free, amount, "free collateral")?;
    sub(&mut balance.total, amount, "collateral total")
}

/// free -> locked[token][kind]
pub fn lock(c: &mut CustodianRecord, token: &str, kind: &str, amount: u64) -> PortalResult<()> {
    if amount == 0 {
        return Ok(());
    }
    let balance = c.collaterals.entry(kind.to_string()).or_default();
    sub(&mut balance.free, amount, "free collateral")?;
    let locked = c
        .locked_collaterals
        .entry(token.to_string())
        .or_default()
        .entry(kind.to_string())
        .or_default();
    add(locked, amount, "locked collateral")
}

fn take_locked(c: &mut CustodianRecord, token: &str, kind: &str, amount: u64) -> PortalResult<()> {
    let locks = c
        .locked_collaterals
        .get_mut(token)
        .ok_or_else(|| PortalError::Inconsistent(format!("{} has no {token} locks", c.address)))?;
    let locked = locks.entry(kind.to_string()).or_default();
    sub(locked, amount, "locked collateral")?;
    if *locked == 0 {
        locks.remove(kind);
    }
    if locks.is_empty() {
        c.locked_collaterals.remove(token);
    }
    Ok(())
}

/// locked[token][kind] -> free
pub fn unlock(c: &mut CustodianRecord, token: &str, kind: &str, amount: u64) -> PortalResult<()> {
    if amount == 0 {
        return Ok(());
    }
    take_locked(c, token, kind, amount)?;
    let balance = c.collaterals.entry(kind.to_string()).or_default();
    add(&mut balance.free, amount, "free collateral")
}

/// locked[token][kind] leaves the custodian entirely.
pub fn seize_locked(c: &mut CustodianRecord, token: &str, kind: &str, amount: u64) -> PortalResult<()> {
    if amount == 0 {
        return Ok(());
    }
    take_locked(c, token, kind, amount)?;
    let balance = c.collaterals.entry(kind.to_string()).or_default();
    sub(&mut balance.total, amount, "collateral total")
}

pub fn add_holding(c: &mut CustodianRecord, token: &str, amount: u64) -> PortalResult<()> {
    add(
        c.holding_public_tokens.entry(token.to_string()).or_default(),
        amount,
        "holding public tokens",
    )
}

pub fn sub_holding(c: &mut CustodianRecord, token: &str, amount: u64) -> PortalResult<()> {
    let holding = c.holding_public_tokens.entry(token.to_string()).or_default();
    sub(holding, amount, "holding public tokens")?;
    if *holding == 0 {
        c.holding_public_tokens.remove(token);
    }
    Ok(())
}

/// What open requests tie up per (custodian, token): holdings reserved by
/// redeems and collateral locked inside waiting portings.
#[derive(Debug, Default)]
pub struct RequestExposure {
    reserved: BTreeMap<(String, String), u64>,
    in_portings: BTreeMap<(String, String), BTreeMap<String, u64>>,
}

impl RequestExposure {
    /// One pass over every open request.
    pub fn scan(scratch: &ScratchState<'_>) -> Self {
        Self::collect(scratch, |_, _| true)
    }

    /// Only the entries of one custodian's `token` position.
    pub fn of(scratch: &ScratchState<'_>, custodian: &str, token: &str) -> Self {
        Self::collect(scratch, |c, t| c == custodian && t == token)
    }

    fn collect(scratch: &ScratchState<'_>, wanted: impl Fn(&str, &str) -> bool) -> Self {
        let mut out = Self::default();
        for req in scratch.waiting_redeems.values().chain(scratch.matched_redeems.values()) {
            for m in req.custodians.iter().filter(|m| wanted(&m.custodian, &req.token_id)) {
                *out.reserved
                    .entry((m.custodian.clone(), req.token_id.clone()))
                    .or_default() += m.amount;
            }
        }
        for porting in scratch.waiting_portings.values() {
            for detail in porting.custodians.iter().filter(|d| wanted(&d.custodian, &porting.token_id)) {
                let locks = out
                    .in_portings
                    .entry((detail.custodian.clone(), porting.token_id.clone()))
                    .or_default();
                for (kind, amount) in &detail.locked_collaterals {
                    *locks.entry(kind.clone()).or_default() += amount;
                }
            }
        }
        out
    }

    fn key(custodian: &str, token: &str) -> (String, String) {
        (custodian.to_string(), token.to_string())
    }

    /// Holding plus amounts already reserved for this custodian in redeem requests.
    pub fn total_holding(&self, custodian: &CustodianRecord, token: &str) -> u64 {
        let reserved = self
            .reserved
            .get(&Self::key(&custodian.address, token))
            .copied()
            .unwrap_or(0);
        custodian.holding(token) + reserved
    }

    /// Locked collateral per kind that backs public tokens already minted.
    /// Collateral inside waiting portings backs nothing yet.
    pub fn backing_collateral(&self, custodian: &CustodianRecord, token: &str) -> PortalResult<BTreeMap<String, u64>> {
        let in_portings = self.in_portings.get(&Self::key(&custodian.address, token));
        let mut out = BTreeMap::new();
        for (kind, locked) in custodian.locked_for_token(token) {
            let pending = in_portings.and_then(|p| p.get(&kind)).copied().unwrap_or(0);
            let backing = locked.checked_sub(pending).ok_or_else(|| {
                PortalError::Inconsistent(format!(
                    "{} locks {locked} {kind} for {token} but waiting portings hold {pending}",
                    custodian.address
                ))
            })?;
            if backing > 0 {
                out.insert(kind, backing);
            }
        }
        Ok(out)
    }

    /// Collateral released when `amount` public tokens held by the custodian
    /// are paid out: the same share of the backing as `amount` is of the holding.
    pub fn proportional_unlock(
        &self,
        custodian: &CustodianRecord,
        token: &str,
        amount: u64,
    ) -> PortalResult<BTreeMap<String, u64>> {
        let holding = self.total_holding(custodian, token);
        if holding == 0 {
            return Err(PortalError::Inconsistent(format!(
                "{} holds no {token} to release collateral for",
                custodian.address
            )));
        }
        let mut out = BTreeMap::new();
        for (kind, backing) in self.backing_collateral(custodian, token)? {
            let share = portal_oracles::mul_div(backing, amount.min(holding), holding)?;
            if share > 0 {
                out.insert(kind, share);
            }
        }
        Ok(out)
    }
}

pub fn record_status<T: Serialize>(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    kind: RequestKind,
    id: &str,
    status: InstructionStatus,
    detail: &T,
) -> PortalResult<()> {
    let detail = serde_json::to_string(detail)
        .map_err(|e| PortalError::Encode(format!("status detail of {id}: {e}")))?;
    scratch.request_history.insert(
        status_key(kind, id),
        RequestStatus {
            kind,
            status,
            beacon_height: ctx.height,
            detail,
        },
    );
    Ok(())
}

/// Like `record_status` but never overwrites an existing record, so a
/// rejected duplicate cannot clobber the original request's status.
pub fn record_status_if_absent<T: Serialize>(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    kind: RequestKind,
    id: &str,
    status: InstructionStatus,
    detail: &T,
) -> PortalResult<()> {
    if scratch.request_history.contains_key(&status_key(kind, id)) {
        return Ok(());
    }
    record_status(scratch, ctx, kind, id, status, detail)
}

pub fn history_contains(scratch: &ScratchState<'_>, kind: RequestKind, id: &str) -> bool {
    scratch.request_history.contains_key(&status_key(kind, id))
}

/// Minimum fee for moving `amount` of `token`: basis points of its native
/// value, rounded half up, floored at `min_portal_fee`.
pub fn min_fee(
    tool: &ExchangeRateTool<'_>,
    ctx: &ExecutionContext,
    token: &str,
    amount: u64,
    fee_bps: u64,
) -> PortalResult<u64> {
    let native_value = tool.convert(token, &ctx.params.native_collateral, amount)?;
    let fee = (native_value as u128 * fee_bps as u128 + 5_000) / 10_000;
    let fee = u64::try_from(fee).map_err(|_| PortalError::Overflow { context: "min fee".into() })?;
    Ok(fee.max(ctx.params.min_portal_fee))
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_types::custodian::CollateralBalance;

    fn custodian() -> CustodianRecord {
        let mut c = CustodianRecord::new("cust");
        c.collaterals.insert("native".into(), CollateralBalance { total: 1_000, free: 1_000 });
        c
    }

    #[test]
    fn lock_unlock_seize_conserve() {
        let mut c = custodian();
        lock(&mut c, "BTC", "native", 600).unwrap();
        assert!(c.is_conserved());
        unlock(&mut c, "BTC", "native", 100).unwrap();
        seize_locked(&mut c, "BTC", "native", 200).unwrap();
        assert!(c.is_conserved());
        assert_eq!(c.balance("native"), CollateralBalance { total: 800, free: 500 });
        assert_eq!(c.locked("BTC", "native"), 300);
    }

    #[test]
    fn over_unlock_is_inconsistent() {
        let mut c = custodian();
        lock(&mut c, "BTC", "native", 10).unwrap();
        let err = unlock(&mut c, "BTC", "native", 11).unwrap_err();
        assert!(matches!(err, PortalError::Inconsistent(_)));
        assert!(lock(&mut c, "BTC", "native", 5_000).is_err());
    }

    #[test]
    fn emptied_locks_are_pruned() {
        let mut c = custodian();
        lock(&mut c, "BTC", "native", 10).unwrap();
        unlock(&mut c, "BTC", "native", 10).unwrap();
        assert!(c.locked_collaterals.is_empty());
    }

    #[test]
    fn split_fatal_keeps_soft_errors() {
        let soft: PortalResult<()> = Err(PortalError::NoExchangeRate);
        assert!(matches!(split_fatal(soft), Ok(Err(PortalError::NoExchangeRate))));
        let fatal: PortalResult<()> = Err(PortalError::Decode("x".into()));
        assert!(split_fatal(fatal).is_err());
    }

    #[test]
    fn unencodable_status_detail_is_an_error() {
        let state = portal_types::state::PortalState::default();
        let params = portal_types::params::PortalParams::default();
        let ctx = ExecutionContext::new(&params, 1, 40);
        let mut scratch = ScratchState::new(&state);
        // JSON object keys must be strings.
        let detail = BTreeMap::from([((1u8, 2u8), 3u64)]);
        let err = record_status(&mut scratch, &ctx, RequestKind::Porting, "port-1", InstructionStatus::Accepted, &detail)
            .unwrap_err();
        assert!(matches!(err, PortalError::Encode(_)));
        assert!(err.is_fatal());
        assert!(!history_contains(&scratch, RequestKind::Porting, "port-1"));

        record_status(&mut scratch, &ctx, RequestKind::Porting, "port-1", InstructionStatus::Accepted, &"ok").unwrap();
        assert!(history_contains(&scratch, RequestKind::Porting, "port-1"));
    }
}
