//! Feeder price submissions, settled into final rates at end of block.

use crate::accounting::{action_rejected, invalid, split_fatal, status_of};
use crate::ExecutionContext;
use portal_oracles::aggregate_final_rates;
use portal_types::action::{ExchangeRatesAction, PortalAction};
use portal_types::error::{PortalError, PortalResult};
use portal_types::instruction::{ExchangeRatesContent, Instruction, InstructionStatus, PortalInstruction};
use portal_types::scratch::ScratchState;
use portal_types::state::ExchangeRatesSubmission;
use tracing::debug;

pub fn build_exchange_rates(
    ctx: &ExecutionContext,
    action: &PortalAction,
    a: &ExchangeRatesAction,
) -> PortalResult<Instruction> {
    let check = || -> PortalResult<()> {
        if !ctx.params.is_feeder(&a.feeder) {
            return Err(PortalError::UnauthorizedFeeder {
                feeder: a.feeder.clone(),
            });
        }
        if a.rates.is_empty() {
            return Err(invalid(&action.tx_req_id, "no rates submitted"));
        }
        for (asset, price) in &a.rates {
            if !ctx.params.is_portal_token(asset) && !ctx.params.is_collateral(asset) {
                return Err(PortalError::UnsupportedAsset { asset: asset.clone() });
            }
            if *price == 0 {
                return Err(invalid(&action.tx_req_id, "zero price"));
            }
        }
        Ok(())
    };
    let reason = split_fatal(check())?.err();
    let content = ExchangeRatesContent {
        feeder: a.feeder.clone(),
        rates: a.rates.clone(),
        tx_req_id: action.tx_req_id.clone(),
        reason,
    };
    Ok(Instruction::new(
        Some(action.shard_id),
        status_of(&content.reason),
        PortalInstruction::ExchangeRates(content),
    ))
}

/// A feeder's later submission in the same block replaces its earlier one.
pub fn apply_exchange_rates(
    scratch: &mut ScratchState<'_>,
    ctx: &ExecutionContext,
    status: InstructionStatus,
    c: &ExchangeRatesContent,
) -> PortalResult<()> {
    if action_rejected(status, &c.reason)? {
        return Ok(());
    }
    scratch.pending_exchange_rates.insert(
        c.feeder.clone(),
        ExchangeRatesSubmission {
            feeder: c.feeder.clone(),
            rates: c.rates.clone(),
            beacon_height: ctx.height,
        },
    );
    Ok(())
}

/// Folds this block's submissions into the final rates and clears them.
pub fn finalize_exchange_rates(scratch: &mut ScratchState<'_>) {
    let submissions: Vec<ExchangeRatesSubmission> = scratch
        .pending_exchange_rates
        .values()
        .cloned()
        .collect();
    if submissions.is_empty() {
        return;
    }
    let next = aggregate_final_rates(scratch.rates(), &submissions);
    if next.as_ref() != scratch.rates() {
        debug!("Final exchange rates updated from {} feeders", submissions.len());
        *scratch.final_exchange_rates.to_mut() = next;
    }
    for feeder in scratch.pending_exchange_rates.keys() {
        scratch.pending_exchange_rates.remove(&feeder);
    }
}
