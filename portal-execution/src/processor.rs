//! Replays a block's instructions onto the Portal state.
//!
//! Instructions carry every decision the producer made, so replay never
//! consults the verifiers or re-runs matching. It only checks that each
//! instruction still fits the state and applies it.

use crate::instructions::{ledger, liquidation, porting, rates, redeem, rewards};
use crate::ExecutionContext;
use portal_types::error::PortalResult;
use portal_types::instruction::{Instruction, PortalInstruction};
use portal_types::scratch::{ScratchState, StateDiff};
use portal_types::state::PortalState;
use tracing::{error, info};

pub fn apply_instruction(scratch: &mut ScratchState<'_>, ctx: &ExecutionContext, inst: &Instruction) -> PortalResult<()> {
    let status = inst.status;
    match &inst.body {
        PortalInstruction::CustodianDeposit(c) => ledger::apply_deposit(scratch, ctx, status, c),
        PortalInstruction::CustodianWithdraw(c) => ledger::apply_withdraw(scratch, ctx, status, c),
        PortalInstruction::CustodianTopup(c) => ledger::apply_custodian_topup(scratch, ctx, status, c),
        PortalInstruction::PortingTopup(c) => ledger::apply_porting_topup(scratch, ctx, status, c),
        PortalInstruction::PortingRequest(c) => {
            porting::apply_porting_request(scratch, ctx, inst.shard_id, status, c)
        }
        PortalInstruction::PortingProof(c) => porting::apply_porting_proof(scratch, ctx, status, c),
        PortalInstruction::ExpiredWaitingPorting(c) => porting::apply_expired_porting(scratch, ctx, status, c),
        PortalInstruction::RedeemRequest(c) => {
            redeem::apply_redeem_request(scratch, ctx, inst.shard_id, status, c)
        }
        PortalInstruction::RedeemMatching(c) => redeem::apply_redeem_matching(scratch, ctx, status, c),
        PortalInstruction::RedeemProof(c) => redeem::apply_redeem_proof(scratch, ctx, status, c),
        PortalInstruction::PickMoreCustodians(c) => redeem::apply_pick_more_custodians(scratch, ctx, status, c),
        PortalInstruction::LiquidateRunAway(c) => {
            liquidation::apply_run_away_liquidation(scratch, ctx, status, c)
        }
        PortalInstruction::LiquidateByRates(c) => liquidation::apply_rates_liquidation(scratch, ctx, status, c),
        PortalInstruction::PoolRedeem(c) => liquidation::apply_pool_redeem(scratch, ctx, status, c),
        PortalInstruction::ExchangeRates(c) => rates::apply_exchange_rates(scratch, ctx, status, c),
        PortalInstruction::CustodianReward(c) => rewards::apply_custodian_rewards(scratch, ctx, status, c),
        PortalInstruction::WithdrawReward(c) => rewards::apply_withdraw_reward(scratch, ctx, status, c),
    }
}

/// End-of-block bookkeeping, after every instruction: close the epoch if
/// due, accumulate locked collateral, then settle feeder prices.
pub fn finalize_block(scratch: &mut ScratchState<'_>, ctx: &ExecutionContext) -> PortalResult<()> {
    rewards::reset_epoch_snapshot(scratch, ctx);
    rewards::accumulate_locked_for_rewards(scratch)?;
    rates::finalize_exchange_rates(scratch);
    Ok(())
}

pub struct BlockProcessor;

impl BlockProcessor {
    /// Diff of applying `instructions` and end-of-block bookkeeping to `state`.
    /// Nothing is committed; any error leaves the caller's state untouched.
    pub fn diff(state: &PortalState, ctx: &ExecutionContext, instructions: &[Instruction]) -> PortalResult<StateDiff> {
        let mut scratch = ScratchState::new(state);
        for (i, inst) in instructions.iter().enumerate() {
            if let Err(e) = apply_instruction(&mut scratch, ctx, inst) {
                error!(
                    "Instruction {} ({:?}) failed at height {}: {}",
                    i,
                    inst.kind(),
                    ctx.height,
                    e
                );
                return Err(e);
            }
            scratch.seal();
        }
        finalize_block(&mut scratch, ctx)?;
        Ok(scratch.into_diff())
    }

    /// Applies a whole block atomically and returns what changed.
    pub fn process(state: &mut PortalState, ctx: &ExecutionContext, instructions: &[Instruction]) -> PortalResult<StateDiff> {
        let diff = Self::diff(state, ctx, instructions)?;
        state.apply_diff(diff.clone());
        info!(
            "Processed {} portal instructions at height {}",
            instructions.len(),
            ctx.height
        );
        Ok(diff)
    }

    /// Decodes wire-format instructions first; a malformed one fails the block.
    pub fn process_wire(state: &mut PortalState, ctx: &ExecutionContext, wire: &[Vec<String>]) -> PortalResult<StateDiff> {
        let instructions = wire
            .iter()
            .map(|parts| Instruction::from_wire(parts))
            .collect::<PortalResult<Vec<_>>>()?;
        Self::process(state, ctx, &instructions)
    }
}
