//! Turns a block's shard actions into Portal instructions.
//!
//! Every instruction is applied to a scratch copy of the state as soon as it
//! is built, so later decisions in the same block see earlier ones and the
//! processor replays exactly what the producer saw.

use crate::accounting::RequestExposure;
use crate::instructions::rewards::{self, EpochReward, FeeShare};
use crate::instructions::{ledger, liquidation, porting, rates, redeem};
use crate::processor::apply_instruction;
use crate::verifier::{expected_transfers, proof_chain, ProofVerdict, VerifierRegistry};
use crate::ExecutionContext;
use portal_types::action::{ActionRequest, PortalAction};
use portal_types::error::{PortalError, PortalResult};
use portal_types::instruction::{Instruction, PortalInstruction};
use portal_types::scratch::ScratchState;
use portal_types::state::PortalState;
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

#[derive(Debug, Default)]
pub struct BlockOutput {
    pub instructions: Vec<Instruction>,
    /// Actions dropped on a fatal error, by `tx_req_id`. They produce no
    /// instruction and are reported to the host.
    pub failures: Vec<(String, PortalError)>,
}

/// Fees of requests that became active in the block being built.
#[derive(Default)]
struct BlockJournal {
    fees: Vec<FeeShare>,
}

impl BlockJournal {
    fn observe(&mut self, scratch: &ScratchState<'_>, inst: &Instruction) {
        if inst.is_rejected() {
            return;
        }
        match &inst.body {
            PortalInstruction::PortingRequest(c) => self.fees.push(FeeShare {
                fee: c.porting_fee,
                shares: c.custodians.iter().map(|d| (d.custodian.clone(), d.amount)).collect(),
            }),
            PortalInstruction::RedeemMatching(c) => self.observe_matched(scratch, &c.redeem_id),
            PortalInstruction::PickMoreCustodians(c) => self.observe_matched(scratch, &c.redeem_id),
            _ => {}
        }
    }

    fn observe_matched(&mut self, scratch: &ScratchState<'_>, redeem_id: &str) {
        if let Some(req) = scratch.matched_redeems.get(&redeem_id.to_string()) {
            self.fees.push(FeeShare {
                fee: req.redeem_fee,
                shares: req.custodians.iter().map(|m| (m.custodian.clone(), m.amount)).collect(),
            });
        }
    }
}

pub struct BlockProducer<'v> {
    verifiers: &'v VerifierRegistry,
}

impl<'v> BlockProducer<'v> {
    pub fn new(verifiers: &'v VerifierRegistry) -> Self {
        Self { verifiers }
    }

    /// Builds the instructions for one beacon block: automatic expiries and
    /// liquidations, then actions grouped by kind in tag order (shard, then
    /// arrival, within a kind), forced redeem matching, and rewards.
    pub fn produce(
        &self,
        state: &PortalState,
        ctx: &ExecutionContext,
        actions: &[PortalAction],
        epoch: Option<&EpochReward>,
    ) -> PortalResult<BlockOutput> {
        let verdicts = self.verify_proofs(state, ctx, actions);
        let mut scratch = ScratchState::new(state);
        let mut out = BlockOutput::default();
        let mut journal = BlockJournal::default();

        for porting_id in scratch.waiting_portings.keys() {
            if let Some(inst) = porting::build_expired_porting(&scratch, ctx, &porting_id)? {
                Self::emit(&mut scratch, ctx, inst, &mut out, &mut journal)?;
            }
        }
        for redeem_id in scratch.matched_redeems.keys() {
            let custodians: Vec<String> = scratch
                .matched_redeems
                .get(&redeem_id)
                .map(|r| r.custodians.iter().map(|m| m.custodian.clone()).collect())
                .unwrap_or_default();
            for custodian in custodians {
                if let Some(inst) = liquidation::build_run_away_liquidation(&scratch, ctx, &redeem_id, &custodian)? {
                    Self::emit(&mut scratch, ctx, inst, &mut out, &mut journal)?;
                }
            }
        }
        let exposure = RequestExposure::scan(&scratch);
        for custodian in scratch.custodians.keys() {
            let tokens: Vec<String> = scratch
                .custodians
                .get(&custodian)
                .map(|c| c.holding_public_tokens.keys().cloned().collect())
                .unwrap_or_default();
            for token in tokens {
                if let Some(inst) = liquidation::build_rates_liquidation(&scratch, ctx, &exposure, &custodian, &token)? {
                    Self::emit(&mut scratch, ctx, inst, &mut out, &mut journal)?;
                }
            }
        }

        let mut ordered: Vec<(usize, &PortalAction)> = actions.iter().enumerate().collect();
        ordered.sort_by_key(|(i, a)| (a.kind(), a.shard_id, *i));
        for (i, action) in ordered {
            let verdict = verdicts.get(&i).copied();
            let built = Self::build_action(&scratch, ctx, action, verdict);
            let result = built.and_then(|inst| Self::emit(&mut scratch, ctx, inst, &mut out, &mut journal));
            if let Err(e) = result {
                error!("Dropping action {} ({:?}): {}", action.tx_req_id, action.kind(), e);
                out.failures.push((action.tx_req_id.clone(), e));
            }
        }

        for redeem_id in scratch.waiting_redeems.keys() {
            if let Some(inst) = redeem::build_pick_more_custodians(&scratch, ctx, &redeem_id)? {
                Self::emit(&mut scratch, ctx, inst, &mut out, &mut journal)?;
            }
        }
        if let Some(inst) = rewards::build_custodian_rewards(&scratch, ctx, &journal.fees, epoch)? {
            Self::emit(&mut scratch, ctx, inst, &mut out, &mut journal)?;
        }

        debug!(
            "Produced {} portal instructions from {} actions at height {}",
            out.instructions.len(),
            actions.len(),
            ctx.height
        );
        Ok(out)
    }

    fn build_action(
        scratch: &ScratchState<'_>,
        ctx: &ExecutionContext,
        action: &PortalAction,
        verdict: Option<ProofVerdict>,
    ) -> PortalResult<Instruction> {
        match &action.request {
            ActionRequest::CustodianDeposit(a) => ledger::build_deposit(scratch, ctx, action, a, verdict),
            ActionRequest::CustodianWithdraw(a) => ledger::build_withdraw(scratch, ctx, action, a),
            ActionRequest::CustodianTopup(a) => ledger::build_custodian_topup(scratch, ctx, action, a),
            ActionRequest::PortingTopup(a) => ledger::build_porting_topup(scratch, ctx, action, a),
            ActionRequest::PortingRequest(a) => porting::build_porting_request(scratch, ctx, action, a),
            ActionRequest::PortingProof(a) => porting::build_porting_proof(scratch, action, a, verdict),
            ActionRequest::RedeemRequest(a) => redeem::build_redeem_request(scratch, ctx, action, a),
            ActionRequest::RedeemMatching(a) => redeem::build_redeem_matching(scratch, action, a),
            ActionRequest::RedeemProof(a) => redeem::build_redeem_proof(scratch, action, a, verdict),
            ActionRequest::ExchangeRates(a) => rates::build_exchange_rates(ctx, action, a),
            ActionRequest::PoolRedeem(a) => liquidation::build_pool_redeem(scratch, ctx, action, a),
            ActionRequest::WithdrawReward(a) => rewards::build_withdraw_reward(scratch, action, a),
        }
    }

    fn emit(
        scratch: &mut ScratchState<'_>,
        ctx: &ExecutionContext,
        inst: Instruction,
        out: &mut BlockOutput,
        journal: &mut BlockJournal,
    ) -> PortalResult<()> {
        let checkpoint = scratch.checkpoint();
        if let Err(e) = apply_instruction(scratch, ctx, &inst) {
            scratch.rollback(checkpoint);
            return Err(e);
        }
        scratch.seal();
        journal.observe(scratch, &inst);
        out.instructions.push(inst);
        Ok(())
    }

    /// Verdicts for every proof-carrying action whose chain has a verifier,
    /// keyed by action index. Runs in parallel against the starting state.
    /// A proof of a request unknown at that point still names its external
    /// transaction, so replays are caught, but never counts as paid.
    fn verify_proofs(
        &self,
        state: &PortalState,
        ctx: &ExecutionContext,
        actions: &[PortalAction],
    ) -> BTreeMap<usize, ProofVerdict> {
        let jobs: Vec<_> = actions
            .iter()
            .enumerate()
            .filter_map(|(i, action)| {
                let proof = action.request.proof()?;
                let chain = proof_chain(ctx.params, &action.request)?;
                let expected = expected_transfers(state, ctx.params, &action.request);
                Some((i, &action.tx_req_id, proof, chain, expected))
            })
            .collect();

        jobs.par_iter()
            .filter_map(|(i, tx, proof, chain, expected)| {
                let Some(verifier) = self.verifiers.get(*chain) else {
                    warn!("No {:?} verifier for {}", chain, tx);
                    return None;
                };
                let owed = expected.as_deref().unwrap_or_default();
                match verifier.verify_and_extract(proof, owed) {
                    Ok(verdict) => Some((
                        *i,
                        ProofVerdict {
                            paid: verdict.paid && expected.is_some(),
                            ..verdict
                        },
                    )),
                    Err(e) => {
                        warn!("Proof in {} failed verification: {}", tx, e);
                        None
                    }
                }
            })
            .collect()
    }
}
