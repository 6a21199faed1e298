//! The Portal state machine: instruction building, replay and the ledger
//! rules both share.

pub mod accounting;
pub mod instructions;
pub mod processor;
pub mod producer;
pub mod verifier;

use portal_types::params::PortalParams;

pub use instructions::rewards::{custodian_reward_percent, epoch_reward_for, EpochReward};
pub use processor::{apply_instruction, finalize_block, BlockProcessor};
pub use producer::{BlockOutput, BlockProducer};
pub use verifier::{
    ExpectedTransfer, ProofVerdict, ProofVerifier, ReceiptVerifier, TransferReceipt, VerifierRegistry, VerifyError,
};

/// The beacon block being built or replayed.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub params: &'a PortalParams,
    pub height: u64,
    pub timestamp: u64,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(params: &'a PortalParams, height: u64, timestamp: u64) -> Self {
        Self { params, height, timestamp }
    }
}

#[cfg(test)]
mod tests;
