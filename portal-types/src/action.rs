use crate::instruction::InstructionKind;
use crate::params::ExternalChain;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CustodianDepositAction {
    pub custodian: String,
    pub collateral: String,
    pub amount: u64,
    pub remote_addresses: BTreeMap<String, String>,
    /// Proof of payment to the collateral vault; required for token collateral.
    pub proof: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CustodianWithdrawAction {
    pub custodian: String,
    pub collateral: String,
    pub amount: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortingRequestAction {
    pub porting_id: String,
    pub token_id: String,
    pub porter: String,
    pub amount: u64,
    pub porting_fee: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortingProofAction {
    pub porting_id: String,
    pub token_id: String,
    pub porter: String,
    pub amount: u64,
    pub proof: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RedeemRequestAction {
    pub redeem_id: String,
    pub token_id: String,
    pub redeemer: String,
    pub redeemer_remote_address: String,
    pub amount: u64,
    pub redeem_fee: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RedeemMatchingAction {
    pub redeem_id: String,
    pub custodian: String,
    /// Upper bound the custodian offers to cover; `None` covers as much as it can.
    pub amount: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RedeemProofAction {
    pub redeem_id: String,
    pub token_id: String,
    pub custodian: String,
    pub proof: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRatesAction {
    pub feeder: String,
    pub rates: BTreeMap<String, u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CustodianTopupAction {
    pub custodian: String,
    pub token_id: String,
    pub collateral: String,
    pub amount: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortingTopupAction {
    pub porting_id: String,
    pub custodian: String,
    pub collateral: String,
    pub amount: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PoolRedeemAction {
    pub redeemer: String,
    pub token_id: String,
    pub amount: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WithdrawRewardAction {
    pub custodian: String,
    pub asset: String,
}

/// Request metadata a shard forwards to the beacon.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ActionRequest {
    CustodianDeposit(CustodianDepositAction),
    CustodianWithdraw(CustodianWithdrawAction),
    PortingRequest(PortingRequestAction),
    PortingProof(PortingProofAction),
    RedeemRequest(RedeemRequestAction),
    RedeemMatching(RedeemMatchingAction),
    RedeemProof(RedeemProofAction),
    ExchangeRates(ExchangeRatesAction),
    CustodianTopup(CustodianTopupAction),
    PortingTopup(PortingTopupAction),
    PoolRedeem(PoolRedeemAction),
    WithdrawReward(WithdrawRewardAction),
}

impl ActionRequest {
    pub fn kind(&self) -> InstructionKind {
        match self {
            ActionRequest::CustodianDeposit(_) => InstructionKind::CustodianDeposit,
            ActionRequest::CustodianWithdraw(_) => InstructionKind::CustodianWithdraw,
            ActionRequest::PortingRequest(_) => InstructionKind::PortingRequest,
            ActionRequest::PortingProof(_) => InstructionKind::PortingProof,
            ActionRequest::RedeemRequest(_) => InstructionKind::RedeemRequest,
            ActionRequest::RedeemMatching(_) => InstructionKind::RedeemMatching,
            ActionRequest::RedeemProof(_) => InstructionKind::RedeemProof,
            ActionRequest::ExchangeRates(_) => InstructionKind::ExchangeRates,
            ActionRequest::CustodianTopup(_) => InstructionKind::CustodianTopup,
            ActionRequest::PortingTopup(_) => InstructionKind::PortingTopup,
            ActionRequest::PoolRedeem(_) => InstructionKind::PoolRedeem,
            ActionRequest::WithdrawReward(_) => InstructionKind::WithdrawReward,
        }
    }

    /// External proof bytes the producer must verify before deciding.
    pub fn proof(&self) -> Option<&[u8]> {
        match self {
            ActionRequest::CustodianDeposit(a) => a.proof.as_deref(),
            ActionRequest::PortingProof(a) => Some(&a.proof),
            ActionRequest::RedeemProof(a) => Some(&a.proof),
            _ => None,
        }
    }
}

/// A shard-originated action waiting for the beacon producer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortalAction {
    pub tx_req_id: String,
    pub shard_id: u8,
    pub shard_height: u64,
    pub request: ActionRequest,
}

impl PortalAction {
    pub fn kind(&self) -> InstructionKind {
        self.request.kind()
    }

    pub fn id(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.tx_req_id.as_bytes());
        hasher.update(&[self.shard_id]);
        hasher.update(&self.shard_height.to_le_bytes());
        if let Ok(bytes) = bincode::serialize(&self.request) {
            hasher.update(&bytes);
        }
        *hasher.finalize().as_bytes()
    }
}

/// Replay-protection key of an external transaction. Depends only on the
/// chain and the transaction id, never on how a proof of it was encoded.
pub fn external_tx_hash(chain: ExternalChain, tx_id: &str) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(format!("{chain:?}").as_bytes());
    hasher.update(&[0]);
    hasher.update(tx_id.trim().to_ascii_lowercase().as_bytes());
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_tx_hash_is_per_chain_and_tx() {
        let tx = external_tx_hash(ExternalChain::Btc, "AB01");
        assert_eq!(tx, external_tx_hash(ExternalChain::Btc, " ab01 "));
        assert_ne!(tx, external_tx_hash(ExternalChain::Bnb, "ab01"));
        assert_ne!(tx, external_tx_hash(ExternalChain::Btc, "ab02"));
    }
}
