//! External-chain proof verification.
//!
//! The state machine never parses chain data itself. Each external chain
//! gets a `ProofVerifier`; the producer asks it which external transaction a
//! proof attests and whether it carries the transfers an action claims. Only
//! that verdict enters the block.

use portal_types::action::{external_tx_hash, ActionRequest};
use portal_types::params::{ExternalChain, PortalParams};
use portal_types::state::PortalState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Malformed proof: {0}")]
    Malformed(String),
    #[error("Proof is for chain {got:?}, expected {expected:?}")]
    WrongChain { expected: ExternalChain, got: ExternalChain },
    #[error("Verifier unavailable: {0}")]
    Unavailable(String),
}

/// A transfer the proof must show on the external chain.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExpectedTransfer {
    pub receiver: String,
    pub amount: u64,
}

/// What a verifier read from a well-formed proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofVerdict {
    /// `external_tx_hash` of the attested transaction; the replay key.
    pub external_tx: [u8; 32],
    /// Every expected transfer is paid.
    pub paid: bool,
}

pub trait ProofVerifier: Send + Sync {
    /// Identifies the external transaction behind `proof` and checks it pays
    /// every expected transfer.
    fn verify_and_extract(&self, proof: &[u8], expected: &[ExpectedTransfer]) -> Result<ProofVerdict, VerifyError>;
}

#[derive(Default)]
pub struct VerifierRegistry {
    verifiers: BTreeMap<ExternalChain, Box<dyn ProofVerifier>>,
}

impl VerifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, chain: ExternalChain, verifier: Box<dyn ProofVerifier>) {
        self.verifiers.insert(chain, verifier);
    }

    pub fn get(&self, chain: ExternalChain) -> Option<&dyn ProofVerifier> {
        self.verifiers.get(&chain).map(|v| v.as_ref())
    }

    /// Registry with a `ReceiptVerifier` for every chain.
    pub fn with_receipts() -> Self {
        let mut registry = Self::new();
        for chain in [ExternalChain::Btc, ExternalChain::Bnb, ExternalChain::Eth] {
            registry.register(chain, Box::new(ReceiptVerifier::new(chain)));
        }
        registry
    }
}

/// The external chain an action's proof comes from, by the asset it names.
pub fn proof_chain(params: &PortalParams, request: &ActionRequest) -> Option<ExternalChain> {
    match request {
        ActionRequest::PortingProof(a) => params.portal_tokens.get(&a.token_id).copied(),
        ActionRequest::RedeemProof(a) => params.portal_tokens.get(&a.token_id).copied(),
        ActionRequest::CustodianDeposit(a) if a.proof.is_some() => {
            params.supported_collaterals.get(&a.collateral).copied()
        }
        _ => None,
    }
}

/// The transfers an action's proof has to show, computed from the state at
/// the start of the block. `None` when the request it proves is unknown at
/// that point.
pub fn expected_transfers(
    state: &PortalState,
    params: &PortalParams,
    request: &ActionRequest,
) -> Option<Vec<ExpectedTransfer>> {
    match request {
        ActionRequest::PortingProof(a) => {
            let porting = state.waiting_portings.get(&a.porting_id)?;
            if porting.token_id != a.token_id {
                return None;
            }
            let transfers = porting
                .custodians
                .iter()
                .map(|c| ExpectedTransfer {
                    receiver: c.remote_address.clone(),
                    amount: c.amount,
                })
                .collect();
            Some(transfers)
        }
        ActionRequest::RedeemProof(a) => {
            let redeem = state.matched_redeems.get(&a.redeem_id)?;
            if redeem.token_id != a.token_id {
                return None;
            }
            let matched = redeem.matched_to(&a.custodian)?;
            Some(vec![ExpectedTransfer {
                receiver: redeem.redeemer_remote_address.clone(),
                amount: matched.amount,
            }])
        }
        ActionRequest::CustodianDeposit(a) if a.proof.is_some() => Some(vec![ExpectedTransfer {
            receiver: params.collateral_vault_address.clone(),
            amount: a.amount,
        }]),
        _ => None,
    }
}

/// Relayed transfer receipt: what a light client or bridge relayer attests
/// happened on the external chain.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub chain: ExternalChain,
    pub tx_id: String,
    pub transfers: Vec<ExpectedTransfer>,
}

impl TransferReceipt {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Verifier over JSON `TransferReceipt`s. Every expected receiver must be
/// paid at least the expected amount, summed across the receipt.
pub struct ReceiptVerifier {
    chain: ExternalChain,
}

impl ReceiptVerifier {
    pub fn new(chain: ExternalChain) -> Self {
        Self { chain }
    }
}

impl ProofVerifier for ReceiptVerifier {
    fn verify_and_extract(&self, proof: &[u8], expected: &[ExpectedTransfer]) -> Result<ProofVerdict, VerifyError> {
        let receipt: TransferReceipt =
            serde_json::from_slice(proof).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        if receipt.chain != self.chain {
            return Err(VerifyError::WrongChain {
                expected: self.chain,
                got: receipt.chain,
            });
        }
        if receipt.tx_id.trim().is_empty() {
            return Err(VerifyError::Malformed("receipt has no tx id".to_string()));
        }

        let mut paid: BTreeMap<&str, u128> = BTreeMap::new();
        for t in &receipt.transfers {
            *paid.entry(t.receiver.as_str()).or_default() += t.amount as u128;
        }
        let mut owed: BTreeMap<&str, u128> = BTreeMap::new();
        for t in expected {
            *owed.entry(t.receiver.as_str()).or_default() += t.amount as u128;
        }
        Ok(ProofVerdict {
            external_tx: external_tx_hash(receipt.chain, &receipt.tx_id),
            paid: owed
                .iter()
                .all(|(receiver, amount)| paid.get(receiver).copied().unwrap_or(0) >= *amount),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(receiver: &str, amount: u64) -> ExpectedTransfer {
        ExpectedTransfer {
            receiver: receiver.to_string(),
            amount,
        }
    }

    fn receipt(chain: ExternalChain, transfers: Vec<ExpectedTransfer>) -> Vec<u8> {
        TransferReceipt {
            chain,
            tx_id: "ab01".into(),
            transfers,
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn receipt_must_cover_every_receiver() {
        let v = ReceiptVerifier::new(ExternalChain::Btc);
        let proof = receipt(ExternalChain::Btc, vec![transfer("bc1-a", 60), transfer("bc1-a", 40)]);
        assert!(v.verify_and_extract(&proof, &[transfer("bc1-a", 100)]).unwrap().paid);
        assert!(!v.verify_and_extract(&proof, &[transfer("bc1-a", 101)]).unwrap().paid);
        assert!(!v
            .verify_and_extract(&proof, &[transfer("bc1-a", 1), transfer("bc1-b", 1)])
            .unwrap()
            .paid);
    }

    #[test]
    fn reencoded_receipt_names_the_same_tx() {
        let v = ReceiptVerifier::new(ExternalChain::Btc);
        let proof = receipt(ExternalChain::Btc, vec![transfer("bc1-a", 100)]);
        let mut padded = proof.clone();
        padded.push(b' ');
        let first = v.verify_and_extract(&proof, &[transfer("bc1-a", 100)]).unwrap();
        let second = v.verify_and_extract(&padded, &[transfer("bc1-a", 100)]).unwrap();
        assert_eq!(first.external_tx, second.external_tx);
        assert_eq!(first.external_tx, external_tx_hash(ExternalChain::Btc, "ab01"));
    }

    #[test]
    fn receipt_without_tx_id_is_malformed() {
        let v = ReceiptVerifier::new(ExternalChain::Btc);
        let proof = TransferReceipt {
            chain: ExternalChain::Btc,
            tx_id: " ".into(),
            transfers: vec![transfer("bc1-a", 1)],
        }
        .encode()
        .unwrap();
        assert!(matches!(
            v.verify_and_extract(&proof, &[]),
            Err(VerifyError::Malformed(_))
        ));
    }

    #[test]
    fn wrong_chain_and_garbage_are_errors() {
        let v = ReceiptVerifier::new(ExternalChain::Bnb);
        let proof = receipt(ExternalChain::Btc, vec![transfer("x", 1)]);
        assert!(matches!(
            v.verify_and_extract(&proof, &[]),
            Err(VerifyError::WrongChain { .. })
        ));
        assert!(matches!(
            v.verify_and_extract(b"not json", &[]),
            Err(VerifyError::Malformed(_))
        ));
    }

    #[test]
    fn registry_lookup() {
        let registry = VerifierRegistry::with_receipts();
        assert!(registry.get(ExternalChain::Eth).is_some());
        assert!(VerifierRegistry::new().get(ExternalChain::Eth).is_none());
    }
}
