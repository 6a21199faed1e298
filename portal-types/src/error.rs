use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every way a Portal operation can fail.
///
/// Soft variants are business outcomes: the producer records them inside a
/// `rejected` instruction and moves on. Fatal variants abort the instruction
/// (and the block) and surface to the host chain.
#[derive(Error, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum PortalError {
    // ══════════════════════════════════════════════════════════════
    // Soft rejections
    // ══════════════════════════════════════════════════════════════
    #[error("request id {id} already exists")]
    DuplicateId { id: String },
    #[error("final exchange rates are not set")]
    NoExchangeRate,
    #[error("fee {got} below minimum {expected} for {id}")]
    FeeTooLow { id: String, expected: u64, got: u64 },
    #[error("custodians cannot back {requested} {asset}, capacity {available}")]
    InsufficientCollateral { asset: String, requested: u64, available: u64 },
    #[error("custodian {custodian} has {free} free {collateral}, needs {requested}")]
    InsufficientFreeCollateral { custodian: String, collateral: String, requested: u64, free: u64 },
    #[error("not enough public {asset} held: requested {requested}, available {available}")]
    InsufficientPublicTokens { asset: String, requested: u64, available: u64 },
    #[error("custodian {custodian} not found")]
    CustodianNotFound { custodian: String },
    #[error("custodian {custodian} already matched to {id}")]
    CustodianAlreadyMatched { id: String, custodian: String },
    #[error("request {id} not found")]
    RequestNotFound { id: String },
    #[error("proof for {id} was already submitted")]
    DuplicateProof { id: String },
    #[error("proof for {id} rejected: {reason}")]
    InvalidProof { id: String, reason: String },
    #[error("request {id} invalid: {reason}")]
    InvalidRequest { id: String, reason: String },
    #[error("asset {asset} is not a supported portal token")]
    UnsupportedAsset { asset: String },
    #[error("collateral {collateral} is not accepted")]
    UnsupportedCollateral { collateral: String },
    #[error("{feeder} is not an authorised price feeder")]
    UnauthorizedFeeder { feeder: String },
    #[error("liquidation pool for {asset} is empty")]
    LiquidationPoolEmpty { asset: String },
    #[error("liquidation pool for {asset} holds {available}, requested {requested}")]
    InsufficientPoolTokens { asset: String, requested: u64, available: u64 },
    #[error("custodian {custodian} has no {asset} reward")]
    NoReward { custodian: String, asset: String },

    // ══════════════════════════════════════════════════════════════
    // Fatal
    // ══════════════════════════════════════════════════════════════
    #[error("unknown asset {asset} in exchange rates")]
    UnknownAsset { asset: String },
    #[error("division by zero while pricing {context}")]
    DivideByZero { context: String },
    #[error("arithmetic overflow in {context}")]
    Overflow { context: String },
    #[error("malformed instruction: {0}")]
    Decode(String),
    #[error("cannot encode {0}")]
    Encode(String),
    #[error("state inconsistency: {0}")]
    Inconsistent(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl PortalError {
    /// Fatal errors abort block processing; everything else becomes a
    /// rejected instruction.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PortalError::UnknownAsset { .. }
                | PortalError::DivideByZero { .. }
                | PortalError::Overflow { .. }
                | PortalError::Decode(_)
                | PortalError::Encode(_)
                | PortalError::Inconsistent(_)
                | PortalError::Storage(_)
        )
    }
}

pub type PortalResult<T> = std::result::Result<T, PortalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_split() {
        assert!(!PortalError::NoExchangeRate.is_fatal());
        assert!(!PortalError::DuplicateProof { id: "p1".into() }.is_fatal());
        assert!(PortalError::Decode("bad base64".into()).is_fatal());
        assert!(PortalError::Encode("status detail".into()).is_fatal());
        assert!(PortalError::UnknownAsset { asset: "DOGE".into() }.is_fatal());
    }

    #[test]
    fn rejection_detail_survives_json() {
        let err = PortalError::FeeTooLow { id: "porting-1".into(), expected: 100, got: 1 };
        let json = serde_json::to_string(&err).unwrap();
        let back: PortalError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
        assert_eq!(err.to_string(), "fee 1 below minimum 100 for porting-1");
    }
}
