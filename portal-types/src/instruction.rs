use crate::error::{PortalError, PortalResult};
use crate::request::{MatchingPortingCustodian, MatchingRedeemCustodian};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Type tag of every Portal instruction. Shard actions are processed in
/// ascending tag order within a block.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstructionKind {
    CustodianDeposit,
    PortingRequest,
    PortingProof,
    CustodianWithdraw,
    RedeemRequest,
    RedeemMatching,
    RedeemProof,
    ExchangeRates,
    CustodianTopup,
    PortingTopup,
    PoolRedeem,
    WithdrawReward,
    ExpiredWaitingPorting,
    LiquidateRunAway,
    LiquidateByRates,
    PickMoreCustodians,
    CustodianReward,
}

impl InstructionKind {
    pub const ALL: [InstructionKind; 17] = [
        InstructionKind::CustodianDeposit,
        InstructionKind::PortingRequest,
        InstructionKind::PortingProof,
        InstructionKind::CustodianWithdraw,
        InstructionKind::RedeemRequest,
        InstructionKind::RedeemMatching,
        InstructionKind::RedeemProof,
        InstructionKind::ExchangeRates,
        InstructionKind::CustodianTopup,
        InstructionKind::PortingTopup,
        InstructionKind::PoolRedeem,
        InstructionKind::WithdrawReward,
        InstructionKind::ExpiredWaitingPorting,
        InstructionKind::LiquidateRunAway,
        InstructionKind::LiquidateByRates,
        InstructionKind::PickMoreCustodians,
        InstructionKind::CustodianReward,
    ];

    pub fn tag(&self) -> u16 {
        match self {
            InstructionKind::CustodianDeposit => 300,
            InstructionKind::PortingRequest => 301,
            InstructionKind::PortingProof => 302,
            InstructionKind::CustodianWithdraw => 303,
            InstructionKind::RedeemRequest => 304,
            InstructionKind::RedeemMatching => 305,
            InstructionKind::RedeemProof => 306,
            InstructionKind::ExchangeRates => 307,
            InstructionKind::CustodianTopup => 308,
            InstructionKind::PortingTopup => 309,
            InstructionKind::PoolRedeem => 310,
            InstructionKind::WithdrawReward => 311,
            InstructionKind::ExpiredWaitingPorting => 320,
            InstructionKind::LiquidateRunAway => 321,
            InstructionKind::LiquidateByRates => 322,
            InstructionKind::PickMoreCustodians => 323,
            InstructionKind::CustodianReward => 324,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.tag() == tag)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstructionStatus {
    Accepted,
    Rejected,
    Success,
    Expired,
    Liquidated,
    Refunded,
}

impl InstructionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstructionStatus::Accepted => "accepted",
            InstructionStatus::Rejected => "rejected",
            InstructionStatus::Success => "success",
            InstructionStatus::Expired => "expired",
            InstructionStatus::Liquidated => "liquidated",
            InstructionStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accepted" => Some(InstructionStatus::Accepted),
            "rejected" => Some(InstructionStatus::Rejected),
            "success" => Some(InstructionStatus::Success),
            "expired" => Some(InstructionStatus::Expired),
            "liquidated" => Some(InstructionStatus::Liquidated),
            "refunded" => Some(InstructionStatus::Refunded),
            _ => None,
        }
    }
}

// ══════════════════════════════════════════════════════════════
// Shard-action contents
// ══════════════════════════════════════════════════════════════

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DepositContent {
    pub custodian: String,
    pub collateral: String,
    pub amount: u64,
    pub remote_addresses: BTreeMap<String, String>,
    /// Vault payment, for token collateral.
    pub external_tx: Option<[u8; 32]>,
    pub tx_req_id: String,
    pub reason: Option<PortalError>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WithdrawContent {
    pub custodian: String,
    pub collateral: String,
    pub amount: u64,
    pub tx_req_id: String,
    pub reason: Option<PortalError>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortingRequestContent {
    pub porting_id: String,
    pub token_id: String,
    pub porter: String,
    pub amount: u64,
    pub porting_fee: u64,
    pub custodians: Vec<MatchingPortingCustodian>,
    pub tx_req_id: String,
    pub shard_height: u64,
    pub reason: Option<PortalError>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortingProofContent {
    pub porting_id: String,
    pub token_id: String,
    pub porter: String,
    pub amount: u64,
    pub external_tx: Option<[u8; 32]>,
    pub custodians: Vec<MatchingPortingCustodian>,
    pub tx_req_id: String,
    pub reason: Option<PortalError>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RedeemRequestContent {
    pub redeem_id: String,
    pub token_id: String,
    pub redeemer: String,
    pub redeemer_remote_address: String,
    pub amount: u64,
    pub redeem_fee: u64,
    pub tx_req_id: String,
    pub shard_height: u64,
    pub reason: Option<PortalError>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RedeemMatchingContent {
    pub redeem_id: String,
    pub custodian: String,
    pub remote_address: String,
    pub matched_amount: u64,
    pub tx_req_id: String,
    pub reason: Option<PortalError>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RedeemProofContent {
    pub redeem_id: String,
    pub token_id: String,
    pub custodian: String,
    pub redeem_amount: u64,
    pub unlocked: BTreeMap<String, u64>,
    pub external_tx: Option<[u8; 32]>,
    pub tx_req_id: String,
    pub reason: Option<PortalError>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRatesContent {
    pub feeder: String,
    pub rates: BTreeMap<String, u64>,
    pub tx_req_id: String,
    pub reason: Option<PortalError>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CustodianTopupContent {
    pub custodian: String,
    pub token_id: String,
    pub collateral: String,
    pub amount: u64,
    pub tx_req_id: String,
    pub reason: Option<PortalError>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortingTopupContent {
    pub porting_id: String,
    pub custodian: String,
    pub collateral: String,
    pub amount: u64,
    pub tx_req_id: String,
    pub reason: Option<PortalError>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PoolRedeemContent {
    pub redeemer: String,
    pub token_id: String,
    pub amount: u64,
    pub payout: BTreeMap<String, u64>,
    pub tx_req_id: String,
    pub reason: Option<PortalError>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WithdrawRewardContent {
    pub custodian: String,
    pub asset: String,
    pub amount: u64,
    pub tx_req_id: String,
    pub reason: Option<PortalError>,
}

// ══════════════════════════════════════════════════════════════
// Beacon-generated contents
// ══════════════════════════════════════════════════════════════

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExpiredPortingContent {
    pub porting_id: String,
    pub token_id: String,
    pub porter: String,
    pub amount: u64,
    pub custodians: Vec<MatchingPortingCustodian>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RunAwayLiquidationContent {
    pub redeem_id: String,
    pub token_id: String,
    pub redeemer: String,
    pub custodian: String,
    pub matched_amount: u64,
    /// Collateral moved into the liquidation pool, per kind.
    pub liquidated: BTreeMap<String, u64>,
    /// Collateral returned to the custodian's free balance, per kind.
    pub remain_unlocked: BTreeMap<String, u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RatesLiquidationContent {
    pub custodian: String,
    pub token_id: String,
    pub liquidated_public_tokens: u64,
    pub liquidated: BTreeMap<String, u64>,
    /// Collateral ratio (percent) that triggered the liquidation.
    pub ratio_before: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PickMoreCustodiansContent {
    pub redeem_id: String,
    pub token_id: String,
    pub custodians: Vec<MatchingRedeemCustodian>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CustodianRewardContent {
    pub beacon_height: u64,
    /// custodian -> reward asset -> amount
    pub rewards: BTreeMap<String, BTreeMap<String, u64>>,
    /// Epoch reward split this block, empty off epoch boundaries.
    pub epoch_total: BTreeMap<String, u64>,
}

/// Typed content, one variant per flow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum PortalInstruction {
    CustodianDeposit(DepositContent),
    PortingRequest(PortingRequestContent),
    PortingProof(PortingProofContent),
    CustodianWithdraw(WithdrawContent),
    RedeemRequest(RedeemRequestContent),
    RedeemMatching(RedeemMatchingContent),
    RedeemProof(RedeemProofContent),
    ExchangeRates(ExchangeRatesContent),
    CustodianTopup(CustodianTopupContent),
    PortingTopup(PortingTopupContent),
    PoolRedeem(PoolRedeemContent),
    WithdrawReward(WithdrawRewardContent),
    ExpiredWaitingPorting(ExpiredPortingContent),
    LiquidateRunAway(RunAwayLiquidationContent),
    LiquidateByRates(RatesLiquidationContent),
    PickMoreCustodians(PickMoreCustodiansContent),
    CustodianReward(CustodianRewardContent),
}

impl PortalInstruction {
    pub fn kind(&self) -> InstructionKind {
        match self {
            PortalInstruction::CustodianDeposit(_) => InstructionKind::CustodianDeposit,
            PortalInstruction::PortingRequest(_) => InstructionKind::PortingRequest,
            PortalInstruction::PortingProof(_) => InstructionKind::PortingProof,
            PortalInstruction::CustodianWithdraw(_) => InstructionKind::CustodianWithdraw,
            PortalInstruction::RedeemRequest(_) => InstructionKind::RedeemRequest,
            PortalInstruction::RedeemMatching(_) => InstructionKind::RedeemMatching,
            PortalInstruction::RedeemProof(_) => InstructionKind::RedeemProof,
            PortalInstruction::ExchangeRates(_) => InstructionKind::ExchangeRates,
            PortalInstruction::CustodianTopup(_) => InstructionKind::CustodianTopup,
            PortalInstruction::PortingTopup(_) => InstructionKind::PortingTopup,
            PortalInstruction::PoolRedeem(_) => InstructionKind::PoolRedeem,
            PortalInstruction::WithdrawReward(_) => InstructionKind::WithdrawReward,
            PortalInstruction::ExpiredWaitingPorting(_) => InstructionKind::ExpiredWaitingPorting,
            PortalInstruction::LiquidateRunAway(_) => InstructionKind::LiquidateRunAway,
            PortalInstruction::LiquidateByRates(_) => InstructionKind::LiquidateByRates,
            PortalInstruction::PickMoreCustodians(_) => InstructionKind::PickMoreCustodians,
            PortalInstruction::CustodianReward(_) => InstructionKind::CustodianReward,
        }
    }

    fn content_json(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            PortalInstruction::CustodianDeposit(c) => serde_json::to_vec(c),
            PortalInstruction::PortingRequest(c) => serde_json::to_vec(c),
            PortalInstruction::PortingProof(c) => serde_json::to_vec(c),
            PortalInstruction::CustodianWithdraw(c) => serde_json::to_vec(c),
            PortalInstruction::RedeemRequest(c) => serde_json::to_vec(c),
            PortalInstruction::RedeemMatching(c) => serde_json::to_vec(c),
            PortalInstruction::RedeemProof(c) => serde_json::to_vec(c),
            PortalInstruction::ExchangeRates(c) => serde_json::to_vec(c),
            PortalInstruction::CustodianTopup(c) => serde_json::to_vec(c),
            PortalInstruction::PortingTopup(c) => serde_json::to_vec(c),
            PortalInstruction::PoolRedeem(c) => serde_json::to_vec(c),
            PortalInstruction::WithdrawReward(c) => serde_json::to_vec(c),
            PortalInstruction::ExpiredWaitingPorting(c) => serde_json::to_vec(c),
            PortalInstruction::LiquidateRunAway(c) => serde_json::to_vec(c),
            PortalInstruction::LiquidateByRates(c) => serde_json::to_vec(c),
            PortalInstruction::PickMoreCustodians(c) => serde_json::to_vec(c),
            PortalInstruction::CustodianReward(c) => serde_json::to_vec(c),
        }
    }

    fn from_content(kind: InstructionKind, json: &[u8]) -> PortalResult<Self> {
        Ok(match kind {
            InstructionKind::CustodianDeposit => PortalInstruction::CustodianDeposit(decode(json)?),
            InstructionKind::PortingRequest => PortalInstruction::PortingRequest(decode(json)?),
            InstructionKind::PortingProof => PortalInstruction::PortingProof(decode(json)?),
            InstructionKind::CustodianWithdraw => PortalInstruction::CustodianWithdraw(decode(json)?),
            InstructionKind::RedeemRequest => PortalInstruction::RedeemRequest(decode(json)?),
            InstructionKind::RedeemMatching => PortalInstruction::RedeemMatching(decode(json)?),
            InstructionKind::RedeemProof => PortalInstruction::RedeemProof(decode(json)?),
            InstructionKind::ExchangeRates => PortalInstruction::ExchangeRates(decode(json)?),
            InstructionKind::CustodianTopup => PortalInstruction::CustodianTopup(decode(json)?),
            InstructionKind::PortingTopup => PortalInstruction::PortingTopup(decode(json)?),
            InstructionKind::PoolRedeem => PortalInstruction::PoolRedeem(decode(json)?),
            InstructionKind::WithdrawReward => PortalInstruction::WithdrawReward(decode(json)?),
            InstructionKind::ExpiredWaitingPorting => {
                PortalInstruction::ExpiredWaitingPorting(decode(json)?)
            }
            InstructionKind::LiquidateRunAway => PortalInstruction::LiquidateRunAway(decode(json)?),
            InstructionKind::LiquidateByRates => PortalInstruction::LiquidateByRates(decode(json)?),
            InstructionKind::PickMoreCustodians => {
                PortalInstruction::PickMoreCustodians(decode(json)?)
            }
            InstructionKind::CustodianReward => PortalInstruction::CustodianReward(decode(json)?),
        })
    }
}

fn decode<T: DeserializeOwned>(json: &[u8]) -> PortalResult<T> {
    serde_json::from_slice(json).map_err(|e| PortalError::Decode(format!("content json: {e}")))
}

/// One beacon instruction: `[type_tag, shard_id, status, base64(json)]` on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Originating shard; `None` for beacon-generated instructions.
    pub shard_id: Option<u8>,
    pub status: InstructionStatus,
    pub body: PortalInstruction,
}

impl Instruction {
    pub fn new(shard_id: Option<u8>, status: InstructionStatus, body: PortalInstruction) -> Self {
        Self { shard_id, status, body }
    }

    pub fn kind(&self) -> InstructionKind {
        self.body.kind()
    }

    pub fn is_rejected(&self) -> bool {
        self.status == InstructionStatus::Rejected
    }

    pub fn to_wire(&self) -> PortalResult<[String; 4]> {
        let json = self
            .body
            .content_json()
            .map_err(|e| PortalError::Encode(format!("instruction content: {e}")))?;
        let shard = match self.shard_id {
            Some(id) => id.to_string(),
            None => "-1".to_string(),
        };
        Ok([
            self.kind().tag().to_string(),
            shard,
            self.status.as_str().to_string(),
            STANDARD.encode(json),
        ])
    }

    pub fn from_wire(parts: &[String]) -> PortalResult<Self> {
        let [tag, shard, status, content] = parts else {
            return Err(PortalError::Decode(format!("expected 4 fields, got {}", parts.len())));
        };
        let tag: u16 = tag
            .parse()
            .map_err(|_| PortalError::Decode(format!("bad type tag {tag}")))?;
        let kind = InstructionKind::from_tag(tag)
            .ok_or_else(|| PortalError::Decode(format!("unregistered type tag {tag}")))?;
        let shard_id = match shard.as_str() {
            "-1" => None,
            s => Some(
                s.parse::<u8>()
                    .map_err(|_| PortalError::Decode(format!("bad shard id {s}")))?,
            ),
        };
        let status = InstructionStatus::parse(status)
            .ok_or_else(|| PortalError::Decode(format!("bad status {status}")))?;
        let json = STANDARD
            .decode(content)
            .map_err(|e| PortalError::Decode(format!("content base64: {e}")))?;
        let body = PortalInstruction::from_content(kind, &json)?;
        Ok(Self { shard_id, status, body })
    }
}
