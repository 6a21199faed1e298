use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MatchingPortingCustodian {
    pub custodian: String,
    pub remote_address: String,
    pub amount: u64,
    pub locked_collaterals: BTreeMap<String, u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WaitingPortingRequest {
    pub porting_id: String,
    pub token_id: String,
    pub porter: String,
    pub amount: u64,
    pub custodians: Vec<MatchingPortingCustodian>,
    pub porting_fee: u64,
    pub beacon_height: u64,
    pub shard_id: u8,
    pub shard_height: u64,
    pub tx_req_id: String,
}

impl WaitingPortingRequest {
    pub fn matched_amount(&self) -> u64 {
        self.custodians.iter().map(|c| c.amount).sum()
    }

    /// Collateral of `kind` this request holds locked for `custodian`.
    pub fn locked_by(&self, custodian: &str, kind: &str) -> u64 {
        self.custodians
            .iter()
            .filter(|c| c.custodian == custodian)
            .filter_map(|c| c.locked_collaterals.get(kind))
            .sum()
    }

    pub fn is_expired(&self, height: u64, timeout: u64) -> bool {
        height.saturating_sub(self.beacon_height) >= timeout
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MatchingRedeemCustodian {
    pub custodian: String,
    pub remote_address: String,
    pub amount: u64,
}

/// Lives in the waiting set until fully covered, then in the matched set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RedeemRequest {
    pub redeem_id: String,
    pub token_id: String,
    pub redeemer: String,
    pub redeemer_remote_address: String,
    pub amount: u64,
    pub custodians: Vec<MatchingRedeemCustodian>,
    pub redeem_fee: u64,
    pub beacon_height: u64,
    pub shard_id: u8,
    pub shard_height: u64,
    pub tx_req_id: String,
}

impl RedeemRequest {
    pub fn matched_amount(&self) -> u64 {
        self.custodians.iter().map(|c| c.amount).sum()
    }

    pub fn remaining(&self) -> u64 {
        self.amount.saturating_sub(self.matched_amount())
    }

    pub fn is_fully_matched(&self) -> bool {
        self.matched_amount() == self.amount
    }

    pub fn matched_to(&self, custodian: &str) -> Option<&MatchingRedeemCustodian> {
        self.custodians.iter().find(|c| c.custodian == custodian)
    }

    pub fn is_expired(&self, height: u64, timeout: u64) -> bool {
        height.saturating_sub(self.beacon_height) >= timeout
    }
}
