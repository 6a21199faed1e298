use crate::custodian::CustodianRecord;
use crate::instruction::InstructionStatus;
use crate::request::{RedeemRequest, WaitingPortingRequest};
use crate::scratch::StateDiff;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Unit price of each asset, in micro-USD per 10^9 base units.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalExchangeRates {
    pub rates: BTreeMap<String, u64>,
}

impl FinalExchangeRates {
    pub fn price(&self, asset: &str) -> Option<u64> {
        self.rates.get(asset).copied()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct LiquidationPoolEntry {
    pub public_token_amount: u64,
    pub collaterals: BTreeMap<String, u64>,
}

/// Locked value accumulated over the current epoch; basis for reward splits.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct LockedCollateralForRewards {
    pub total: u64,
    pub per_custodian: BTreeMap<String, u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestKind {
    Porting,
    PortingProof,
    Redeem,
    RedeemMatching,
    RedeemProof,
    Deposit,
    Withdraw,
    Topup,
    PortingTopup,
    PoolRedeem,
    RewardWithdraw,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Porting => "porting",
            RequestKind::PortingProof => "porting-proof",
            RequestKind::Redeem => "redeem",
            RequestKind::RedeemMatching => "redeem-matching",
            RequestKind::RedeemProof => "redeem-proof",
            RequestKind::Deposit => "deposit",
            RequestKind::Withdraw => "withdraw",
            RequestKind::Topup => "topup",
            RequestKind::PortingTopup => "porting-topup",
            RequestKind::PoolRedeem => "pool-redeem",
            RequestKind::RewardWithdraw => "reward-withdraw",
        }
    }
}

/// Key under which a request's latest status is stored.
pub fn status_key(kind: RequestKind, id: &str) -> String {
    format!("{}/{}", kind.as_str(), id)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RequestStatus {
    pub kind: RequestKind,
    pub status: InstructionStatus,
    pub beacon_height: u64,
    /// JSON of the instruction content that produced this status.
    pub detail: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRatesSubmission {
    pub feeder: String,
    pub rates: BTreeMap<String, u64>,
    pub beacon_height: u64,
}

/// Canonical Portal snapshot for one beacon height.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PortalState {
    pub custodians: BTreeMap<String, CustodianRecord>,
    pub waiting_portings: BTreeMap<String, WaitingPortingRequest>,
    pub waiting_redeems: BTreeMap<String, RedeemRequest>,
    pub matched_redeems: BTreeMap<String, RedeemRequest>,
    pub liquidation_pool: BTreeMap<String, LiquidationPoolEntry>,
    pub final_exchange_rates: Option<FinalExchangeRates>,
    pub locked_collateral_for_rewards: LockedCollateralForRewards,

    // === History ===
    pub request_history: BTreeMap<String, RequestStatus>,
    pub used_proofs: BTreeSet<[u8; 32]>,
    pub pending_exchange_rates: BTreeMap<String, ExchangeRatesSubmission>,
}

fn apply_changes<V>(target: &mut BTreeMap<String, V>, changes: BTreeMap<String, Option<V>>) {
    for (key, change) in changes {
        match change {
            Some(value) => {
                target.insert(key, value);
            }
            None => {
                target.remove(&key);
            }
        }
    }
}

impl PortalState {
    pub fn root_hash(&self) -> [u8; 32] {
        // BTreeMap fields serialize in key order, so equal states hash equal.
        match bincode::serialize(self) {
            Ok(bytes) => *blake3::hash(&bytes).as_bytes(),
            Err(_) => [0u8; 32],
        }
    }

    pub fn apply_diff(&mut self, diff: StateDiff) {
        apply_changes(&mut self.custodians, diff.custodians);
        apply_changes(&mut self.waiting_portings, diff.waiting_portings);
        apply_changes(&mut self.waiting_redeems, diff.waiting_redeems);
        apply_changes(&mut self.matched_redeems, diff.matched_redeems);
        apply_changes(&mut self.liquidation_pool, diff.liquidation_pool);
        apply_changes(&mut self.request_history, diff.request_history);
        apply_changes(&mut self.pending_exchange_rates, diff.pending_exchange_rates);
        self.used_proofs.extend(diff.used_proofs);
        if let Some(rates) = diff.final_exchange_rates {
            self.final_exchange_rates = rates;
        }
        if let Some(snapshot) = diff.locked_collateral_for_rewards {
            self.locked_collateral_for_rewards = snapshot;
        }
    }

    pub fn status(&self, kind: RequestKind, id: &str) -> Option<&RequestStatus> {
        self.request_history.get(&status_key(kind, id))
    }

    /// Custodians whose ledger breaks `total == free + Σ locked`.
    pub fn unconserved_custodians(&self) -> Vec<String> {
        self.custodians
            .values()
            .filter(|c| !c.is_conserved())
            .map(|c| c.address.clone())
            .collect()
    }
}
