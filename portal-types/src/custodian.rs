use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollateralBalance {
    pub total: u64,
    pub free: u64,
}

/// A custodian's multi-collateral ledger.
///
/// Native and token collaterals share one map keyed by collateral asset, and
/// locks are tracked per wrapped asset then per collateral kind.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CustodianRecord {
    pub address: String,
    pub collaterals: BTreeMap<String, CollateralBalance>,
    pub locked_collaterals: BTreeMap<String, BTreeMap<String, u64>>,
    pub holding_public_tokens: BTreeMap<String, u64>,
    pub remote_addresses: BTreeMap<String, String>,
    pub reward_amount: BTreeMap<String, u64>,
}

impl CustodianRecord {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Default::default()
        }
    }

    pub fn balance(&self, collateral: &str) -> CollateralBalance {
        self.collaterals.get(collateral).copied().unwrap_or_default()
    }

    pub fn free(&self, collateral: &str) -> u64 {
        self.balance(collateral).free
    }

    /// Native collateral total.
    pub fn total_collateral(&self, native: &str) -> u64 {
        self.balance(native).total
    }

    pub fn free_collateral(&self, native: &str) -> u64 {
        self.balance(native).free
    }

    pub fn total_token_collaterals(&self, native: &str) -> BTreeMap<String, u64> {
        self.collaterals
            .iter()
            .filter(|(asset, _)| asset.as_str() != native)
            .map(|(asset, b)| (asset.clone(), b.total))
            .collect()
    }

    pub fn free_token_collaterals(&self, native: &str) -> BTreeMap<String, u64> {
        self.collaterals
            .iter()
            .filter(|(asset, _)| asset.as_str() != native)
            .map(|(asset, b)| (asset.clone(), b.free))
            .collect()
    }

    /// Native collateral locked per wrapped asset.
    pub fn locked_amount_collateral(&self, native: &str) -> BTreeMap<String, u64> {
        self.locked_collaterals
            .iter()
            .filter_map(|(token, locks)| locks.get(native).map(|v| (token.clone(), *v)))
            .collect()
    }

    pub fn locked(&self, token: &str, collateral: &str) -> u64 {
        self.locked_collaterals
            .get(token)
            .and_then(|locks| locks.get(collateral))
            .copied()
            .unwrap_or(0)
    }

    pub fn locked_for_token(&self, token: &str) -> BTreeMap<String, u64> {
        self.locked_collaterals.get(token).cloned().unwrap_or_default()
    }

    /// Sum of a collateral kind locked across every wrapped asset.
    pub fn total_locked(&self, collateral: &str) -> u64 {
        self.locked_collaterals
            .values()
            .filter_map(|locks| locks.get(collateral))
            .sum()
    }

    pub fn holding(&self, token: &str) -> u64 {
        self.holding_public_tokens.get(token).copied().unwrap_or(0)
    }

    pub fn has_any_collateral(&self) -> bool {
        self.collaterals.values().any(|b| b.total > 0)
    }

    /// `total == free + Σ locked` for every collateral kind.
    pub fn is_conserved(&self) -> bool {
        let kinds = self
            .collaterals
            .keys()
            .chain(self.locked_collaterals.values().flat_map(|l| l.keys()));
        for kind in kinds {
            let b = self.balance(kind);
            let locked = self.total_locked(kind) as u128;
            if b.total as u128 != b.free as u128 + locked {
                return false;
            }
        }
        true
    }
}
