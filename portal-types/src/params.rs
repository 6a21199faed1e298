use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// External chain a portal token lives on. Selects the proof verifier.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExternalChain {
    Btc,
    Bnb,
    Eth,
}

/// Consensus parameters of the Portal. Never mutated by the state machine.
///
/// Timeouts are beacon-block counts. Percentages are whole percents except
/// the fee rates, which are basis points (1 = 0.01%).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PortalParams {
    pub timeout_waiting_porting_request: u64,
    pub timeout_waiting_redeem_request: u64,
    pub timeout_custodian_return_pub_token: u64,

    pub max_percent_liquidated_collateral_amount: u64,
    pub percent_collateral_liquidated_by_rates: u64,
    pub min_percent_locked_collateral: u64,
    pub tp120: u64,
    pub tp130: u64,

    pub min_percent_custodian_rewards: u64,
    pub max_percent_custodian_rewards: u64,
    pub min_lock_collateral_amount_in_epoch: u64,
    pub epoch_length: u64,

    pub min_porting_fee_bps: u64,
    pub min_redeem_fee_bps: u64,
    pub min_portal_fee: u64,

    pub native_collateral: String,
    /// Token collaterals accepted besides the native one, with the chain
    /// their deposits are proven on.
    pub supported_collaterals: BTreeMap<String, ExternalChain>,
    pub portal_tokens: BTreeMap<String, ExternalChain>,
    /// Address on the collateral chain that token deposits must pay.
    pub collateral_vault_address: String,
    pub feeders: Vec<String>,
}

pub const NATIVE_COLLATERAL: &str = "native";

impl Default for PortalParams {
    fn default() -> Self {
        // 40s beacon blocks: 24h = 2160 blocks, 15min = 22 blocks.
        let mut supported_collaterals = BTreeMap::new();
        supported_collaterals.insert("ETH".to_string(), ExternalChain::Eth);
        supported_collaterals.insert("USDT".to_string(), ExternalChain::Eth);

        let mut portal_tokens = BTreeMap::new();
        portal_tokens.insert("BTC".to_string(), ExternalChain::Btc);
        portal_tokens.insert("BNB".to_string(), ExternalChain::Bnb);

        Self {
            timeout_waiting_porting_request: 2160,
            timeout_waiting_redeem_request: 22,
            timeout_custodian_return_pub_token: 2160,
            max_percent_liquidated_collateral_amount: 120,
            percent_collateral_liquidated_by_rates: 105,
            min_percent_locked_collateral: 200,
            tp120: 120,
            tp130: 130,
            min_percent_custodian_rewards: 1,
            max_percent_custodian_rewards: 10,
            min_lock_collateral_amount_in_epoch: 5_000_000_000,
            epoch_length: 100,
            min_porting_fee_bps: 1,
            min_redeem_fee_bps: 1,
            min_portal_fee: 100,
            native_collateral: NATIVE_COLLATERAL.to_string(),
            supported_collaterals,
            portal_tokens,
            collateral_vault_address: "0x0000000000000000000000000000000000b41d6e".to_string(),
            feeders: Vec::new(),
        }
    }
}

impl PortalParams {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read params file {}", path.display()))?;
        let params: PortalParams = toml::from_str(&content).context("Failed to parse params file")?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tp120 == 0 || self.tp130 <= self.tp120 {
            bail!("tp130 ({}) must exceed tp120 ({})", self.tp130, self.tp120);
        }
        if self.min_percent_locked_collateral < self.tp130 {
            bail!("min_percent_locked_collateral must be at least tp130");
        }
        if self.percent_collateral_liquidated_by_rates >= self.tp130 {
            bail!("percent_collateral_liquidated_by_rates must stay below tp130");
        }
        if self.min_percent_custodian_rewards > self.max_percent_custodian_rewards
            || self.max_percent_custodian_rewards > 100
        {
            bail!("custodian reward percentages must satisfy min <= max <= 100");
        }
        if self.epoch_length == 0 {
            bail!("epoch_length cannot be zero");
        }
        if self.native_collateral.is_empty() {
            bail!("native_collateral cannot be empty");
        }
        if self.supported_collaterals.contains_key(&self.native_collateral) {
            bail!("native collateral {} listed as a token collateral", self.native_collateral);
        }
        if self.portal_tokens.is_empty() {
            bail!("at least one portal token must be configured");
        }
        Ok(())
    }

    pub fn is_portal_token(&self, asset: &str) -> bool {
        self.portal_tokens.contains_key(asset)
    }

    pub fn is_collateral(&self, asset: &str) -> bool {
        asset == self.native_collateral || self.supported_collaterals.contains_key(asset)
    }

    /// Collateral kinds in locking order: native first, then tokens by ID.
    pub fn collateral_order(&self) -> Vec<String> {
        std::iter::once(self.native_collateral.clone())
            .chain(self.supported_collaterals.keys().cloned())
            .collect()
    }

    pub fn is_feeder(&self, who: &str) -> bool {
        self.feeders.iter().any(|f| f == who)
    }
}
