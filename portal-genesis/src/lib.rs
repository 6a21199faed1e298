use anyhow::{bail, Context, Result};
use portal_types::params::PortalParams;
use portal_types::state::{FinalExchangeRates, PortalState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Chain parameters plus the prices the Portal starts with, so porting can
/// open before the first feeder round settles.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GenesisConfig {
    pub params: PortalParams,
    /// asset -> micro-USD per whole unit
    pub initial_rates: BTreeMap<String, u64>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        let mut initial_rates = BTreeMap::new();
        initial_rates.insert("BTC".to_string(), 20_000_000_000); // $20000.000000
        initial_rates.insert("BNB".to_string(), 300_000_000); // $300.000000
        initial_rates.insert("ETH".to_string(), 2_000_000_000); // $2000.000000
        initial_rates.insert("USDT".to_string(), 1_000_000); // $1.000000
        initial_rates.insert("native".to_string(), 1_000_000); // $1.000000
        Self {
            params: PortalParams::default(),
            initial_rates,
        }
    }
}

impl GenesisConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read genesis file {}", path.display()))?;
        let config: GenesisConfig = toml::from_str(&content).context("Failed to parse genesis file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.params.validate()?;
        for (asset, price) in &self.initial_rates {
            if !self.params.is_portal_token(asset) && !self.params.is_collateral(asset) {
                bail!("Initial rate for unknown asset {}", asset);
            }
            if *price == 0 {
                bail!("Initial rate for {} is zero", asset);
            }
        }
        Ok(())
    }
}

pub fn create_genesis_state(config: &GenesisConfig) -> Result<PortalState> {
    config.validate()?;
    let final_exchange_rates = if config.initial_rates.is_empty() {
        None
    } else {
        Some(FinalExchangeRates {
            rates: config.initial_rates.clone(),
        })
    };
    info!(
        "Genesis Portal state with {} initial rates and {} feeders",
        config.initial_rates.len(),
        config.params.feeders.len()
    );
    Ok(PortalState {
        final_exchange_rates,
        ..Default::default()
    })
}
