//! Integer conversions between registered assets.
//!
//! Prices are micro-USD per 10^9 base units. Every division truncates toward
//! zero so a conversion can never create value.

use portal_types::error::{PortalError, PortalResult};
use portal_types::state::FinalExchangeRates;

/// Base units per whole asset unit.
pub const ASSET_UNIT: u64 = 1_000_000_000;

pub fn mul_div(a: u64, b: u64, c: u64) -> PortalResult<u64> {
    if c == 0 {
        return Err(PortalError::DivideByZero { context: "mul_div".into() });
    }
    let out = a as u128 * b as u128 / c as u128;
    u64::try_from(out).map_err(|_| PortalError::Overflow { context: "mul_div".into() })
}

/// `amount * percent / 100`, truncated.
pub fn up_percent(amount: u64, percent: u64) -> PortalResult<u64> {
    mul_div(amount, percent, 100)
}

/// `amount * 100 / percent`, truncated.
pub fn down_percent(amount: u64, percent: u64) -> PortalResult<u64> {
    mul_div(amount, 100, percent)
}

pub struct ExchangeRateTool<'a> {
    rates: &'a FinalExchangeRates,
}

impl<'a> ExchangeRateTool<'a> {
    pub fn new(rates: &'a FinalExchangeRates) -> Self {
        Self { rates }
    }

    pub fn price(&self, asset: &str) -> PortalResult<u64> {
        let price = self
            .rates
            .price(asset)
            .ok_or_else(|| PortalError::UnknownAsset { asset: asset.to_string() })?;
        if price == 0 {
            return Err(PortalError::DivideByZero { context: format!("price of {asset}") });
        }
        Ok(price)
    }

    pub fn has_price(&self, asset: &str) -> bool {
        self.price(asset).is_ok()
    }

    /// `amount * price[from] / price[to]`.
    pub fn convert(&self, from: &str, to: &str, amount: u64) -> PortalResult<u64> {
        let from_price = self.price(from)?;
        let to_price = self.price(to)?;
        mul_div(amount, from_price, to_price)
    }

    pub fn convert_to_usd(&self, asset: &str, amount: u64) -> PortalResult<u64> {
        mul_div(amount, self.price(asset)?, ASSET_UNIT)
    }

    pub fn convert_from_usd(&self, asset: &str, usd: u64) -> PortalResult<u64> {
        mul_div(usd, ASSET_UNIT, self.price(asset)?)
    }

    /// Exact value in `price * base unit`; no truncation, used for ratios.
    pub fn value_of(&self, asset: &str, amount: u64) -> PortalResult<u128> {
        Ok(amount as u128 * self.price(asset)? as u128)
    }

    /// Base units of `asset` worth at most `value`.
    pub fn amount_for_value(&self, asset: &str, value: u128) -> PortalResult<u64> {
        let out = value / self.price(asset)? as u128;
        u64::try_from(out).map_err(|_| PortalError::Overflow { context: format!("{asset} amount") })
    }

    /// Base units of `asset` worth at least `value`.
    pub fn amount_for_value_ceil(&self, asset: &str, value: u128) -> PortalResult<u64> {
        let price = self.price(asset)? as u128;
        let out = (value + price - 1) / price;
        u64::try_from(out).map_err(|_| PortalError::Overflow { context: format!("{asset} amount") })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rates() -> FinalExchangeRates {
        let mut r = FinalExchangeRates::default();
        r.rates.insert("BTC".into(), 20_000_000);
        r.rates.insert("native".into(), 1_000_000);
        r.rates.insert("BROKEN".into(), 0);
        r
    }

    #[test]
    fn converts_wrapped_to_native() {
        let r = rates();
        let tool = ExchangeRateTool::new(&r);
        let collateral = up_percent(ASSET_UNIT, 200).unwrap();
        assert_eq!(tool.convert("BTC", "native", collateral).unwrap(), 40_000_000_000);
    }

    #[test]
    fn truncates_toward_zero() {
        let r = rates();
        let tool = ExchangeRateTool::new(&r);
        assert_eq!(tool.convert("native", "BTC", 19).unwrap(), 0);
        assert_eq!(up_percent(199, 50).unwrap(), 99);
        assert_eq!(down_percent(10, 3).unwrap(), 333);
    }

    #[test]
    fn unknown_and_zero_prices() {
        let r = rates();
        let tool = ExchangeRateTool::new(&r);
        assert_eq!(
            tool.convert("DOGE", "native", 1),
            Err(PortalError::UnknownAsset { asset: "DOGE".into() })
        );
        assert!(matches!(
            tool.convert("BTC", "BROKEN", 1),
            Err(PortalError::DivideByZero { .. })
        ));
        assert!(down_percent(1, 0).is_err());
    }

    #[test]
    fn usd_helpers() {
        let r = rates();
        let tool = ExchangeRateTool::new(&r);
        assert_eq!(tool.convert_to_usd("BTC", ASSET_UNIT).unwrap(), 20_000_000);
        assert_eq!(tool.convert_from_usd("native", 3_000_000).unwrap(), 3 * ASSET_UNIT);
        assert_eq!(tool.amount_for_value_ceil("BTC", 20_000_001).unwrap(), 2);
    }

    proptest! {
        #[test]
        fn round_trip_never_creates_value(amount in 0u64..1_000_000_000_000, p1 in 1_000u64..100_000_000, p2 in 1_000u64..100_000_000) {
            let mut r = FinalExchangeRates::default();
            r.rates.insert("A".into(), p1);
            r.rates.insert("B".into(), p2);
            let tool = ExchangeRateTool::new(&r);
            let there = tool.convert("A", "B", amount).unwrap();
            let back = tool.convert("B", "A", there).unwrap();
            prop_assert!(back <= amount);
            prop_assert!(tool.value_of("B", there).unwrap() <= tool.value_of("A", amount).unwrap());
        }
    }
}
