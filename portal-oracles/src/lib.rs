pub mod exchange;
pub mod price_feed;

pub use exchange::{down_percent, mul_div, up_percent, ExchangeRateTool, ASSET_UNIT};
pub use price_feed::aggregate_final_rates;
