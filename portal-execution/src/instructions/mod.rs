pub mod ledger;
pub mod liquidation;
pub mod porting;
pub mod rates;
pub mod redeem;
pub mod rewards;
