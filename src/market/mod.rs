//! Market data providers
//!
//! The tools never talk to a data vendor directly; they go through
//! [`MarketDataProvider`] so the vendor can be swapped (or faked in tests).

use crate::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod yahoo;

pub use yahoo::YahooMarketData;

/// One daily OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adjclose: f64,
    pub volume: u64,
}

#[async_trait::async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Most recent closing price.
    async fn latest_price(&self, ticker: &str) -> Result<f64>;
    /// Daily bars from `start` (inclusive) to `end` (exclusive).
    async fn price_history(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>>;
    /// Balance sheet in the provider's own shape.
    async fn balance_sheet(&self, ticker: &str) -> Result<Value>;
    /// Recent news items in the provider's own shape.
    async fn news(&self, ticker: &str) -> Result<Value>;
}
