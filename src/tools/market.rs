//! Market data tools: price, price history, balance sheet, news.

use crate::error::ChatError;
use crate::market::MarketDataProvider;
use crate::models::{ToolInput, ToolOutput};
use crate::tools::Tool;
use crate::Result;
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

fn ensure_object_parameters(input: &ToolInput) -> Result<()> {
    if input.parameters.is_object() {
        Ok(())
    } else {
        Err(ChatError::InvalidToolInput(
            "tool arguments must be a JSON object".to_string(),
        ))
    }
}

fn require_str<'a>(input: &'a ToolInput, key: &str) -> Result<&'a str> {
    input
        .parameters
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ChatError::InvalidToolInput(format!("Expected '{}' in tool arguments", key)))
}

fn require_ticker(input: &ToolInput) -> Result<String> {
    ensure_object_parameters(input)?;
    Ok(require_str(input, "ticker")?.to_uppercase())
}

fn require_date(input: &ToolInput, key: &str) -> Result<NaiveDate> {
    let raw = require_str(input, key)?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| {
        ChatError::InvalidToolInput(format!("'{}' must be a YYYY-MM-DD date, got '{}': {}", key, raw, e))
    })
}

fn ticker_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "ticker": { "type": "string", "description": "Ticker symbol, e.g. AAPL" }
        },
        "required": ["ticker"]
    })
}

pub struct StockPriceTool {
    provider: Arc<dyn MarketDataProvider>,
}

impl StockPriceTool {
    pub fn new(provider: Arc<dyn MarketDataProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl Tool for StockPriceTool {
    fn name(&self) -> &'static str {
        "get_stock_price"
    }

    fn description(&self) -> &'static str {
        "A function that returns the current stock price based on a ticker symbol."
    }

    fn parameters(&self) -> Value {
        ticker_schema()
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let ticker = require_ticker(input)?;
        info!(tool = self.name(), %ticker, "tool is being used");

        let price = self.provider.latest_price(&ticker).await?;
        Ok(ToolOutput::ok(json!({ "ticker": ticker, "price": price })))
    }
}

pub struct HistoricalPriceTool {
    provider: Arc<dyn MarketDataProvider>,
}

impl HistoricalPriceTool {
    pub fn new(provider: Arc<dyn MarketDataProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl Tool for HistoricalPriceTool {
    fn name(&self) -> &'static str {
        "get_historical_stock_price"
    }

    fn description(&self) -> &'static str {
        "A function that returns the current stock price over time based on a ticker symbol and a start and end date."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "ticker": { "type": "string", "description": "Ticker symbol, e.g. AAPL" },
                "start_date": { "type": "string", "description": "Start date, YYYY-MM-DD" },
                "end_date": { "type": "string", "description": "End date, YYYY-MM-DD (exclusive)" }
            },
            "required": ["ticker", "start_date", "end_date"]
        })
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let ticker = require_ticker(input)?;
        let start = require_date(input, "start_date")?;
        let end = require_date(input, "end_date")?;
        if start > end {
            return Err(ChatError::InvalidToolInput(format!(
                "start_date {} is after end_date {}",
                start, end
            )));
        }
        info!(tool = self.name(), %ticker, %start, %end, "tool is being used");

        let bars = self.provider.price_history(&ticker, start, end).await?;
        Ok(ToolOutput::ok(json!({
            "ticker": ticker,
            "start_date": start.to_string(),
            "end_date": end.to_string(),
            "prices": bars,
        })))
    }
}

pub struct BalanceSheetTool {
    provider: Arc<dyn MarketDataProvider>,
}

impl BalanceSheetTool {
    pub fn new(provider: Arc<dyn MarketDataProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl Tool for BalanceSheetTool {
    fn name(&self) -> &'static str {
        "get_balance_sheet"
    }

    fn description(&self) -> &'static str {
        "A function that returns the balance sheet based on a ticker symbol."
    }

    fn parameters(&self) -> Value {
        ticker_schema()
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let ticker = require_ticker(input)?;
        info!(tool = self.name(), %ticker, "tool is being used");

        let sheet = self.provider.balance_sheet(&ticker).await?;
        Ok(ToolOutput::ok(sheet))
    }
}

pub struct StockNewsTool {
    provider: Arc<dyn MarketDataProvider>,
}

impl StockNewsTool {
    pub fn new(provider: Arc<dyn MarketDataProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl Tool for StockNewsTool {
    fn name(&self) -> &'static str {
        "get_stock_news"
    }

    fn description(&self) -> &'static str {
        "A function that returns news based on a ticker symbol."
    }

    fn parameters(&self) -> Value {
        ticker_schema()
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let ticker = require_ticker(input)?;
        info!(tool = self.name(), %ticker, "tool is being used");

        let news = self.provider.news(&ticker).await?;
        Ok(ToolOutput::ok(json!({ "ticker": ticker, "news": news })))
    }
}
