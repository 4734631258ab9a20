//! Yahoo Finance market data
//!
//! Quotes and history come through `yahoo_finance_api`; balance sheets and
//! news come from Yahoo's public JSON endpoints, which that crate does not
//! cover.

use crate::error::ChatError;
use crate::market::{MarketDataProvider, PriceBar};
use crate::Result;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::error;
use yahoo_finance_api as yahoo;

const DEFAULT_QUERY_URL: &str = "https://query2.finance.yahoo.com";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) stock-chat-assistant";
const NEWS_COUNT: u32 = 10;

/// Annual balance sheet line items requested from the timeseries endpoint.
const BALANCE_SHEET_FIELDS: &[&str] = &[
    "annualTotalAssets",
    "annualCurrentAssets",
    "annualCashAndCashEquivalents",
    "annualTotalLiabilitiesNetMinorityInterest",
    "annualCurrentLiabilities",
    "annualLongTermDebt",
    "annualTotalDebt",
    "annualStockholdersEquity",
    "annualRetainedEarnings",
    "annualOrdinarySharesNumber",
];

/// Yahoo Finance provider (connection-pooled)
#[derive(Clone)]
pub struct YahooMarketData {
    client: Client,
    query_url: String,
}

impl YahooMarketData {
    pub fn new() -> Result<Self> {
        Self::with_query_url(DEFAULT_QUERY_URL)
    }

    pub fn with_query_url(query_url: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ChatError::ToolError(format!("Failed to build Yahoo HTTP client: {}", e)))?;

        Ok(Self {
            client,
            query_url: query_url.trim_end_matches('/').to_string(),
        })
    }

    fn connector() -> Result<yahoo::YahooConnector> {
        yahoo::YahooConnector::new().map_err(|e| ChatError::ToolError(e.to_string()))
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.query_url, path);

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| ChatError::ToolError(format!("Yahoo request failed for {}: {}", path, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Yahoo returned {} for {}: {}", status, path, body);
            return Err(ChatError::ToolError(format!(
                "Yahoo returned {} for {}",
                status, path
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ChatError::ToolError(format!("Invalid JSON response from Yahoo: {}", e)))
    }
}

fn to_offset(date: NaiveDate) -> Result<OffsetDateTime> {
    let seconds = date
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .ok_or_else(|| ChatError::InvalidToolInput(format!("Invalid date: {}", date)))?;

    OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|e| ChatError::InvalidToolInput(format!("Invalid date {}: {}", date, e)))
}

fn bar_from_quote(quote: &yahoo::Quote) -> PriceBar {
    PriceBar {
        timestamp: DateTime::from_timestamp(quote.timestamp as i64, 0).unwrap_or_else(Utc::now),
        open: quote.open,
        high: quote.high,
        low: quote.low,
        close: quote.close,
        adjclose: quote.adjclose,
        volume: quote.volume,
    }
}

/// Flatten the timeseries response into `{ line_item: [{as_of_date, value}] }`.
fn condense_balance_sheet(ticker: &str, response: &Value) -> Result<Value> {
    let results = response
        .pointer("/timeseries/result")
        .and_then(Value::as_array)
        .ok_or_else(|| ChatError::ToolError(format!("No balance sheet data for {}", ticker)))?;

    let mut sheet = serde_json::Map::new();
    for entry in results {
        let Some(field) = entry
            .pointer("/meta/type/0")
            .and_then(Value::as_str)
        else {
            continue;
        };
        let Some(points) = entry.get(field).and_then(Value::as_array) else {
            continue;
        };

        let values: Vec<Value> = points
            .iter()
            .filter(|p| !p.is_null())
            .map(|p| {
                json!({
                    "as_of_date": p.get("asOfDate").cloned().unwrap_or(Value::Null),
                    "value": p.pointer("/reportedValue/raw").cloned().unwrap_or(Value::Null),
                })
            })
            .collect();

        let name = field.strip_prefix("annual").unwrap_or(field);
        sheet.insert(name.to_string(), Value::Array(values));
    }

    if sheet.is_empty() {
        return Err(ChatError::ToolError(format!(
            "No balance sheet data for {}",
            ticker
        )));
    }

    Ok(json!({ "symbol": ticker, "balance_sheet": sheet }))
}

#[async_trait::async_trait]
impl MarketDataProvider for YahooMarketData {
    async fn latest_price(&self, ticker: &str) -> Result<f64> {
        let response = Self::connector()?
            .get_latest_quotes(ticker, "1d")
            .await
            .map_err(|e| ChatError::ToolError(e.to_string()))?;

        let quote = response
            .last_quote()
            .map_err(|e| ChatError::ToolError(e.to_string()))?;

        Ok(quote.close)
    }

    async fn price_history(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>> {
        let response = Self::connector()?
            .get_quote_history(ticker, to_offset(start)?, to_offset(end)?)
            .await
            .map_err(|e| ChatError::ToolError(e.to_string()))?;

        let quotes = response
            .quotes()
            .map_err(|e| ChatError::ToolError(e.to_string()))?;

        Ok(quotes.iter().map(bar_from_quote).collect())
    }

    async fn balance_sheet(&self, ticker: &str) -> Result<Value> {
        let path = format!("/ws/fundamentals-timeseries/v1/finance/timeseries/{}", ticker);
        let response = self
            .get_json(
                &path,
                &[
                    ("symbol", ticker.to_string()),
                    ("type", BALANCE_SHEET_FIELDS.join(",")),
                    ("period1", "493590046".to_string()),
                    ("period2", Utc::now().timestamp().to_string()),
                ],
            )
            .await?;

        condense_balance_sheet(ticker, &response)
    }

    async fn news(&self, ticker: &str) -> Result<Value> {
        let response = self
            .get_json(
                "/v1/finance/search",
                &[
                    ("q", ticker.to_string()),
                    ("quotesCount", "0".to_string()),
                    ("newsCount", NEWS_COUNT.to_string()),
                ],
            )
            .await?;

        Ok(response.get("news").cloned().unwrap_or_else(|| json!([])))
    }
}
