//! Alpha Vantage HTTP provider.
//!
//! Uses the `TIME_SERIES_DAILY` and `OVERVIEW` functions. Alpha Vantage
//! reports most failures with a 200 status and an explanatory body, so every
//! response is checked for those before it is parsed.

use super::{CompanyOverview, DataProvider, MarketData, PriceBar};
use crate::config::DataConfig;
use crate::models::RequestKey;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct AlphaVantageProvider {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    history_days: usize,
    timeout_seconds: u64,
}

impl AlphaVantageProvider {
    pub fn new(config: &DataConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .context("Alpha Vantage needs an API key (set data.api_key or ALPHA_VANTAGE_KEY)")?;

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            base_url: config.base_url.clone(),
            api_key,
            history_days: config.history_days.max(1),
            timeout_seconds: config.request_timeout_seconds,
        })
    }

    async fn query(&self, function: &str, symbol: &RequestKey, extra: &[(&str, &str)]) -> Result<Value> {
        debug!("Fetching {} for {}", function, symbol);

        let mut params = vec![
            ("function", function),
            ("symbol", symbol.as_str()),
            ("apikey", self.api_key.as_str()),
        ];
        params.extend_from_slice(extra);

        let response = self
            .http_client
            .get(&self.base_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow::anyhow!("Request timed out after {}s", self.timeout_seconds)
                } else if e.is_connect() {
                    anyhow::anyhow!("Cannot connect to Alpha Vantage at {}", self.base_url)
                } else {
                    anyhow::anyhow!("Failed to send request: {}", e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Alpha Vantage error {}: {}", status, body));
        }

        let body: Value = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", function))?;
        check_api_errors(&body)?;
        Ok(body)
    }
}

#[async_trait]
impl DataProvider for AlphaVantageProvider {
    fn name(&self) -> &str {
        "alpha_vantage"
    }

    async fn fetch(&self, symbol: &RequestKey) -> Result<MarketData> {
        let output_size = if self.history_days > 100 { "full" } else { "compact" };
        let series = self
            .query("TIME_SERIES_DAILY", symbol, &[("outputsize", output_size)])
            .await?;
        let history = parse_daily_series(&series, self.history_days)
            .with_context(|| format!("Unusable price history for {}", symbol))?;

        // The overview is optional; ETFs and indices have none.
        let overview = match self.query("OVERVIEW", symbol, &[]).await {
            Ok(body) => parse_overview(&body),
            Err(e) => {
                warn!("No overview for {}: {:#}", symbol, e);
                None
            }
        };

        info!(
            "Fetched {} bars for {} from Alpha Vantage",
            history.len(),
            symbol
        );

        Ok(MarketData {
            symbol: symbol.clone(),
            history,
            overview,
            source: self.name().to_string(),
            fetched_at: Utc::now(),
        })
    }
}

/// Fail on the error bodies Alpha Vantage returns with a 200 status.
pub fn check_api_errors(body: &Value) -> Result<()> {
    if let Some(message) = body.get("Error Message").and_then(Value::as_str) {
        anyhow::bail!("Alpha Vantage rejected the request: {}", message);
    }
    if let Some(note) = body.get("Note").and_then(Value::as_str) {
        anyhow::bail!("Alpha Vantage rate limit exceeded: {}", note);
    }
    if let Some(info) = body.get("Information").and_then(Value::as_str) {
        if info.to_lowercase().contains("rate limit") {
            anyhow::bail!("Alpha Vantage rate limit exceeded: {}", info);
        }
        anyhow::bail!("Alpha Vantage returned no data: {}", info);
    }
    Ok(())
}

/// Parse a `TIME_SERIES_DAILY` body into at most `limit` bars, oldest first.
pub fn parse_daily_series(body: &Value, limit: usize) -> Result<Vec<PriceBar>> {
    let series = body
        .get("Time Series (Daily)")
        .and_then(Value::as_object)
        .context("Response has no daily time series")?;

    let mut bars = series
        .iter()
        .map(|(date, bar)| {
            let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .with_context(|| format!("Bad date '{}'", date))?;
            let field = |name: &str| -> Result<f64> {
                bar.get(name)
                    .and_then(Value::as_str)
                    .and_then(|raw| raw.parse::<f64>().ok())
                    .with_context(|| format!("Missing '{}' on {}", name, date))
            };
            Ok(PriceBar {
                date,
                open: field("1. open")?,
                high: field("2. high")?,
                low: field("3. low")?,
                close: field("4. close")?,
                volume: field("5. volume")? as u64,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if bars.is_empty() {
        anyhow::bail!("Daily time series is empty");
    }

    bars.sort_by_key(|bar| bar.date);
    if bars.len() > limit {
        bars.drain(..bars.len() - limit);
    }
    Ok(bars)
}

/// Parse an `OVERVIEW` body. An empty object means no overview exists.
pub fn parse_overview(body: &Value) -> Option<CompanyOverview> {
    let object = body.as_object().filter(|o| !o.is_empty())?;

    let text = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty() && *s != "None" && *s != "-")
            .map(String::from)
    };
    let number = |key: &str| text(key).and_then(|s| s.parse::<f64>().ok());

    Some(CompanyOverview {
        name: text("Name"),
        sector: text("Sector"),
        pe_ratio: number("PERatio"),
        market_cap: number("MarketCapitalization"),
        profit_margin: number("ProfitMargin"),
        revenue_growth: number("QuarterlyRevenueGrowthYOY"),
        beta: number("Beta"),
        eps: number("EPS"),
        dividend_yield: number("DividendYield"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_message_body() {
        let body = json!({"Error Message": "Invalid API call."});
        let err = check_api_errors(&body).unwrap_err();
        assert!(err.to_string().contains("Invalid API call"));
    }

    #[test]
    fn test_rate_limit_body() {
        let body = json!({"Information": "Our standard API rate limit is 25 requests per day."});
        let err = check_api_errors(&body).unwrap_err();
        assert!(err.to_string().contains("rate limit exceeded"));

        assert!(check_api_errors(&json!({"Time Series (Daily)": {}})).is_ok());
    }

    #[test]
    fn test_parse_daily_series() {
        let body = json!({
            "Meta Data": {"2. Symbol": "IBM"},
            "Time Series (Daily)": {
                "2024-03-15": {"1. open": "191.99", "2. high": "193.06", "3. low": "190.70",
                               "4. close": "191.07", "5. volume": "8828184"},
                "2024-03-13": {"1. open": "197.55", "2. high": "198.10", "3. low": "195.32",
                               "4. close": "196.70", "5. volume": "3960737"},
                "2024-03-14": {"1. open": "196.95", "2. high": "197.75", "3. low": "192.12",
                               "4. close": "193.43", "5. volume": "4102167"}
            }
        });

        let bars = parse_daily_series(&body, 2).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, NaiveDate::from_ymd_opt(2024, 3, 14).unwrap());
        assert_eq!(bars[1].close, 191.07);
        assert_eq!(bars[1].volume, 8_828_184);
    }

    #[test]
    fn test_parse_daily_series_rejects_garbage() {
        assert!(parse_daily_series(&json!({}), 10).is_err());
        let body = json!({"Time Series (Daily)": {"2024-03-15": {"1. open": "n/a"}}});
        assert!(parse_daily_series(&body, 10).is_err());
    }

    #[test]
    fn test_parse_overview() {
        let body = json!({
            "Symbol": "IBM", "Name": "International Business Machines",
            "Sector": "TECHNOLOGY", "PERatio": "22.9", "MarketCapitalization": "175000000000",
            "ProfitMargin": "0.121", "QuarterlyRevenueGrowthYOY": "0.041",
            "Beta": "0.71", "EPS": "8.14", "DividendYield": "None"
        });

        let overview = parse_overview(&body).unwrap();
        assert_eq!(overview.pe_ratio, Some(22.9));
        assert_eq!(overview.beta, Some(0.71));
        assert_eq!(overview.dividend_yield, None);
        assert!(parse_overview(&json!({})).is_none());
    }

    #[test]
    fn test_missing_api_key() {
        let config = DataConfig {
            api_key: None,
            ..DataConfig::default()
        };
        assert!(AlphaVantageProvider::new(&config).is_err());
    }
}
