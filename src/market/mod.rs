//! Market data providers.
//!
//! A provider turns a symbol into a [`MarketData`] snapshot: daily price
//! history (oldest bar first) and, where available, a company overview.

pub mod alpha_vantage;
pub mod cache;
pub mod synthetic;

pub use alpha_vantage::AlphaVantageProvider;
pub use cache::CachedProvider;
pub use synthetic::SyntheticProvider;

use crate::config::{DataConfig, ProviderKind};
use crate::models::{fields, Payload, RequestKey};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// One daily bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Company fundamentals. Providers leave out what they do not know.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyOverview {
    pub name: Option<String>,
    pub sector: Option<String>,
    pub pe_ratio: Option<f64>,
    pub market_cap: Option<f64>,
    pub profit_margin: Option<f64>,
    /// Quarterly revenue growth, year over year, as a fraction.
    pub revenue_growth: Option<f64>,
    pub beta: Option<f64>,
    pub eps: Option<f64>,
    pub dividend_yield: Option<f64>,
}

/// Everything the analysis workers get to see for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    pub symbol: RequestKey,
    pub history: Vec<PriceBar>,
    pub overview: Option<CompanyOverview>,
    /// Name of the provider that produced the data.
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

impl MarketData {
    /// Closing prices, oldest first.
    pub fn closes(&self) -> Vec<f64> {
        self.history.iter().map(|bar| bar.close).collect()
    }

    pub fn latest_close(&self) -> Option<f64> {
        self.history.last().map(|bar| bar.close)
    }

    /// Encode as a `DataReady` payload.
    pub fn to_payload(&self) -> Result<Payload> {
        let mut payload = Payload::new();
        payload.insert(fields::SYMBOL.into(), Value::String(self.symbol.to_string()));
        payload.insert(
            fields::MARKET_DATA.into(),
            serde_json::to_value(self).context("Failed to encode market data")?,
        );
        Ok(payload)
    }

    /// Decode from a `DataReady` payload.
    pub fn from_payload(payload: &Payload) -> Result<Self> {
        let value = payload
            .get(fields::MARKET_DATA)
            .context("Payload carries no market data")?;
        Self::deserialize(value).context("Payload market data is malformed")
    }
}

/// Source of market data.
#[async_trait]
pub trait DataProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, symbol: &RequestKey) -> Result<MarketData>;
}

/// Build the configured provider, wrapped in a cache when enabled.
pub fn build_provider(config: &DataConfig) -> Result<Arc<dyn DataProvider>> {
    let provider: Arc<dyn DataProvider> = match config.provider {
        ProviderKind::Synthetic => Arc::new(SyntheticProvider::new(config.history_days)),
        ProviderKind::AlphaVantage => Arc::new(AlphaVantageProvider::new(config)?),
    };

    if config.cache_enabled && config.cache_ttl_seconds > 0 {
        info!(
            "Caching {} responses for {}s",
            provider.name(),
            config.cache_ttl_seconds
        );
        return Ok(Arc::new(CachedProvider::new(
            provider,
            Duration::from_secs(config.cache_ttl_seconds),
        )));
    }
    Ok(provider)
}
