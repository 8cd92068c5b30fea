//! Deterministic offline provider.
//!
//! Every symbol gets its own reproducible random walk, seeded from the
//! symbol text, so runs are repeatable without network access.

use super::{CompanyOverview, DataProvider, MarketData, PriceBar};
use crate::models::RequestKey;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, Utc, Weekday};
use tracing::debug;

pub struct SyntheticProvider {
    history_days: usize,
}

impl SyntheticProvider {
    pub fn new(history_days: usize) -> Self {
        Self {
            history_days: history_days.max(1),
        }
    }

    /// Generate a series ending on `last_day`.
    pub fn generate(&self, symbol: &RequestKey, last_day: NaiveDate) -> MarketData {
        let mut rng = Lcg::new(seed(symbol.as_str()));

        let start_price = 20.0 + rng.next_f64() * 480.0;
        let drift = (rng.next_f64() - 0.35) * 0.003;
        let volatility = 0.008 + rng.next_f64() * 0.022;
        let base_volume = 500_000.0 + rng.next_f64() * 20_000_000.0;

        let days = trading_days(last_day, self.history_days);
        let mut history = Vec::with_capacity(days.len());
        let mut close = start_price;

        for date in days {
            let open = close;
            let shock = (rng.next_f64() - 0.5) * 2.0 * volatility;
            close = (open * (1.0 + drift + shock)).max(0.01);
            let spread = open.max(close) * volatility * rng.next_f64();
            history.push(PriceBar {
                date,
                open: round2(open),
                high: round2(open.max(close) + spread),
                low: round2((open.min(close) - spread).max(0.01)),
                close: round2(close),
                volume: (base_volume * (0.5 + rng.next_f64())) as u64,
            });
        }

        let eps = 0.5 + rng.next_f64() * 12.0;
        let shares = 50_000_000.0 + rng.next_f64() * 5_000_000_000.0;
        let overview = CompanyOverview {
            name: Some(format!("{} Holdings", symbol)),
            sector: Some(SECTORS[(rng.next_u64() % SECTORS.len() as u64) as usize].to_string()),
            pe_ratio: Some(round2(close / eps)),
            market_cap: Some((close * shares).round()),
            profit_margin: Some(round2(rng.next_f64() * 0.35 - 0.05)),
            revenue_growth: Some(round2(rng.next_f64() * 0.4 - 0.1)),
            beta: Some(round2(0.4 + rng.next_f64() * 1.6)),
            eps: Some(round2(eps)),
            dividend_yield: Some(round2(rng.next_f64() * 0.04)),
        };

        MarketData {
            symbol: symbol.clone(),
            history,
            overview: Some(overview),
            source: "synthetic".to_string(),
            fetched_at: Utc::now(),
        }
    }
}

#[async_trait]
impl DataProvider for SyntheticProvider {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn fetch(&self, symbol: &RequestKey) -> Result<MarketData> {
        debug!("Generating {} synthetic bars for {}", self.history_days, symbol);
        Ok(self.generate(symbol, Utc::now().date_naive()))
    }
}

const SECTORS: [&str; 6] = [
    "Technology",
    "Healthcare",
    "Financials",
    "Energy",
    "Consumer Discretionary",
    "Industrials",
];

/// The last `count` weekdays up to and including `last_day`, oldest first.
fn trading_days(last_day: NaiveDate, count: usize) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(count);
    let mut day = last_day;
    while days.len() < count {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            days.push(day);
        }
        day -= Duration::days(1);
    }
    days.reverse();
    days
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// FNV-1a over the symbol bytes.
fn seed(symbol: &str) -> u64 {
    symbol.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

struct Lcg(u64);

impl Lcg {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u64(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 11
    }

    /// Uniform in `[0, 1)`.
    fn next_f64(&mut self) -> f64 {
        self.next_u64() as f64 / (1u64 << 53) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_same_symbol_same_series() {
        let provider = SyntheticProvider::new(60);
        let symbol = RequestKey::parse("AAPL").unwrap();
        let a = provider.generate(&symbol, day(2024, 3, 15));
        let b = provider.generate(&symbol, day(2024, 3, 15));
        assert_eq!(a.history, b.history);
        assert_eq!(a.overview, b.overview);
    }

    #[test]
    fn test_symbols_differ() {
        let provider = SyntheticProvider::new(10);
        let a = provider.generate(&RequestKey::parse("AAPL").unwrap(), day(2024, 3, 15));
        let b = provider.generate(&RequestKey::parse("MSFT").unwrap(), day(2024, 3, 15));
        assert_ne!(a.closes(), b.closes());
    }

    #[test]
    fn test_bars_are_sane() {
        let provider = SyntheticProvider::new(250);
        let data = provider.generate(&RequestKey::parse("TSLA").unwrap(), day(2024, 3, 15));

        assert_eq!(data.history.len(), 250);
        assert_eq!(data.history.last().unwrap().date, day(2024, 3, 15));
        assert!(data.history.windows(2).all(|w| w[0].date < w[1].date));
        assert!(data
            .history
            .iter()
            .all(|bar| bar.low <= bar.close && bar.close <= bar.high && bar.low > 0.0));
    }

    #[test]
    fn test_trading_days_skip_weekends() {
        // 2024-03-18 is a Monday.
        let days = trading_days(day(2024, 3, 18), 3);
        assert_eq!(days, vec![day(2024, 3, 14), day(2024, 3, 15), day(2024, 3, 18)]);
    }
}
