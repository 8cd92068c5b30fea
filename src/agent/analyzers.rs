//! Analysis workers.
//!
//! Each analysis worker wraps a pure [`Analyzer`]: market data in, analysis
//! fields out. The worker handles the bus side (decoding `DataReady`,
//! tagging the output with its agent type).

use super::{Worker, FUNDAMENTAL, RISK, SENTIMENT, TECHNICAL};
use crate::market::MarketData;
use crate::models::{fields, Event, EventKind, Payload, WorkerId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Trading days per year, for annualising.
const TRADING_DAYS: f64 = 252.0;

/// A pure analysis over market data.
pub trait Analyzer: Send + Sync {
    /// Stage name reported when the analysis fails.
    fn stage(&self) -> &str;

    fn process(&self, data: &MarketData) -> Result<Payload>;
}

/// Bus adapter around an [`Analyzer`].
pub struct AnalysisWorker {
    id: WorkerId,
    analyzer: Box<dyn Analyzer>,
}

impl AnalysisWorker {
    pub fn new(id: impl Into<WorkerId>, analyzer: Box<dyn Analyzer>) -> Self {
        Self {
            id: id.into(),
            analyzer,
        }
    }
}

#[async_trait]
impl Worker for AnalysisWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn stage(&self) -> &str {
        self.analyzer.stage()
    }

    async fn handle(&self, event: &Event) -> Result<Vec<Event>> {
        if event.kind != EventKind::DataReady {
            debug!("{} ignores {} events", self.id, event.kind);
            return Ok(Vec::new());
        }

        let data = MarketData::from_payload(&event.payload)?;
        let mut output = self.analyzer.process(&data)?;
        output.insert(fields::AGENT_TYPE.into(), Value::String(self.id.clone()));

        Ok(vec![Event::new(
            EventKind::AnalysisCompleted,
            output,
            self.id.clone(),
        )])
    }
}

/// The built-in analysis worker registered under `id`, if there is one.
pub fn build_analysis_worker(id: &str) -> Option<AnalysisWorker> {
    let analyzer: Box<dyn Analyzer> = match id {
        TECHNICAL => Box::new(TechnicalAnalyzer),
        FUNDAMENTAL => Box::new(FundamentalAnalyzer),
        SENTIMENT => Box::new(SentimentAnalyzer),
        RISK => Box::new(RiskAnalyzer),
        _ => return None,
    };
    Some(AnalysisWorker::new(id, analyzer))
}

fn to_fields<T: Serialize>(report: &T) -> Result<Payload> {
    match serde_json::to_value(report).context("Failed to encode analysis")? {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("analysis did not encode as an object"),
    }
}

// ---------------------------------------------------------------------------
// Technical
// ---------------------------------------------------------------------------

pub struct TechnicalAnalyzer;

#[derive(Debug, Serialize)]
struct TechnicalReport {
    latest_close: f64,
    sma_50: Option<f64>,
    sma_200: Option<f64>,
    rsi_14: f64,
    trend: &'static str,
    rsi_signal: &'static str,
    headline: String,
}

impl Analyzer for TechnicalAnalyzer {
    fn stage(&self) -> &str {
        "technical_analysis"
    }

    fn process(&self, data: &MarketData) -> Result<Payload> {
        let closes = data.closes();
        let latest_close = data.latest_close().context("No closing prices")?;
        let rsi_14 = rsi(&closes, 14)
            .with_context(|| format!("RSI-14 needs at least 15 closes, got {}", closes.len()))?;
        let sma_50 = sma(&closes, 50);
        let sma_200 = sma(&closes, 200);

        let trend = match (sma_50, sma_200) {
            (Some(short), Some(long)) if latest_close > short && short > long => "bullish",
            (Some(short), Some(long)) if latest_close < short && short < long => "bearish",
            (Some(short), None) if latest_close > short => "bullish",
            (Some(short), None) if latest_close < short => "bearish",
            _ => "neutral",
        };
        let rsi_signal = if rsi_14 >= 70.0 {
            "overbought"
        } else if rsi_14 <= 30.0 {
            "oversold"
        } else {
            "neutral"
        };

        to_fields(&TechnicalReport {
            latest_close,
            sma_50,
            sma_200,
            rsi_14: round2(rsi_14),
            trend,
            rsi_signal,
            headline: format!(
                "Trend is {} with RSI-14 at {:.1} ({})",
                trend, rsi_14, rsi_signal
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Fundamental
// ---------------------------------------------------------------------------

pub struct FundamentalAnalyzer;

#[derive(Debug, Serialize)]
struct FundamentalReport {
    company: Option<String>,
    sector: Option<String>,
    pe_ratio: Option<f64>,
    market_cap: Option<f64>,
    profit_margin: Option<f64>,
    revenue_growth: Option<f64>,
    eps: Option<f64>,
    dividend_yield: Option<f64>,
    valuation: &'static str,
    headline: String,
}

impl Analyzer for FundamentalAnalyzer {
    fn stage(&self) -> &str {
        "fundamental_analysis"
    }

    fn process(&self, data: &MarketData) -> Result<Payload> {
        let overview = data
            .overview
            .as_ref()
            .with_context(|| format!("No company overview for {}", data.symbol))?;

        let valuation = match overview.pe_ratio {
            Some(pe) if pe <= 0.0 => "unprofitable",
            Some(pe) if pe < 15.0 => "undervalued",
            Some(pe) if pe < 25.0 => "fairly valued",
            Some(_) => "premium",
            None => "unknown",
        };

        let growth = overview
            .revenue_growth
            .map(|g| format!("revenue growth {:+.1}%", g * 100.0))
            .unwrap_or_else(|| "revenue growth unknown".to_string());

        to_fields(&FundamentalReport {
            company: overview.name.clone(),
            sector: overview.sector.clone(),
            pe_ratio: overview.pe_ratio,
            market_cap: overview.market_cap,
            profit_margin: overview.profit_margin,
            revenue_growth: overview.revenue_growth,
            eps: overview.eps,
            dividend_yield: overview.dividend_yield,
            valuation,
            headline: format!("Valuation looks {}, {}", valuation, growth),
        })
    }
}

// ---------------------------------------------------------------------------
// Sentiment
// ---------------------------------------------------------------------------

/// Market sentiment read from price momentum.
pub struct SentimentAnalyzer;

#[derive(Debug, Serialize)]
struct SentimentReport {
    /// Medium-term (20 day) momentum score in `[0, 1]`.
    news_sentiment: f64,
    /// Short-term (5 day) momentum score in `[0, 1]`.
    social_sentiment: f64,
    overall: &'static str,
    headline: String,
}

impl Analyzer for SentimentAnalyzer {
    fn stage(&self) -> &str {
        "sentiment_analysis"
    }

    fn process(&self, data: &MarketData) -> Result<Payload> {
        let closes = data.closes();
        let medium = period_return(&closes, 20)
            .with_context(|| format!("Momentum needs 21 closes, got {}", closes.len()))?;
        let short = period_return(&closes, 5).unwrap_or(medium);

        // A 10% move maps to roughly 0.73 / 0.27.
        let news_sentiment = round2(logistic(medium * 10.0));
        let social_sentiment = round2(logistic(short * 20.0));
        let blended = (news_sentiment + social_sentiment) / 2.0;
        let overall = if blended >= 0.6 {
            "bullish"
        } else if blended <= 0.4 {
            "bearish"
        } else {
            "neutral"
        };

        to_fields(&SentimentReport {
            news_sentiment,
            social_sentiment,
            overall,
            headline: format!(
                "Sentiment is {} ({:+.1}% over 20 days)",
                overall,
                medium * 100.0
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

pub struct RiskAnalyzer;

#[derive(Debug, Serialize)]
struct RiskReport {
    volatility: f64,
    max_drawdown: f64,
    value_at_risk_95: f64,
    beta: Option<f64>,
    risk_level: &'static str,
    headline: String,
}

impl Analyzer for RiskAnalyzer {
    fn stage(&self) -> &str {
        "risk_analysis"
    }

    fn process(&self, data: &MarketData) -> Result<Payload> {
        let closes = data.closes();
        let returns = daily_returns(&closes);
        if returns.len() < 2 {
            anyhow::bail!("Risk metrics need at least 3 closes, got {}", closes.len());
        }

        let volatility = std_dev(&returns) * TRADING_DAYS.sqrt();
        let max_drawdown = max_drawdown(&closes);
        let value_at_risk_95 = percentile(&returns, 0.05);
        let beta = data.overview.as_ref().and_then(|o| o.beta);

        let risk_level = if volatility > 0.45 || max_drawdown > 0.35 {
            "high"
        } else if volatility > 0.25 || max_drawdown > 0.2 {
            "moderate"
        } else {
            "low"
        };

        to_fields(&RiskReport {
            volatility: round4(volatility),
            max_drawdown: round4(max_drawdown),
            value_at_risk_95: round4(value_at_risk_95),
            beta,
            risk_level,
            headline: format!(
                "Risk is {}: {:.1}% annualised volatility, {:.1}% max drawdown",
                risk_level,
                volatility * 100.0,
                max_drawdown * 100.0
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Indicators
// ---------------------------------------------------------------------------

/// Simple moving average of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(round2(window.iter().sum::<f64>() / period as f64))
}

/// Wilder's relative strength index.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() <= period {
        return None;
    }

    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let (seed, rest) = changes.split_at(period);

    let mut avg_gain = seed.iter().filter(|c| **c > 0.0).sum::<f64>() / period as f64;
    let mut avg_loss = -seed.iter().filter(|c| **c < 0.0).sum::<f64>() / period as f64;

    for change in rest {
        let (gain, loss) = if *change > 0.0 {
            (*change, 0.0)
        } else {
            (0.0, -*change)
        };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

fn period_return(closes: &[f64], days: usize) -> Option<f64> {
    if closes.len() <= days {
        return None;
    }
    let last = *closes.last()?;
    let base = closes[closes.len() - 1 - days];
    (base > 0.0).then(|| last / base - 1.0)
}

fn daily_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

fn std_dev(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.sqrt()
}

/// Largest peak-to-trough decline, as a positive fraction.
fn max_drawdown(closes: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst: f64 = 0.0;
    for close in closes {
        peak = peak.max(*close);
        if peak > 0.0 {
            worst = worst.max(1.0 - close / peak);
        }
    }
    worst
}

fn percentile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let index = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[index]
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
