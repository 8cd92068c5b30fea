//! Turning collected contributions into a narrative.
//!
//! Two backends: a local Ollama model asked for a JSON answer, and an offline
//! template that summarises the analyzers' own headlines.

use crate::config::{ModelConfig, SynthesizerKind};
use crate::models::{Contribution, RequestKey, Synthesis, WorkerId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Produces the final narrative for a run.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(
        &self,
        results: &BTreeMap<WorkerId, Contribution>,
        query: &str,
        symbol: &RequestKey,
    ) -> Result<Synthesis>;
}

/// Build the configured synthesizer.
pub fn build_synthesizer(config: &ModelConfig) -> Result<Arc<dyn Synthesizer>> {
    Ok(match config.backend {
        SynthesizerKind::Template => Arc::new(TemplateSynthesizer),
        SynthesizerKind::Ollama => Arc::new(OllamaSynthesizer::new(config)?),
    })
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// Deterministic offline narrative.
pub struct TemplateSynthesizer;

#[async_trait]
impl Synthesizer for TemplateSynthesizer {
    fn name(&self) -> &str {
        "template"
    }

    async fn synthesize(
        &self,
        results: &BTreeMap<WorkerId, Contribution>,
        query: &str,
        symbol: &RequestKey,
    ) -> Result<Synthesis> {
        Ok(compose(results, query, symbol))
    }
}

fn compose(
    results: &BTreeMap<WorkerId, Contribution>,
    query: &str,
    symbol: &RequestKey,
) -> Synthesis {
    if results.is_empty() {
        return Synthesis {
            summary: format!("No analyses were requested for {}.", symbol),
            confidence_level: "low".to_string(),
            next_steps: vec!["Request at least one analysis".to_string()],
            ..Synthesis::default()
        };
    }

    let mut insights = Vec::new();
    let mut risks = Vec::new();
    let mut next_steps = Vec::new();
    let mut score = 0i32;

    for (worker, contribution) in results {
        match contribution {
            Contribution::Completed { fields } => {
                let text = |key: &str| fields.get(key).and_then(Value::as_str);
                if let Some(headline) = text("headline") {
                    insights.push(format!("{}: {}", label(worker), headline));
                }
                for key in ["trend", "overall"] {
                    match text(key) {
                        Some("bullish") => score += 1,
                        Some("bearish") => score -= 1,
                        _ => {}
                    }
                }
                match text("valuation") {
                    Some("undervalued") => score += 1,
                    Some("premium") | Some("unprofitable") => score -= 1,
                    _ => {}
                }
                match text("risk_level") {
                    Some("high") => {
                        score -= 1;
                        risks.push("Price swings are large; size positions accordingly".to_string());
                    }
                    Some("moderate") => {
                        risks.push("Volatility is moderate".to_string());
                    }
                    _ => {}
                }
            }
            Contribution::Failed { cause } => {
                risks.push(format!("{} failed: {}", label(worker), cause));
                next_steps.push(format!("Re-run the {} once it recovers", label(worker)));
            }
            Contribution::Missing => {
                risks.push(format!("{} did not report in time", label(worker)));
                next_steps.push(format!("Re-run the {}", label(worker)));
            }
        }
    }

    let completed = results.values().filter(|c| c.is_completed()).count();
    let confidence = if completed == results.len() && completed >= 3 {
        "high"
    } else if completed * 2 >= results.len() {
        "medium"
    } else {
        "low"
    };

    let (stance, recommendation) = match score {
        s if s >= 2 => ("constructive", "Consider building a position gradually"),
        s if s <= -2 => ("cautious", "Consider reducing exposure"),
        _ => ("mixed", "Hold and wait for a clearer signal"),
    };

    if next_steps.is_empty() {
        next_steps.push(format!("Review {} again after the next earnings report", symbol));
    }

    let question = if query.is_empty() {
        String::new()
    } else {
        format!(" Question: \"{}\".", query)
    };

    Synthesis {
        summary: format!(
            "The picture for {} is {} based on {} of {} analyses.{}",
            symbol,
            stance,
            completed,
            results.len(),
            question
        ),
        key_insights: insights,
        recommendations: vec![recommendation.to_string()],
        confidence_level: confidence.to_string(),
        risks,
        next_steps,
    }
}

/// `technical_analyzer` → `technical analyzer`.
fn label(worker: &str) -> String {
    worker.replace('_', " ")
}

// ---------------------------------------------------------------------------
// Ollama
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    format: &'static str,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
}

/// Narrative from a local model served by Ollama.
pub struct OllamaSynthesizer {
    http_client: reqwest::Client,
    ollama_url: String,
    model_name: String,
    temperature: f32,
    timeout_seconds: u64,
}

impl OllamaSynthesizer {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        info!(
            "Initializing synthesizer with model {} at {}",
            config.name, config.ollama_url
        );

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            ollama_url: config.ollama_url.trim_end_matches('/').to_string(),
            model_name: config.name.clone(),
            temperature: config.temperature,
            timeout_seconds: config.timeout_seconds,
        })
    }

    async fn chat(&self, prompt: String) -> Result<String> {
        let url = format!("{}/api/chat", self.ollama_url);

        let request = OllamaChatRequest {
            model: self.model_name.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt,
                },
            ],
            stream: false,
            format: "json",
            options: OllamaOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow::anyhow!("Request timed out after {}s", self.timeout_seconds)
                } else if e.is_connect() {
                    anyhow::anyhow!(
                        "Cannot connect to Ollama at {}. Is Ollama running?",
                        self.ollama_url
                    )
                } else {
                    anyhow::anyhow!("Failed to send request: {}", e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Ollama API error {}: {}", status, body));
        }

        let chat_response: OllamaChatResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        Ok(chat_response.message.content)
    }
}

#[async_trait]
impl Synthesizer for OllamaSynthesizer {
    fn name(&self) -> &str {
        &self.model_name
    }

    async fn synthesize(
        &self,
        results: &BTreeMap<WorkerId, Contribution>,
        query: &str,
        symbol: &RequestKey,
    ) -> Result<Synthesis> {
        let prompt = build_prompt(results, query, symbol)?;
        debug!("Synthesis prompt for {} is {} chars", symbol, prompt.len());

        let answer = self.chat(prompt).await?;
        parse_synthesis(&answer)
    }
}

fn build_prompt(
    results: &BTreeMap<WorkerId, Contribution>,
    query: &str,
    symbol: &RequestKey,
) -> Result<String> {
    let analyses =
        serde_json::to_string_pretty(results).context("Failed to encode analysis results")?;
    Ok(format!(
        "Symbol: {}\nUser question: {}\n\nAnalysis results:\n{}\n\n\
         Answer with a JSON object with the keys summary, key_insights, \
         recommendations, confidence_level, risks and next_steps.",
        symbol,
        if query.is_empty() { "(none)" } else { query },
        analyses
    ))
}

/// Parse the model's answer, tolerating text around the JSON object.
fn parse_synthesis(answer: &str) -> Result<Synthesis> {
    let trimmed = answer.trim();
    if let Ok(synthesis) = serde_json::from_str::<Synthesis>(trimmed) {
        return Ok(synthesis);
    }

    let start = trimmed.find('{').context("Model answer contains no JSON object")?;
    let end = trimmed.rfind('}').context("Model answer contains no JSON object")?;
    if end < start {
        anyhow::bail!("Model answer contains no JSON object");
    }
    serde_json::from_str(&trimmed[start..=end]).context("Model answer is not a valid synthesis")
}

const SYSTEM_PROMPT: &str = r#"You are a senior financial analyst.
You receive the output of several automated analyses of one stock (technical,
fundamental, sentiment, risk). Some analyses may have failed or be missing;
say so where it matters. Combine them into a balanced answer to the user's
question. Respond with JSON only, no markdown."#;
