//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.tradeflow.toml` files.

use crate::agent::default_analysis_workers;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default config file name, looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = ".tradeflow.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Pipeline timing and wiring.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Synthesizer settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Market data settings.
    #[serde(default)]
    pub data: DataConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default report path; `-` writes to stdout.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
        }
    }
}

fn default_output() -> String {
    "tradeflow_report.md".to_string()
}

/// Pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How long a caller waits for the final result.
    #[serde(default = "default_result_timeout")]
    pub result_timeout_seconds: u64,

    /// After this long a run completes with whatever arrived. 0 disables.
    #[serde(default = "default_barrier_timeout")]
    pub barrier_timeout_seconds: u64,

    /// Analysis workers every plan fans out to.
    #[serde(default = "default_analysis_workers")]
    pub analysis_workers: Vec<String>,

    /// Number of recent errors kept for inspection.
    #[serde(default = "default_error_history")]
    pub error_history: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            result_timeout_seconds: default_result_timeout(),
            barrier_timeout_seconds: default_barrier_timeout(),
            analysis_workers: default_analysis_workers(),
            error_history: default_error_history(),
        }
    }
}

impl PipelineConfig {
    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_seconds)
    }

    pub fn barrier_timeout(&self) -> Option<Duration> {
        (self.barrier_timeout_seconds > 0).then(|| Duration::from_secs(self.barrier_timeout_seconds))
    }
}

fn default_result_timeout() -> u64 {
    120
}

fn default_barrier_timeout() -> u64 {
    90
}

fn default_error_history() -> usize {
    64
}

/// Which synthesizer produces the narrative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SynthesizerKind {
    /// Offline template (default)
    #[default]
    Template,
    /// Local model served by Ollama
    Ollama,
}

/// Synthesizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Synthesizer backend.
    #[serde(default)]
    pub backend: SynthesizerKind,

    /// Ollama model name.
    #[serde(default = "default_model")]
    pub name: String,

    /// Ollama API URL.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds.
    #[serde(default = "default_model_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: SynthesizerKind::default(),
            name: default_model(),
            ollama_url: default_ollama_url(),
            temperature: default_temperature(),
            timeout_seconds: default_model_timeout(),
        }
    }
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_model_timeout() -> u64 {
    90
}

/// Where market data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Deterministic offline data (default)
    #[default]
    Synthetic,
    /// Alpha Vantage HTTP API
    #[value(name = "alpha_vantage", alias = "alpha-vantage")]
    AlphaVantage,
}

/// Market data settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Data provider.
    #[serde(default)]
    pub provider: ProviderKind,

    /// Alpha Vantage query endpoint.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Alpha Vantage API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Cache provider responses in memory.
    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// How long a cached response stays fresh.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,

    /// Number of daily bars to analyse.
    #[serde(default = "default_history_days")]
    pub history_days: usize,

    /// HTTP timeout for provider requests.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            base_url: default_base_url(),
            api_key: None,
            cache_enabled: true,
            cache_ttl_seconds: default_cache_ttl(),
            history_days: default_history_days(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "https://www.alphavantage.co/query".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_history_days() -> usize {
    260 // enough for SMA-200 with room to spare
}

fn default_request_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// where they were actually given.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref output) = args.output {
            self.general.output = output.display().to_string();
        }
        if args.verbose {
            self.general.verbose = true;
        }

        if let Some(timeout) = args.timeout {
            self.pipeline.result_timeout_seconds = timeout;
        }
        if let Some(barrier) = args.barrier_timeout {
            self.pipeline.barrier_timeout_seconds = barrier;
        }
        if let Some(ref workers) = args.workers {
            self.pipeline.analysis_workers = workers.clone();
        }

        if let Some(backend) = args.synthesizer {
            self.model.backend = backend;
        }
        if let Some(ref model) = args.model {
            self.model.name = model.clone();
        }
        if let Some(ref url) = args.ollama_url {
            self.model.ollama_url = url.clone();
        }

        if let Some(provider) = args.provider {
            self.data.provider = provider;
        }
        if let Some(ref key) = args.api_key {
            self.data.api_key = Some(key.clone());
        }
        if args.no_cache {
            self.data.cache_enabled = false;
        }
    }

    /// Log level after merging: `verbose` in the file raises the CLI level,
    /// `--quiet` still wins.
    pub fn log_level(&self, args: &crate::cli::Args) -> tracing::Level {
        if self.general.verbose && !args.quiet {
            tracing::Level::DEBUG
        } else {
            args.log_level()
        }
    }

    /// Check values that deserialize fine but cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.result_timeout_seconds == 0 {
            anyhow::bail!("pipeline.result_timeout_seconds must be at least 1");
        }
        let mut seen = HashSet::new();
        for worker in &self.pipeline.analysis_workers {
            if worker.trim().is_empty() {
                anyhow::bail!("pipeline.analysis_workers contains an empty id");
            }
            if !seen.insert(worker.as_str()) {
                anyhow::bail!("pipeline.analysis_workers lists '{}' twice", worker);
            }
        }
        if !(0.0..=1.0).contains(&self.model.temperature) {
            anyhow::bail!("model.temperature must be between 0.0 and 1.0");
        }
        if self.data.history_days == 0 {
            anyhow::bail!("data.history_days must be at least 1");
        }
        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
