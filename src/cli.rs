//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::config::{ProviderKind, SynthesizerKind};
use clap::Parser;
use std::path::PathBuf;

/// Tradeflow - event-driven multi-analyzer stock research
///
/// Collects market data for a symbol, fans it out to technical, fundamental,
/// sentiment and risk analyzers, and synthesizes one answer once every
/// analyzer has reported.
///
/// Examples:
///   tradeflow --symbol AAPL --query "Is now a good time to buy?"
///   tradeflow --symbol MSFT --provider alpha_vantage --format json --output -
///   tradeflow --symbol TSLA --synthesizer ollama --model llama3.2:latest
///   tradeflow --symbol NVDA --dry-run
///   tradeflow --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Ticker symbol to analyze
    #[arg(short, long, value_name = "SYMBOL", required_unless_present = "init_config")]
    pub symbol: Option<String>,

    /// Free-text question to answer about the symbol
    #[arg(short = 'Q', long, default_value = "", value_name = "TEXT")]
    pub query: String,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Output file path for the report (`-` for stdout)
    ///
    /// Default: from config or tradeflow_report.md
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Seconds to wait for the final result
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Seconds after which a run completes with the results it has (0 disables)
    #[arg(long, value_name = "SECS")]
    pub barrier_timeout: Option<u64>,

    /// Analysis workers to fan out to (comma-separated)
    ///
    /// Example: --workers technical_analyzer,risk_analyzer
    #[arg(long, value_name = "IDS", value_delimiter = ',')]
    pub workers: Option<Vec<String>>,

    /// Market data provider
    #[arg(long, value_name = "PROVIDER")]
    pub provider: Option<ProviderKind>,

    /// Alpha Vantage API key
    #[arg(long, env = "ALPHA_VANTAGE_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Disable the in-memory market data cache
    #[arg(long)]
    pub no_cache: bool,

    /// Synthesizer backend
    #[arg(long, value_name = "BACKEND")]
    pub synthesizer: Option<SynthesizerKind>,

    /// Ollama model used by the ollama synthesizer
    #[arg(short, long, env = "TRADEFLOW_MODEL")]
    pub model: Option<String>,

    /// Ollama API endpoint URL
    #[arg(long, env = "OLLAMA_URL")]
    pub ollama_url: Option<String>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .tradeflow.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Dry run: print the analysis plan without running it
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .tradeflow.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if self.symbol.as_deref().map_or(true, |s| s.trim().is_empty()) {
            return Err("A symbol is required (--symbol)".to_string());
        }

        if let Some(ref url) = self.ollama_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Ollama URL must start with 'http://' or 'https://'".to_string());
            }
        }

        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return Err("Timeout must be at least 1 second".to_string());
            }
        }

        if let Some(ref workers) = self.workers {
            if workers.iter().any(|w| w.trim().is_empty()) {
                return Err("Worker ids must not be empty".to_string());
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
