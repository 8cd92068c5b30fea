//! Tradeflow - event-driven multi-analyzer stock research
//!
//! A CLI tool that collects market data for a symbol, fans it out to a set
//! of analyzers over an in-process event bus, and synthesizes their results
//! into one report once every analyzer has reported.
//!
//! Exit codes:
//!   0 - Run finished (complete or partial result)
//!   1 - Run failed, or a runtime error (invalid request, configuration, etc.)
//!   2 - Timed out waiting for the result

mod agent;
mod analysis;
mod bus;
mod cli;
mod config;
mod coordinator;
mod error;
mod market;
mod models;
mod report;

use agent::{build_analysis_worker, build_synthesizer, DataCollector, DATA_COLLECTOR};
use anyhow::{Context, Result};
use chrono::Utc;
use cli::{Args, OutputFormat};
use config::{Config, DEFAULT_CONFIG_FILE};
use coordinator::{Coordinator, CoordinatorSettings, PlanBuilder};
use error::PipelineError;
use indicatif::{ProgressBar, ProgressStyle};
use models::{fields, Contribution, Payload, RequestKey, RunStatus};
use report::{Report, ReportMetadata};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // The config file may turn on verbose output, so read it before logging
    let config = match prepare_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    init_logging(config.log_level(&args));

    info!("Tradeflow v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args, config).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Analysis failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .tradeflow.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to choose the data provider, analyzers, synthesizer and timeouts.");
    Ok(())
}

/// Initialize logging. `RUST_LOG` wins over the verbosity settings when set.
fn init_logging(level: tracing::Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run one analysis end to end. Returns the exit code.
async fn run(args: Args, config: Config) -> Result<i32> {
    let start_time = Instant::now();

    let symbol = args
        .symbol
        .clone()
        .context("A symbol is required (--symbol)")?;

    if args.dry_run {
        return handle_dry_run(&config, &symbol, &args.query);
    }

    // Step 1: Wire up the pipeline
    let provider = market::build_provider(&config.data)?;
    let synthesizer = build_synthesizer(&config.model)?;
    let provider_name = provider.name().to_string();
    let synthesizer_name = synthesizer.name().to_string();

    if !args.quiet {
        println!("🧭 Starting pipeline...");
        println!("   Data provider: {}", provider_name);
        println!(
            "   Analyzers: {}",
            config.pipeline.analysis_workers.join(", ")
        );
        println!("   Synthesizer: {}", synthesizer_name);
        println!("   Timeout: {}s", config.pipeline.result_timeout_seconds);
    }

    let mut builder = Coordinator::builder(CoordinatorSettings::from(&config.pipeline));
    builder.worker(Arc::new(DataCollector::new(provider)))?;
    for id in &config.pipeline.analysis_workers {
        let worker = build_analysis_worker(id)
            .with_context(|| format!("Unknown analysis worker '{}'", id))?;
        builder.worker(Arc::new(worker))?;
    }
    builder.synthesizer(synthesizer);
    let coordinator = builder.start()?;

    // Step 2: Submit and wait
    let key = RequestKey::parse(&symbol)?;
    let spinner = progress_spinner(args.quiet);
    spinner.set_message(format!("Analyzing {}...", key));

    let submit = coordinator.submit(&symbol, &args.query);
    tokio::pin!(submit);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let outcome = loop {
        tokio::select! {
            outcome = &mut submit => break outcome,
            _ = ticker.tick() => {
                if let Some((received, expected)) = coordinator.progress(&key) {
                    spinner.set_message(format!(
                        "Analyzing {}: {}/{} analyzers reported",
                        key, received, expected
                    ));
                }
            }
        }
    };
    spinner.finish_and_clear();

    debug!("Barrier statistics: {:?}", coordinator.barrier_stats());
    for record in coordinator.errors() {
        debug!(
            "Recorded error in {} from {}: {}",
            record.stage, record.source, record.cause
        );
    }

    let result = match outcome {
        Ok(result) => result,
        Err(PipelineError::TimedOut { key, after }) => match coordinator.latest_result() {
            // Landed between the deadline and now
            Some(late) if late.symbol == key => {
                warn!("Result for {} arrived just after the {:?} deadline", key, after);
                late
            }
            _ => {
                eprintln!(
                    "\n⏱️  Timed out after {}s waiting for {}. Try a larger --timeout or --barrier-timeout.",
                    after.as_secs(),
                    key
                );
                return Ok(2);
            }
        },
        Err(e) => return Err(e.into()),
    };
    coordinator.shutdown();

    // Step 3: Render and save the report
    let duration = start_time.elapsed().as_secs_f64();
    let report = Report {
        metadata: ReportMetadata {
            provider: provider_name,
            synthesizer: synthesizer_name,
            generated_at: Utc::now(),
            duration_seconds: duration,
        },
        result,
    };

    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(&report)?,
        OutputFormat::Markdown => report::generate_markdown_report(&report),
    };

    let destination = config.general.output.as_str();
    if destination == "-" {
        println!("{}", output);
    } else {
        std::fs::write(destination, &output)
            .with_context(|| format!("Failed to write report to {}", destination))?;
    }

    if !args.quiet {
        print_summary(&report, destination, coordinator.error_count());
    }

    if report.result.status == RunStatus::Failed {
        warn!(
            "Run for {} failed: {}",
            report.result.symbol,
            report.result.error.as_deref().unwrap_or("unknown cause")
        );
    }

    Ok(report.exit_code())
}

fn progress_spinner(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

fn print_summary(report: &Report, destination: &str, errors: usize) {
    let result = &report.result;

    println!("\n📊 Analysis Summary:");
    println!("   Symbol: {}", result.symbol);
    println!("   Status: {}", result.status);
    for (worker, contribution) in &result.details {
        let mark = match contribution {
            Contribution::Completed { .. } => "✅",
            Contribution::Failed { .. } => "❌",
            Contribution::Missing => "⏳",
        };
        println!("   {} {}", mark, worker);
    }
    if errors > 0 {
        println!("   Errors recorded: {}", errors);
    }
    if let Some(ref narrative) = result.narrative {
        if !narrative.summary.is_empty() {
            println!("\n   {}", narrative.summary);
        }
    }
    println!("   Duration: {:.1}s", report.metadata.duration_seconds);

    if destination != "-" {
        println!("\n✅ Analysis complete! Report saved to: {}", destination);
    }
}

/// Handle --dry-run: build and print the plan, run nothing.
fn handle_dry_run(config: &Config, symbol: &str, query: &str) -> Result<i32> {
    println!("\n🔍 Dry run: planning only (no data is fetched)...\n");

    let mut request = Payload::new();
    request.insert(fields::SYMBOL.into(), Value::String(symbol.to_string()));
    request.insert(fields::QUERY.into(), Value::String(query.to_string()));

    let planner = PlanBuilder::new(DATA_COLLECTOR, config.pipeline.analysis_workers.clone());
    let plan = planner.build(&request)?;

    println!("   Symbol: {}", plan.key);
    if !plan.query.is_empty() {
        println!("   Question: {}", plan.query);
    }
    for (i, step) in plan.steps.iter().enumerate() {
        if step.depends_on.is_empty() {
            println!("     {}. {}", i, step.worker);
        } else {
            println!(
                "     {}. {} (after {})",
                i,
                step.worker,
                step.depends_on.join(", ")
            );
        }
    }
    match config.pipeline.barrier_timeout() {
        Some(after) => println!("\n   Partial results after {}s", after.as_secs()),
        None => println!("\n   Waits for every analyzer"),
    }

    println!("\n✅ Dry run complete. No data was fetched.");
    Ok(0)
}

/// Load, merge and validate the configuration.
///
/// Runs before logging is up, so problems go straight to stderr.
fn prepare_config(args: &Args) -> Result<Config> {
    let mut config = load_config(args)?;
    config.merge_with_args(args);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => Ok(config),
        Ok(None) => Ok(Config::default()),
        Err(e) => {
            eprintln!("⚠️  Ignoring {}: {:#}", DEFAULT_CONFIG_FILE, e);
            Ok(Config::default())
        }
    }
}
