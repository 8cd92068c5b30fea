//! Coordination: planning, fan-out, and the caller-facing entry point.
//!
//! [`Coordinator`] owns the bus and everything hanging off it. Callers only
//! ever see [`Coordinator::submit`], which publishes a request and waits on
//! the completion gate for its final result.

pub mod fanout;
pub mod gate;
pub mod plan;


pub use fanout::FanOutRouter;
pub use gate::CompletionGate;
pub use plan::{validate_query, AnalysisPlan, PlanBuilder};

use crate::agent::{
    default_analysis_workers, Synthesizer, Worker, AGGREGATOR, CALLER, DATA_COLLECTOR,
};
use crate::analysis::{AggregatorWorker, BarrierStats, FanInBarrier};
use crate::bus::{DispatchSettings, Dispatcher, ErrorRecord, ErrorSink, EventBus, WorkerRegistry};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::{fields, Event, EventKind, FinalResult, Payload, RequestKey, WorkerId};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Runtime knobs of a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// How long `submit` waits for a final result.
    pub result_timeout: Duration,
    /// Time box for partial completion, `None` to wait for every worker.
    pub barrier_timeout: Option<Duration>,
    /// Workers the provider's data is fanned out to.
    pub analysis_workers: Vec<WorkerId>,
    /// Number of recent errors kept for inspection.
    pub error_history: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            result_timeout: Duration::from_secs(120),
            barrier_timeout: None,
            analysis_workers: default_analysis_workers(),
            error_history: 64,
        }
    }
}

impl From<&PipelineConfig> for CoordinatorSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            result_timeout: config.result_timeout(),
            barrier_timeout: config.barrier_timeout(),
            analysis_workers: config.analysis_workers.clone(),
            error_history: config.error_history,
        }
    }
}

/// Collects workers and a synthesizer before the bus starts.
pub struct CoordinatorBuilder {
    registry: WorkerRegistry,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    settings: CoordinatorSettings,
}

impl CoordinatorBuilder {
    /// Register a worker. Ids must be unique.
    pub fn worker(&mut self, worker: Arc<dyn Worker>) -> Result<&mut Self, PipelineError> {
        if worker.id() == AGGREGATOR {
            return Err(PipelineError::Config(format!(
                "'{}' is reserved for the aggregator",
                AGGREGATOR
            )));
        }
        self.registry.register(worker)?;
        Ok(self)
    }

    pub fn synthesizer(&mut self, synthesizer: Arc<dyn Synthesizer>) -> &mut Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    /// Freeze the registry and start the dispatcher and every mailbox.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<Coordinator, PipelineError> {
        let Self {
            mut registry,
            synthesizer,
            settings,
        } = self;

        let synthesizer = synthesizer
            .ok_or_else(|| PipelineError::Config("no synthesizer configured".to_string()))?;

        if !registry.contains(DATA_COLLECTOR) {
            return Err(PipelineError::Config(format!(
                "data provider worker '{}' is not registered",
                DATA_COLLECTOR
            )));
        }
        for id in &settings.analysis_workers {
            if id == DATA_COLLECTOR || id == AGGREGATOR {
                return Err(PipelineError::Config(format!(
                    "'{}' cannot be an analysis worker",
                    id
                )));
            }
            if !registry.contains(id) {
                warn!("Analysis worker {} is not registered, runs will abort", id);
            }
        }

        let barrier = Arc::new(FanInBarrier::new());
        registry.register(Arc::new(AggregatorWorker::new(
            AGGREGATOR,
            DATA_COLLECTOR,
            Arc::clone(&barrier),
            Arc::clone(&synthesizer),
        )))?;

        info!(
            "Starting pipeline with workers {:?}, synthesizer {}",
            registry.ids(),
            synthesizer.name()
        );

        let (bus, receiver) = EventBus::new();
        let mailboxes = registry.start(&bus);
        let gate = Arc::new(CompletionGate::new());
        let errors = Arc::new(ErrorSink::new(settings.error_history));

        let dispatcher = Dispatcher::new(
            bus.clone(),
            mailboxes,
            PlanBuilder::new(DATA_COLLECTOR, settings.analysis_workers.clone()),
            FanOutRouter::new(settings.analysis_workers.clone(), AGGREGATOR),
            Arc::clone(&gate),
            Arc::clone(&errors),
            DispatchSettings {
                provider: DATA_COLLECTOR.to_string(),
                aggregator: AGGREGATOR.to_string(),
                barrier_timeout: settings.barrier_timeout,
            },
        );
        let task = tokio::spawn(dispatcher.run(receiver));

        Ok(Coordinator {
            bus,
            gate,
            errors,
            barrier,
            settings,
            task,
        })
    }
}

/// A running pipeline.
pub struct Coordinator {
    bus: EventBus,
    gate: Arc<CompletionGate>,
    errors: Arc<ErrorSink>,
    barrier: Arc<FanInBarrier>,
    settings: CoordinatorSettings,
    task: JoinHandle<()>,
}

impl Coordinator {
    pub fn builder(settings: CoordinatorSettings) -> CoordinatorBuilder {
        CoordinatorBuilder {
            registry: WorkerRegistry::new(),
            synthesizer: None,
            settings,
        }
    }

    /// Analyze `symbol` and wait for the final result.
    pub async fn submit(&self, symbol: &str, query: &str) -> Result<FinalResult, PipelineError> {
        self.submit_within(symbol, query, self.settings.result_timeout)
            .await
    }

    /// Like [`Coordinator::submit`] with an explicit wait bound.
    ///
    /// Timing out does not cancel the run; its result still lands in
    /// [`Coordinator::latest_result`] when it arrives.
    pub async fn submit_within(
        &self,
        symbol: &str,
        query: &str,
        timeout: Duration,
    ) -> Result<FinalResult, PipelineError> {
        let key = RequestKey::parse(symbol)?;
        let query = query.trim();
        validate_query(query)?;

        if self.task.is_finished() || self.bus.is_closed() {
            return Err(PipelineError::Shutdown);
        }

        // Register before publishing so a fast pipeline cannot finish first.
        let waiter = self.gate.register(&key);

        let mut payload = Payload::new();
        payload.insert(fields::SYMBOL.into(), Value::String(key.to_string()));
        payload.insert(fields::QUERY.into(), Value::String(query.to_string()));
        self.bus
            .publish(Event::new(EventKind::CoordinationNeeded, payload, CALLER))
            .map_err(|_| PipelineError::Shutdown)?;

        info!("Submitted {} (waiting up to {:?})", key, timeout);
        let result = self.gate.await_result(waiter, timeout).await?;

        // Waiters share one key per symbol; a newer request answers them all.
        if result.query != query {
            warn!(
                "Result for {} (run {}) answers {:?}, not {:?}",
                key, result.run_id, result.query, query
            );
        }
        Ok(result)
    }

    /// Recent `Error` events, oldest first.
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.recent()
    }

    /// Number of `Error` events seen since start.
    pub fn error_count(&self) -> usize {
        self.errors.total()
    }

    pub fn barrier_stats(&self) -> BarrierStats {
        self.barrier.stats()
    }

    /// `(received, expected)` for a run still in flight.
    pub fn progress(&self, key: &RequestKey) -> Option<(usize, usize)> {
        self.barrier.progress(key)
    }

    /// Most recent final result of any symbol.
    pub fn latest_result(&self) -> Option<FinalResult> {
        self.gate.latest()
    }

    /// Stop the dispatcher. Its mailboxes stop with it.
    pub fn shutdown(&self) {
        if !self.task.is_finished() {
            debug!("Shutting down dispatcher");
            self.task.abort();
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
