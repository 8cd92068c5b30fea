//! The single consumer of the bus.
//!
//! Routing precedence, first match wins:
//! 1. explicit target that is registered: delivered to its mailbox
//! 2. `CoordinationNeeded`: planned, then plan notice and root requests are
//!    published as one batch
//! 3. `Error`: recorded; a worker failure naming a symbol is also forwarded
//!    to the aggregator
//! 4. `DataReady` from the provider: fanned out
//! 5. `AnalysisCompleted`: the aggregator's is the final result, anyone
//!    else's is forwarded to the aggregator
//!
//! Anything else is unroutable. A routing fault never ends the loop.

use super::{BusReceiver, EventBus, Mailboxes};
use crate::agent::COORDINATOR;
use crate::coordinator::{AnalysisPlan, CompletionGate, FanOutRouter, PlanBuilder};
use crate::error::{panic_message, DispatchError};
use crate::models::{fields, Event, EventKind, FinalResult, Payload, WorkerId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Stage name reported for routing faults.
const DISPATCH_STAGE: &str = "dispatch";

/// Fixed wiring the dispatcher routes by.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Worker whose `DataReady` output is fanned out.
    pub provider: WorkerId,
    /// Worker that owns the fan-in barrier.
    pub aggregator: WorkerId,
    /// Time box after which the barrier completes with what it has.
    pub barrier_timeout: Option<Duration>,
}

/// One recorded `Error` event.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub stage: String,
    pub symbol: Option<String>,
    pub cause: String,
    pub source: WorkerId,
    pub at: DateTime<Utc>,
}

/// Sink for `Error` events: counts them and keeps the most recent ones.
#[derive(Debug)]
pub struct ErrorSink {
    capacity: usize,
    recent: Mutex<VecDeque<ErrorRecord>>,
    total: AtomicUsize,
}

impl ErrorSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            total: AtomicUsize::new(0),
        }
    }

    /// Record an `Error` event.
    pub fn record(&self, event: &Event) -> ErrorRecord {
        let record = ErrorRecord {
            stage: event.str_field(fields::STAGE).unwrap_or("unknown").to_string(),
            symbol: event.symbol().map(String::from),
            cause: event
                .str_field(fields::CAUSE)
                .unwrap_or("unspecified error")
                .to_string(),
            source: event.source.clone(),
            at: event.timestamp,
        };

        error!(
            "Error in stage {} from {} ({}): {}",
            record.stage,
            record.source,
            record.symbol.as_deref().unwrap_or("no symbol"),
            record.cause
        );

        self.total.fetch_add(1, Ordering::Relaxed);
        if self.capacity > 0 {
            let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
            while recent.len() >= self.capacity {
                recent.pop_front();
            }
            recent.push_back(record.clone());
        }
        record
    }

    /// Most recent records, oldest first.
    pub fn recent(&self) -> Vec<ErrorRecord> {
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Number of errors recorded since start.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }
}

pub struct Dispatcher {
    bus: EventBus,
    mailboxes: Mailboxes,
    planner: PlanBuilder,
    fan_out: FanOutRouter,
    gate: Arc<CompletionGate>,
    errors: Arc<ErrorSink>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        bus: EventBus,
        mailboxes: Mailboxes,
        planner: PlanBuilder,
        fan_out: FanOutRouter,
        gate: Arc<CompletionGate>,
        errors: Arc<ErrorSink>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            bus,
            mailboxes,
            planner,
            fan_out,
            gate,
            errors,
            settings,
        }
    }

    /// Drain the bus until every publisher is gone.
    pub async fn run(self, mut receiver: BusReceiver) {
        info!(
            "Dispatcher running: provider {}, aggregator {}, fan-out to {:?}",
            self.settings.provider,
            self.settings.aggregator,
            self.fan_out.workers()
        );

        while let Some(batch) = receiver.recv().await {
            for event in batch {
                self.dispatch(event);
            }
        }

        debug!("Bus drained, dispatcher stopping");
    }

    /// Route one event, containing any fault.
    pub fn dispatch(&self, event: Event) {
        debug!("Dispatching {}", event.describe());

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| self.route(event.clone())))
            .unwrap_or_else(|panic| Err(DispatchError::Panicked(panic_message(panic.as_ref()))));

        if let Err(failure) = outcome {
            self.report_failure(&event, &failure);
        }
    }

    fn route(&self, event: Event) -> Result<(), DispatchError> {
        if let Some(target) = event.target.as_deref() {
            if self.mailboxes.contains(target) {
                return self.mailboxes.deliver(event);
            }
        }

        match event.kind {
            EventKind::CoordinationNeeded => self.coordinate(&event),
            EventKind::Error => self.forward_error(&event),
            EventKind::DataReady if event.source == self.settings.provider => {
                self.expand(&event)
            }
            EventKind::AnalysisCompleted if event.source == self.settings.aggregator => {
                self.complete(&event)
            }
            EventKind::AnalysisCompleted => self.to_aggregator(&event),
            kind => Err(DispatchError::Unroutable {
                kind,
                origin: event.source.clone(),
            }),
        }
    }

    fn coordinate(&self, event: &Event) -> Result<(), DispatchError> {
        let plan = self.planner.build(&event.payload)?;
        info!(
            "Planned run {} for {}: {} analysis step(s)",
            plan.run_id,
            plan.key,
            plan.expected().len()
        );

        // The notice goes first so the aggregator knows the expected set
        // before any result can reach it.
        let mut batch = vec![Event::new(
            EventKind::PlanCreated,
            plan.notice_payload(),
            COORDINATOR,
        )
        .to(self.settings.aggregator.clone())];
        batch.extend(plan.roots().map(|step| {
            Event::new(
                EventKind::AnalysisRequested,
                plan.request_payload(step),
                COORDINATOR,
            )
            .to(step.worker.clone())
        }));
        self.bus.publish_batch(batch)?;

        if let Some(after) = self.settings.barrier_timeout {
            self.arm_deadline(&plan, after);
        }
        Ok(())
    }

    fn arm_deadline(&self, plan: &AnalysisPlan, after: Duration) {
        let mut payload = Payload::new();
        payload.insert(fields::SYMBOL.into(), Value::String(plan.key.to_string()));
        payload.insert(fields::RUN_ID.into(), Value::from(plan.run_id));
        let deadline = Event::new(EventKind::BarrierDeadline, payload, COORDINATOR)
            .to(self.settings.aggregator.clone());

        let bus = self.bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if bus.publish(deadline).is_err() {
                debug!("Bus closed before barrier deadline fired");
            }
        });
    }

    fn forward_error(&self, event: &Event) -> Result<(), DispatchError> {
        self.errors.record(event);

        let from_worker = event.source != self.settings.aggregator
            && self.mailboxes.contains(&event.source);
        if from_worker && event.symbol().is_some() {
            return self.to_aggregator(event);
        }
        Ok(())
    }

    fn expand(&self, event: &Event) -> Result<(), DispatchError> {
        match self.fan_out.expand(event, |id| self.mailboxes.is_open(id)) {
            Ok(batch) => {
                debug!(
                    "Fanning out data for {} to {} target(s)",
                    event.symbol().unwrap_or("no symbol"),
                    batch.len()
                );
                self.bus.publish_batch(batch)
            }
            Err(reason) => {
                warn!(
                    "Fan-out for {} aborted: {}",
                    event.symbol().unwrap_or("no symbol"),
                    reason
                );
                self.bus.publish(self.fan_out.abort_notice(event, &reason))?;
                Err(reason)
            }
        }
    }

    fn complete(&self, event: &Event) -> Result<(), DispatchError> {
        let result =
            FinalResult::from_payload(&event.payload).map_err(|e| DispatchError::MalformedPayload {
                kind: event.kind,
                reason: format!("{:#}", e),
            })?;

        info!(
            "Run {} for {} finished: {} ({} ok, {} failed)",
            result.run_id,
            result.symbol,
            result.status,
            result.completed_count(),
            result.failed_count()
        );
        self.gate.publish_result(result);
        Ok(())
    }

    fn to_aggregator(&self, event: &Event) -> Result<(), DispatchError> {
        if !self.mailboxes.contains(&self.settings.aggregator) {
            return Err(DispatchError::UnknownTarget(self.settings.aggregator.clone()));
        }
        self.bus.publish(event.retarget(self.settings.aggregator.clone()))
    }

    /// Turn a routing fault into an `Error` event. Faults on `Error` events
    /// are only logged.
    fn report_failure(&self, event: &Event, failure: &DispatchError) {
        if event.kind == EventKind::Error {
            error!("Dropping {} after routing failure: {}", event.describe(), failure);
            return;
        }

        warn!("Routing {} failed: {}", event.describe(), failure);

        let mut payload = event.correlation();
        payload.insert(fields::STAGE.into(), Value::String(DISPATCH_STAGE.into()));
        payload.insert(fields::WORKER.into(), Value::String(COORDINATOR.into()));
        payload.insert(fields::CAUSE.into(), Value::String(failure.to_string()));
        payload.insert(
            fields::ORIGINAL_KIND.into(),
            Value::String(event.kind.to_string()),
        );

        if self
            .bus
            .publish(Event::new(EventKind::Error, payload, COORDINATOR))
            .is_err()
        {
            error!("Bus closed, routing failure for {} lost", event.kind);
        }
    }
}
