//! Expanding one `DataReady` signal into per-worker deliveries.

use crate::agent::COORDINATOR;
use crate::error::DispatchError;
use crate::models::{fields, Event, EventKind, WorkerId};
use serde_json::Value;
use std::sync::Arc;

/// Fans a provider's data out to the configured analysis set plus the aggregator.
#[derive(Debug, Clone)]
pub struct FanOutRouter {
    workers: Vec<WorkerId>,
    aggregator: WorkerId,
}

impl FanOutRouter {
    pub fn new(workers: Vec<WorkerId>, aggregator: impl Into<WorkerId>) -> Self {
        Self {
            workers,
            aggregator: aggregator.into(),
        }
    }

    pub fn workers(&self) -> &[WorkerId] {
        &self.workers
    }

    /// Build the whole batch, or nothing.
    ///
    /// `is_available` tells whether a target can currently receive events. If
    /// any target cannot, no event is produced and the first unavailable
    /// target is reported.
    pub fn expand<F>(&self, event: &Event, is_available: F) -> Result<Vec<Event>, DispatchError>
    where
        F: Fn(&str) -> bool,
    {
        let targets: Vec<&WorkerId> = self
            .workers
            .iter()
            .chain(std::iter::once(&self.aggregator))
            .collect();

        if let Some(missing) = targets.iter().find(|id| !is_available(id.as_str())) {
            return Err(DispatchError::UnknownTarget((*missing).clone()));
        }

        Ok(targets
            .into_iter()
            .map(|target| Event {
                kind: EventKind::DataReady,
                payload: Arc::clone(&event.payload),
                source: COORDINATOR.to_string(),
                target: Some(target.clone()),
                priority: event.priority,
                timestamp: chrono::Utc::now(),
            })
            .collect())
    }

    /// Signal sent to the aggregator instead of a batch that could not be built.
    pub fn abort_notice(&self, event: &Event, reason: &DispatchError) -> Event {
        let mut payload = event.correlation();
        payload.insert(fields::REASON.into(), Value::String(reason.to_string()));
        Event::new(EventKind::BarrierAborted, payload, COORDINATOR).to(self.aggregator.clone())
    }
}
