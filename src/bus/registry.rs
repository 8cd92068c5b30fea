//! Worker registry and per-worker mailboxes.
//!
//! The registry is assembled once and frozen. Starting it gives every worker
//! its own FIFO mailbox drained by a dedicated task, so a slow worker only
//! delays its own queue and never the dispatcher.

use super::EventBus;
use crate::agent::Worker;
use crate::error::{panic_message, DispatchError, PipelineError};
use crate::models::{fields, Event, EventKind, Payload, WorkerId};
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// worker-id → worker, keys unique.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker. Ids must be unique.
    pub fn register(&mut self, worker: Arc<dyn Worker>) -> Result<(), PipelineError> {
        let id = worker.id().to_string();
        if self.workers.contains_key(&id) {
            return Err(PipelineError::DuplicateWorker(id));
        }
        debug!("Registered worker {}", id);
        self.workers.insert(id, worker);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.workers.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<_> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start one mailbox task per worker. Worker output is published to `bus`.
    pub fn start(self, bus: &EventBus) -> Mailboxes {
        let mut senders = HashMap::with_capacity(self.workers.len());
        let mut tasks = Vec::with_capacity(self.workers.len());

        for (id, worker) in self.workers {
            let (tx, rx) = mpsc::unbounded_channel();
            tasks.push(tokio::spawn(run_mailbox(worker, rx, bus.clone())));
            senders.insert(id, tx);
        }

        Mailboxes { senders, tasks }
    }
}

/// Running mailboxes, one per registered worker.
pub struct Mailboxes {
    senders: HashMap<WorkerId, mpsc::UnboundedSender<Event>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Mailboxes {
    /// Whether `id` is registered (its mailbox may still have stopped).
    pub fn contains(&self, id: &str) -> bool {
        self.senders.contains_key(id)
    }

    /// Whether `id` is registered and its mailbox still accepts events.
    pub fn is_open(&self, id: &str) -> bool {
        self.senders.get(id).is_some_and(|tx| !tx.is_closed())
    }

    /// Hand an event to its target's mailbox.
    pub fn deliver(&self, event: Event) -> Result<(), DispatchError> {
        let target = event
            .target
            .clone()
            .ok_or_else(|| DispatchError::UnknownTarget("-".to_string()))?;
        let sender = self
            .senders
            .get(&target)
            .ok_or_else(|| DispatchError::UnknownTarget(target.clone()))?;
        sender
            .send(event)
            .map_err(|_| DispatchError::UnknownTarget(target))
    }

    /// Stop every mailbox task.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Mailboxes {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drain one worker's mailbox in order until the bus goes away.
async fn run_mailbox(
    worker: Arc<dyn Worker>,
    mut inbox: mpsc::UnboundedReceiver<Event>,
    bus: EventBus,
) {
    while let Some(event) = inbox.recv().await {
        debug!("{} handling {}", worker.id(), event.describe());

        let produced = match AssertUnwindSafe(worker.handle(&event))
            .catch_unwind()
            .await
        {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                warn!("{} failed on {}: {:#}", worker.id(), event.kind, e);
                vec![failure_event(worker.as_ref(), &event, format!("{:#}", e))]
            }
            Err(panic) => {
                let cause = format!("worker panicked: {}", panic_message(panic.as_ref()));
                error!("{} {} on {}", worker.id(), cause, event.kind);
                vec![failure_event(worker.as_ref(), &event, cause)]
            }
        };

        let outgoing: Vec<Event> = produced
            .into_iter()
            .map(|out| stamp_correlation(&event, out))
            .collect();

        if bus.publish_batch(outgoing).is_err() {
            debug!("Bus closed, stopping mailbox of {}", worker.id());
            break;
        }
    }
}

/// Error event describing a failed (or panicked) handler invocation.
fn failure_event(worker: &dyn Worker, input: &Event, cause: String) -> Event {
    let mut payload = Payload::new();
    payload.insert(fields::STAGE.into(), Value::String(worker.stage().to_string()));
    payload.insert(fields::WORKER.into(), Value::String(worker.id().to_string()));
    payload.insert(fields::CAUSE.into(), Value::String(cause));
    payload.insert(
        fields::ORIGINAL_KIND.into(),
        Value::String(input.kind.to_string()),
    );
    Event::new(EventKind::Error, payload, worker.id())
}

/// Copy the correlation fields of `input` onto `output` where it lacks them.
fn stamp_correlation(input: &Event, mut output: Event) -> Event {
    let missing: Vec<&str> = fields::CORRELATION
        .into_iter()
        .filter(|key| input.payload.contains_key(*key) && !output.payload.contains_key(*key))
        .collect();

    if !missing.is_empty() {
        let payload = Arc::make_mut(&mut output.payload);
        for key in missing {
            if let Some(value) = input.payload.get(key) {
                payload.insert(key.to_string(), value.clone());
            }
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl Worker for Echo {
        fn id(&self) -> &str {
            "echo"
        }

        async fn handle(&self, event: &Event) -> Result<Vec<Event>> {
            let mut payload = Payload::new();
            payload.insert("echoed".into(), json!(event.kind.to_string()));
            Ok(vec![Event::new(EventKind::AnalysisCompleted, payload, "echo")])
        }
    }

    struct Faulty {
        panic: bool,
    }

    #[async_trait]
    impl Worker for Faulty {
        fn id(&self) -> &str {
            "faulty"
        }

        fn stage(&self) -> &str {
            "faulty_stage"
        }

        async fn handle(&self, _event: &Event) -> Result<Vec<Event>> {
            if self.panic {
                panic!("kaboom");
            }
            anyhow::bail!("could not compute")
        }
    }

    fn request(target: &str) -> Event {
        let payload = match json!({"symbol": "AAPL", "query": "q", "run_id": 3}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        Event::new(EventKind::DataReady, payload, "coordinator").to(target)
    }

    async fn next(rx: &mut super::super::BusReceiver) -> Vec<Event> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("worker did not publish")
            .expect("bus closed")
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = WorkerRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let err = registry.register(Arc::new(Echo)).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateWorker(id) if id == "echo"));
        assert_eq!(registry.ids(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn test_output_is_stamped_with_correlation() {
        let (bus, mut rx) = EventBus::new();
        let mut registry = WorkerRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let mailboxes = registry.start(&bus);

        mailboxes.deliver(request("echo")).unwrap();
        let out = next(&mut rx).await;

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].symbol(), Some("AAPL"));
        assert_eq!(out[0].run_id(), Some(3));
        assert_eq!(out[0].str_field("query"), Some("q"));
        assert_eq!(out[0].str_field("echoed"), Some("data_ready"));
    }

    #[tokio::test]
    async fn test_worker_error_becomes_error_event() {
        let (bus, mut rx) = EventBus::new();
        let mut registry = WorkerRegistry::new();
        registry.register(Arc::new(Faulty { panic: false })).unwrap();
        let mailboxes = registry.start(&bus);

        mailboxes.deliver(request("faulty")).unwrap();
        let out = next(&mut rx).await;

        assert_eq!(out[0].kind, EventKind::Error);
        assert_eq!(out[0].source, "faulty");
        assert_eq!(out[0].str_field("stage"), Some("faulty_stage"));
        assert_eq!(out[0].str_field("error"), Some("could not compute"));
        assert_eq!(out[0].symbol(), Some("AAPL"));
    }

    #[tokio::test]
    async fn test_panic_is_contained_and_mailbox_keeps_running() {
        let (bus, mut rx) = EventBus::new();
        let mut registry = WorkerRegistry::new();
        registry.register(Arc::new(Faulty { panic: true })).unwrap();
        let mailboxes = registry.start(&bus);

        mailboxes.deliver(request("faulty")).unwrap();
        let first = next(&mut rx).await;
        assert!(first[0]
            .str_field("error")
            .is_some_and(|cause| cause.contains("kaboom")));

        mailboxes.deliver(request("faulty")).unwrap();
        let second = next(&mut rx).await;
        assert_eq!(second[0].kind, EventKind::Error);
        assert!(mailboxes.is_open("faulty"));
    }

    #[tokio::test]
    async fn test_deliver_to_unknown_target() {
        let (bus, _rx) = EventBus::new();
        let mailboxes = WorkerRegistry::new().start(&bus);
        assert!(matches!(
            mailboxes.deliver(request("ghost")),
            Err(DispatchError::UnknownTarget(id)) if id == "ghost"
        ));
    }
}
