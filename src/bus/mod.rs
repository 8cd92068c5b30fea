//! Event bus: an ordered queue drained by a single dispatcher.
//!
//! Every `publish` is one queue item, and so is every `publish_batch`; the
//! dispatcher handles items strictly in enqueue order. A batch is therefore
//! contiguous and all-or-nothing, which is what fan-out relies on.

pub mod dispatcher;
pub mod registry;

pub use dispatcher::{DispatchSettings, Dispatcher, ErrorRecord, ErrorSink};
pub use registry::{Mailboxes, WorkerRegistry};

use crate::error::DispatchError;
use crate::models::Event;
use tokio::sync::mpsc;

/// Publishing half of the bus. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: mpsc::UnboundedSender<Vec<Event>>,
}

/// Consuming half of the bus, owned by the dispatcher.
#[derive(Debug)]
pub struct BusReceiver {
    receiver: mpsc::UnboundedReceiver<Vec<Event>>,
}

impl EventBus {
    /// Create a bus and the receiver its dispatcher will drain.
    pub fn new() -> (Self, BusReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, BusReceiver { receiver })
    }

    /// Enqueue one event. Never blocks.
    pub fn publish(&self, event: Event) -> Result<(), DispatchError> {
        self.sender
            .send(vec![event])
            .map_err(|_| DispatchError::BusClosed)
    }

    /// Enqueue several events as a single contiguous item.
    pub fn publish_batch(&self, events: Vec<Event>) -> Result<(), DispatchError> {
        if events.is_empty() {
            return Ok(());
        }
        self.sender
            .send(events)
            .map_err(|_| DispatchError::BusClosed)
    }

    /// Whether the dispatcher side has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl BusReceiver {
    /// Next queue item, or `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<Vec<Event>> {
        self.receiver.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventKind, Payload};

    fn event(kind: EventKind, source: &str) -> Event {
        Event::new(kind, Payload::new(), source)
    }

    #[tokio::test]
    async fn test_publish_preserves_fifo_order() {
        let (bus, mut rx) = EventBus::new();

        bus.publish(event(EventKind::CoordinationNeeded, "a")).unwrap();
        bus.publish_batch(vec![
            event(EventKind::PlanCreated, "b"),
            event(EventKind::AnalysisRequested, "c"),
        ])
        .unwrap();
        bus.publish(event(EventKind::DataReady, "d")).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].source, "a");

        let batch = rx.recv().await.unwrap();
        let sources: Vec<_> = batch.iter().map(|e| e.source.as_str()).collect();
        assert_eq!(sources, vec!["b", "c"]);

        let last = rx.recv().await.unwrap();
        assert_eq!(last[0].kind, EventKind::DataReady);
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_enqueued() {
        let (bus, mut rx) = EventBus::new();
        bus.publish_batch(Vec::new()).unwrap();
        bus.publish(event(EventKind::Error, "x")).unwrap();

        let item = rx.recv().await.unwrap();
        assert_eq!(item[0].source, "x");
    }

    #[test]
    fn test_publish_after_receiver_dropped() {
        let (bus, rx) = EventBus::new();
        drop(rx);
        assert!(bus.is_closed());
        assert!(matches!(
            bus.publish(event(EventKind::Error, "x")),
            Err(DispatchError::BusClosed)
        ));
    }
}
