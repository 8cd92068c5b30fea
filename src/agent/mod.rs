//! Workers that take part in the analysis pipeline.
//!
//! A worker consumes the events it is interested in and answers with zero or
//! more new events. Workers never talk to each other; the bus routes their
//! output.

pub mod analyzers;
pub mod data_collector;
pub mod synthesizer;

pub use analyzers::build_analysis_worker;
pub use data_collector::DataCollector;
pub use synthesizer::{build_synthesizer, Synthesizer};

use crate::models::Event;
use anyhow::Result;
use async_trait::async_trait;

/// Id of the data-provisioning worker (plan entry 0).
pub const DATA_COLLECTOR: &str = "data_collector";
/// Id of the aggregator that owns the fan-in barrier.
pub const AGGREGATOR: &str = "results_synthesizer";
/// Source id used by the dispatcher for events it creates itself.
pub const COORDINATOR: &str = "coordinator";
/// Source id used for caller requests.
pub const CALLER: &str = "system";

pub const TECHNICAL: &str = "technical_analyzer";
pub const FUNDAMENTAL: &str = "fundamental_analyzer";
pub const SENTIMENT: &str = "sentiment_analyzer";
pub const RISK: &str = "risk_analyzer";

/// The default analysis set, in plan order.
pub fn default_analysis_workers() -> Vec<String> {
    [TECHNICAL, FUNDAMENTAL, SENTIMENT, RISK]
        .into_iter()
        .map(String::from)
        .collect()
}

/// A named unit of work driven by the bus.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Unique id the worker is registered and addressed under.
    fn id(&self) -> &str;

    /// Stage name reported in error events when this worker fails.
    fn stage(&self) -> &str {
        self.id()
    }

    /// Handle one delivered event.
    ///
    /// Returning `Err` is a worker failure: the runtime turns it into an
    /// `Error` event carrying the stage, symbol and cause.
    async fn handle(&self, event: &Event) -> Result<Vec<Event>>;
}
