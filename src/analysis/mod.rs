//! Fan-in side of the pipeline.
//!
//! The barrier decides when a run is done; the aggregator worker feeds it and
//! turns released runs into final results.

pub mod aggregator;
pub mod barrier;

pub use aggregator::AggregatorWorker;
pub use barrier::{BarrierStats, FanInBarrier};
