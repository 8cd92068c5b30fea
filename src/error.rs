//! Error types for the coordination engine.
//!
//! Only [`PipelineError`] crosses the boundary to the caller. Everything that
//! goes wrong inside the bus stays inside it as an `Error` event; the
//! [`DispatchError`] type describes faults of the routing layer itself.

use crate::models::{EventKind, RequestKey};
use std::time::Duration;
use thiserror::Error;

/// A request that was rejected before it entered the bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required request field is absent.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A field is present but has the wrong JSON type.
    #[error("field '{field}' must be a {expected}")]
    WrongType {
        /// Field name
        field: &'static str,
        /// Expected JSON type
        expected: &'static str,
    },

    /// The asset symbol is not usable as a request key.
    #[error("invalid symbol '{symbol}': {reason}")]
    InvalidSymbol {
        /// Raw symbol as supplied
        symbol: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// The free-text query exceeds the accepted length.
    #[error("query is too long ({len} characters, at most {max} allowed)")]
    QueryTooLong {
        /// Actual length in characters
        len: usize,
        /// Maximum accepted length
        max: usize,
    },
}

/// Errors visible to the caller of the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed request
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// The barrier did not complete before the caller's deadline
    #[error("analysis for {key} timed out after {}s", .after.as_secs_f64())]
    TimedOut {
        /// Request that timed out
        key: RequestKey,
        /// How long the caller waited
        after: Duration,
    },

    /// The bus (or the gate behind it) is no longer running
    #[error("pipeline is shut down")]
    Shutdown,

    /// Two workers share the same id
    #[error("worker '{0}' is registered twice")]
    DuplicateWorker(String),

    /// Invalid pipeline wiring or settings
    #[error("configuration error: {0}")]
    Config(String),
}

/// Faults raised while routing a single event.
///
/// The dispatcher never lets these escape its loop; they are converted into
/// `Error` events addressed to the error sink.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No routing rule matched the event
    #[error("no route for {kind} event from '{origin}'")]
    Unroutable {
        /// Event kind
        kind: EventKind,
        /// Worker that published the event
        origin: String,
    },

    /// The coordination request failed validation inside the bus
    #[error("plan rejected: {0}")]
    Plan(#[from] ValidationError),

    /// A payload did not have the shape its kind requires
    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload {
        /// Event kind
        kind: EventKind,
        /// What was wrong
        reason: String,
    },

    /// A target is not registered or its mailbox stopped
    #[error("worker '{0}' is not available")]
    UnknownTarget(String),

    /// Routing code panicked
    #[error("routing panicked: {0}")]
    Panicked(String),

    /// The bus queue is closed
    #[error("event bus is closed")]
    BusClosed,
}

/// Render a caught panic payload as text.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let err = PipelineError::TimedOut {
            key: RequestKey::parse("AAPL").unwrap(),
            after: Duration::from_secs(120),
        };
        assert_eq!(err.to_string(), "analysis for AAPL timed out after 120s");
    }

    #[test]
    fn test_validation_converts_into_pipeline_error() {
        let err: PipelineError = ValidationError::MissingField("symbol").into();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(
            err.to_string(),
            "invalid request: missing required field: symbol"
        );
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(payload.as_ref()), "owned boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
