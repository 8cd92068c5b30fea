//! Data models for the coordination engine.
//!
//! This module contains the event envelope that travels over the bus, the
//! request key used to correlate a pipeline run, and the final result handed
//! back to the caller.

use crate::error::ValidationError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Opaque structured payload carried by an event.
pub type Payload = serde_json::Map<String, Value>;

/// Name of a registered worker.
pub type WorkerId = String;

/// Well-known payload field names.
pub mod fields {
    pub const SYMBOL: &str = "symbol";
    pub const QUERY: &str = "query";
    pub const RUN_ID: &str = "run_id";
    pub const EXPECTED: &str = "expected_agents";
    pub const STAGE: &str = "stage";
    pub const CAUSE: &str = "error";
    pub const WORKER: &str = "worker";
    pub const AGENT_TYPE: &str = "agent_type";
    pub const REASON: &str = "reason";
    pub const ORIGINAL_KIND: &str = "original_kind";
    pub const MARKET_DATA: &str = "market_data";

    /// Fields copied from a worker's input event onto everything it emits.
    pub const CORRELATION: [&str; 3] = [SYMBOL, QUERY, RUN_ID];
}

/// Longest accepted ticker symbol.
pub const MAX_SYMBOL_LEN: usize = 12;

/// Kind of an event on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A caller asked for an analysis; the planner takes it from here
    CoordinationNeeded,
    /// Plan notice for the aggregator: the expected contributor set
    PlanCreated,
    /// Work request for a plan step without dependencies
    AnalysisRequested,
    /// Market data is available for fan-out
    DataReady,
    /// A worker (or the aggregator) finished
    AnalysisCompleted,
    /// Something failed somewhere
    Error,
    /// Fan-out could not be completed; the barrier must not keep waiting
    BarrierAborted,
    /// The barrier's time box for a run has elapsed
    BarrierDeadline,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::CoordinationNeeded => "coordination_needed",
            EventKind::PlanCreated => "analysis_plan_created",
            EventKind::AnalysisRequested => "analysis_requested",
            EventKind::DataReady => "data_ready",
            EventKind::AnalysisCompleted => "analysis_completed",
            EventKind::Error => "error_occurred",
            EventKind::BarrierAborted => "barrier_aborted",
            EventKind::BarrierDeadline => "barrier_deadline",
        };
        write!(f, "{}", name)
    }
}

/// An event travelling over the bus.
///
/// Events are immutable once published. The payload sits behind an `Arc` so a
/// fan-out can hand the same data to every worker without copying it.
#[derive(Debug, Clone)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Structured data for the consumer.
    pub payload: Arc<Payload>,
    /// Worker (or component) that published the event.
    pub source: WorkerId,
    /// Explicit recipient, if any.
    pub target: Option<WorkerId>,
    /// Reserved; carried but not used for ordering.
    pub priority: i32,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an untargeted event.
    pub fn new(kind: EventKind, payload: Payload, source: impl Into<WorkerId>) -> Self {
        Self {
            kind,
            payload: Arc::new(payload),
            source: source.into(),
            target: None,
            priority: 1,
            timestamp: Utc::now(),
        }
    }

    /// Address the event to a specific worker.
    pub fn to(mut self, target: impl Into<WorkerId>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Copy of this event addressed to `target`, sharing the payload.
    pub fn retarget(&self, target: impl Into<WorkerId>) -> Self {
        Self {
            target: Some(target.into()),
            timestamp: Utc::now(),
            ..self.clone()
        }
    }

    /// A string field of the payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Symbol this event belongs to, if it carries one.
    pub fn symbol(&self) -> Option<&str> {
        self.str_field(fields::SYMBOL)
    }

    /// Run id this event belongs to, if it carries one.
    pub fn run_id(&self) -> Option<u64> {
        self.payload.get(fields::RUN_ID).and_then(Value::as_u64)
    }

    /// Request key parsed from the payload's symbol.
    pub fn request_key(&self) -> Result<RequestKey, ValidationError> {
        match self.payload.get(fields::SYMBOL) {
            None | Some(Value::Null) => Err(ValidationError::MissingField(fields::SYMBOL)),
            Some(Value::String(raw)) => RequestKey::parse(raw),
            Some(_) => Err(ValidationError::WrongType {
                field: fields::SYMBOL,
                expected: "string",
            }),
        }
    }

    /// The correlation fields this event carries, copied into a fresh payload.
    pub fn correlation(&self) -> Payload {
        fields::CORRELATION
            .into_iter()
            .filter_map(|key| {
                self.payload
                    .get(key)
                    .map(|value| (key.to_string(), value.clone()))
            })
            .collect()
    }

    /// Short one-line description for logs.
    pub fn describe(&self) -> String {
        format!(
            "{} from {} to {} ({})",
            self.kind,
            self.source,
            self.target.as_deref().unwrap_or("-"),
            self.symbol().unwrap_or("no symbol")
        )
    }
}

/// Correlation id for one pipeline run: a normalised asset symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestKey(String);

impl RequestKey {
    /// Validate and normalise a raw symbol (trimmed, upper-cased).
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let symbol = raw.trim();
        if symbol.is_empty() {
            return Err(ValidationError::MissingField(fields::SYMBOL));
        }
        if symbol.chars().count() > MAX_SYMBOL_LEN {
            return Err(ValidationError::InvalidSymbol {
                symbol: raw.to_string(),
                reason: "too long",
            });
        }
        if !symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return Err(ValidationError::InvalidSymbol {
                symbol: raw.to_string(),
                reason: "only letters, digits, '.' and '-' are allowed",
            });
        }
        Ok(Self(symbol.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RequestKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RequestKey> for String {
    fn from(key: RequestKey) -> Self {
        key.0
    }
}

/// What one expected worker contributed to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Contribution {
    /// The worker produced its analysis fields.
    Completed { fields: Payload },
    /// The worker reported a failure.
    Failed { cause: String },
    /// Nothing arrived before the barrier closed.
    Missing,
}

impl Contribution {
    pub fn is_completed(&self) -> bool {
        matches!(self, Contribution::Completed { .. })
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every contributor succeeded and the synthesis succeeded.
    Complete,
    /// Some contributions failed or went missing, or the synthesis failed.
    Partial,
    /// The run was aborted before any analysis could happen.
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Complete => write!(f, "Complete"),
            RunStatus::Partial => write!(f, "Partial"),
            RunStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Narrative produced by the synthesizer.
///
/// Models are inconsistent about returning strings or lists, so the list
/// fields accept either.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    #[serde(default)]
    pub summary: String,
    #[serde(default, deserialize_with = "lenient_lines")]
    pub key_insights: Vec<String>,
    #[serde(default, deserialize_with = "lenient_lines")]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub confidence_level: String,
    #[serde(default, deserialize_with = "lenient_lines")]
    pub risks: Vec<String>,
    #[serde(default, deserialize_with = "lenient_lines")]
    pub next_steps: Vec<String>,
}

fn lenient_lines<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    fn flatten(value: Value, out: &mut Vec<String>) {
        match value {
            Value::Null => {}
            Value::String(s) => {
                if !s.trim().is_empty() {
                    out.push(s);
                }
            }
            Value::Array(items) => {
                for item in items {
                    flatten(item, out);
                }
            }
            other => out.push(other.to_string()),
        }
    }

    let value = Value::deserialize(deserializer)?;
    let mut lines = Vec::new();
    flatten(value, &mut lines);
    Ok(lines)
}

/// The single aggregated answer for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub symbol: RequestKey,
    pub query: String,
    pub run_id: u64,
    pub status: RunStatus,
    /// Synthesized narrative, absent if the synthesis failed or was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narrative: Option<Synthesis>,
    /// Per-worker contributions, keyed by worker id.
    pub details: BTreeMap<WorkerId, Contribution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl FinalResult {
    /// Encode as an event payload.
    pub fn to_payload(&self) -> Result<Payload> {
        match serde_json::to_value(self).context("Failed to encode final result")? {
            Value::Object(map) => Ok(map),
            _ => anyhow::bail!("final result did not encode as an object"),
        }
    }

    /// Decode from an event payload.
    pub fn from_payload(payload: &Payload) -> Result<Self> {
        serde_json::from_value(Value::Object(payload.clone()))
            .context("Payload is not a final result")
    }

    /// Number of contributions that completed successfully.
    pub fn completed_count(&self) -> usize {
        self.details.values().filter(|c| c.is_completed()).count()
    }

    /// Number of contributions that failed or went missing.
    pub fn failed_count(&self) -> usize {
        self.details.len() - self.completed_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_request_key_normalises() {
        let key = RequestKey::parse("  aapl ").unwrap();
        assert_eq!(key.as_str(), "AAPL");
        assert_eq!(RequestKey::parse("brk.b").unwrap().as_str(), "BRK.B");
    }

    #[test]
    fn test_request_key_rejects_bad_input() {
        assert_eq!(
            RequestKey::parse("   "),
            Err(ValidationError::MissingField("symbol"))
        );
        assert!(matches!(
            RequestKey::parse("AA PL"),
            Err(ValidationError::InvalidSymbol { .. })
        ));
        assert!(matches!(
            RequestKey::parse("ABCDEFGHIJKLMNOP"),
            Err(ValidationError::InvalidSymbol { reason: "too long", .. })
        ));
    }

    #[test]
    fn test_event_accessors() {
        let event = Event::new(
            EventKind::DataReady,
            payload(json!({"symbol": "msft", "run_id": 7})),
            "data_collector",
        );
        assert_eq!(event.symbol(), Some("msft"));
        assert_eq!(event.run_id(), Some(7));
        assert_eq!(event.request_key().unwrap().as_str(), "MSFT");
        assert!(event.target.is_none());
        assert_eq!(event.priority, 1);
    }

    #[test]
    fn test_request_key_from_payload_errors() {
        let missing = Event::new(EventKind::CoordinationNeeded, Payload::new(), "system");
        assert_eq!(
            missing.request_key(),
            Err(ValidationError::MissingField("symbol"))
        );

        let wrong = Event::new(
            EventKind::CoordinationNeeded,
            payload(json!({"symbol": 42})),
            "system",
        );
        assert!(matches!(
            wrong.request_key(),
            Err(ValidationError::WrongType { field: "symbol", .. })
        ));
    }

    #[test]
    fn test_retarget_shares_payload() {
        let event = Event::new(
            EventKind::AnalysisCompleted,
            payload(json!({"symbol": "AAPL"})),
            "risk_analyzer",
        );
        let copy = event.retarget("results_synthesizer");
        assert_eq!(copy.target.as_deref(), Some("results_synthesizer"));
        assert_eq!(copy.source, "risk_analyzer");
        assert!(Arc::ptr_eq(&event.payload, &copy.payload));
    }

    #[test]
    fn test_synthesis_accepts_strings_or_lists() {
        let synthesis: Synthesis = serde_json::from_value(json!({
            "summary": "Solid quarter",
            "key_insights": "Momentum is strong",
            "recommendations": ["Hold", "Trim above 200"],
            "risks": [{"risk": "rates"}],
            "confidence_level": "medium"
        }))
        .unwrap();

        assert_eq!(synthesis.key_insights, vec!["Momentum is strong"]);
        assert_eq!(synthesis.recommendations.len(), 2);
        assert_eq!(synthesis.risks, vec![r#"{"risk":"rates"}"#]);
        assert!(synthesis.next_steps.is_empty());
    }

    #[test]
    fn test_final_result_counts() {
        let mut details = BTreeMap::new();
        details.insert(
            "technical_analyzer".to_string(),
            Contribution::Completed {
                fields: Payload::new(),
            },
        );
        details.insert(
            "risk_analyzer".to_string(),
            Contribution::Failed {
                cause: "no data".to_string(),
            },
        );
        details.insert("sentiment_analyzer".to_string(), Contribution::Missing);

        let result = FinalResult {
            symbol: RequestKey::parse("AAPL").unwrap(),
            query: "outlook".to_string(),
            run_id: 1,
            status: RunStatus::Partial,
            narrative: None,
            details,
            error: None,
            completed_at: Utc::now(),
        };

        assert_eq!(result.completed_count(), 1);
        assert_eq!(result.failed_count(), 2);

        let decoded = FinalResult::from_payload(&result.to_payload().unwrap()).unwrap();
        assert_eq!(decoded, result);
    }
}
