//! Turning a request into an ordered analysis plan.

use crate::error::ValidationError;
use crate::models::{fields, Payload, RequestKey, WorkerId};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Longest accepted free-text query, in characters.
pub const MAX_QUERY_LEN: usize = 2000;

/// One participant of a plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanStep {
    pub worker: WorkerId,
    pub parameters: Payload,
    /// Steps whose output this step consumes. Empty for roots.
    pub depends_on: Vec<WorkerId>,
}

/// Ordered plan for one run. Entry 0 is always the data provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisPlan {
    pub key: RequestKey,
    pub query: String,
    pub run_id: u64,
    pub steps: Vec<PlanStep>,
}

impl AnalysisPlan {
    /// Workers the aggregator must hear from: everything after the provider.
    pub fn expected(&self) -> Vec<WorkerId> {
        self.steps
            .iter()
            .skip(1)
            .map(|step| step.worker.clone())
            .collect()
    }

    /// Steps that can start immediately.
    pub fn roots(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|step| step.depends_on.is_empty())
    }

    /// Payload of the plan notice sent to the aggregator.
    pub fn notice_payload(&self) -> Payload {
        let mut payload = self.correlation();
        payload.insert(
            fields::EXPECTED.into(),
            Value::Array(self.expected().into_iter().map(Value::String).collect()),
        );
        payload
    }

    /// Payload of the work request for `step`.
    pub fn request_payload(&self, step: &PlanStep) -> Payload {
        let mut payload = step.parameters.clone();
        payload.extend(self.correlation());
        payload
    }

    fn correlation(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert(fields::SYMBOL.into(), Value::String(self.key.to_string()));
        payload.insert(fields::QUERY.into(), Value::String(self.query.clone()));
        payload.insert(fields::RUN_ID.into(), Value::from(self.run_id));
        payload
    }
}

/// Builds the fixed two-level plan: provider first, then the analysis set.
#[derive(Debug)]
pub struct PlanBuilder {
    provider: WorkerId,
    analysis: Vec<WorkerId>,
    next_run: AtomicU64,
}

impl PlanBuilder {
    pub fn new(provider: impl Into<WorkerId>, analysis: Vec<WorkerId>) -> Self {
        Self {
            provider: provider.into(),
            analysis,
            next_run: AtomicU64::new(1),
        }
    }

    /// Validate a coordination request and build its plan.
    pub fn build(&self, request: &Payload) -> Result<AnalysisPlan, ValidationError> {
        let (key, query) = validate_request(request)?;
        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);

        let mut steps = Vec::with_capacity(self.analysis.len() + 1);
        steps.push(PlanStep {
            worker: self.provider.clone(),
            parameters: Payload::new(),
            depends_on: Vec::new(),
        });
        steps.extend(self.analysis.iter().map(|worker| PlanStep {
            worker: worker.clone(),
            parameters: Payload::new(),
            depends_on: vec![self.provider.clone()],
        }));

        Ok(AnalysisPlan {
            key,
            query,
            run_id,
            steps,
        })
    }
}

/// Check the required request fields without substituting defaults.
pub fn validate_request(request: &Payload) -> Result<(RequestKey, String), ValidationError> {
    let key = match request.get(fields::SYMBOL) {
        None | Some(Value::Null) => return Err(ValidationError::MissingField(fields::SYMBOL)),
        Some(Value::String(raw)) => RequestKey::parse(raw)?,
        Some(_) => {
            return Err(ValidationError::WrongType {
                field: fields::SYMBOL,
                expected: "string",
            })
        }
    };

    let query = match request.get(fields::QUERY) {
        None | Some(Value::Null) => return Err(ValidationError::MissingField(fields::QUERY)),
        Some(Value::String(text)) => text.trim().to_string(),
        Some(_) => {
            return Err(ValidationError::WrongType {
                field: fields::QUERY,
                expected: "string",
            })
        }
    };
    validate_query(&query)?;

    Ok((key, query))
}

/// Length check shared by the bus-side validation and the caller boundary.
pub fn validate_query(query: &str) -> Result<(), ValidationError> {
    let len = query.chars().count();
    if len > MAX_QUERY_LEN {
        return Err(ValidationError::QueryTooLong {
            len,
            max: MAX_QUERY_LEN,
        });
    }
    Ok(())
}
