//! The aggregating worker.
//!
//! Feeds plan notices, worker results and failures into the fan-in barrier
//! and, once a run is released, synthesizes it into a single final result.

use super::barrier::{Admission, CompletedRequest, FanInBarrier};
use crate::agent::{Synthesizer, Worker};
use crate::error::panic_message;
use crate::models::{fields, Contribution, Event, EventKind, FinalResult, RunStatus, WorkerId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct AggregatorWorker {
    id: WorkerId,
    provider: WorkerId,
    barrier: Arc<FanInBarrier>,
    synthesizer: Arc<dyn Synthesizer>,
}

impl AggregatorWorker {
    pub fn new(
        id: impl Into<WorkerId>,
        provider: impl Into<WorkerId>,
        barrier: Arc<FanInBarrier>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            barrier,
            synthesizer,
        }
    }

    fn offer(&self, admission: Admission) -> Option<CompletedRequest> {
        match admission {
            Admission::Complete(done) => Some(done),
            _ => None,
        }
    }

    /// Synthesize a released run into the final `AnalysisCompleted` event.
    async fn finish(&self, done: CompletedRequest) -> Result<Event> {
        let CompletedRequest {
            key,
            query,
            run_id,
            mut status,
            results,
            reason,
        } = done;

        let mut error = reason;
        let narrative = if status == RunStatus::Failed {
            None
        } else {
            // The barrier has already released the run; a panic must still
            // produce a result.
            let outcome = AssertUnwindSafe(self.synthesizer.synthesize(&results, &query, &key))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(anyhow::anyhow!(
                        "synthesizer panicked: {}",
                        panic_message(panic.as_ref())
                    ))
                });
            match outcome {
                Ok(synthesis) => Some(synthesis),
                Err(e) => {
                    warn!(
                        "{} could not synthesize {}: {:#}",
                        self.synthesizer.name(),
                        key,
                        e
                    );
                    status = RunStatus::Partial;
                    error = Some(match error {
                        Some(earlier) => format!("{}; synthesis failed: {:#}", earlier, e),
                        None => format!("synthesis failed: {:#}", e),
                    });
                    None
                }
            }
        };

        let result = FinalResult {
            symbol: key,
            query,
            run_id,
            status,
            narrative,
            details: results,
            error,
            completed_at: Utc::now(),
        };
        info!(
            "Synthesized run {} for {} ({})",
            result.run_id, result.symbol, result.status
        );

        Ok(Event::new(
            EventKind::AnalysisCompleted,
            result.to_payload()?,
            self.id.clone(),
        ))
    }
}

#[async_trait]
impl Worker for AggregatorWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn stage(&self) -> &str {
        "synthesis"
    }

    async fn handle(&self, event: &Event) -> Result<Vec<Event>> {
        let key = event
            .request_key()
            .with_context(|| format!("{} event without a usable symbol", event.kind))?;
        let run_id = event.run_id();

        let released = match event.kind {
            EventKind::PlanCreated => {
                let run_id = run_id.context("Plan notice without run id")?;
                let expected = expected_workers(event)?;
                let query = event.str_field(fields::QUERY).unwrap_or_default().to_string();
                self.barrier.open(key, query, run_id, expected)
            }
            EventKind::AnalysisCompleted => {
                let contribution = Contribution::Completed {
                    fields: (*event.payload).clone(),
                };
                self.offer(self.barrier.accept(&key, run_id, &event.source, contribution))
            }
            EventKind::Error => {
                let cause = event
                    .str_field(fields::CAUSE)
                    .unwrap_or("unspecified error")
                    .to_string();
                if event.source == self.provider {
                    self.barrier.abort(&key, run_id, &format!("data provider failed: {}", cause))
                } else {
                    let contribution = Contribution::Failed { cause };
                    self.offer(self.barrier.accept(&key, run_id, &event.source, contribution))
                }
            }
            EventKind::DataReady => {
                if !self.barrier.mark_data_ready(&key, run_id) {
                    debug!("Data for {} arrived without an open run", key);
                }
                None
            }
            EventKind::BarrierDeadline => {
                let run_id = run_id.context("Deadline without run id")?;
                self.barrier.expire(&key, run_id)
            }
            EventKind::BarrierAborted => {
                let reason = event.str_field(fields::REASON).unwrap_or("fan-out failed");
                self.barrier.abort(&key, run_id, reason)
            }
            other => {
                debug!("{} ignores {} events", self.id, other);
                None
            }
        };

        match released {
            Some(done) => Ok(vec![self.finish(done).await?]),
            None => Ok(Vec::new()),
        }
    }
}

fn expected_workers(event: &Event) -> Result<Vec<WorkerId>> {
    let list = event
        .payload
        .get(fields::EXPECTED)
        .and_then(Value::as_array)
        .context("Plan notice without an expected worker list")?;

    list.iter()
        .map(|value| {
            value
                .as_str()
                .map(String::from)
                .context("Expected worker ids must be strings")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AGGREGATOR, COORDINATOR, DATA_COLLECTOR, RISK, TECHNICAL};
    use crate::models::{Payload, RequestKey, Synthesis, WorkerId};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
        panic: bool,
    }

    #[async_trait]
    impl Synthesizer for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn synthesize(
            &self,
            results: &BTreeMap<WorkerId, Contribution>,
            _query: &str,
            symbol: &RequestKey,
        ) -> Result<Synthesis> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("summarizer crashed");
            }
            if self.fail {
                anyhow::bail!("model offline");
            }
            Ok(Synthesis {
                summary: format!("{} from {} result(s)", symbol, results.len()),
                ..Synthesis::default()
            })
        }
    }

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn worker(synth: Arc<Counting>) -> AggregatorWorker {
        AggregatorWorker::new(
            AGGREGATOR,
            DATA_COLLECTOR,
            Arc::new(FanInBarrier::new()),
            synth,
        )
    }

    fn plan(expected: &[&str]) -> Event {
        Event::new(
            EventKind::PlanCreated,
            payload(json!({
                "symbol": "AAPL", "query": "outlook", "run_id": 1,
                "expected_agents": expected,
            })),
            COORDINATOR,
        )
    }

    fn result(from: &str) -> Event {
        Event::new(
            EventKind::AnalysisCompleted,
            payload(json!({"symbol": "AAPL", "run_id": 1, "score": 0.5})),
            from,
        )
    }

    fn released_result(events: Vec<Event>) -> FinalResult {
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::AnalysisCompleted);
        assert_eq!(events[0].source, AGGREGATOR);
        FinalResult::from_payload(&events[0].payload).unwrap()
    }

    #[tokio::test]
    async fn test_synthesizes_when_all_reported() {
        let synth = Arc::new(Counting::default());
        let agg = worker(Arc::clone(&synth));

        assert!(agg.handle(&plan(&[TECHNICAL, RISK])).await.unwrap().is_empty());
        assert!(agg.handle(&result(RISK)).await.unwrap().is_empty());
        let out = agg.handle(&result(TECHNICAL)).await.unwrap();

        let final_result = released_result(out);
        assert_eq!(final_result.status, RunStatus::Complete);
        assert_eq!(final_result.details.len(), 2);
        assert_eq!(
            final_result.narrative.unwrap().summary,
            "AAPL from 2 result(s)"
        );
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);

        assert!(agg.handle(&result(RISK)).await.unwrap().is_empty());
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_plan_synthesizes_immediately() {
        let synth = Arc::new(Counting::default());
        let agg = worker(Arc::clone(&synth));

        let final_result = released_result(agg.handle(&plan(&[])).await.unwrap());
        assert_eq!(final_result.status, RunStatus::Complete);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_error_marks_slot_failed() {
        let agg = worker(Arc::new(Counting::default()));
        agg.handle(&plan(&[TECHNICAL, RISK])).await.unwrap();
        agg.handle(&result(TECHNICAL)).await.unwrap();

        let error = Event::new(
            EventKind::Error,
            payload(json!({"symbol": "AAPL", "run_id": 1, "error": "no prices"})),
            RISK,
        );
        let final_result = released_result(agg.handle(&error).await.unwrap());

        assert_eq!(final_result.status, RunStatus::Partial);
        assert_eq!(
            final_result.details[RISK],
            Contribution::Failed {
                cause: "no prices".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_provider_error_aborts_without_synthesis() {
        let synth = Arc::new(Counting::default());
        let agg = worker(Arc::clone(&synth));
        agg.handle(&plan(&[TECHNICAL])).await.unwrap();

        let error = Event::new(
            EventKind::Error,
            payload(json!({"symbol": "AAPL", "run_id": 1, "error": "rate limited"})),
            DATA_COLLECTOR,
        );
        let final_result = released_result(agg.handle(&error).await.unwrap());

        assert_eq!(final_result.status, RunStatus::Failed);
        assert!(final_result.error.unwrap().contains("rate limited"));
        assert!(final_result.narrative.is_none());
        assert_eq!(synth.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_synthesis_failure_keeps_partial_results() {
        let synth = Arc::new(Counting {
            fail: true,
            ..Counting::default()
        });
        let agg = worker(synth);
        agg.handle(&plan(&[TECHNICAL])).await.unwrap();

        let final_result = released_result(agg.handle(&result(TECHNICAL)).await.unwrap());
        assert_eq!(final_result.status, RunStatus::Partial);
        assert!(final_result.details[TECHNICAL].is_completed());
        assert!(final_result.error.unwrap().contains("model offline"));
    }

    #[tokio::test]
    async fn test_synthesizer_panic_keeps_partial_results() {
        let synth = Arc::new(Counting {
            panic: true,
            ..Counting::default()
        });
        let agg = worker(Arc::clone(&synth));
        agg.handle(&plan(&[TECHNICAL])).await.unwrap();

        let final_result = released_result(agg.handle(&result(TECHNICAL)).await.unwrap());
        assert_eq!(final_result.status, RunStatus::Partial);
        assert!(final_result.details[TECHNICAL].is_completed());
        assert!(final_result.narrative.is_none());
        let error = final_result.error.unwrap();
        assert!(error.contains("synthesis failed"));
        assert!(error.contains("summarizer crashed"));
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadline_releases_partial_run() {
        let agg = worker(Arc::new(Counting::default()));
        agg.handle(&plan(&[TECHNICAL, RISK])).await.unwrap();
        agg.handle(&result(TECHNICAL)).await.unwrap();

        let deadline = Event::new(
            EventKind::BarrierDeadline,
            payload(json!({"symbol": "AAPL", "run_id": 1})),
            COORDINATOR,
        );
        let final_result = released_result(agg.handle(&deadline).await.unwrap());
        assert_eq!(final_result.status, RunStatus::Partial);
        assert_eq!(final_result.details[RISK], Contribution::Missing);
    }

    #[tokio::test]
    async fn test_malformed_plan_is_an_error() {
        let agg = worker(Arc::new(Counting::default()));
        let bad = Event::new(
            EventKind::PlanCreated,
            payload(json!({"symbol": "AAPL", "run_id": 1})),
            COORDINATOR,
        );
        assert!(agg.handle(&bad).await.is_err());
    }
}
