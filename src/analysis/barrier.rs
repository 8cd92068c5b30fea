//! Fan-in barrier.
//!
//! Tracks, per request key, which contributors are expected and which have
//! reported. A request completes exactly once: when every expected worker has
//! reported (successfully or not), when its deadline passes, or when it is
//! aborted. Completed requests are evicted, so anything arriving afterwards is
//! late and gets dropped.

use crate::models::{Contribution, RequestKey, RunStatus, WorkerId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Open state of one request.
#[derive(Debug)]
struct PendingRequest {
    query: String,
    run_id: u64,
    expected: BTreeSet<WorkerId>,
    received: BTreeSet<WorkerId>,
    results: BTreeMap<WorkerId, Contribution>,
    data_ready: bool,
    created_at: Instant,
}

impl PendingRequest {
    fn is_complete(&self) -> bool {
        self.received == self.expected
    }

    fn into_completed(mut self, key: RequestKey, reason: Option<String>) -> CompletedRequest {
        for worker in self.expected.difference(&self.received) {
            self.results.insert(worker.clone(), Contribution::Missing);
        }
        let status = if self.results.values().all(Contribution::is_completed) {
            RunStatus::Complete
        } else {
            RunStatus::Partial
        };

        CompletedRequest {
            key,
            query: self.query,
            run_id: self.run_id,
            status,
            results: self.results,
            reason,
        }
    }
}

/// A request whose barrier has released.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRequest {
    pub key: RequestKey,
    pub query: String,
    pub run_id: u64,
    pub status: RunStatus,
    /// One entry per expected worker.
    pub results: BTreeMap<WorkerId, Contribution>,
    /// Why the barrier released early, if it did.
    pub reason: Option<String>,
}

/// Outcome of offering a result to the barrier.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Counted; the request is still waiting.
    Accepted { received: usize, expected: usize },
    /// Counted, and it was the last one.
    Complete(CompletedRequest),
    /// The worker already reported for this run.
    Duplicate,
    /// The worker is not part of this run.
    Unexpected,
    /// The result belongs to an earlier, replaced run.
    Stale,
    /// No run is open for the key.
    NoPlan,
}

/// Counters for results that did not change barrier state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BarrierStats {
    pub completed: usize,
    pub duplicates: usize,
    pub unexpected: usize,
    pub stale: usize,
    pub late: usize,
}

#[derive(Debug, Default)]
pub struct FanInBarrier {
    pending: Mutex<HashMap<RequestKey, PendingRequest>>,
    stats: Mutex<BarrierStats>,
}

impl FanInBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `expected` under `key`.
    ///
    /// An already open run for the same key is replaced. With nothing to wait
    /// for the request completes on the spot.
    pub fn open(
        &self,
        key: RequestKey,
        query: String,
        run_id: u64,
        expected: impl IntoIterator<Item = WorkerId>,
    ) -> Option<CompletedRequest> {
        let request = PendingRequest {
            query,
            run_id,
            expected: expected.into_iter().collect(),
            received: BTreeSet::new(),
            results: BTreeMap::new(),
            data_ready: false,
            created_at: Instant::now(),
        };

        if request.expected.is_empty() {
            info!("Run {} for {} expects no contributors", run_id, key);
            self.bump(|s| s.completed += 1);
            return Some(request.into_completed(key, None));
        }

        debug!(
            "Awaiting {:?} for {} (run {})",
            request.expected, key, run_id
        );

        let mut pending = self.lock();
        if let Some(old) = pending.insert(key.clone(), request) {
            warn!(
                "Run {} for {} replaced run {} with {}/{} results",
                run_id,
                key,
                old.run_id,
                old.received.len(),
                old.expected.len()
            );
        }
        None
    }

    /// Offer one worker's contribution.
    pub fn accept(
        &self,
        key: &RequestKey,
        run_id: Option<u64>,
        worker: &str,
        contribution: Contribution,
    ) -> Admission {
        let mut pending = self.lock();

        let Some(request) = pending.get_mut(key) else {
            drop(pending);
            warn!("Dropping late result from {} for {}", worker, key);
            self.bump(|s| s.late += 1);
            return Admission::NoPlan;
        };

        if run_id.is_some_and(|id| id != request.run_id) {
            let current = request.run_id;
            drop(pending);
            warn!(
                "Dropping stale result from {} for {} (run {:?}, current {})",
                worker, key, run_id, current
            );
            self.bump(|s| s.stale += 1);
            return Admission::Stale;
        }

        if !request.expected.contains(worker) {
            drop(pending);
            warn!("Dropping result from unexpected worker {} for {}", worker, key);
            self.bump(|s| s.unexpected += 1);
            return Admission::Unexpected;
        }

        if request.received.contains(worker) {
            drop(pending);
            warn!("Dropping duplicate result from {} for {}", worker, key);
            self.bump(|s| s.duplicates += 1);
            return Admission::Duplicate;
        }

        request.received.insert(worker.to_string());
        request.results.insert(worker.to_string(), contribution);
        debug!(
            "{} reported for {}: {}/{}",
            worker,
            key,
            request.received.len(),
            request.expected.len()
        );

        if !request.is_complete() {
            return Admission::Accepted {
                received: request.received.len(),
                expected: request.expected.len(),
            };
        }

        match pending.remove(key) {
            Some(request) => {
                drop(pending);
                info!(
                    "All {} contributor(s) reported for {} in {:?}",
                    request.expected.len(),
                    key,
                    request.created_at.elapsed()
                );
                self.bump(|s| s.completed += 1);
                Admission::Complete(request.into_completed(key.clone(), None))
            }
            None => Admission::NoPlan,
        }
    }

    /// Note that market data for the run has been fanned out.
    pub fn mark_data_ready(&self, key: &RequestKey, run_id: Option<u64>) -> bool {
        let mut pending = self.lock();
        match pending.get_mut(key) {
            Some(request) if run_id.map_or(true, |id| id == request.run_id) => {
                request.data_ready = true;
                true
            }
            _ => false,
        }
    }

    /// Release a run whose deadline passed, marking silent workers missing.
    pub fn expire(&self, key: &RequestKey, run_id: u64) -> Option<CompletedRequest> {
        let request = self.take(key, Some(run_id))?;
        let missing = request.expected.len() - request.received.len();
        warn!(
            "Deadline passed for {} (run {}), {} contributor(s) missing",
            key, run_id, missing
        );

        let reason = if request.data_ready {
            format!("{} contributor(s) did not report in time", missing)
        } else {
            "market data never arrived".to_string()
        };
        self.bump(|s| s.completed += 1);
        Some(request.into_completed(key.clone(), Some(reason)))
    }

    /// Release a run that cannot make progress.
    pub fn abort(
        &self,
        key: &RequestKey,
        run_id: Option<u64>,
        reason: &str,
    ) -> Option<CompletedRequest> {
        let request = self.take(key, run_id)?;
        warn!("Aborting run {} for {}: {}", request.run_id, key, reason);

        self.bump(|s| s.completed += 1);
        let mut done = request.into_completed(key.clone(), Some(reason.to_string()));
        done.status = RunStatus::Failed;
        Some(done)
    }

    #[cfg(test)]
    pub fn is_awaiting(&self, key: &RequestKey) -> bool {
        self.lock().contains_key(key)
    }

    /// `(received, expected)` for an open run.
    pub fn progress(&self, key: &RequestKey) -> Option<(usize, usize)> {
        self.lock()
            .get(key)
            .map(|r| (r.received.len(), r.expected.len()))
    }

    pub fn stats(&self) -> BarrierStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove the open run for `key` if it matches `run_id`.
    fn take(&self, key: &RequestKey, run_id: Option<u64>) -> Option<PendingRequest> {
        let mut pending = self.lock();
        match pending.get(key) {
            Some(request) if run_id.map_or(true, |id| id == request.run_id) => {
                pending.remove(key)
            }
            Some(request) => {
                debug!(
                    "Ignoring signal for run {:?} of {}, run {} is current",
                    run_id, key, request.run_id
                );
                None
            }
            None => {
                debug!("Ignoring signal for {}: no open run", key);
                None
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestKey, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self, update: impl FnOnce(&mut BarrierStats)) {
        update(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{default_analysis_workers, FUNDAMENTAL, RISK, SENTIMENT, TECHNICAL};
    use crate::models::Payload;

    fn key() -> RequestKey {
        RequestKey::parse("AAPL").unwrap()
    }

    fn done(field: &str) -> Contribution {
        let mut fields = Payload::new();
        fields.insert(field.to_string(), serde_json::json!(1.0));
        Contribution::Completed { fields }
    }

    fn open_default(barrier: &FanInBarrier, run_id: u64) {
        assert!(barrier
            .open(key(), "outlook".to_string(), run_id, default_analysis_workers())
            .is_none());
    }

    #[test]
    fn test_completes_once_in_any_order() {
        let barrier = FanInBarrier::new();
        open_default(&barrier, 1);

        for worker in [SENTIMENT, RISK, TECHNICAL] {
            assert!(matches!(
                barrier.accept(&key(), Some(1), worker, done(worker)),
                Admission::Accepted { expected: 4, .. }
            ));
        }

        let completed = match barrier.accept(&key(), Some(1), FUNDAMENTAL, done(FUNDAMENTAL)) {
            Admission::Complete(completed) => completed,
            other => panic!("expected completion, got {:?}", other),
        };
        assert_eq!(completed.status, RunStatus::Complete);
        assert_eq!(completed.results.len(), 4);
        assert!(!barrier.is_awaiting(&key()));
        assert_eq!(barrier.stats().completed, 1);

        assert_eq!(
            barrier.accept(&key(), Some(1), RISK, done(RISK)),
            Admission::NoPlan
        );
        assert_eq!(barrier.stats().late, 1);
    }

    #[test]
    fn test_duplicate_does_not_count_twice() {
        let barrier = FanInBarrier::new();
        open_default(&barrier, 1);

        barrier.accept(&key(), Some(1), RISK, done(RISK));
        assert_eq!(
            barrier.accept(&key(), Some(1), RISK, done(RISK)),
            Admission::Duplicate
        );
        assert_eq!(barrier.progress(&key()), Some((1, 4)));
        assert_eq!(barrier.stats().duplicates, 1);
    }

    #[test]
    fn test_unexpected_worker_is_dropped() {
        let barrier = FanInBarrier::new();
        open_default(&barrier, 1);

        assert_eq!(
            barrier.accept(&key(), Some(1), "astrology_analyzer", done("x")),
            Admission::Unexpected
        );
        assert_eq!(barrier.progress(&key()), Some((0, 4)));
    }

    #[test]
    fn test_unknown_key_is_dropped_quietly() {
        let barrier = FanInBarrier::new();
        let other = RequestKey::parse("MSFT").unwrap();
        assert_eq!(
            barrier.accept(&other, None, RISK, done(RISK)),
            Admission::NoPlan
        );
    }

    #[test]
    fn test_replacement_makes_old_results_stale() {
        let barrier = FanInBarrier::new();
        open_default(&barrier, 1);
        barrier.accept(&key(), Some(1), RISK, done(RISK));

        open_default(&barrier, 2);
        assert_eq!(barrier.progress(&key()), Some((0, 4)));
        assert_eq!(
            barrier.accept(&key(), Some(1), TECHNICAL, done(TECHNICAL)),
            Admission::Stale
        );
        assert_eq!(barrier.stats().stale, 1);
    }

    #[test]
    fn test_empty_expected_set_completes_immediately() {
        let barrier = FanInBarrier::new();
        let completed = barrier
            .open(key(), "q".to_string(), 1, Vec::new())
            .unwrap();
        assert_eq!(completed.status, RunStatus::Complete);
        assert!(completed.results.is_empty());
        assert!(!barrier.is_awaiting(&key()));
    }

    #[test]
    fn test_failure_counts_toward_expected() {
        let barrier = FanInBarrier::new();
        open_default(&barrier, 1);

        barrier.accept(&key(), Some(1), TECHNICAL, done(TECHNICAL));
        barrier.accept(&key(), Some(1), FUNDAMENTAL, done(FUNDAMENTAL));
        barrier.accept(
            &key(),
            Some(1),
            RISK,
            Contribution::Failed {
                cause: "no volatility".to_string(),
            },
        );
        let completed = match barrier.accept(&key(), Some(1), SENTIMENT, done(SENTIMENT)) {
            Admission::Complete(completed) => completed,
            other => panic!("expected completion, got {:?}", other),
        };

        assert_eq!(completed.status, RunStatus::Partial);
        assert_eq!(
            completed.results.values().filter(|c| c.is_completed()).count(),
            3
        );
    }

    #[test]
    fn test_deadline_fills_missing_slots() {
        let barrier = FanInBarrier::new();
        open_default(&barrier, 5);
        barrier.mark_data_ready(&key(), Some(5));
        barrier.accept(&key(), Some(5), TECHNICAL, done(TECHNICAL));

        assert!(barrier.expire(&key(), 4).is_none());
        let completed = barrier.expire(&key(), 5).unwrap();

        assert_eq!(completed.status, RunStatus::Partial);
        assert_eq!(completed.results[RISK], Contribution::Missing);
        assert!(completed.reason.unwrap().contains("3 contributor"));
        assert!(barrier.expire(&key(), 5).is_none());
    }

    #[test]
    fn test_abort_fails_the_run() {
        let barrier = FanInBarrier::new();
        open_default(&barrier, 1);

        let aborted = barrier
            .abort(&key(), Some(1), "provider unavailable")
            .unwrap();
        assert_eq!(aborted.status, RunStatus::Failed);
        assert_eq!(aborted.reason.as_deref(), Some("provider unavailable"));
        assert_eq!(aborted.results.len(), 4);
        assert!(barrier.abort(&key(), Some(1), "again").is_none());
    }
}
