//! Completion gate: hands final results to waiting callers.
//!
//! Each caller registers a one-shot waiter under its request key *before*
//! publishing the request, then awaits it with a deadline. Any number of keys
//! can be in flight at once, and several callers may wait on the same key.

use crate::error::PipelineError;
use crate::models::{FinalResult, RequestKey};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A registered, not yet resolved wait for one key.
#[derive(Debug)]
pub struct Waiter {
    key: RequestKey,
    receiver: oneshot::Receiver<FinalResult>,
}

#[derive(Debug, Default)]
pub struct CompletionGate {
    waiters: Mutex<HashMap<RequestKey, Vec<oneshot::Sender<FinalResult>>>>,
    latest: Mutex<Option<FinalResult>>,
}

impl CompletionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the next result for `key`.
    pub fn register(&self, key: &RequestKey) -> Waiter {
        let (sender, receiver) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_default()
            .push(sender);
        Waiter {
            key: key.clone(),
            receiver,
        }
    }

    /// Wait for the waiter's result, giving up after `timeout`.
    pub async fn await_result(
        &self,
        waiter: Waiter,
        timeout: Duration,
    ) -> Result<FinalResult, PipelineError> {
        let Waiter { key, receiver } = waiter;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(PipelineError::Shutdown),
            Err(_) => {
                warn!("Gave up waiting for {} after {:?}", key, timeout);
                self.prune(&key);
                Err(PipelineError::TimedOut {
                    key,
                    after: timeout,
                })
            }
        }
    }

    /// Store `result` as the latest and wake every waiter for its key.
    ///
    /// Returns how many waiters were woken.
    pub fn publish_result(&self, result: FinalResult) -> usize {
        let senders = self
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&result.symbol)
            .unwrap_or_default();

        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(result.clone());

        let woken = senders
            .into_iter()
            .filter_map(|sender| sender.send(result.clone()).ok())
            .count();

        if woken == 0 {
            debug!("Result for {} arrived with nobody waiting", result.symbol);
        } else {
            debug!("Woke {} waiter(s) for {}", woken, result.symbol);
        }
        woken
    }

    /// Most recent result of any key.
    pub fn latest(&self) -> Option<FinalResult> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of live waiters for `key`.
    #[cfg(test)]
    pub fn waiting(&self, key: &RequestKey) -> usize {
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    /// Drop senders whose caller stopped waiting.
    fn prune(&self, key: &RequestKey) {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(senders) = waiters.get_mut(key) {
            senders.retain(|s| !s.is_closed());
            if senders.is_empty() {
                waiters.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Instant;

    fn result(symbol: &str, run_id: u64) -> FinalResult {
        FinalResult {
            symbol: RequestKey::parse(symbol).unwrap(),
            query: "q".to_string(),
            run_id,
            status: RunStatus::Complete,
            narrative: None,
            details: BTreeMap::new(),
            error: None,
            completed_at: Utc::now(),
        }
    }

    fn key(symbol: &str) -> RequestKey {
        RequestKey::parse(symbol).unwrap()
    }

    #[tokio::test]
    async fn test_result_wakes_waiter() {
        let gate = Arc::new(CompletionGate::new());
        let waiter = gate.register(&key("AAPL"));

        let publisher = Arc::clone(&gate);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish_result(result("AAPL", 9));
        });

        let got = gate
            .await_result(waiter, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(got.run_id, 9);
        assert_eq!(gate.latest().map(|r| r.run_id), Some(9));
    }

    #[tokio::test]
    async fn test_timeout_is_bounded() {
        let gate = CompletionGate::new();
        let waiter = gate.register(&key("AAPL"));
        let started = Instant::now();

        let err = gate
            .await_result(waiter, Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(gate.waiting(&key("AAPL")), 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let gate = CompletionGate::new();
        let aapl = gate.register(&key("AAPL"));
        let msft = gate.register(&key("MSFT"));

        assert_eq!(gate.publish_result(result("MSFT", 2)), 1);
        let got = gate
            .await_result(msft, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got.symbol.as_str(), "MSFT");
        assert_eq!(gate.waiting(&key("AAPL")), 1);

        gate.publish_result(result("AAPL", 3));
        let got = gate
            .await_result(aapl, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got.run_id, 3);
    }

    #[tokio::test]
    async fn test_all_waiters_for_a_key_are_woken() {
        let gate = CompletionGate::new();
        let first = gate.register(&key("AAPL"));
        let second = gate.register(&key("AAPL"));

        assert_eq!(gate.publish_result(result("AAPL", 5)), 2);

        tokio_test::assert_ok!(gate.await_result(first, Duration::from_secs(1)).await);
        tokio_test::assert_ok!(gate.await_result(second, Duration::from_secs(1)).await);
    }

    #[test]
    fn test_result_without_waiter_still_updates_latest() {
        let gate = CompletionGate::new();
        assert_eq!(gate.publish_result(result("TSLA", 1)), 0);
        assert_eq!(gate.latest().unwrap().symbol.as_str(), "TSLA");
    }
}
