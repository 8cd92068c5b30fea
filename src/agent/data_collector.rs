//! The data-provisioning worker.

use super::{Worker, DATA_COLLECTOR};
use crate::market::DataProvider;
use crate::models::{Event, EventKind};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Answers `AnalysisRequested` with `DataReady` carrying the market data.
pub struct DataCollector {
    provider: Arc<dyn DataProvider>,
}

impl DataCollector {
    pub fn new(provider: Arc<dyn DataProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Worker for DataCollector {
    fn id(&self) -> &str {
        DATA_COLLECTOR
    }

    fn stage(&self) -> &str {
        "data_collection"
    }

    async fn handle(&self, event: &Event) -> Result<Vec<Event>> {
        if event.kind != EventKind::AnalysisRequested {
            debug!("{} ignores {} events", DATA_COLLECTOR, event.kind);
            return Ok(Vec::new());
        }

        let symbol = event.request_key()?;
        info!("Collecting market data for {} via {}", symbol, self.provider.name());

        let data = self
            .provider
            .fetch(&symbol)
            .await
            .with_context(|| format!("{} could not fetch {}", self.provider.name(), symbol))?;
        if data.history.is_empty() {
            anyhow::bail!("{} returned no price history for {}", self.provider.name(), symbol);
        }

        Ok(vec![Event::new(
            EventKind::DataReady,
            data.to_payload()?,
            DATA_COLLECTOR,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{MarketData, SyntheticProvider};
    use crate::models::{Payload, RequestKey};
    use serde_json::{json, Value};

    struct Broken;

    #[async_trait]
    impl DataProvider for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn fetch(&self, _symbol: &RequestKey) -> Result<MarketData> {
            anyhow::bail!("API rate limit exceeded")
        }
    }

    fn request() -> Event {
        let payload: Payload = match json!({"symbol": "AAPL", "query": "q", "run_id": 1}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        Event::new(EventKind::AnalysisRequested, payload, "coordinator").to(DATA_COLLECTOR)
    }

    #[tokio::test]
    async fn test_request_produces_data_ready() {
        let collector = DataCollector::new(Arc::new(SyntheticProvider::new(20)));
        let out = collector.handle(&request()).await.unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, EventKind::DataReady);
        assert_eq!(out[0].source, DATA_COLLECTOR);
        assert!(out[0].target.is_none());
        let data = MarketData::from_payload(&out[0].payload).unwrap();
        assert_eq!(data.history.len(), 20);
    }

    #[tokio::test]
    async fn test_provider_failure_is_an_error() {
        let collector = DataCollector::new(Arc::new(Broken));
        let err = collector.handle(&request()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("rate limit"));
    }

    #[tokio::test]
    async fn test_other_events_are_ignored() {
        let collector = DataCollector::new(Arc::new(SyntheticProvider::new(5)));
        let event = Event::new(EventKind::DataReady, Payload::new(), "x");
        assert!(collector.handle(&event).await.unwrap().is_empty());
    }
}
