//! TTL cache in front of a provider.

use super::{DataProvider, MarketData};
use crate::models::RequestKey;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Serves repeated fetches of a symbol from memory until the entry expires.
/// Failures are not cached.
pub struct CachedProvider {
    inner: Arc<dyn DataProvider>,
    name: String,
    ttl: Duration,
    entries: Mutex<HashMap<RequestKey, (Instant, MarketData)>>,
}

impl CachedProvider {
    pub fn new(inner: Arc<dyn DataProvider>, ttl: Duration) -> Self {
        Self {
            name: format!("cached {}", inner.name()),
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, symbol: &RequestKey) -> Option<MarketData> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(symbol) {
            Some((stored, data)) if stored.elapsed() < self.ttl => Some(data.clone()),
            Some(_) => {
                entries.remove(symbol);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl DataProvider for CachedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, symbol: &RequestKey) -> Result<MarketData> {
        if let Some(data) = self.lookup(symbol) {
            debug!("Cache hit for {}", symbol);
            return Ok(data);
        }

        let data = self.inner.fetch(symbol).await?;
        debug!("Caching {} data for {:?}", symbol, self.ttl);
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(symbol.clone(), (Instant::now(), data.clone()));
        Ok(data)
    }
}
