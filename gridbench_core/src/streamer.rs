//! Bounded-concurrency bulk loader.
//!
//! A streamer pushes many entries into an asynchronous store without waiting
//! for each write. At most `concurrency` writes are in flight; `push` waits for
//! a free slot and `await_completion` waits for every slot to be returned. Both
//! waits are bounded so a store that never answers fails the load instead of
//! wedging it.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamerError {
    #[error("Timed out after {timeout_ms} ms waiting for {waiting_for}")]
    Timeout { timeout_ms: u64, waiting_for: String },

    #[error("Store call failed: {0}")]
    StoreFailed(String),

    #[error("Streamer is closed")]
    Closed,
}

/// Asynchronous key/value sink.
#[async_trait]
pub trait AsyncStore<K, V>: Send + Sync + 'static {
    async fn put(&self, key: K, value: V) -> Result<(), String>;
}

/// Limits for a [`Streamer`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Maximum number of store calls in flight
    pub concurrency: usize,

    /// Bound on every wait, in milliseconds
    pub await_timeout_ms: u64,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1000,
            await_timeout_ms: 120_000,
        }
    }
}

impl StreamerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_await_timeout(mut self, timeout: Duration) -> Self {
        self.await_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn await_timeout(&self) -> Duration {
        Duration::from_millis(self.await_timeout_ms)
    }
}

/// Pushes entries into an [`AsyncStore`] with bounded concurrency.
pub struct Streamer<K, V, S> {
    store: Arc<S>,
    permits: Arc<Semaphore>,
    concurrency: u32,
    timeout: Duration,
    first_failure: Arc<Mutex<Option<String>>>,
    _entry: std::marker::PhantomData<fn(K, V)>,
}

impl<K, V, S> Streamer<K, V, S>
where
    K: Send + 'static,
    V: Send + 'static,
    S: AsyncStore<K, V>,
{
    pub fn new(store: Arc<S>, config: &StreamerConfig) -> Self {
        // acquire_many takes a u32, so that is the real ceiling.
        let ceiling = Semaphore::MAX_PERMITS.min(u32::MAX as usize);
        let concurrency = u32::try_from(config.concurrency.clamp(1, ceiling)).unwrap_or(u32::MAX);
        Self {
            store,
            permits: Arc::new(Semaphore::new(concurrency as usize)),
            concurrency,
            timeout: config.await_timeout(),
            first_failure: Arc::new(Mutex::new(None)),
            _entry: std::marker::PhantomData,
        }
    }

    /// Number of store calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.concurrency as usize - self.permits.available_permits()
    }

    /// Starts an asynchronous put, waiting for a free slot first.
    ///
    /// A failure of an earlier put is reported here as soon as it is known.
    pub async fn push(&self, key: K, value: V) -> Result<(), StreamerError> {
        self.check_failure()?;
        let permit = tokio::time::timeout(self.timeout, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| StreamerError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
                waiting_for: "a free streaming slot".to_string(),
            })?
            .map_err(|_| StreamerError::Closed)?;

        let store = Arc::clone(&self.store);
        let first_failure = Arc::clone(&self.first_failure);
        tokio::spawn(async move {
            if let Err(e) = store.put(key, value).await {
                warn!(error = %e, "Streamed put failed");
                first_failure.lock().get_or_insert(e);
            }
            drop(permit);
        });
        Ok(())
    }

    /// Waits until every pushed entry has been stored.
    pub async fn await_completion(&self) -> Result<(), StreamerError> {
        let all = tokio::time::timeout(self.timeout, self.permits.acquire_many(self.concurrency))
            .await
            .map_err(|_| StreamerError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
                waiting_for: format!("{} in-flight store calls", self.in_flight()),
            })?
            .map_err(|_| StreamerError::Closed)?;
        drop(all);
        debug!("Streamer drained");
        self.check_failure()
    }

    fn check_failure(&self) -> Result<(), StreamerError> {
        match self.first_failure.lock().as_ref() {
            Some(reason) => Err(StreamerError::StoreFailed(reason.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemoryStore {
        entries: Mutex<HashMap<u64, String>>,
    }

    #[async_trait]
    impl AsyncStore<u64, String> for MemoryStore {
        async fn put(&self, key: u64, value: String) -> Result<(), String> {
            tokio::task::yield_now().await;
            self.entries.lock().insert(key, value);
            Ok(())
        }
    }

    /// Never completes a put.
    struct StuckStore;

    #[async_trait]
    impl AsyncStore<u64, u64> for StuckStore {
        async fn put(&self, _key: u64, _value: u64) -> Result<(), String> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct RejectingStore;

    #[async_trait]
    impl AsyncStore<u64, u64> for RejectingStore {
        async fn put(&self, key: u64, _value: u64) -> Result<(), String> {
            if key == 3 {
                Err("disk full".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_all_entries_are_stored() {
        let store = Arc::new(MemoryStore::default());
        let streamer = Streamer::new(Arc::clone(&store), &StreamerConfig::default().with_concurrency(4));
        for key in 0..100u64 {
            streamer.push(key, format!("value-{}", key)).await.unwrap();
        }
        streamer.await_completion().await.unwrap();
        assert_eq!(store.entries.lock().len(), 100);
        assert_eq!(streamer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_store_times_out() {
        let config = StreamerConfig::default()
            .with_concurrency(2)
            .with_await_timeout(Duration::from_secs(120));
        let streamer = Streamer::new(Arc::new(StuckStore), &config);
        streamer.push(1, 1).await.unwrap();
        streamer.push(2, 2).await.unwrap();

        // No slot left: the third push waits for the full timeout.
        let err = streamer.push(3, 3).await.unwrap_err();
        assert!(matches!(err, StreamerError::Timeout { timeout_ms: 120_000, .. }));

        let err = streamer.await_completion().await.unwrap_err();
        assert!(matches!(err, StreamerError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_oversized_concurrency_is_capped() {
        let store = Arc::new(MemoryStore::default());
        let config = StreamerConfig::default().with_concurrency(usize::MAX);
        let streamer = Streamer::new(Arc::clone(&store), &config);
        assert_eq!(streamer.concurrency as usize, Semaphore::MAX_PERMITS.min(u32::MAX as usize));
        assert_eq!(streamer.in_flight(), 0);

        streamer.push(7, "seven".to_string()).await.unwrap();
        streamer.await_completion().await.unwrap();
        assert_eq!(store.entries.lock().get(&7).map(String::as_str), Some("seven"));
        assert_eq!(streamer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_zero_concurrency_still_makes_progress() {
        let store = Arc::new(MemoryStore::default());
        let streamer = Streamer::new(Arc::clone(&store), &StreamerConfig::default().with_concurrency(0));
        assert_eq!(streamer.concurrency, 1);
        streamer.push(1, "one".to_string()).await.unwrap();
        streamer.await_completion().await.unwrap();
        assert_eq!(store.entries.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_first_failure_is_reported() {
        let streamer = Streamer::new(Arc::new(RejectingStore), &StreamerConfig::default());
        for key in 0..10u64 {
            // Later pushes may already see the failure.
            if streamer.push(key, key).await.is_err() {
                break;
            }
        }
        let err = streamer.await_completion().await.unwrap_err();
        assert_eq!(err, StreamerError::StoreFailed("disk full".to_string()));
    }
}
