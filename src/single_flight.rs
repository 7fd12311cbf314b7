//! Single-flight keyed cache.
//!
//! Concurrent requesters for the same key share one underlying fetch: the
//! first requester runs the closure, everyone else awaits the in-flight
//! result. Successful results stay cached for the life of the cache;
//! failures are not retained, so the next requester retries.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use crate::Result;

pub struct SingleFlightCache<K, V> {
    cells: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> SingleFlightCache<K, V> {
        SingleFlightCache {
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Look up `key`, running `fetch` at most once per key even under
    /// concurrent misses.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V>>,
    {
        let cell = {
            let mut cells = self.cells.lock().await;
            cells.entry(key).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };
        let value = cell.get_or_try_init(fetch).await?;
        Ok(value.clone())
    }

    /// A snapshot of every resolved entry. Pending fetches are skipped.
    pub async fn resolved_entries(&self) -> Vec<(K, V)> {
        let cells = self.cells.lock().await;
        cells
            .iter()
            .filter_map(|(key, cell)| cell.get().map(|v| (key.clone(), v.clone())))
            .collect()
    }

    /// Value for `key`, if already resolved.
    pub async fn get_resolved(&self, key: &K) -> Option<V> {
        let cells = self.cells.lock().await;
        cells.get(key).and_then(|cell| cell.get().cloned())
    }

    pub async fn len(&self) -> usize {
        self.cells.lock().await.len()
    }
}

impl<K, V> Default for SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        SingleFlightCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let cache: Arc<SingleFlightCache<String, u64>> =
            Arc::new(SingleFlightCache::new());
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("same-key".to_owned(), || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(42)
                    })
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), 42);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache: SingleFlightCache<&'static str, u64> = SingleFlightCache::new();
        let result = cache
            .get_or_fetch("k", || async { Err(anyhow::format_err!("boom")) })
            .await;
        assert!(result.is_err());
        let retried = cache.get_or_fetch("k", || async { Ok(7) }).await.unwrap();
        assert_eq!(retried, 7);
    }
}
