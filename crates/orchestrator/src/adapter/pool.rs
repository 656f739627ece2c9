//! Adapter Pool: process-wide map from `endpoint+kind` to a
//! shared adapter instance, lazily constructed with single-flight semantics.
//!
//! A `contains_key`-then-`insert` check on a concurrent map is not enough
//! here: two callers racing on the same key can both observe a miss and
//! both construct, which is exactly the double-construction this pool
//! needs to rule out. A single bookkeeping lock holding an
//! in-progress-or-ready slot closes that race.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use super::{RuntimeAdapter, RuntimeKind};

type Key = (String, RuntimeKind);
type Slot = Arc<OnceCell<Arc<dyn RuntimeAdapter>>>;

#[derive(Default)]
pub struct AdapterPool {
    slots: Mutex<HashMap<Key, Slot>>,
}

impl AdapterPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or construct the adapter for `(endpoint, kind)`. `factory` runs
    /// at most once per key, even under concurrent callers: the slot is
    /// claimed (under the bookkeeping lock) before the lock is released, so
    /// losers of the race await the same `OnceCell` instead of re-running
    /// `factory`.
    pub async fn get_or_create<F>(&self, endpoint: &str, kind: RuntimeKind, factory: F) -> Arc<dyn RuntimeAdapter>
    where
        F: FnOnce() -> Arc<dyn RuntimeAdapter>,
    {
        let key = (endpoint.to_string(), kind);

        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(key).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        slot.get_or_init(|| async { factory() }).await.clone()
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::code::CodeAdapter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn single_flight_constructs_once_under_concurrency() {
        let pool = Arc::new(AdapterPool::new());
        let construct_count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let count = construct_count.clone();
            handles.push(tokio::spawn(async move {
                pool.get_or_create("http://127.0.0.1:8123", RuntimeKind::Code, || {
                    count.fetch_add(1, Ordering::SeqCst);
                    Arc::new(CodeAdapter::new("http://127.0.0.1:8123".to_string(), reqwest::Client::new()))
                })
                .await
            }));
        }

        let mut adapters = Vec::new();
        for h in handles {
            adapters.push(h.await.unwrap());
        }

        assert_eq!(construct_count.load(Ordering::SeqCst), 1);
        for a in &adapters[1..] {
            assert!(Arc::ptr_eq(&adapters[0], a));
        }
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_adapters() {
        let pool = AdapterPool::new();
        let a = pool
            .get_or_create("http://127.0.0.1:8123", RuntimeKind::Code, || {
                Arc::new(CodeAdapter::new("http://127.0.0.1:8123".to_string(), reqwest::Client::new()))
            })
            .await;
        let b = pool
            .get_or_create("http://127.0.0.1:9000", RuntimeKind::Browser, || {
                Arc::new(crate::adapter::browser::BrowserAdapter::new(
                    "http://127.0.0.1:9000".to_string(),
                    reqwest::Client::new(),
                ))
            })
            .await;
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len().await, 2);
    }
}
