//! Per-sandbox in-process mutual exclusion.
//!
//! A process-wide `sandbox_id -> mutex` map behind one bookkeeping mutex.
//! Uses a single guard lock rather than a concurrent map's racy
//! `contains_key` pre-check, because two callers racing on the same key
//! can both observe a miss and both create a mutex, which defeats the
//! exclusion this registry exists to provide: "get-or-create" must be
//! atomic, not merely fast.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Default)]
pub struct SandboxLockRegistry {
    locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SandboxLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the mutex for `sandbox_id`, creating it if absent. The
    /// bookkeeping mutex is never held across the returned mutex's own lock.
    pub fn get(&self, sandbox_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        locks.entry(sandbox_id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Drop the entry for `sandbox_id`. Safe to call even if another task
    /// currently holds a clone of the `Arc` — it keeps working, just isn't
    /// reachable via the registry anymore.
    pub fn cleanup(&self, sandbox_id: &str) {
        self.locks.lock().remove(sandbox_id);
    }

    /// Drop entries for every id in `sandbox_ids`, for the GC scheduler to
    /// release locks of sandboxes tombstoned during a cycle.
    pub fn cleanup_many<'a>(&self, sandbox_ids: impl IntoIterator<Item = &'a str>) {
        let mut locks = self.locks.lock();
        for id in sandbox_ids {
            locks.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_same_mutex_for_same_id() {
        let registry = SandboxLockRegistry::new();
        let a = registry.get("sb-1");
        let b = registry.get("sb-1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn distinct_ids_get_distinct_mutexes() {
        let registry = SandboxLockRegistry::new();
        let a = registry.get("sb-1");
        let b = registry.get("sb-2");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn cleanup_removes_entry_but_not_outstanding_clones() {
        let registry = SandboxLockRegistry::new();
        let held = registry.get("sb-1");
        registry.cleanup("sb-1");
        assert!(registry.is_empty());
        // the clone a caller already took keeps working
        let _guard = held.lock().await;
    }

    #[tokio::test]
    async fn cleanup_many_drops_only_named_ids() {
        let registry = SandboxLockRegistry::new();
        registry.get("sb-1");
        registry.get("sb-2");
        registry.cleanup_many(["sb-1"]);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn lock_serializes_concurrent_acquirers() {
        let registry = Arc::new(SandboxLockRegistry::new());
        let order = Arc::new(SyncMutex::new(Vec::new()));

        let mutex = registry.get("sb-1");
        let guard = mutex.lock().await;

        let registry2 = registry.clone();
        let order2 = order.clone();
        let handle = tokio::spawn(async move {
            let mutex2 = registry2.get("sb-1");
            let _g = mutex2.lock().await;
            order2.lock().push("second");
        });

        tokio::task::yield_now().await;
        order.lock().push("first");
        drop(guard);
        handle.await.unwrap();

        assert_eq!(*order.lock(), vec!["first", "second"]);
    }
}
