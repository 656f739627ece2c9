//! GC coordination lease. A no-op coordinator always yields true, which is
//! correct for single-instance deployments; a real coordinator (e.g.
//! backed by a DB advisory lock) would contend with other instances here.

use async_trait::async_trait;

#[async_trait]
pub trait GcCoordinator: Send + Sync {
    /// Returns true if this instance may run the current GC cycle.
    async fn acquire(&self) -> bool;
}

#[derive(Default)]
pub struct NoopCoordinator;

#[async_trait]
impl GcCoordinator for NoopCoordinator {
    async fn acquire(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_coordinator_always_grants_lease() {
        let c = NoopCoordinator;
        assert!(c.acquire().await);
        assert!(c.acquire().await);
    }
}
