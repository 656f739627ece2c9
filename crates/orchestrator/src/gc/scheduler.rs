//! GC Scheduler: a periodic loop that
//! acquires the coordinator lease, runs T1-T4 strictly serially against one
//! fresh DB transaction per cycle, and never overlaps the periodic cycle
//! with an administrative manual trigger.

use std::sync::Arc;
use std::time::Duration;

use sqlx::Row;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use bay_driver::Driver;

use crate::config::GcConfig;
use crate::db::DbPool;
use crate::locks::SandboxLockRegistry;
use crate::managers::{CargoManager, SessionManager};

use super::coordinator::GcCoordinator;
use super::tasks::{self, TaskResult};

#[derive(Debug, Default, serde::Serialize)]
pub struct CycleReport {
    pub skipped_no_lease: bool,
    pub idle_session: TaskResult,
    pub expired_sandbox: TaskResult,
    pub orphan_cargo: TaskResult,
    pub orphan_container: TaskResult,
}

pub struct GcScheduler {
    pool: DbPool,
    driver: Arc<dyn Driver>,
    locks: Arc<SandboxLockRegistry>,
    cargo_manager: Arc<CargoManager>,
    session_manager: Arc<SessionManager>,
    coordinator: Arc<dyn GcCoordinator>,
    config: GcConfig,
    instance_id: String,
    /// Separates the periodic cycle from administrative manual triggers so
    /// the two never run concurrently.
    run_lock: AsyncMutex<()>,
}

impl GcScheduler {
    pub fn new(
        pool: DbPool,
        driver: Arc<dyn Driver>,
        locks: Arc<SandboxLockRegistry>,
        cargo_manager: Arc<CargoManager>,
        session_manager: Arc<SessionManager>,
        coordinator: Arc<dyn GcCoordinator>,
        config: GcConfig,
        instance_id: String,
    ) -> Self {
        Self { pool, driver, locks, cargo_manager, session_manager, coordinator, config, instance_id, run_lock: AsyncMutex::new(()) }
    }

    /// Run one GC cycle: T1 -> T2 -> T3 -> T4, strictly serial. Skipped
    /// entirely when the coordinator lease is unheld (single-instance
    /// deployments always hold it, via `NoopCoordinator`).
    pub async fn run_cycle(&self) -> CycleReport {
        let _run_guard = self.run_lock.lock().await;

        if !self.coordinator.acquire().await {
            return CycleReport { skipped_no_lease: true, ..Default::default() };
        }

        // An explicit rollback at the start of the cycle forces the
        // connections tasks acquire afterward to see the latest committed
        // state rather than a snapshot predating this cycle — SQLite's
        // snapshot isolation otherwise hides commits made by the previous
        // task in the same cycle.
        if let Ok(txn) = self.pool.begin().await {
            let _ = txn.rollback().await;
        }

        let mut report = CycleReport::default();

        if self.config.idle_session.enabled {
            report.idle_session = tasks::idle_session_gc(&self.pool, &self.locks, &self.session_manager).await;
        }
        if self.config.expired_sandbox.enabled {
            report.expired_sandbox =
                tasks::expired_sandbox_gc(&self.pool, &self.locks, &self.session_manager, &self.cargo_manager).await;
        }
        if self.config.orphan_cargo.enabled {
            report.orphan_cargo = tasks::orphan_cargo_gc(&self.pool, &self.cargo_manager).await;
        }
        if self.config.orphan_container.enabled {
            report.orphan_container = tasks::orphan_container_gc(&self.pool, &self.driver, &self.instance_id).await;
        }

        self.reap_tombstoned_locks().await;
        report
    }

    /// Drop in-process locks for sandboxes tombstoned during this cycle
    /// (including by a concurrent request, not just T2), so the registry
    /// doesn't grow unboundedly across the process lifetime.
    async fn reap_tombstoned_locks(&self) {
        if let Ok(rows) = sqlx::query("SELECT id FROM sandboxes WHERE deleted_at IS NOT NULL").fetch_all(&self.pool).await {
            let ids: Vec<String> = rows.into_iter().map(|r| r.get::<String, _>("id")).collect();
            self.locks.cleanup_many(ids.iter().map(String::as_str));
        }
    }

    /// Administrative manual trigger. Shares `run_lock` with the periodic
    /// loop so the two never overlap.
    pub async fn trigger_manual(&self) -> CycleReport {
        self.run_cycle().await
    }

    /// Periodic loop with a cancellable sleep. On shutdown the sleep is
    /// cancelled and this returns once the currently running cycle
    /// finishes — in-flight work is never preempted mid-transaction.
    pub async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        if self.config.run_on_startup {
            log_cycle(&self.run_cycle().await);
        }

        let interval = Duration::from_secs(self.config.interval_seconds.max(1));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("gc scheduler loop cancelled, shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    log_cycle(&self.run_cycle().await);
                }
            }
        }
    }
}

fn log_cycle(report: &CycleReport) {
    if report.skipped_no_lease {
        tracing::debug!("gc cycle skipped: coordinator lease not held");
        return;
    }
    tracing::info!(
        idle_cleaned = report.idle_session.cleaned_count,
        idle_skipped = report.idle_session.skipped_count,
        expired_cleaned = report.expired_sandbox.cleaned_count,
        orphan_cargo_cleaned = report.orphan_cargo.cleaned_count,
        orphan_container_cleaned = report.orphan_container.cleaned_count,
        "gc cycle complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GcTaskConfig, ImagePullPolicySetting};
    use async_trait::async_trait;
    use bay_driver::fake::FakeDriver;
    use bay_driver::ImagePullPolicy;

    struct DenyingCoordinator;

    #[async_trait]
    impl GcCoordinator for DenyingCoordinator {
        async fn acquire(&self) -> bool {
            false
        }
    }

    fn gc_config(idle: bool, expired: bool, orphan_cargo: bool, orphan_container: bool) -> GcConfig {
        GcConfig {
            enabled: true,
            run_on_startup: false,
            interval_seconds: 60,
            instance_id: Some("bay".to_string()),
            idle_session: GcTaskConfig { enabled: idle },
            expired_sandbox: GcTaskConfig { enabled: expired },
            orphan_cargo: GcTaskConfig { enabled: orphan_cargo },
            orphan_container: GcTaskConfig { enabled: orphan_container },
        }
    }

    async fn build_scheduler(coordinator: Arc<dyn GcCoordinator>, config: GcConfig) -> GcScheduler {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let driver: Arc<dyn Driver> = Arc::new(FakeDriver::new());
        let locks = Arc::new(SandboxLockRegistry::new());
        let cargo_manager = Arc::new(CargoManager::new(pool.clone(), driver.clone()));
        let session_manager = Arc::new(SessionManager::new(
            pool.clone(),
            driver.clone(),
            reqwest::Client::new(),
            ImagePullPolicy::IfNotPresent,
            std::time::Duration::from_millis(50),
            "/workspace".to_string(),
        ));
        GcScheduler::new(pool, driver, locks, cargo_manager, session_manager, coordinator, config, "bay".to_string())
    }

    #[tokio::test]
    async fn cycle_is_skipped_entirely_when_lease_is_unheld() {
        let scheduler = build_scheduler(Arc::new(DenyingCoordinator), gc_config(true, true, true, true)).await;
        let report = scheduler.run_cycle().await;
        assert!(report.skipped_no_lease);
        assert_eq!(report.idle_session.cleaned_count, 0);
    }

    #[tokio::test]
    async fn disabled_tasks_are_not_invoked() {
        let scheduler = build_scheduler(Arc::new(crate::gc::NoopCoordinator), gc_config(false, false, false, false)).await;

        sqlx::query(
            "INSERT INTO cargos (id, owner, backend, driver_ref, managed, managed_by_sandbox_id, size_limit_mb, created_at, last_accessed_at) \
             VALUES ('cg-orphan', 'owner-1', 'local', 'bay-cargo-cg-orphan', TRUE, NULL, NULL, ?, ?)",
        )
        .bind(chrono::Utc::now())
        .bind(chrono::Utc::now())
        .execute(&scheduler.pool)
        .await
        .unwrap();

        let report = scheduler.run_cycle().await;
        assert!(!report.skipped_no_lease);
        // orphan_cargo is disabled: the orphan row above must survive.
        assert_eq!(report.orphan_cargo.cleaned_count, 0);
        let still_there: Option<(String,)> = sqlx::query_as("SELECT id FROM cargos WHERE id = 'cg-orphan'")
            .fetch_optional(&scheduler.pool)
            .await
            .unwrap();
        assert!(still_there.is_some());
    }

    #[tokio::test]
    async fn run_lock_serializes_manual_trigger_against_concurrent_cycle() {
        let scheduler = Arc::new(build_scheduler(Arc::new(crate::gc::NoopCoordinator), gc_config(true, true, true, false)).await);

        let a = scheduler.clone();
        let b = scheduler.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.run_cycle().await }),
            tokio::spawn(async move { b.trigger_manual().await }),
        );
        // Both complete without panicking; overlap is prevented by run_lock,
        // not observable here beyond both cycles finishing cleanly.
        assert!(!ra.unwrap().skipped_no_lease);
        assert!(!rb.unwrap().skipped_no_lease);
    }
}
