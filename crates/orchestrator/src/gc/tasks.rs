//! GC tasks T1-T4. Each returns a `TaskResult` so per-item
//! errors are recorded rather than aborting the rest of the batch.

use std::sync::Arc;

use chrono::Utc;
use sqlx::Row;

use bay_driver::{labels, Driver};

use crate::db::DbPool;
use crate::locks::SandboxLockRegistry;
use crate::managers::{CargoManager, SessionManager};
use crate::models::{Sandbox, Session};

#[derive(Debug, Default, serde::Serialize)]
pub struct TaskResult {
    pub cleaned_count: u64,
    pub skipped_count: u64,
    pub errors: Vec<String>,
}

impl TaskResult {
    fn record_error(&mut self, context: &str, err: impl std::fmt::Display) {
        self.errors.push(format!("{context}: {err}"));
    }
}

async fn fetch_sandbox(pool: &DbPool, id: &str) -> Result<Option<Sandbox>, sqlx::Error> {
    sqlx::query_as::<_, Sandbox>("SELECT * FROM sandboxes WHERE id = ?").bind(id).fetch_optional(pool).await
}

async fn fetch_session(pool: &DbPool, id: &str) -> Result<Option<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?").bind(id).fetch_optional(pool).await
}

/// T1. Idle Session GC: destroy sessions for sandboxes whose idle deadline
/// has passed, unless the deadline was pushed out again since selection.
pub async fn idle_session_gc(
    pool: &DbPool,
    locks: &SandboxLockRegistry,
    session_manager: &SessionManager,
) -> TaskResult {
    let mut result = TaskResult::default();
    let now = Utc::now();

    let candidates = match sqlx::query("SELECT id FROM sandboxes WHERE deleted_at IS NULL AND idle_expires_at < ?")
        .bind(now)
        .fetch_all(pool)
        .await
    {
        Ok(rows) => rows.into_iter().map(|r| r.get::<String, _>("id")).collect::<Vec<_>>(),
        Err(e) => {
            result.record_error("select idle candidates", e);
            return result;
        }
    };

    for sandbox_id in candidates {
        let lock = locks.get(&sandbox_id);
        let _guard = lock.lock().await;

        let sandbox = match fetch_sandbox(pool, &sandbox_id).await {
            Ok(Some(s)) => s,
            Ok(None) => continue,
            Err(e) => {
                result.record_error(&sandbox_id, e);
                continue;
            }
        };

        if sandbox.is_deleted() {
            result.skipped_count += 1;
            continue;
        }
        if sandbox.idle_expires_at.map(|t| t >= Utc::now()).unwrap_or(true) {
            result.skipped_count += 1;
            continue;
        }

        if let Some(session_id) = &sandbox.current_session_id {
            match fetch_session(pool, session_id).await {
                Ok(Some(mut session)) => {
                    if let Err(e) = session_manager.destroy(&mut session).await {
                        result.record_error(&sandbox_id, e);
                    }
                }
                Ok(None) => {}
                Err(e) => result.record_error(&sandbox_id, e),
            }
        }

        if let Err(e) = sqlx::query("UPDATE sandboxes SET current_session_id = NULL, idle_expires_at = NULL WHERE id = ?")
            .bind(&sandbox_id)
            .execute(pool)
            .await
        {
            result.record_error(&sandbox_id, e);
            continue;
        }

        result.cleaned_count += 1;
    }

    result
}

/// T2. Expired Sandbox GC: destroy sessions, tombstone the sandbox, then
/// cascade-delete its managed cargo. Order matters — an interrupt at any
/// point leaves a state a later cycle can complete.
pub async fn expired_sandbox_gc(
    pool: &DbPool,
    locks: &SandboxLockRegistry,
    session_manager: &SessionManager,
    cargo_manager: &CargoManager,
) -> TaskResult {
    let mut result = TaskResult::default();
    let now = Utc::now();

    let candidates = match sqlx::query("SELECT id FROM sandboxes WHERE deleted_at IS NULL AND expires_at IS NOT NULL AND expires_at < ?")
        .bind(now)
        .fetch_all(pool)
        .await
    {
        Ok(rows) => rows.into_iter().map(|r| r.get::<String, _>("id")).collect::<Vec<_>>(),
        Err(e) => {
            result.record_error("select expired candidates", e);
            return result;
        }
    };

    for sandbox_id in candidates {
        let lock = locks.get(&sandbox_id);
        let _guard = lock.lock().await;

        let sandbox = match fetch_sandbox(pool, &sandbox_id).await {
            Ok(Some(s)) => s,
            Ok(None) => continue,
            Err(e) => {
                result.record_error(&sandbox_id, e);
                continue;
            }
        };

        if sandbox.is_deleted() {
            result.skipped_count += 1;
            continue;
        }
        let still_expired = sandbox.expires_at.map(|t| t < Utc::now()).unwrap_or(false);
        if !still_expired {
            result.skipped_count += 1;
            continue;
        }

        if let Some(session_id) = &sandbox.current_session_id {
            match fetch_session(pool, session_id).await {
                Ok(Some(mut session)) => {
                    if let Err(e) = session_manager.destroy(&mut session).await {
                        result.record_error(&sandbox_id, e);
                    }
                }
                Ok(None) => {}
                Err(e) => result.record_error(&sandbox_id, e),
            }
        }

        if let Err(e) = sqlx::query("UPDATE sandboxes SET deleted_at = ?, current_session_id = NULL WHERE id = ?")
            .bind(Utc::now())
            .bind(&sandbox_id)
            .execute(pool)
            .await
        {
            result.record_error(&sandbox_id, e);
            continue;
        }

        if let Some(cargo_id) = &sandbox.cargo_id {
            if let Err(e) = cargo_manager.delete_internal_by_id(cargo_id).await {
                // Logged, not fatal to the task.
                result.record_error(&format!("cargo cascade for {sandbox_id}"), e);
            }
        }

        result.cleaned_count += 1;
    }

    result
}

/// T3. Orphan Cargo GC: managed cargos whose owning sandbox is gone or
/// tombstoned.
pub async fn orphan_cargo_gc(pool: &DbPool, cargo_manager: &CargoManager) -> TaskResult {
    let mut result = TaskResult::default();

    let rows = sqlx::query(
        "SELECT c.id FROM cargos c LEFT JOIN sandboxes s ON c.managed_by_sandbox_id = s.id \
         WHERE c.managed = TRUE AND (c.managed_by_sandbox_id IS NULL OR s.id IS NULL OR s.deleted_at IS NOT NULL)",
    )
    .fetch_all(pool)
    .await;

    let ids: Vec<String> = match rows {
        Ok(rows) => rows.into_iter().map(|r| r.get::<String, _>("id")).collect(),
        Err(e) => {
            result.record_error("select orphan cargo candidates", e);
            return result;
        }
    };

    for id in ids {
        match cargo_manager.delete_internal_by_id(&id).await {
            Ok(()) => result.cleaned_count += 1,
            Err(e) => result.record_error(&id, e),
        }
    }

    result
}

/// T4. Orphan Container GC (strict). Destroys a runtime instance only when
/// every one of conditions (a)-(e) below holds; otherwise it is skipped,
/// never partial-matched.
pub async fn orphan_container_gc(pool: &DbPool, driver: &Arc<dyn Driver>, instance_id: &str) -> TaskResult {
    let mut result = TaskResult::default();

    let mut filter = std::collections::HashMap::new();
    filter.insert(labels::LABEL_MANAGED.to_string(), "true".to_string());
    filter.insert(labels::LABEL_INSTANCE_ID.to_string(), instance_id.to_string());

    let instances = match driver.list_runtime_instances(&filter).await {
        Ok(list) => list,
        Err(e) => {
            result.record_error("list runtime instances", e);
            return result;
        }
    };

    for instance in instances {
        // (a) name prefix
        if !instance.name.starts_with(labels::SESSION_CONTAINER_PREFIX) {
            result.skipped_count += 1;
            continue;
        }
        // (b) every required label present
        if !labels::REQUIRED_CONTAINER_LABELS.iter().all(|l| instance.labels.contains_key(*l)) {
            result.skipped_count += 1;
            continue;
        }
        // (c) managed == "true"
        if instance.labels.get(labels::LABEL_MANAGED).map(String::as_str) != Some("true") {
            result.skipped_count += 1;
            continue;
        }
        // (d) instance_id matches (belt-and-suspenders on top of the filter)
        if instance.labels.get(labels::LABEL_INSTANCE_ID).map(String::as_str) != Some(instance_id) {
            result.skipped_count += 1;
            continue;
        }
        // (e) session_id non-empty and absent from the DB
        let session_id = match instance.labels.get(labels::LABEL_SESSION_ID) {
            Some(id) if !id.is_empty() => id,
            _ => {
                result.skipped_count += 1;
                continue;
            }
        };
        match fetch_session(pool, session_id).await {
            Ok(Some(_)) => {
                result.skipped_count += 1;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                result.record_error(&instance.id, e);
                continue;
            }
        }

        match driver.destroy_runtime_instance(&instance.id).await {
            Ok(()) => result.cleaned_count += 1,
            Err(e) => result.record_error(&instance.id, e),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use bay_driver::fake::FakeDriver;
    use bay_driver::{ContainerSpec, ImagePullPolicy};
    use std::collections::HashMap;

    #[tokio::test]
    async fn orphan_container_gc_skips_wrong_name_prefix() {
        let driver: Arc<dyn Driver> = Arc::new(FakeDriver::new());
        let mut labels_map = HashMap::new();
        labels_map.insert(labels::LABEL_SESSION_ID.to_string(), "sess-ghost".to_string());
        labels_map.insert(labels::LABEL_SANDBOX_ID.to_string(), "sb-x".to_string());
        labels_map.insert(labels::LABEL_CARGO_ID.to_string(), "cg-x".to_string());
        labels_map.insert(labels::LABEL_INSTANCE_ID.to_string(), "bay".to_string());
        labels_map.insert(labels::LABEL_MANAGED.to_string(), "true".to_string());

        let spec = ContainerSpec {
            name: "other-x".to_string(),
            image: "bay/ship:latest".to_string(),
            runtime_port: 8123,
            env: HashMap::new(),
            cpu_limit: None,
            memory_limit_mb: None,
            volume_mounts: vec![],
            network: None,
        };
        driver.create(&spec, labels_map, ImagePullPolicy::IfNotPresent).await.unwrap();

        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();

        let result = orphan_container_gc(&pool, &driver, "bay").await;
        assert_eq!(result.cleaned_count, 0);
        assert_eq!(result.skipped_count, 1);
    }

    #[tokio::test]
    async fn orphan_container_gc_destroys_when_all_conditions_hold() {
        let driver: Arc<dyn Driver> = Arc::new(FakeDriver::new());
        let mut labels_map = HashMap::new();
        labels_map.insert(labels::LABEL_SESSION_ID.to_string(), "sess-ghost".to_string());
        labels_map.insert(labels::LABEL_SANDBOX_ID.to_string(), "sb-x".to_string());
        labels_map.insert(labels::LABEL_CARGO_ID.to_string(), "cg-x".to_string());
        labels_map.insert(labels::LABEL_INSTANCE_ID.to_string(), "bay".to_string());
        labels_map.insert(labels::LABEL_MANAGED.to_string(), "true".to_string());

        let spec = ContainerSpec {
            name: format!("{}zzz", labels::SESSION_CONTAINER_PREFIX),
            image: "bay/ship:latest".to_string(),
            runtime_port: 8123,
            env: HashMap::new(),
            cpu_limit: None,
            memory_limit_mb: None,
            volume_mounts: vec![],
            network: None,
        };
        driver.create(&spec, labels_map, ImagePullPolicy::IfNotPresent).await.unwrap();

        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();

        let result = orphan_container_gc(&pool, &driver, "bay").await;
        assert_eq!(result.cleaned_count, 1);
        assert_eq!(result.skipped_count, 0);
    }

    #[tokio::test]
    async fn orphan_container_gc_skips_missing_required_label() {
        let driver: Arc<dyn Driver> = Arc::new(FakeDriver::new());
        let mut labels_map = HashMap::new();
        labels_map.insert(labels::LABEL_SESSION_ID.to_string(), "sess-ghost".to_string());
        labels_map.insert(labels::LABEL_SANDBOX_ID.to_string(), "sb-x".to_string());
        // bay.cargo_id deliberately omitted
        labels_map.insert(labels::LABEL_INSTANCE_ID.to_string(), "bay".to_string());
        labels_map.insert(labels::LABEL_MANAGED.to_string(), "true".to_string());

        let spec = ContainerSpec {
            name: format!("{}zzz", labels::SESSION_CONTAINER_PREFIX),
            image: "bay/ship:latest".to_string(),
            runtime_port: 8123,
            env: HashMap::new(),
            cpu_limit: None,
            memory_limit_mb: None,
            volume_mounts: vec![],
            network: None,
        };
        driver.create(&spec, labels_map, ImagePullPolicy::IfNotPresent).await.unwrap();

        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();

        let result = orphan_container_gc(&pool, &driver, "bay").await;
        assert_eq!(result.cleaned_count, 0);
        assert_eq!(result.skipped_count, 1);
    }
}
