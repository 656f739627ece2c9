//! Cargo Manager: CRUD over persistent volumes, managed vs.
//! external deletion invariants.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use bay_driver::Driver;

use crate::db::DbPool;
use crate::error::CoreError;
use crate::models::{Cargo, CargoBackend};

fn new_cargo_id() -> String {
    format!("ws-{}", Uuid::new_v4().simple().to_string()[..12].to_string())
}

fn volume_name(cargo_id: &str) -> String {
    format!("bay-cargo-{cargo_id}")
}

pub struct CargoManager {
    pool: DbPool,
    driver: Arc<dyn Driver>,
}

impl CargoManager {
    pub fn new(pool: DbPool, driver: Arc<dyn Driver>) -> Self {
        Self { pool, driver }
    }

    /// Create a backend volume with the required labels, then persist the
    /// row in the same logical operation. If persistence fails, the volume
    /// that was already created is torn back down so nothing dangles.
    pub async fn create(
        &self,
        owner: &str,
        managed: bool,
        managed_by_sandbox_id: Option<&str>,
        size_limit_mb: Option<u64>,
    ) -> Result<Cargo, CoreError> {
        let id = new_cargo_id();
        let driver_ref = volume_name(&id);

        let mut labels = HashMap::new();
        labels.insert("bay.owner".to_string(), owner.to_string());
        labels.insert("bay.cargo_id".to_string(), id.clone());
        labels.insert("bay.managed".to_string(), "true".to_string());

        self.driver.create_volume(&driver_ref, labels).await?;

        let now = Utc::now();
        let insert = sqlx::query(
            "INSERT INTO cargos (id, owner, backend, driver_ref, managed, managed_by_sandbox_id, size_limit_mb, created_at, last_accessed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(owner)
        .bind("local")
        .bind(&driver_ref)
        .bind(managed)
        .bind(managed_by_sandbox_id)
        .bind(size_limit_mb.map(|v| v as i64))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        if let Err(e) = insert {
            // Best-effort rollback: do not leave a dangling volume behind.
            let _ = self.driver.delete_volume(&driver_ref).await;
            return Err(CoreError::from(e));
        }

        Ok(Cargo {
            id,
            owner: owner.to_string(),
            backend: CargoBackend::Local,
            driver_ref,
            managed,
            managed_by_sandbox_id: managed_by_sandbox_id.map(str::to_string),
            size_limit_mb,
            created_at: now,
            last_accessed_at: now,
        })
    }

    pub async fn get(&self, id: &str, owner: &str) -> Result<Cargo, CoreError> {
        sqlx::query_as::<_, Cargo>("SELECT * FROM cargos WHERE id = ? AND owner = ?")
            .bind(id)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("cargo {id}")))
    }

    /// `managed = None` returns external cargos only, the default listing
    /// behavior.
    pub async fn list(
        &self,
        owner: &str,
        managed: Option<bool>,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<Vec<Cargo>, CoreError> {
        let managed_filter = managed.unwrap_or(false);
        let cursor = cursor.unwrap_or("");
        let rows = sqlx::query_as::<_, Cargo>(
            "SELECT * FROM cargos WHERE owner = ? AND managed = ? AND id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(owner)
        .bind(managed_filter)
        .bind(cursor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Referential rules: external cargo rejects delete while any living
    /// sandbox references it; managed cargo rejects delete unless the
    /// managing sandbox is absent, tombstoned, or `force=true`.
    pub async fn delete(&self, id: &str, owner: &str, force: bool) -> Result<(), CoreError> {
        let cargo = self.get(id, owner).await?;

        if cargo.managed {
            if !force {
                if let Some(sandbox_id) = &cargo.managed_by_sandbox_id {
                    let alive = sqlx::query("SELECT 1 FROM sandboxes WHERE id = ? AND deleted_at IS NULL")
                        .bind(sandbox_id)
                        .fetch_optional(&self.pool)
                        .await?;
                    if alive.is_some() {
                        return Err(CoreError::Conflict(format!(
                            "cargo {id} is still owned by live sandbox {sandbox_id}"
                        )));
                    }
                }
            }
        } else {
            let blockers: Vec<String> =
                sqlx::query("SELECT id FROM sandboxes WHERE cargo_id = ? AND deleted_at IS NULL")
                    .bind(id)
                    .fetch_all(&self.pool)
                    .await?
                    .into_iter()
                    .map(|r| r.get::<String, _>("id"))
                    .collect();
            if !blockers.is_empty() {
                return Err(CoreError::Conflict(format!(
                    "cargo {id} is referenced by live sandboxes: {}",
                    blockers.join(", ")
                )));
            }
        }

        self.driver.delete_volume(&cargo.driver_ref).await?;
        sqlx::query("DELETE FROM cargos WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    /// No owner check; idempotent; used by GC (orphan cargo cleanup).
    pub async fn delete_internal_by_id(&self, id: &str) -> Result<(), CoreError> {
        let row = sqlx::query_as::<_, Cargo>("SELECT * FROM cargos WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(cargo) = row else {
            return Ok(());
        };
        let _ = self.driver.delete_volume(&cargo.driver_ref).await;
        sqlx::query("DELETE FROM cargos WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(())
    }
}
