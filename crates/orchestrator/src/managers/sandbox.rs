//! Sandbox Manager: the top-level entity manager, owning the
//! sandbox state machine, TTL/idle timers, keepalive, stop/delete and
//! cascade to Cargo and Sessions.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::adapter::AdapterPool;
use crate::config::OrchestratorConfig;
use crate::db::DbPool;
use crate::error::CoreError;
use crate::locks::SandboxLockRegistry;
use crate::managers::cargo::CargoManager;
use crate::managers::session::SessionManager;
use crate::models::{Cargo, Sandbox, Session, SessionState};

fn new_sandbox_id() -> String {
    format!("sb-{}", Uuid::new_v4())
}

pub struct SandboxManager {
    pool: DbPool,
    config: Arc<OrchestratorConfig>,
    locks: Arc<SandboxLockRegistry>,
    cargo_manager: Arc<CargoManager>,
    session_manager: Arc<SessionManager>,
    adapter_pool: Arc<AdapterPool>,
    http: reqwest::Client,
}

impl SandboxManager {
    pub fn new(
        pool: DbPool,
        config: Arc<OrchestratorConfig>,
        locks: Arc<SandboxLockRegistry>,
        cargo_manager: Arc<CargoManager>,
        session_manager: Arc<SessionManager>,
        adapter_pool: Arc<AdapterPool>,
        http: reqwest::Client,
    ) -> Self {
        Self { pool, config, locks, cargo_manager, session_manager, adapter_pool, http }
    }

    /// True if the session's primary endpoint reports healthy right now.
    async fn probe_session_health(&self, session: &Session) -> bool {
        let Some(endpoint) = &session.endpoint else {
            return false;
        };
        let adapter = crate::adapter::adapter_for(&self.adapter_pool, &self.http, endpoint, &session.runtime_type).await;
        adapter.health().await
    }

    pub async fn create(
        &self,
        owner: &str,
        profile_id: &str,
        ttl_seconds: Option<i64>,
    ) -> Result<Sandbox, CoreError> {
        let profile = self
            .config
            .profile(profile_id)
            .ok_or_else(|| CoreError::ValidationError(format!("unknown profile {profile_id}")))?;

        let cargo = self.cargo_manager.create(owner, true, None, None).await?;

        let now = Utc::now();
        let id = new_sandbox_id();
        let expires_at = ttl_seconds.map(|s| now + Duration::seconds(s));

        sqlx::query(
            "INSERT INTO sandboxes (id, owner, profile_id, cargo_id, current_session_id, expires_at, idle_expires_at, deleted_at, version, created_at, last_active_at) \
             VALUES (?, ?, ?, ?, NULL, ?, NULL, NULL, 1, ?, ?)",
        )
        .bind(&id)
        .bind(owner)
        .bind(&profile.id)
        .bind(&cargo.id)
        .bind(expires_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        // Backfill the cargo's managing sandbox now that the id exists.
        sqlx::query("UPDATE cargos SET managed_by_sandbox_id = ? WHERE id = ?")
            .bind(&id)
            .bind(&cargo.id)
            .execute(&self.pool)
            .await?;

        Ok(Sandbox {
            id,
            owner: owner.to_string(),
            profile_id: profile.id.clone(),
            cargo_id: Some(cargo.id),
            current_session_id: None,
            expires_at,
            idle_expires_at: None,
            deleted_at: None,
            version: 1,
            created_at: now,
            last_active_at: now,
        })
    }

    pub async fn get(&self, id: &str, owner: &str) -> Result<Sandbox, CoreError> {
        sqlx::query_as::<_, Sandbox>("SELECT * FROM sandboxes WHERE id = ? AND owner = ?")
            .bind(id)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("sandbox {id}")))
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, CoreError> {
        Ok(sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_cargo_row(&self, cargo_id: &str) -> Result<Cargo, CoreError> {
        sqlx::query_as::<_, Cargo>("SELECT * FROM cargos WHERE id = ?")
            .bind(cargo_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("cargo {cargo_id}")))
    }

    /// Called by the Capability Router before dispatch. Runs under the
    /// per-sandbox lock; refetches the row to get a fresh view before
    /// deciding whether a new session is needed.
    pub async fn ensure_running(&self, sandbox_id: &str, owner: &str) -> Result<Session, CoreError> {
        let lock = self.locks.get(sandbox_id);
        let _guard = lock.lock().await;

        let sandbox = self.get(sandbox_id, owner).await?;
        let now = Utc::now();

        if sandbox.is_deleted() {
            return Err(CoreError::NotFound(format!("sandbox {sandbox_id} is deleted")));
        }
        if sandbox.is_expired(now) {
            return Err(CoreError::SandboxExpired);
        }

        if let Some(session_id) = &sandbox.current_session_id {
            if let Some(mut session) = self.get_session(session_id).await? {
                if session.is_running() {
                    if self.probe_session_health(&session).await {
                        return Ok(session);
                    }
                    tracing::warn!(sandbox_id, session_id, "health probe failed on reused session, rebuilding");
                    let _ = self.session_manager.destroy(&mut session).await;
                }
            }
        }

        let profile = self
            .config
            .profile(&sandbox.profile_id)
            .ok_or_else(|| CoreError::ValidationError(format!("unknown profile {}", sandbox.profile_id)))?;
        let cargo_id = sandbox
            .cargo_id
            .as_ref()
            .ok_or_else(|| CoreError::RuntimeError(format!("sandbox {sandbox_id} has no cargo")))?;
        let cargo = self.get_cargo_row(cargo_id).await?;

        let pending = self.session_manager.create(sandbox_id, profile).await?;
        let instance_id = self.config.gc.resolved_instance_id();
        let session = self.session_manager.ensure_running(pending, &cargo, profile, &instance_id).await?;

        let idle_expires_at = now + Duration::seconds(profile.idle_timeout_seconds as i64);
        sqlx::query(
            "UPDATE sandboxes SET current_session_id = ?, idle_expires_at = ?, last_active_at = ?, version = version + 1 WHERE id = ?",
        )
        .bind(&session.id)
        .bind(idle_expires_at)
        .bind(now)
        .bind(sandbox_id)
        .execute(&self.pool)
        .await?;

        Ok(session)
    }

    /// Extend `idle_expires_at` only. Never starts a session, never touches
    /// `expires_at`.
    pub async fn keepalive(&self, sandbox_id: &str, owner: &str) -> Result<(), CoreError> {
        let lock = self.locks.get(sandbox_id);
        let _guard = lock.lock().await;

        let sandbox = self.get(sandbox_id, owner).await?;
        if sandbox.current_session_id.is_none() {
            return Ok(());
        }
        let profile = self
            .config
            .profile(&sandbox.profile_id)
            .ok_or_else(|| CoreError::ValidationError(format!("unknown profile {}", sandbox.profile_id)))?;
        let idle_expires_at = Utc::now() + Duration::seconds(profile.idle_timeout_seconds as i64);
        sqlx::query("UPDATE sandboxes SET idle_expires_at = ? WHERE id = ?")
            .bind(idle_expires_at)
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn extend_ttl(&self, sandbox_id: &str, owner: &str, extend_by_seconds: i64) -> Result<Sandbox, CoreError> {
        if extend_by_seconds <= 0 {
            return Err(CoreError::ValidationError("extend_by must be > 0".to_string()));
        }

        let lock = self.locks.get(sandbox_id);
        let _guard = lock.lock().await;

        let mut sandbox = self.get(sandbox_id, owner).await?;
        let now = Utc::now();

        let Some(expires_at) = sandbox.expires_at else {
            return Err(CoreError::SandboxTtlInfinite);
        };
        if expires_at < now {
            return Err(CoreError::SandboxExpired);
        }

        let new_expires_at = expires_at + Duration::seconds(extend_by_seconds);
        sqlx::query("UPDATE sandboxes SET expires_at = ?, version = version + 1 WHERE id = ?")
            .bind(new_expires_at)
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;

        sandbox.expires_at = Some(new_expires_at);
        Ok(sandbox)
    }

    /// Destroy all sessions; clear `current_session_id`/`idle_expires_at`;
    /// cargo is preserved. Idempotent.
    pub async fn stop(&self, sandbox_id: &str, owner: &str) -> Result<(), CoreError> {
        let lock = self.locks.get(sandbox_id);
        let _guard = lock.lock().await;

        let sandbox = self.get(sandbox_id, owner).await?;
        if let Some(session_id) = &sandbox.current_session_id {
            if let Some(mut session) = self.get_session(session_id).await? {
                self.session_manager.destroy(&mut session).await?;
            }
        }

        sqlx::query("UPDATE sandboxes SET current_session_id = NULL, idle_expires_at = NULL WHERE id = ?")
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Destroy all sessions; tombstone the sandbox; cascade-delete the
    /// managed cargo (force); external cargo is untouched.
    pub async fn delete(&self, sandbox_id: &str, owner: &str) -> Result<(), CoreError> {
        let lock = self.locks.get(sandbox_id);
        let _guard = lock.lock().await;

        let sandbox = self.get(sandbox_id, owner).await?;
        if let Some(session_id) = &sandbox.current_session_id {
            if let Some(mut session) = self.get_session(session_id).await? {
                self.session_manager.destroy(&mut session).await?;
            }
        }

        let now = Utc::now();
        sqlx::query("UPDATE sandboxes SET deleted_at = ?, current_session_id = NULL WHERE id = ?")
            .bind(now)
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;

        if let Some(cargo_id) = &sandbox.cargo_id {
            if let Ok(cargo) = self.get_cargo_row(cargo_id).await {
                if cargo.managed {
                    if let Err(e) = self.cargo_manager.delete(cargo_id, owner, true).await {
                        tracing::warn!(cargo_id, error = %e, "failed to cascade-delete managed cargo");
                    }
                }
            }
        }

        self.locks.cleanup(sandbox_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use bay_driver::fake::FakeDriver;
    use bay_driver::{Driver, ImagePullPolicy};

    use crate::config::{ContainerProfileConfig, ProfileConfig, StartupOrderSetting};

    #[test]
    fn sandbox_id_carries_prefix() {
        let id = new_sandbox_id();
        assert!(id.starts_with("sb-"));
    }

    fn profile_config() -> ProfileConfig {
        ProfileConfig {
            id: "default".to_string(),
            containers: vec![ContainerProfileConfig {
                name: "primary".to_string(),
                image: "bay/ship:latest".to_string(),
                runtime_type: "ship".to_string(),
                runtime_port: 8123,
                cpu_limit: None,
                memory_limit_mb: None,
                capabilities: vec!["python".to_string()],
                primary_for: vec![],
                env: HashMap::new(),
            }],
            image: None,
            runtime_port: None,
            idle_timeout_seconds: 300,
            startup_order: StartupOrderSetting::Sequential,
            wait_for_all: true,
        }
    }

    /// A current session whose DB row still says `running` but whose
    /// endpoint no longer answers must be destroyed and rebuilt rather
    /// than handed back to the caller.
    #[tokio::test]
    async fn ensure_running_rebuilds_session_when_health_probe_fails() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();

        let fake = Arc::new(FakeDriver::new());
        let driver: Arc<dyn Driver> = fake.clone();
        let http = reqwest::Client::new();

        let locks = Arc::new(SandboxLockRegistry::new());
        let cargo_manager = Arc::new(CargoManager::new(pool.clone(), driver.clone()));
        let session_manager = Arc::new(SessionManager::new(
            pool.clone(),
            driver.clone(),
            http.clone(),
            ImagePullPolicy::IfNotPresent,
            std::time::Duration::from_millis(10),
            "/workspace".to_string(),
        ));

        let mut config = OrchestratorConfig::default();
        config.profiles.push(profile_config());
        let config = Arc::new(config);

        let adapter_pool = Arc::new(AdapterPool::new());
        let sandbox_manager =
            SandboxManager::new(pool.clone(), config, locks, cargo_manager, session_manager, adapter_pool, http);

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO cargos (id, owner, backend, driver_ref, managed, managed_by_sandbox_id, size_limit_mb, created_at, last_accessed_at) \
             VALUES ('cg-1', 'owner-1', 'local', 'bay-cargo-cg-1', TRUE, 'sb-1', NULL, ?, ?)",
        )
        .bind(now)
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO sandboxes (id, owner, profile_id, cargo_id, current_session_id, expires_at, idle_expires_at, deleted_at, version, created_at, last_active_at) \
             VALUES ('sb-1', 'owner-1', 'default', 'cg-1', 'sess-stale', NULL, ?, NULL, 1, ?, ?)",
        )
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO sessions (id, sandbox_id, profile_id, runtime_type, container_id, endpoint, containers_json, network_id, desired_state, observed_state, last_observed_at, created_at, last_active_at) \
             VALUES ('sess-stale', 'sb-1', 'default', 'ship', 'fake-container-dead', 'http://fake-host:9999', NULL, NULL, ?, ?, ?, ?, ?)",
        )
        .bind(SessionState::Running)
        .bind(SessionState::Running)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();

        // The stale endpoint never resolves, so the probe fails and a
        // rebuild is attempted; the rebuild's own probe also fails (the
        // fake driver's endpoints aren't real listeners either), but what
        // matters here is that the dead session was torn down and a fresh
        // container was requested rather than the stale session being
        // handed back.
        let result = sandbox_manager.ensure_running("sb-1", "owner-1").await;
        assert!(result.is_err());

        assert_eq!(fake.destroy_calls.lock().unwrap().as_slice(), ["fake-container-dead"]);
        assert_eq!(fake.create_calls.lock().unwrap().len(), 1);
    }
}
