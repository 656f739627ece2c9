//! Shared application state: every long-lived, process-wide collaborator
//! the core wires together, constructed once in `main` and handed to
//! whatever request layer sits above the core (out of scope here).

use std::sync::Arc;

use bay_driver::Driver;
use chrono::Duration as ChronoDuration;

use crate::adapter::{build_http_client, AdapterPool};
use crate::config::{DriverKind, OrchestratorConfig};
use crate::db::DbPool;
use crate::error::CoreError;
use crate::gc::{GcScheduler, NoopCoordinator};
use crate::idempotency::IdempotencyService;
use crate::locks::SandboxLockRegistry;
use crate::managers::{CargoManager, SandboxManager, SessionManager};
use crate::router::CapabilityRouter;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<OrchestratorConfig>,
    pub db: DbPool,
    pub driver: Arc<dyn Driver>,
    pub cargo_manager: Arc<CargoManager>,
    pub session_manager: Arc<SessionManager>,
    pub sandbox_manager: Arc<SandboxManager>,
    pub router: Arc<CapabilityRouter>,
    pub idempotency: Arc<IdempotencyService>,
    pub locks: Arc<SandboxLockRegistry>,
    pub gc: Arc<GcScheduler>,
}

fn build_driver(config: &OrchestratorConfig) -> Result<Arc<dyn Driver>, CoreError> {
    match config.driver.kind {
        DriverKind::LocalEngine => {
            let driver = bay_driver::docker::DockerDriver::new(
                &config.driver.socket_path,
                config.driver.connect_mode,
                config.driver.network.clone(),
                config.driver.host_address.clone(),
            )?;
            Ok(Arc::new(driver))
        }
        // Cluster orchestrator backends (Kubernetes et al.) are a named
        // driver variant but no wire protocol has been settled on beyond
        // the `Driver` trait itself; wiring a concrete cluster client is
        // left to a deployment-specific build rather than stubbed out
        // with a fake here. See DESIGN.md.
        DriverKind::Cluster => Err(CoreError::RuntimeError(
            "driver.type = cluster has no concrete implementation in this build".to_string(),
        )),
    }
}

fn map_pull_policy(p: crate::config::ImagePullPolicySetting) -> bay_driver::ImagePullPolicy {
    match p {
        crate::config::ImagePullPolicySetting::Always => bay_driver::ImagePullPolicy::Always,
        crate::config::ImagePullPolicySetting::IfNotPresent => bay_driver::ImagePullPolicy::IfNotPresent,
        crate::config::ImagePullPolicySetting::Never => bay_driver::ImagePullPolicy::Never,
    }
}

impl AppState {
    pub async fn new(config: OrchestratorConfig) -> Result<Self, CoreError> {
        let config = Arc::new(config);

        let db = crate::db::connect(&config.database.url).await?;
        crate::db::run_migrations(&db).await.map_err(|e| CoreError::RuntimeError(e.to_string()))?;

        let driver = build_driver(&config)?;
        let http = build_http_client();

        let locks = Arc::new(SandboxLockRegistry::new());
        let cargo_manager = Arc::new(CargoManager::new(db.clone(), driver.clone()));

        let readiness_deadline = std::time::Duration::from_secs(config.driver.pod_startup_timeout_seconds);
        let session_manager = Arc::new(SessionManager::new(
            db.clone(),
            driver.clone(),
            http.clone(),
            map_pull_policy(config.driver.image_pull_policy),
            readiness_deadline,
            config.cargo.mount_path.clone(),
        ));

        let adapter_pool = Arc::new(AdapterPool::new());
        let sandbox_manager = Arc::new(SandboxManager::new(
            db.clone(),
            config.clone(),
            locks.clone(),
            cargo_manager.clone(),
            session_manager.clone(),
            adapter_pool.clone(),
            http.clone(),
        ));

        let router = Arc::new(CapabilityRouter::new(config.clone(), sandbox_manager.clone(), adapter_pool, http));

        let idempotency =
            Arc::new(IdempotencyService::new(db.clone(), ChronoDuration::hours(config.idempotency.ttl_hours as i64)));

        let instance_id = config.gc.resolved_instance_id();
        let gc = Arc::new(GcScheduler::new(
            db.clone(),
            driver.clone(),
            locks.clone(),
            cargo_manager.clone(),
            session_manager.clone(),
            Arc::new(NoopCoordinator),
            config.gc.clone(),
            instance_id,
        ));

        Ok(Self { config, db, driver, cargo_manager, session_manager, sandbox_manager, router, idempotency, locks, gc })
    }
}
