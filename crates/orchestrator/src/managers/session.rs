//! Session Manager: materializes and tears down the container
//! group backing a sandbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use bay_driver::{ContainerSpec, Driver, ImagePullPolicy, StartupOrder, VolumeMount};

use crate::config::{ContainerProfileConfig, ProfileConfig, StartupOrderSetting};
use crate::db::DbPool;
use crate::error::CoreError;
use crate::models::{Cargo, ContainerEndpoint, Session, SessionState};

fn new_session_id() -> String {
    format!("sess-{}", Uuid::new_v4())
}

fn map_pull_policy(p: crate::config::ImagePullPolicySetting) -> ImagePullPolicy {
    match p {
        crate::config::ImagePullPolicySetting::Always => ImagePullPolicy::Always,
        crate::config::ImagePullPolicySetting::IfNotPresent => ImagePullPolicy::IfNotPresent,
        crate::config::ImagePullPolicySetting::Never => ImagePullPolicy::Never,
    }
}

fn map_startup_order(o: StartupOrderSetting) -> StartupOrder {
    match o {
        StartupOrderSetting::Parallel => StartupOrder::Parallel,
        StartupOrderSetting::Sequential => StartupOrder::Sequential,
    }
}

pub struct SessionManager {
    pool: DbPool,
    driver: Arc<dyn Driver>,
    http: reqwest::Client,
    pull_policy: ImagePullPolicy,
    readiness_deadline: Duration,
    cargo_mount_path: String,
}

impl SessionManager {
    pub fn new(
        pool: DbPool,
        driver: Arc<dyn Driver>,
        http: reqwest::Client,
        pull_policy: ImagePullPolicy,
        readiness_deadline: Duration,
        cargo_mount_path: String,
    ) -> Self {
        Self { pool, driver, http, pull_policy, readiness_deadline, cargo_mount_path }
    }

    /// Create a pending session row. No containers are started yet.
    pub async fn create(&self, sandbox_id: &str, profile: &ProfileConfig) -> Result<Session, CoreError> {
        let now = Utc::now();
        let primary_runtime_type = profile
            .primary_container()
            .map(|c| c.runtime_type.clone())
            .unwrap_or_else(|| "ship".to_string());

        let session = Session {
            id: new_session_id(),
            sandbox_id: sandbox_id.to_string(),
            profile_id: profile.id.clone(),
            runtime_type: primary_runtime_type,
            container_id: None,
            endpoint: None,
            containers_json: None,
            network_id: None,
            desired_state: SessionState::Pending,
            observed_state: SessionState::Pending,
            last_observed_at: now,
            created_at: now,
            last_active_at: now,
        };

        sqlx::query(
            "INSERT INTO sessions (id, sandbox_id, profile_id, runtime_type, container_id, endpoint, containers_json, network_id, desired_state, observed_state, last_observed_at, created_at, last_active_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.sandbox_id)
        .bind(&session.profile_id)
        .bind(&session.runtime_type)
        .bind(&session.container_id)
        .bind(&session.endpoint)
        .bind(&session.containers_json)
        .bind(&session.network_id)
        .bind(session.desired_state)
        .bind(session.observed_state)
        .bind(session.last_observed_at)
        .bind(session.created_at)
        .bind(session.last_active_at)
        .execute(&self.pool)
        .await?;

        Ok(session)
    }

    fn container_labels(&self, sandbox_id: &str, session_id: &str, cargo_id: &str, instance_id: &str) -> HashMap<String, String> {
        bay_driver::labels::container_labels(session_id, sandbox_id, cargo_id, instance_id)
    }

    /// Idempotent materialization: single-container and multi-container
    /// profiles each create/start/probe, rolling back everything they
    /// created on any failure.
    pub async fn ensure_running(
        &self,
        mut session: Session,
        cargo: &Cargo,
        profile: &ProfileConfig,
        instance_id: &str,
    ) -> Result<Session, CoreError> {
        if session.is_running() {
            return Ok(session);
        }

        let result = if profile.is_multi() {
            self.materialize_multi(&session, cargo, profile, instance_id).await
        } else {
            self.materialize_single(&session, cargo, profile, instance_id).await
        };

        match result {
            Ok((endpoint, container_id, containers, network_id)) => {
                session.endpoint = Some(endpoint);
                session.container_id = Some(container_id);
                session.network_id = network_id;
                session.set_containers(&containers);
                session.observed_state = SessionState::Running;
                session.desired_state = SessionState::Running;
            }
            Err(e) => {
                session.observed_state = SessionState::Failed;
                session.desired_state = SessionState::Failed;
                self.persist(&session).await?;
                return Err(e);
            }
        }

        self.persist(&session).await?;
        Ok(session)
    }

    async fn materialize_single(
        &self,
        session: &Session,
        cargo: &Cargo,
        profile: &ProfileConfig,
        instance_id: &str,
    ) -> Result<(String, String, Vec<ContainerEndpoint>, Option<String>), CoreError> {
        let container = profile
            .primary_container()
            .ok_or_else(|| CoreError::ValidationError(format!("profile {} declares no containers", profile.id)))?;

        let labels = self.container_labels(&session.sandbox_id, &session.id, &cargo.id, instance_id);
        let spec = self.build_spec(&session.id, container, cargo, None);

        let container_id = self.driver.create(&spec, labels, self.pull_policy).await?;
        let endpoint = match self.driver.start(&container_id, container.runtime_port).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                let _ = self.driver.destroy(&container_id).await;
                return Err(CoreError::from(e));
            }
        };

        if !self.probe_ready(&endpoint).await {
            let _ = self.driver.destroy(&container_id).await;
            return Err(CoreError::Timeout(format!("container {container_id} never became ready")));
        }

        let containers = vec![ContainerEndpoint {
            name: container.name.clone(),
            container_id: container_id.clone(),
            endpoint: Some(endpoint.clone()),
            status: "running".to_string(),
            runtime_type: container.runtime_type.clone(),
            capabilities: container.capabilities.clone(),
        }];

        Ok((endpoint, container_id, containers, None))
    }

    async fn materialize_multi(
        &self,
        session: &Session,
        cargo: &Cargo,
        profile: &ProfileConfig,
        instance_id: &str,
    ) -> Result<(String, String, Vec<ContainerEndpoint>, Option<String>), CoreError> {
        let network_id = self.driver.create_network(&session.id).await?;

        let mut created: Vec<(String, &ContainerProfileConfig)> = Vec::new();
        for container in &profile.containers {
            let labels = self.container_labels(&session.sandbox_id, &session.id, &cargo.id, instance_id);
            let spec = self.build_spec(&session.id, container, cargo, Some(&network_id));
            match self.driver.create(&spec, labels, self.pull_policy).await {
                Ok(id) => created.push((id, container)),
                Err(e) => {
                    self.rollback(&created, &network_id).await;
                    return Err(CoreError::from(e));
                }
            }
        }

        let order = map_startup_order(profile.startup_order);
        let names: Vec<String> = created.iter().map(|(id, _)| id.clone()).collect();
        let ports: Vec<u16> = created.iter().map(|(_, c)| c.runtime_port).collect();

        let start_result = match order {
            StartupOrder::Parallel => {
                let futures = names.iter().zip(ports.iter()).map(|(id, port)| self.driver.start(id, *port));
                futures::future::join_all(futures).await
            }
            StartupOrder::Sequential => {
                let mut results = Vec::with_capacity(names.len());
                for (id, port) in names.iter().zip(ports.iter()) {
                    results.push(self.driver.start(id, *port).await);
                }
                results
            }
        };

        let mut endpoints = Vec::with_capacity(start_result.len());
        for r in start_result {
            match r {
                Ok(endpoint) => endpoints.push(Some(endpoint)),
                Err(_) => endpoints.push(None),
            }
        }

        let any_start_failed = endpoints.iter().any(|e| e.is_none());
        if any_start_failed && profile.wait_for_all {
            self.rollback(&created, &network_id).await;
            return Err(CoreError::RuntimeError("one or more containers failed to start".to_string()));
        }

        let mut ready_flags = vec![false; endpoints.len()];
        let probes = endpoints.iter().map(|e| {
            let this = self;
            async move {
                match e {
                    Some(endpoint) => this.probe_ready(endpoint).await,
                    None => false,
                }
            }
        });
        let probe_results = futures::future::join_all(probes).await;
        ready_flags.copy_from_slice(&probe_results);

        let all_ready = ready_flags.iter().all(|r| *r);
        if !all_ready && profile.wait_for_all {
            self.rollback(&created, &network_id).await;
            return Err(CoreError::Timeout("one or more containers never became ready".to_string()));
        }

        let mut containers = Vec::with_capacity(created.len());
        for (i, (container_id, spec)) in created.iter().enumerate() {
            containers.push(ContainerEndpoint {
                name: spec.name.clone(),
                container_id: container_id.clone(),
                endpoint: endpoints[i].clone(),
                status: if ready_flags[i] { "running".to_string() } else { "degraded".to_string() },
                runtime_type: spec.runtime_type.clone(),
                capabilities: spec.capabilities.clone(),
            });
        }

        let primary = containers
            .iter()
            .find(|c| c.name == "primary" || c.name == "ship")
            .or_else(|| containers.first())
            .cloned()
            .ok_or_else(|| CoreError::RuntimeError("no containers in multi-container session".to_string()))?;

        let primary_endpoint = primary
            .endpoint
            .clone()
            .ok_or_else(|| CoreError::RuntimeError("primary container has no endpoint".to_string()))?;

        Ok((primary_endpoint, primary.container_id.clone(), containers, Some(network_id)))
    }

    async fn rollback(&self, created: &[(String, &ContainerProfileConfig)], network_id: &str) {
        for (id, _) in created {
            let _ = self.driver.destroy(id).await;
        }
        let _ = self.driver.remove_network(network_id).await;
    }

    fn build_spec(
        &self,
        session_id: &str,
        container: &ContainerProfileConfig,
        cargo: &Cargo,
        network: Option<&str>,
    ) -> ContainerSpec {
        ContainerSpec {
            name: format!("{}-{}", bay_driver::labels::session_container_name(session_id), container.name),
            image: container.image.clone(),
            runtime_port: container.runtime_port,
            env: container.env.clone(),
            cpu_limit: container.cpu_limit,
            memory_limit_mb: container.memory_limit_mb,
            volume_mounts: vec![VolumeMount {
                volume_name: cargo.driver_ref.clone(),
                mount_path: self.cargo_mount_path.clone(),
                read_only: false,
            }],
            network: network.map(str::to_string),
        }
    }

    /// Poll the container's health endpoint until it reports ready or the
    /// configured deadline elapses.
    async fn probe_ready(&self, endpoint: &str) -> bool {
        let deadline = tokio::time::Instant::now() + self.readiness_deadline;
        let mut backoff = Duration::from_millis(100);
        loop {
            if let Ok(resp) = self.http.get(format!("{endpoint}/health")).send().await {
                if resp.status().is_success() {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(backoff.min(deadline.saturating_duration_since(tokio::time::Instant::now()))).await;
            backoff = (backoff * 2).min(Duration::from_secs(2));
        }
    }

    async fn persist(&self, session: &Session) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE sessions SET container_id = ?, endpoint = ?, containers_json = ?, network_id = ?, desired_state = ?, observed_state = ?, last_observed_at = ?, last_active_at = ? WHERE id = ?",
        )
        .bind(&session.container_id)
        .bind(&session.endpoint)
        .bind(&session.containers_json)
        .bind(&session.network_id)
        .bind(session.desired_state)
        .bind(session.observed_state)
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(&session.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stop all containers, clear endpoints, transition to `stopped`.
    pub async fn stop(&self, session: &mut Session) -> Result<(), CoreError> {
        for container in session.containers() {
            let _ = self.driver.stop(&container.container_id).await;
        }
        if session.containers().is_empty() {
            if let Some(id) = &session.container_id {
                let _ = self.driver.stop(id).await;
            }
        }
        session.observed_state = SessionState::Stopped;
        session.desired_state = SessionState::Stopped;
        self.persist(session).await
    }

    /// Destroy all containers and the session network (if any).
    pub async fn destroy(&self, session: &mut Session) -> Result<(), CoreError> {
        let containers = session.containers();
        if containers.is_empty() {
            if let Some(id) = &session.container_id {
                let _ = self.driver.destroy(id).await;
            }
        } else {
            for container in &containers {
                let _ = self.driver.destroy(&container.container_id).await;
            }
        }
        if let Some(network_id) = &session.network_id {
            let _ = self.driver.remove_network(network_id).await;
        }
        session.endpoint = None;
        session.container_id = None;
        session.network_id = None;
        session.observed_state = SessionState::Stopped;
        session.desired_state = SessionState::Stopped;
        self.persist(session).await
    }
}
