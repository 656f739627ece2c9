//! Infrastructure abstraction over container and volume primitives.
//!
//! A [`Driver`] knows nothing about sandboxes, sessions, or profiles — it
//! operates on plain container specs and label maps. The orchestrator
//! crate's Session Manager translates domain objects into these primitives.

pub mod docker;
pub mod endpoint;
pub mod fake;
pub mod labels;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

pub use endpoint::ConnectMode;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("container not found: {0}")]
    ContainerNotFound(String),
    #[error("volume not found: {0}")]
    VolumeNotFound(String),
    #[error("no endpoint could be resolved for container {0}")]
    NoEndpoint(String),
    #[error("image pull failed for {image}: {source}")]
    ImagePullFailed {
        image: String,
        #[source]
        source: Box<DriverError>,
    },
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// One container within a (possibly multi-container) session.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub runtime_port: u16,
    pub env: HashMap<String, String>,
    pub cpu_limit: Option<f64>,
    pub memory_limit_mb: Option<u64>,
    pub volume_mounts: Vec<VolumeMount>,
    pub network: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub volume_name: String,
    pub mount_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct ContainerStatusInfo {
    pub state: ContainerState,
    pub endpoint: Option<String>,
    pub exit_code: Option<i32>,
}

/// An instance discovered by a label-selector list operation, used by
/// orphan-container GC.
#[derive(Debug, Clone)]
pub struct RuntimeInstance {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePullPolicy {
    Always,
    IfNotPresent,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupOrder {
    Parallel,
    Sequential,
}

/// Result of a multi-container batch creation or start. On partial failure
/// the driver has already rolled back what it created; `error` carries the
/// cause and `succeeded` lists whatever survived (empty after rollback).
pub struct BatchResult<T> {
    pub succeeded: Vec<T>,
    pub error: Option<DriverError>,
}

#[async_trait]
pub trait Driver: Send + Sync {
    async fn create(
        &self,
        spec: &ContainerSpec,
        labels: HashMap<String, String>,
        pull_policy: ImagePullPolicy,
    ) -> Result<String, DriverError>;

    async fn start(&self, container_id: &str, runtime_port: u16) -> Result<String, DriverError>;

    async fn stop(&self, container_id: &str) -> Result<(), DriverError>;

    async fn destroy(&self, container_id: &str) -> Result<(), DriverError>;

    async fn status(
        &self,
        container_id: &str,
        runtime_port: Option<u16>,
    ) -> Result<ContainerStatusInfo, DriverError>;

    async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), DriverError>;

    async fn delete_volume(&self, name: &str) -> Result<(), DriverError>;

    async fn volume_exists(&self, name: &str) -> Result<bool, DriverError>;

    async fn create_network(&self, session_id: &str) -> Result<String, DriverError>;

    async fn remove_network(&self, network_id: &str) -> Result<(), DriverError>;

    async fn list_runtime_instances(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<RuntimeInstance>, DriverError>;

    async fn destroy_runtime_instance(&self, id: &str) -> Result<(), DriverError>;

    /// Atomic-per-batch container creation: on any failure, destroys every
    /// container it already created and returns the error, leaving nothing
    /// behind. Order follows `order`; readiness is the caller's concern.
    async fn create_multi(
        &self,
        specs: &[ContainerSpec],
        labels: HashMap<String, String>,
        pull_policy: ImagePullPolicy,
        order: StartupOrder,
    ) -> BatchResult<(String, String)> {
        let mut created = Vec::new();
        for spec in specs {
            match self.create(spec, labels.clone(), pull_policy).await {
                Ok(id) => created.push((spec.name.clone(), id)),
                Err(e) => {
                    if matches!(order, StartupOrder::Parallel | StartupOrder::Sequential) {
                        for (_, id) in &created {
                            if let Err(cleanup_err) = self.destroy(id).await {
                                tracing::warn!(container_id = %id, error = %cleanup_err, "rollback destroy failed");
                            }
                        }
                    }
                    return BatchResult { succeeded: Vec::new(), error: Some(e) };
                }
            }
        }
        BatchResult { succeeded: created, error: None }
    }

    /// Atomic-per-batch start: on any failure, stops+destroys every
    /// container started in this batch (not the whole session — the caller
    /// decides whether to also tear down never-started containers).
    async fn start_multi(
        &self,
        container_ids: &[(String, String, u16)],
    ) -> BatchResult<(String, String)> {
        let mut started = Vec::new();
        for (name, id, runtime_port) in container_ids {
            match self.start(id, *runtime_port).await {
                Ok(endpoint) => started.push((name.clone(), endpoint)),
                Err(e) => {
                    for (_, id, _) in container_ids.iter().take(started.len()) {
                        if let Err(cleanup_err) = self.destroy(id).await {
                            tracing::warn!(container_id = %id, error = %cleanup_err, "rollback destroy failed");
                        }
                    }
                    return BatchResult { succeeded: Vec::new(), error: Some(e) };
                }
            }
        }
        BatchResult { succeeded: started, error: None }
    }
}
