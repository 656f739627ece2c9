//! Capability Router: resolves `(sandbox, capability, args)` to
//! `(session, container endpoint, adapter)` and dispatches.

use std::sync::Arc;

use crate::adapter::{AdapterPool, RuntimeAdapter};
use crate::config::OrchestratorConfig;
use crate::error::CoreError;
use crate::managers::SandboxManager;
use crate::models::{ContainerEndpoint, ExecutionResult, Session};

pub struct CapabilityRouter {
    config: Arc<OrchestratorConfig>,
    sandbox_manager: Arc<SandboxManager>,
    adapter_pool: Arc<AdapterPool>,
    http: reqwest::Client,
}

impl CapabilityRouter {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        sandbox_manager: Arc<SandboxManager>,
        adapter_pool: Arc<AdapterPool>,
        http: reqwest::Client,
    ) -> Self {
        Self { config, sandbox_manager, adapter_pool, http }
    }

    /// Resolve the target container for `capability` within `session`.
    ///
    /// Prefers the profile's `find_container_for_capability`; falls back to
    /// scanning the session's `containers` array if the profile can't be
    /// loaded; falls back to the single primary endpoint if there's no
    /// `containers` map at all.
    fn resolve_container(&self, session: &Session, capability: &str) -> Result<(String, String), CoreError> {
        resolve_container_for(&self.config, session, capability)
    }

    async fn adapter_for(&self, endpoint: &str, runtime_type: &str) -> Arc<dyn RuntimeAdapter> {
        crate::adapter::adapter_for(&self.adapter_pool, &self.http, endpoint, runtime_type).await
    }

    /// `adapter.get_meta()` (cached); fail `CapabilityNotSupported` if the
    /// runtime doesn't advertise `capability`. Meta-fetch transport errors
    /// propagate unchanged.
    async fn require_capability(&self, adapter: &dyn RuntimeAdapter, capability: &str) -> Result<(), CoreError> {
        let meta = adapter.get_meta().await?;
        if !meta.capabilities.contains_key(capability) {
            let mut available: Vec<String> = meta.capabilities.keys().cloned().collect();
            available.sort();
            return Err(CoreError::CapabilityNotSupported { capability: capability.to_string(), available });
        }
        Ok(())
    }

    /// Full dispatch: ensure the session is running, resolve the container,
    /// acquire the adapter, verify the capability, invoke it.
    pub async fn dispatch(
        &self,
        sandbox_id: &str,
        owner: &str,
        capability: &str,
        invoke: impl FnOnce(Arc<dyn RuntimeAdapter>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<ExecutionResult, CoreError>> + Send>>,
    ) -> Result<ExecutionResult, CoreError> {
        let session = self.sandbox_manager.ensure_running(sandbox_id, owner).await?;
        let (endpoint, runtime_type) = self.resolve_container(&session, capability)?;
        let adapter = self.adapter_for(&endpoint, &runtime_type).await;
        self.require_capability(adapter.as_ref(), capability).await?;
        invoke(adapter).await
    }
}

/// Pure resolution logic, factored out of the router so it is directly
/// unit-testable without constructing a full `CapabilityRouter`.
fn resolve_container_for(config: &OrchestratorConfig, session: &Session, capability: &str) -> Result<(String, String), CoreError> {
    if let Some(profile) = config.profile(&session.profile_id) {
        if let Some(container) = profile.find_container_for_capability(capability) {
            let containers = session.containers();
            if let Some(endpoint) = containers.iter().find(|c| c.name == container.name).and_then(|c| c.endpoint.clone()) {
                return Ok((endpoint, container.runtime_type.clone()));
            }
        }
    }

    let containers = session.containers();
    if containers.len() > 1 {
        if let Some(found) = containers.iter().find(|c| c.capabilities.iter().any(|cap| cap == capability)) {
            if let Some(endpoint) = &found.endpoint {
                return Ok((endpoint.clone(), found.runtime_type.clone()));
            }
        }
        return Err(not_supported_error(capability, &containers));
    }

    let endpoint = session
        .endpoint
        .clone()
        .ok_or_else(|| CoreError::RuntimeError(format!("session {} has no endpoint", session.id)))?;
    Ok((endpoint, session.runtime_type.clone()))
}

fn not_supported_error(capability: &str, containers: &[ContainerEndpoint]) -> CoreError {
    let mut available: Vec<String> = containers.iter().flat_map(|c| c.capabilities.iter().cloned()).collect();
    available.sort();
    available.dedup();
    CoreError::CapabilityNotSupported { capability: capability.to_string(), available }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerEndpoint, SessionState};

    fn session_with_containers(containers: Vec<ContainerEndpoint>) -> Session {
        let mut s = Session {
            id: "sess-1".to_string(),
            sandbox_id: "sb-1".to_string(),
            profile_id: "unknown-profile".to_string(),
            runtime_type: "ship".to_string(),
            container_id: Some("c1".to_string()),
            endpoint: containers.first().and_then(|c| c.endpoint.clone()),
            containers_json: None,
            network_id: None,
            desired_state: SessionState::Running,
            observed_state: SessionState::Running,
            last_observed_at: chrono::Utc::now(),
            created_at: chrono::Utc::now(),
            last_active_at: chrono::Utc::now(),
        };
        s.set_containers(&containers);
        s
    }

    #[test]
    fn resolve_container_falls_back_to_scanning_session_containers() {
        let config = OrchestratorConfig::default();
        let containers = vec![
            ContainerEndpoint {
                name: "ship".to_string(),
                container_id: "c1".to_string(),
                endpoint: Some("http://127.0.0.1:8123".to_string()),
                status: "running".to_string(),
                runtime_type: "ship".to_string(),
                capabilities: vec!["python".to_string(), "filesystem".to_string()],
            },
            ContainerEndpoint {
                name: "gull".to_string(),
                container_id: "c2".to_string(),
                endpoint: Some("http://127.0.0.1:9000".to_string()),
                status: "running".to_string(),
                runtime_type: "gull".to_string(),
                capabilities: vec!["browser".to_string()],
            },
        ];
        let session = session_with_containers(containers);

        let (endpoint, runtime_type) = resolve_container_for(&config, &session, "browser").unwrap();
        assert_eq!(endpoint, "http://127.0.0.1:9000");
        assert_eq!(runtime_type, "gull");

        let err = resolve_container_for(&config, &session, "gpu").unwrap_err();
        match err {
            CoreError::CapabilityNotSupported { available, .. } => {
                assert_eq!(available, vec!["browser".to_string(), "filesystem".to_string(), "python".to_string()]);
            }
            _ => panic!("expected CapabilityNotSupported"),
        }
    }

    #[test]
    fn single_container_session_uses_primary_endpoint() {
        let config = OrchestratorConfig::default();
        let containers = vec![ContainerEndpoint {
            name: "ship".to_string(),
            container_id: "c1".to_string(),
            endpoint: Some("http://127.0.0.1:8123".to_string()),
            status: "running".to_string(),
            runtime_type: "ship".to_string(),
            capabilities: vec!["python".to_string()],
        }];
        let session = session_with_containers(containers);
        let (endpoint, runtime_type) = resolve_container_for(&config, &session, "python").unwrap();
        assert_eq!(endpoint, "http://127.0.0.1:8123");
        assert_eq!(runtime_type, "ship");
    }
}
