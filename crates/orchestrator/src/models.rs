//! Core domain entities: Sandbox, Session, Cargo, Idempotency Key.
//!
//! These mirror the `sqlx::FromRow` rows one-for-one; derived fields (like
//! `Sandbox::status`) are computed, never stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Idle,
    Starting,
    Ready,
    Failed,
    Expired,
    Deleted,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Sandbox {
    pub id: String,
    pub owner: String,
    pub profile_id: String,
    pub cargo_id: Option<String>,
    pub current_session_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub idle_expires_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Sandbox {
    /// Derived external status, checked in precedence order: tombstone
    /// first, then TTL expiry, then idle-vs-session, then session state.
    pub fn compute_status(&self, now: DateTime<Utc>, session_state: Option<SessionState>) -> SandboxStatus {
        if self.deleted_at.is_some() {
            return SandboxStatus::Deleted;
        }
        if let Some(expires_at) = self.expires_at {
            if now > expires_at {
                return SandboxStatus::Expired;
            }
        }
        if self.current_session_id.is_none() {
            return SandboxStatus::Idle;
        }
        match session_state {
            Some(SessionState::Running) => SandboxStatus::Ready,
            Some(SessionState::Pending) | Some(SessionState::Starting) => SandboxStatus::Starting,
            Some(SessionState::Failed) => SandboxStatus::Failed,
            _ => SandboxStatus::Idle,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| now > e).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerEndpoint {
    pub name: String,
    pub container_id: String,
    pub endpoint: Option<String>,
    pub status: String,
    pub runtime_type: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    pub sandbox_id: String,
    pub profile_id: String,
    pub runtime_type: String,
    pub container_id: Option<String>,
    pub endpoint: Option<String>,
    /// JSON-encoded `Vec<ContainerEndpoint>`; `None`/empty means single-container.
    pub containers_json: Option<String>,
    pub network_id: Option<String>,
    pub desired_state: SessionState,
    pub observed_state: SessionState,
    pub last_observed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Session {
    pub fn containers(&self) -> Vec<ContainerEndpoint> {
        self.containers_json
            .as_deref()
            .and_then(|j| serde_json::from_str(j).ok())
            .unwrap_or_default()
    }

    pub fn set_containers(&mut self, containers: &[ContainerEndpoint]) {
        self.containers_json = Some(serde_json::to_string(containers).unwrap_or_else(|_| "[]".to_string()));
    }

    pub fn is_multi(&self) -> bool {
        self.containers().len() > 1
    }

    pub fn is_running(&self) -> bool {
        self.observed_state == SessionState::Running && self.endpoint.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CargoBackend {
    Local,
    Cluster,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Cargo {
    pub id: String,
    pub owner: String,
    pub backend: CargoBackend,
    pub driver_ref: String,
    pub managed: bool,
    pub managed_by_sandbox_id: Option<String>,
    pub size_limit_mb: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IdempotencyKey {
    pub owner: String,
    pub key: String,
    pub fingerprint: String,
    pub response_body: String,
    pub status_code: i32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeMeta {
    pub name: String,
    pub version: String,
    pub api_version: String,
    pub mount_path: String,
    pub capabilities: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub data: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(deleted: bool, expires_at: Option<DateTime<Utc>>, session_id: Option<&str>) -> Sandbox {
        let now = Utc::now();
        Sandbox {
            id: "sb-1".to_string(),
            owner: "owner-1".to_string(),
            profile_id: "python-default".to_string(),
            cargo_id: Some("cg-1".to_string()),
            current_session_id: session_id.map(str::to_string),
            expires_at,
            idle_expires_at: None,
            deleted_at: if deleted { Some(now) } else { None },
            version: 1,
            created_at: now,
            last_active_at: now,
        }
    }

    #[test]
    fn deleted_sandbox_is_always_deleted_status() {
        let sb = sandbox(true, None, Some("sess-1"));
        assert_eq!(sb.compute_status(Utc::now(), Some(SessionState::Running)), SandboxStatus::Deleted);
    }

    #[test]
    fn expired_sandbox_reports_expired_even_with_session() {
        let past = Utc::now() - chrono::Duration::seconds(10);
        let sb = sandbox(false, Some(past), Some("sess-1"));
        assert_eq!(sb.compute_status(Utc::now(), Some(SessionState::Running)), SandboxStatus::Expired);
    }

    #[test]
    fn no_session_is_idle() {
        let sb = sandbox(false, None, None);
        assert_eq!(sb.compute_status(Utc::now(), None), SandboxStatus::Idle);
    }

    #[test]
    fn running_session_is_ready() {
        let sb = sandbox(false, None, Some("sess-1"));
        assert_eq!(sb.compute_status(Utc::now(), Some(SessionState::Running)), SandboxStatus::Ready);
    }

    #[test]
    fn starting_session_maps_to_starting() {
        let sb = sandbox(false, None, Some("sess-1"));
        assert_eq!(sb.compute_status(Utc::now(), Some(SessionState::Pending)), SandboxStatus::Starting);
        assert_eq!(sb.compute_status(Utc::now(), Some(SessionState::Starting)), SandboxStatus::Starting);
    }

    #[test]
    fn failed_session_maps_to_failed() {
        let sb = sandbox(false, None, Some("sess-1"));
        assert_eq!(sb.compute_status(Utc::now(), Some(SessionState::Failed)), SandboxStatus::Failed);
    }

    #[test]
    fn other_session_states_default_to_idle() {
        let sb = sandbox(false, None, Some("sess-1"));
        assert_eq!(sb.compute_status(Utc::now(), Some(SessionState::Stopped)), SandboxStatus::Idle);
    }

    #[test]
    fn session_containers_roundtrip_through_json() {
        let mut session = Session {
            id: "sess-1".to_string(),
            sandbox_id: "sb-1".to_string(),
            profile_id: "multi".to_string(),
            runtime_type: "ship".to_string(),
            container_id: Some("c1".to_string()),
            endpoint: Some("http://127.0.0.1:8123".to_string()),
            containers_json: None,
            network_id: None,
            desired_state: SessionState::Running,
            observed_state: SessionState::Running,
            last_observed_at: Utc::now(),
            created_at: Utc::now(),
            last_active_at: Utc::now(),
        };
        assert!(!session.is_multi());
        session.set_containers(&[
            ContainerEndpoint {
                name: "ship".to_string(),
                container_id: "c1".to_string(),
                endpoint: Some("http://127.0.0.1:8123".to_string()),
                status: "running".to_string(),
                runtime_type: "ship".to_string(),
                capabilities: vec!["python".to_string()],
            },
            ContainerEndpoint {
                name: "gull".to_string(),
                container_id: "c2".to_string(),
                endpoint: Some("http://127.0.0.1:9000".to_string()),
                status: "running".to_string(),
                runtime_type: "gull".to_string(),
                capabilities: vec!["browser".to_string()],
            },
        ]);
        assert!(session.is_multi());
        assert_eq!(session.containers().len(), 2);
    }
}
