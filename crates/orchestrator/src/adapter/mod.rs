pub mod code;
pub mod browser;
pub mod pool;

pub use pool::AdapterPool;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::models::{ExecutionResult, RuntimeMeta};

/// A single adapter abstraction with variants per runtime kind, keyed by
/// `(endpoint, kind)` in the pool. No dynamic subtype discovery beyond the
/// kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    Code,
    Browser,
}

impl RuntimeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeKind::Code => "code",
            RuntimeKind::Browser => "browser",
        }
    }
}

/// Classify a container profile's `runtime_type` into the adapter kind that
/// speaks to it.
pub fn runtime_kind_for(runtime_type: &str) -> RuntimeKind {
    if runtime_type == "gull" || runtime_type == "browser" {
        RuntimeKind::Browser
    } else {
        RuntimeKind::Code
    }
}

/// Build (or fetch from `pool`) the adapter for `endpoint`/`runtime_type`.
pub async fn adapter_for(pool: &AdapterPool, http: &reqwest::Client, endpoint: &str, runtime_type: &str) -> std::sync::Arc<dyn RuntimeAdapter> {
    let kind = runtime_kind_for(runtime_type);
    let http = http.clone();
    let endpoint_owned = endpoint.to_string();
    pool.get_or_create(endpoint, kind, move || -> std::sync::Arc<dyn RuntimeAdapter> {
        match kind {
            RuntimeKind::Code => std::sync::Arc::new(code::CodeAdapter::new(endpoint_owned, http)),
            RuntimeKind::Browser => std::sync::Arc::new(browser::BrowserAdapter::new(endpoint_owned, http)),
        }
    })
    .await
}

/// One adapter per runtime endpoint. `get_meta` is memoized after first
/// success; `health` never raises, only returns false on failure.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    async fn get_meta(&self) -> Result<RuntimeMeta, CoreError>;
    async fn health(&self) -> bool;
    fn supported_capabilities(&self) -> &[&'static str];

    async fn exec_python(&self, _code: &str, _timeout_secs: u64) -> Result<ExecutionResult, CoreError> {
        Err(CoreError::CapabilityNotSupported {
            capability: "python".to_string(),
            available: self.supported_capabilities().iter().map(|s| s.to_string()).collect(),
        })
    }

    async fn exec_shell(&self, _command: &str, _timeout_secs: u64, _cwd: Option<&str>) -> Result<ExecutionResult, CoreError> {
        Err(CoreError::CapabilityNotSupported {
            capability: "shell".to_string(),
            available: self.supported_capabilities().iter().map(|s| s.to_string()).collect(),
        })
    }

    async fn exec_terminal(&self, command: &str, timeout_secs: u64) -> Result<ExecutionResult, CoreError> {
        // Terminal sessions have no dedicated wire method in the runtime
        // contract; they route through the same shell endpoint.
        self.exec_shell(command, timeout_secs, None).await
    }

    async fn read_file(&self, _path: &str) -> Result<String, CoreError> {
        Err(CoreError::CapabilityNotSupported {
            capability: "filesystem".to_string(),
            available: self.supported_capabilities().iter().map(|s| s.to_string()).collect(),
        })
    }

    async fn write_file(&self, _path: &str, _content: &str) -> Result<(), CoreError> {
        Err(CoreError::CapabilityNotSupported {
            capability: "filesystem".to_string(),
            available: self.supported_capabilities().iter().map(|s| s.to_string()).collect(),
        })
    }

    async fn list_files(&self, _path: &str) -> Result<Vec<serde_json::Value>, CoreError> {
        Err(CoreError::CapabilityNotSupported {
            capability: "filesystem".to_string(),
            available: self.supported_capabilities().iter().map(|s| s.to_string()).collect(),
        })
    }

    async fn delete_file(&self, _path: &str) -> Result<(), CoreError> {
        Err(CoreError::CapabilityNotSupported {
            capability: "filesystem".to_string(),
            available: self.supported_capabilities().iter().map(|s| s.to_string()).collect(),
        })
    }

    async fn upload_file(&self, _path: &str, _content: Vec<u8>) -> Result<(), CoreError> {
        Err(CoreError::CapabilityNotSupported {
            capability: "filesystem".to_string(),
            available: self.supported_capabilities().iter().map(|s| s.to_string()).collect(),
        })
    }

    async fn download_file(&self, _path: &str) -> Result<Vec<u8>, CoreError> {
        Err(CoreError::CapabilityNotSupported {
            capability: "filesystem".to_string(),
            available: self.supported_capabilities().iter().map(|s| s.to_string()).collect(),
        })
    }

    async fn exec_browser(&self, _cmd: &str, _timeout_secs: u64) -> Result<ExecutionResult, CoreError> {
        Err(CoreError::CapabilityNotSupported {
            capability: "browser".to_string(),
            available: self.supported_capabilities().iter().map(|s| s.to_string()).collect(),
        })
    }
}

/// Process-wide shared HTTP client parameters, grounded in the original's
/// `HTTPClientManager` defaults (max_connections=200,
/// max_keepalive_connections=100, keepalive_expiry=30s, connect=10s,
/// read=60s). HTTP/2 is left at reqwest's default (ALPN-negotiated, not
/// forced), matching the original's intent of avoiding multiplexing
/// complexity against single-tenant runtime containers.
pub fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(std::time::Duration::from_secs(30))
        .connect_timeout(std::time::Duration::from_secs(10))
        .timeout(std::time::Duration::from_secs(60))
        .build()
        .expect("static http client configuration is always valid")
}
