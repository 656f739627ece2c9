//! Browser-runtime adapter. Mirrors the original Gull adapter: a single
//! passthrough `/exec` endpoint for agent-browser CLI commands.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::RuntimeAdapter;
use crate::error::CoreError;
use crate::models::{ExecutionResult, RuntimeMeta};

const SUPPORTED_CAPABILITIES: &[&str] = &["browser"];

pub struct BrowserAdapter {
    base_url: String,
    http: reqwest::Client,
    meta_cache: RwLock<Option<RuntimeMeta>>,
}

impl BrowserAdapter {
    pub fn new(base_url: String, http: reqwest::Client) -> Self {
        Self { base_url: base_url.trim_end_matches('/').to_string(), http, meta_cache: RwLock::new(None) }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn map_transport_error(e: reqwest::Error) -> CoreError {
    if e.is_timeout() {
        CoreError::Timeout(e.to_string())
    } else {
        CoreError::RuntimeError(e.to_string())
    }
}

#[async_trait]
impl RuntimeAdapter for BrowserAdapter {
    async fn get_meta(&self) -> Result<RuntimeMeta, CoreError> {
        if let Some(meta) = self.meta_cache.read().unwrap().clone() {
            return Ok(meta);
        }

        let resp = self
            .http
            .get(self.url("/meta"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(map_transport_error)?;
        if resp.status().is_client_error() || resp.status().is_server_error() {
            return Err(CoreError::RuntimeError(format!("meta request failed: {}", resp.status())));
        }
        let data: serde_json::Value = resp.json().await.map_err(map_transport_error)?;

        let runtime = data.get("runtime").cloned().unwrap_or_default();
        let workspace = data.get("workspace").cloned().unwrap_or_default();
        let capabilities = data
            .get("capabilities")
            .and_then(|v| v.as_object())
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        let meta = RuntimeMeta {
            name: runtime.get("name").and_then(|v| v.as_str()).unwrap_or("gull").to_string(),
            version: runtime.get("version").and_then(|v| v.as_str()).unwrap_or("unknown").to_string(),
            api_version: runtime.get("api_version").and_then(|v| v.as_str()).unwrap_or("v1").to_string(),
            mount_path: workspace.get("mount_path").and_then(|v| v.as_str()).unwrap_or("/workspace").to_string(),
            capabilities,
        };

        *self.meta_cache.write().unwrap() = Some(meta.clone());
        Ok(meta)
    }

    async fn health(&self) -> bool {
        match self.http.get(self.url("/health")).timeout(Duration::from_secs(5)).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }

    fn supported_capabilities(&self) -> &[&'static str] {
        SUPPORTED_CAPABILITIES
    }

    async fn exec_browser(&self, cmd: &str, timeout_secs: u64) -> Result<ExecutionResult, CoreError> {
        let resp = self
            .http
            .post(self.url("/exec"))
            .json(&json!({"cmd": cmd, "timeout": timeout_secs}))
            .timeout(Duration::from_secs(timeout_secs + 5))
            .send()
            .await
            .map_err(map_transport_error)?;
        if resp.status().is_client_error() || resp.status().is_server_error() {
            return Err(CoreError::RuntimeError(format!("exec failed: {}", resp.status())));
        }
        let result: serde_json::Value = resp.json().await.map_err(map_transport_error)?;

        let exit_code = result.get("exit_code").and_then(|v| v.as_i64()).map(|v| v as i32);
        let stdout = result.get("stdout").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let stderr = result.get("stderr").and_then(|v| v.as_str()).map(str::to_string);

        Ok(ExecutionResult {
            success: exit_code == Some(0),
            output: stdout,
            error: stderr,
            exit_code,
            data: Some(json!({"raw": result})),
        })
    }
}
