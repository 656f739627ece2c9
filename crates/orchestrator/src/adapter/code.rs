//! Code-runtime adapter. Speaks to a container exposing IPython-backed code
//! execution, a shell, and a filesystem, mirroring the original Ship
//! adapter's endpoint mapping:
//!   python -> /ipython/exec, shell -> /shell/exec, filesystem -> /fs/*

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::RuntimeAdapter;
use crate::error::CoreError;
use crate::models::{ExecutionResult, RuntimeMeta};
use crate::path;

const SUPPORTED_CAPABILITIES: &[&str] = &["python", "shell", "filesystem", "terminal"];

pub struct CodeAdapter {
    base_url: String,
    http: reqwest::Client,
    meta_cache: RwLock<Option<RuntimeMeta>>,
}

impl CodeAdapter {
    pub fn new(base_url: String, http: reqwest::Client) -> Self {
        Self { base_url: base_url.trim_end_matches('/').to_string(), http, meta_cache: RwLock::new(None) }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json(&self, path: &str, body: serde_json::Value, timeout: Duration) -> Result<serde_json::Value, CoreError> {
        let resp = self
            .http
            .post(self.url(path))
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_transport_error)?;
        handle_response(resp, path).await
    }
}

fn map_transport_error(e: reqwest::Error) -> CoreError {
    if e.is_timeout() {
        CoreError::Timeout(e.to_string())
    } else {
        CoreError::RuntimeError(e.to_string())
    }
}

async fn handle_response(resp: reqwest::Response, path: &str) -> Result<serde_json::Value, CoreError> {
    let status = resp.status();
    if status == reqwest::StatusCode::NOT_FOUND && path.starts_with("/fs/") {
        return Err(CoreError::FileNotFound(path.to_string()));
    }
    if status.is_client_error() || status.is_server_error() {
        return Err(CoreError::RuntimeError(format!("request to {path} failed: {status}")));
    }
    resp.json::<serde_json::Value>().await.map_err(map_transport_error)
}

#[async_trait]
impl RuntimeAdapter for CodeAdapter {
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
        let data = handle_response(resp, "/meta").await?;

        let runtime = data.get("runtime").cloned().unwrap_or_default();
        let workspace = data.get("workspace").cloned().unwrap_or_default();
        let capabilities = data
            .get("capabilities")
            .and_then(|v| v.as_object())
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        let meta = RuntimeMeta {
            name: runtime.get("name").and_then(|v| v.as_str()).unwrap_or("ship").to_string(),
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

    async fn exec_python(&self, code: &str, timeout_secs: u64) -> Result<ExecutionResult, CoreError> {
        let result = self
            .post_json(
                "/ipython/exec",
                json!({"code": code, "timeout": timeout_secs, "silent": false}),
                Duration::from_secs(timeout_secs + 5),
            )
            .await?;

        let output_obj = result.get("output").cloned().unwrap_or_default();
        let output_text = output_obj.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string();

        Ok(ExecutionResult {
            success: result.get("success").and_then(|v| v.as_bool()).unwrap_or(false),
            output: output_text,
            error: result.get("error").and_then(|v| v.as_str()).map(str::to_string),
            exit_code: None,
            data: Some(json!({"execution_count": result.get("execution_count"), "output": output_obj})),
        })
    }

    async fn exec_shell(&self, command: &str, timeout_secs: u64, cwd: Option<&str>) -> Result<ExecutionResult, CoreError> {
        let mut payload = json!({"command": command, "timeout": timeout_secs});
        if let Some(cwd) = cwd {
            payload["cwd"] = json!(cwd);
        }
        let result = self.post_json("/shell/exec", payload, Duration::from_secs(timeout_secs + 5)).await?;

        Ok(ExecutionResult {
            success: result.get("success").and_then(|v| v.as_bool()).unwrap_or(false),
            output: result.get("stdout").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            error: result
                .get("error")
                .and_then(|v| v.as_str())
                .or_else(|| result.get("stderr").and_then(|v| v.as_str()))
                .map(str::to_string),
            exit_code: result.get("return_code").and_then(|v| v.as_i64()).map(|v| v as i32),
            data: Some(json!({"raw": result})),
        })
    }

    async fn read_file(&self, path: &str) -> Result<String, CoreError> {
        let path = path::normalize(path)?;
        let result = self.post_json("/fs/read_file", json!({"path": path}), Duration::from_secs(30)).await?;
        Ok(result.get("content").and_then(|v| v.as_str()).unwrap_or("").to_string())
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), CoreError> {
        let path = path::normalize(path)?;
        self.post_json("/fs/write_file", json!({"path": path, "content": content, "mode": "w"}), Duration::from_secs(30))
            .await?;
        Ok(())
    }

    async fn list_files(&self, path: &str) -> Result<Vec<serde_json::Value>, CoreError> {
        let path = path::normalize(path)?;
        let result = self
            .post_json("/fs/list_dir", json!({"path": path, "show_hidden": false}), Duration::from_secs(30))
            .await?;
        Ok(result.get("files").and_then(|v| v.as_array()).cloned().unwrap_or_default())
    }

    async fn delete_file(&self, path: &str) -> Result<(), CoreError> {
        let path = path::normalize(path)?;
        self.post_json("/fs/delete_file", json!({"path": path}), Duration::from_secs(30)).await?;
        Ok(())
    }

    async fn upload_file(&self, path: &str, content: Vec<u8>) -> Result<(), CoreError> {
        let path = path::normalize(path)?;
        let part = reqwest::multipart::Part::bytes(content).file_name("file").mime_str("application/octet-stream").map_err(map_transport_error)?;
        let form = reqwest::multipart::Form::new().part("file", part).text("file_path", path);
        let resp = self.http.post(self.url("/fs/upload")).multipart(form).send().await.map_err(map_transport_error)?;
        if resp.status().is_client_error() || resp.status().is_server_error() {
            return Err(CoreError::RuntimeError(format!("upload failed: {}", resp.status())));
        }
        Ok(())
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>, CoreError> {
        let path = path::normalize(path)?;
        let resp = self
            .http
            .get(self.url("/fs/download"))
            .query(&[("file_path", &path)])
            .send()
            .await
            .map_err(map_transport_error)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CoreError::FileNotFound(path));
        }
        if resp.status().is_client_error() || resp.status().is_server_error() {
            return Err(CoreError::RuntimeError(format!("download failed: {}", resp.status())));
        }
        Ok(resp.bytes().await.map_err(map_transport_error)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_capabilities_include_terminal() {
        let adapter = CodeAdapter::new("http://127.0.0.1:8123".to_string(), reqwest::Client::new());
        assert_eq!(adapter.supported_capabilities(), SUPPORTED_CAPABILITIES);
        assert!(adapter.supported_capabilities().contains(&"terminal"));
    }

    #[test]
    fn url_joins_base_and_path() {
        let adapter = CodeAdapter::new("http://127.0.0.1:8123/".to_string(), reqwest::Client::new());
        assert_eq!(adapter.url("/meta"), "http://127.0.0.1:8123/meta");
    }

    #[tokio::test]
    async fn file_ops_reject_traversal_before_any_request_is_sent() {
        let adapter = CodeAdapter::new("http://127.0.0.1:1".to_string(), reqwest::Client::new());
        assert!(adapter.read_file("../../etc/passwd").await.is_err());
        assert!(adapter.write_file("/etc/passwd", "x").await.is_err());
        assert!(adapter.delete_file("..").await.is_err());
    }
}
