use thiserror::Error;

/// Stable wire error kind. The request layer above the core renders these
/// into whatever status codes/bodies it wants; the core only carries the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    Forbidden,
    ValidationError,
    Conflict,
    QuotaExceeded,
    SessionNotReady,
    Timeout,
    RuntimeError,
    CapabilityNotSupported,
    InvalidPath,
    FileNotFound,
    SandboxExpired,
    SandboxTtlInfinite,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("session not ready")]
    SessionNotReady,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("runtime error: {0}")]
    RuntimeError(String),

    #[error("capability not supported: {capability}, available: {available:?}")]
    CapabilityNotSupported { capability: String, available: Vec<String> },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("sandbox expired")]
    SandboxExpired,

    #[error("sandbox has infinite ttl")]
    SandboxTtlInfinite,

    #[error("driver error: {0}")]
    Driver(#[from] bay_driver::DriverError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::ValidationError(_) => ErrorKind::ValidationError,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            CoreError::SessionNotReady => ErrorKind::SessionNotReady,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::CapabilityNotSupported { .. } => ErrorKind::CapabilityNotSupported,
            CoreError::InvalidPath(_) => ErrorKind::InvalidPath,
            CoreError::FileNotFound(_) => ErrorKind::FileNotFound,
            CoreError::SandboxExpired => ErrorKind::SandboxExpired,
            CoreError::SandboxTtlInfinite => ErrorKind::SandboxTtlInfinite,
            CoreError::RuntimeError(_) | CoreError::Driver(_) | CoreError::Http(_) => ErrorKind::RuntimeError,
            CoreError::Database(_) => ErrorKind::RuntimeError,
        }
    }

    /// Message safe to surface to a client. Internal errors are logged in
    /// full server-side and replaced with a short sanitized message here.
    pub fn client_message(&self) -> String {
        match self {
            CoreError::Database(e) => {
                tracing::error!(error = %e, "database error");
                "an internal error occurred".to_string()
            }
            CoreError::Driver(e) => {
                tracing::error!(error = %e, "driver error");
                "a backend communication error occurred".to_string()
            }
            CoreError::Http(e) => {
                tracing::error!(error = %e, "http error");
                "a backend communication error occurred".to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_client_message_passes_through() {
        let err = CoreError::NotFound("sandbox sb-1".to_string());
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.client_message(), "not found: sandbox sb-1");
    }

    #[test]
    fn database_error_is_sanitized_as_runtime_error() {
        let err = CoreError::Database(sqlx::Error::RowNotFound);
        assert_eq!(err.kind(), ErrorKind::RuntimeError);
        assert_eq!(err.client_message(), "an internal error occurred");
    }

    #[test]
    fn capability_not_supported_carries_available_list() {
        let err = CoreError::CapabilityNotSupported {
            capability: "gpu".to_string(),
            available: vec!["browser".to_string(), "python".to_string()],
        };
        assert_eq!(err.kind(), ErrorKind::CapabilityNotSupported);
    }
}
