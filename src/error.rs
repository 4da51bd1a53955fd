//! Error types for the operator

use thiserror::Error;

use crate::consul::ConsulError;

/// Top-level error returned by reconciles and operator setup.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Consul error: {0}")]
    Consul(#[from] ConsulError),

    /// A Consul-side sync step failed and the failure was recorded on the
    /// resource's status under `reason`.
    #[error("{message}")]
    SyncFailed { reason: String, message: String },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// True when the Kubernetes API answered 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(resp)) if resp.code == 404)
    }

    /// True when the Kubernetes API rejected a write because of a stale
    /// resourceVersion.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// Whether retrying the same request could succeed without user action.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 409 || resp.code == 429,
            Error::KubeError(_) => true,
            Error::Consul(e) => e.is_retriable(),
            Error::SyncFailed { .. } => true,
            Error::ValidationError(_) | Error::ConfigError(_) | Error::SerializationError(_) => false,
        }
    }

    /// Short label used for the reconcile error metric.
    pub fn metric_label(&self) -> &str {
        match self {
            Error::KubeError(_) => "kube",
            Error::Consul(_) => "consul",
            Error::SyncFailed { reason, .. } => reason.as_str(),
            Error::ValidationError(_) => "validation",
            Error::ConfigError(_) => "config",
            Error::SerializationError(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "NotFound".to_string(),
            code,
        }))
    }

    #[test]
    fn test_not_found_detection() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(500).is_not_found());
        assert!(!Error::ConfigError("x".into()).is_not_found());
    }

    #[test]
    fn test_conflict_detection() {
        assert!(api_error(409).is_conflict());
        assert!(!api_error(404).is_conflict());
        assert!(!Error::ConfigError("x".into()).is_conflict());
    }

    #[test]
    fn test_retriable() {
        assert!(api_error(503).is_retriable());
        assert!(api_error(409).is_retriable());
        assert!(!api_error(422).is_retriable());
        assert!(!Error::ValidationError("bad".into()).is_retriable());
    }

    #[test]
    fn test_sync_failed_display_is_message() {
        let err = Error::SyncFailed {
            reason: "ConsulAgentError".to_string(),
            message: "writing config entry to consul: 500".to_string(),
        };
        assert_eq!(err.to_string(), "writing config entry to consul: 500");
        assert_eq!(err.metric_label(), "ConsulAgentError");
    }
}
