//! Error types for the local adapters.

use berth_core::BerthError;
use thiserror::Error;

/// Errors raised inside an adapter before they are classified for the core.
#[derive(Error, Debug)]
pub enum BackendError {
    /// A stage or service has nothing to execute.
    #[error("no command configured for {0}")]
    EmptyCommand(String),

    /// A child process exited unsuccessfully.
    #[error("{program} exited with {status}: {detail}")]
    CommandFailed {
        program: String,
        status: String,
        detail: String,
    },

    /// A reference does not have the `<repository>:<tag>` shape.
    #[error("invalid reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Http(err.to_string())
    }
}

impl BackendError {
    pub fn into_build(self, stage: &str) -> BerthError {
        BerthError::BuildFailed {
            stage: stage.to_string(),
            cause: self.to_string(),
        }
    }

    pub fn into_registry(self) -> BerthError {
        BerthError::Registry(self.to_string())
    }

    pub fn into_runtime(self) -> BerthError {
        BerthError::Runtime(self.to_string())
    }

    pub fn into_health(self, service: &str) -> BerthError {
        BerthError::HealthCheckFailed {
            service: service.to_string(),
            cause: self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_keeps_message() {
        let err = BackendError::NotFound("acme/app:latest".to_string()).into_registry();
        assert!(matches!(err, BerthError::Registry(ref m) if m.contains("acme/app:latest")));

        let err = BackendError::EmptyCommand("app".to_string()).into_build("app");
        assert!(matches!(err, BerthError::BuildFailed { ref stage, .. } if stage == "app"));
    }
}
