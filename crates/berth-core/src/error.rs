//! Error taxonomy for berth.
//!
//! Structural errors ([`BerthError::CyclicDependency`],
//! [`BerthError::UnknownDependency`], [`BerthError::InvalidDescriptor`]) are
//! raised before any work starts. Execution errors are local to one stage or
//! service and normally surface inside a report rather than as an `Err`.

use thiserror::Error;

use crate::fingerprint::Fingerprint;

/// Errors produced by the berth controller.
#[derive(Debug, Error)]
pub enum BerthError {
    /// A fingerprint already maps to a different artifact.
    #[error("cache conflict for fingerprint {fingerprint}: recorded {existing}, offered {offered}")]
    CacheConflict {
        fingerprint: Fingerprint,
        existing: String,
        offered: String,
    },

    /// A dependency cycle was detected.
    #[error("dependency cycle detected involving: {nodes:?}")]
    CyclicDependency { nodes: Vec<String> },

    /// A node names a dependency that is not declared.
    #[error("{node} depends on unknown {dependency}")]
    UnknownDependency { node: String, dependency: String },

    /// A build stage failed; descendants were not built.
    #[error("build failed at stage {stage}: {cause}")]
    BuildFailed { stage: String, cause: String },

    /// Registry push or pull failed.
    #[error("registry error: {0}")]
    Registry(String),

    /// Runtime backend failed to start or stop an instance.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// A service exhausted its health probe retries.
    #[error("health check failed for service {service}: {cause}")]
    HealthCheckFailed { service: String, cause: String },

    /// A descriptor could not be parsed or validated.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// `berth.toml` could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// A stop request would strand running dependents.
    #[error("cannot stop {service}: still required by {dependents:?}")]
    StopRejected {
        service: String,
        dependents: Vec<String>,
    },

    /// No instance with that name is known to the orchestrator.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// The surrounding run was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Cache storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BerthError {
    /// True for errors that describe an invalid graph or descriptor rather
    /// than an execution failure.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            BerthError::CyclicDependency { .. }
                | BerthError::UnknownDependency { .. }
                | BerthError::InvalidDescriptor(_)
        )
    }
}

/// Result type for berth operations.
pub type Result<T> = std::result::Result<T, BerthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_displays_node_names() {
        let err = BerthError::CyclicDependency {
            nodes: vec!["a".to_string(), "b".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("cycle"));
        assert!(msg.contains("a"));
        assert!(msg.contains("b"));
    }

    #[test]
    fn test_build_failed_displays_stage_and_cause() {
        let err = BerthError::BuildFailed {
            stage: "deps".to_string(),
            cause: "exit code 2".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("deps"));
        assert!(msg.contains("exit code 2"));
    }

    #[test]
    fn test_structural_classification() {
        assert!(BerthError::UnknownDependency {
            node: "celery".to_string(),
            dependency: "rabbit".to_string(),
        }
        .is_structural());
        assert!(BerthError::InvalidDescriptor("bad yaml".to_string()).is_structural());
        assert!(!BerthError::Runtime("spawn failed".to_string()).is_structural());
        assert!(!BerthError::Cancelled.is_structural());
        assert!(!BerthError::Config("expected a table".to_string()).is_structural());
    }

    #[test]
    fn test_stop_rejected_lists_dependents() {
        let err = BerthError::StopRejected {
            service: "redis".to_string(),
            dependents: vec!["backend".to_string()],
        };
        assert!(err.to_string().contains("backend"));
    }
}
