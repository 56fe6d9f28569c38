//! Error taxonomy for the sandbox engine
//!
//! Policy and capacity errors are raised before any container exists. Build
//! and execution errors are folded into a failed `ExecutionResponse`. Audit
//! errors are the one class that must never be swallowed.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Errors raised while resolving or enforcing an execution policy
#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyError {
    #[error("Policy not found: {0}")]
    NotFound(String),

    #[error("Image '{image}' is not allowed by policy '{policy}'")]
    ImageNotAllowed { image: String, policy: String },

    #[error("Command element '{element}' is blocked by policy '{policy}' (matched '{pattern}')")]
    BlockedCommand {
        element: String,
        pattern: String,
        policy: String,
    },

    #[error("Invalid policy file {}: {}", .path.display(), .errors.join("; "))]
    InvalidPolicyFile { path: PathBuf, errors: Vec<String> },
}

/// Errors reported by the underlying container engine
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Docker error: {0}")]
    Docker(String),

    #[error("Image build failed: {0}")]
    Build(String),

    #[error("Invalid workspace: {0}")]
    Workspace(String),
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            other => RuntimeError::Docker(other.to_string()),
        }
    }
}

/// Errors raised by the image manager
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("Image registry I/O failed: {0}")]
    Registry(#[from] std::io::Error),

    #[error("Image registry is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Invalid package specification: {0:?}")]
    InvalidPackage(String),
}

/// Audit trail write/read failures
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit log I/O failed on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Audit record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Audit log file not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("Audit trail unavailable after an earlier write failure")]
    Poisoned,
}

/// Umbrella error for one execution
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("System at capacity: {0}")]
    Capacity(String),

    #[error("Image build failed: {0}")]
    Build(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Audit trail failure: {0}")]
    Audit(#[from] AuditError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Policy(_) => ErrorKind::Policy,
            EngineError::Capacity(_) => ErrorKind::Capacity,
            EngineError::Build(_) => ErrorKind::Build,
            EngineError::Execution(_) => ErrorKind::Execution,
            EngineError::Audit(_) => ErrorKind::Audit,
        }
    }
}

impl From<ImageError> for EngineError {
    fn from(e: ImageError) -> Self {
        EngineError::Build(e.to_string())
    }
}

impl From<RuntimeError> for EngineError {
    fn from(e: RuntimeError) -> Self {
        EngineError::Execution(e.to_string())
    }
}

/// Error class carried on a failed `ExecutionResponse`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Policy,
    Capacity,
    Build,
    Execution,
    Audit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err: EngineError = PolicyError::NotFound("x".into()).into();
        assert_eq!(err.kind(), ErrorKind::Policy);
        assert_eq!(
            EngineError::Capacity("full".into()).kind(),
            ErrorKind::Capacity
        );
        let err: EngineError = RuntimeError::Docker("boom".into()).into();
        assert_eq!(err.kind(), ErrorKind::Execution);
    }

    #[test]
    fn test_image_not_allowed_message() {
        let err = PolicyError::ImageNotAllowed {
            image: "evil:latest".into(),
            policy: "hardened".into(),
        };
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn test_invalid_policy_file_lists_all_errors() {
        let err = PolicyError::InvalidPolicyFile {
            path: PathBuf::from("/etc/policies.json"),
            errors: vec!["a: bad".into(), "b: worse".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("a: bad"));
        assert!(msg.contains("b: worse"));
    }
}
