//! Cloud lifecycle error types

use crate::action::RunReport;
use thiserror::Error;

/// Errors raised by the lifecycle engine and provisioning backends
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Policy violation on {resource}: {reason}")]
    PolicyViolation { resource: String, reason: String },

    #[error("Backend error on {resource} during {operation}: {message}")]
    Backend {
        resource: String,
        operation: String,
        message: String,
    },

    #[error("Deferred value read before its dependencies were provisioned: {}", pending.join(", "))]
    DependencyUnresolved { pending: Vec<String> },

    /// The run stopped early; `report` holds what was done before it did
    #[error("Run halted: {source}")]
    Halted {
        source: Box<CloudError>,
        report: Box<RunReport>,
    },

    #[error("Resource {resource} depends on unknown resource {dependency}")]
    UnknownDependency { resource: String, dependency: String },

    #[error("Circular dependency between: {0}")]
    CircularDependency(String),

    #[error("Resource declared twice: {0}")]
    DuplicateResource(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Resource {resource} has no output attribute {attribute}")]
    MissingOutput { resource: String, attribute: String },

    #[error("Invalid attribute {attribute}: {message}")]
    InvalidAttribute { attribute: String, message: String },

    #[error("State file error: {0}")]
    StateError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    pub fn backend(
        resource: impl Into<String>,
        operation: impl Into<String>,
        error: impl std::fmt::Display,
    ) -> Self {
        CloudError::Backend {
            resource: resource.into(),
            operation: operation.into(),
            message: error.to_string(),
        }
    }

    pub fn policy_violation(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        CloudError::PolicyViolation {
            resource: resource.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
