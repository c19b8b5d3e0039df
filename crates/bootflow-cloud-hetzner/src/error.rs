//! Hetzner Cloud backend error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HetznerError {
    #[error("hcloud not found. Please install: brew install hcloud")]
    HcloudNotFound,

    #[error("hcloud authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("hcloud command failed: {0}")]
    CommandFailed(String),

    #[error("Missing attribute: {0}")]
    MissingAttribute(String),

    #[error("Invalid attribute {attribute}: {message}")]
    InvalidAttribute { attribute: String, message: String },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Unexpected hcloud response: {0}")]
    UnexpectedResponse(String),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HetznerError>;
