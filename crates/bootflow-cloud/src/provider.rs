//! Provisioning backend trait definition

use crate::error::Result;
use crate::resource::{Attributes, ResourceKind, ResourceOutputs};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Provisioning backend abstraction
///
/// The orchestrator only needs three operations from a cloud provider. Each
/// call completes synchronously from the orchestrator's point of view: once a
/// future resolves, the resource exists (or is gone) with the reported
/// attributes.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Returns the backend name (e.g., "hetzner")
    fn name(&self) -> &str;

    /// Check if the backend is properly configured and authenticated
    async fn check_auth(&self) -> Result<AuthStatus>;

    /// Create a resource and return its ID and output attributes
    async fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        attributes: &Attributes,
    ) -> Result<ResourceOutputs>;

    /// Update a resource in place and return its new output attributes
    async fn update(&self, kind: ResourceKind, id: &str, attributes: &Attributes)
    -> Result<Attributes>;

    /// Delete a resource
    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<()>;
}

/// Authentication status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    /// Whether authentication is valid
    pub authenticated: bool,

    /// Account or context information if available
    pub account_info: Option<String>,

    /// Error message if not authenticated
    pub error: Option<String>,
}

impl AuthStatus {
    pub fn ok(account_info: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            account_info: Some(account_info.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            account_info: None,
            error: Some(error.into()),
        }
    }
}
