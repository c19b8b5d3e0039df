//! Hetzner Cloud backend for bootflow
//!
//! This crate implements the ProvisioningBackend trait for Hetzner Cloud,
//! enabling bootflow to manage SSH keys, volumes, servers and volume
//! attachments.
//!
//! # Requirements
//!
//! - `hcloud` CLI must be installed
//! - Authentication is managed through `HCLOUD_TOKEN` or an hcloud context
//!
//! # Example
//!
//! ```ignore
//! use bootflow_cloud_hetzner::HcloudBackend;
//! use bootflow_cloud::ProvisioningBackend;
//!
//! let backend = HcloudBackend::new();
//!
//! let auth = backend.check_auth().await?;
//! if !auth.authenticated {
//!     panic!("Not authenticated: {:?}", auth.error);
//! }
//! ```

pub mod error;
pub mod hcloud;
pub mod provider;

pub use error::{HetznerError, Result};
pub use hcloud::{CreateServerConfig, CreateVolumeConfig, Hcloud, ServerInfo, SshKeyInfo, VolumeInfo};
pub use provider::HcloudBackend;
