//! Hetzner Cloud provisioning backend

use crate::error::{HetznerError, Result};
use crate::hcloud::{CreateServerConfig, CreateVolumeConfig, Hcloud, ServerInfo, VolumeInfo};
use async_trait::async_trait;
use bootflow_cloud::{
    Attributes, AuthStatus, CloudError, ProvisioningBackend, ResourceKind, ResourceOutputs,
};
use serde_json::{Value, json};

/// Provisioning backend driving the `hcloud` CLI
///
/// Input attributes per kind:
///
/// | kind              | attributes                                                  |
/// |-------------------|-------------------------------------------------------------|
/// | ssh-key           | `name`, `publicKey`                                         |
/// | volume            | `name`, `size`, `location`, `format`?                       |
/// | server            | `name`, `serverType`, `image`, `location`, `sshKeys`, `userData`? |
/// | volume-attachment | `volumeId`, `serverId`, `automount`?                        |
pub struct HcloudBackend {
    hcloud: Hcloud,
}

impl HcloudBackend {
    pub fn new() -> Self {
        Self {
            hcloud: Hcloud::new(),
        }
    }

    pub fn with_context(context: impl Into<String>) -> Self {
        Self {
            hcloud: Hcloud::with_context(context),
        }
    }

    async fn create_resource(
        &self,
        kind: ResourceKind,
        attributes: &Attributes,
    ) -> Result<ResourceOutputs> {
        match kind {
            ResourceKind::SshKey => {
                let name = str_attr(attributes, "name")?;
                let public_key = str_attr(attributes, "publicKey")?;
                let key = self.hcloud.create_ssh_key(name, public_key).await?;
                let mut outputs = ResourceOutputs::new(key.id.to_string())
                    .with_attribute("name", json!(key.name));
                if let Some(fingerprint) = key.fingerprint {
                    outputs = outputs.with_attribute("fingerprint", json!(fingerprint));
                }
                Ok(outputs)
            }
            ResourceKind::Volume => {
                let config = CreateVolumeConfig {
                    name: str_attr(attributes, "name")?.to_string(),
                    size: u64_attr(attributes, "size")?,
                    location: str_attr(attributes, "location")?.to_string(),
                    format: opt_str_attr(attributes, "format")?.map(str::to_string),
                };
                let created = self.hcloud.create_volume(&config).await?;
                // the device path is only reported once the volume exists
                let volume = self.hcloud.describe_volume(&created.id.to_string()).await?;
                Ok(volume_outputs(&volume))
            }
            ResourceKind::Server => {
                let config = CreateServerConfig {
                    name: str_attr(attributes, "name")?.to_string(),
                    server_type: str_attr(attributes, "serverType")?.to_string(),
                    image: str_attr(attributes, "image")?.to_string(),
                    location: str_attr(attributes, "location")?.to_string(),
                    ssh_keys: str_list_attr(attributes, "sshKeys")?,
                    user_data: opt_str_attr(attributes, "userData")?.map(str::to_string),
                };
                let created = self.hcloud.create_server(&config).await?;
                let server = self.hcloud.describe_server(&created.id.to_string()).await?;
                Ok(server_outputs(&server))
            }
            ResourceKind::VolumeAttachment => {
                let volume = str_attr(attributes, "volumeId")?;
                let server = str_attr(attributes, "serverId")?;
                let automount = opt_bool_attr(attributes, "automount")?.unwrap_or(false);
                self.hcloud.attach_volume(volume, server, automount).await?;
                Ok(ResourceOutputs::new(attachment_id(volume, server))
                    .with_attribute("volume_id", json!(volume))
                    .with_attribute("server_id", json!(server)))
            }
        }
    }

    async fn update_resource(
        &self,
        kind: ResourceKind,
        id: &str,
        attributes: &Attributes,
    ) -> Result<Attributes> {
        match kind {
            ResourceKind::SshKey => {
                let name = str_attr(attributes, "name")?;
                self.hcloud.rename_ssh_key(id, name).await?;
                let key = self.hcloud.describe_ssh_key(id).await?;
                let mut outputs = Attributes::new();
                outputs.insert("name".to_string(), json!(key.name));
                if let Some(fingerprint) = key.fingerprint {
                    outputs.insert("fingerprint".to_string(), json!(fingerprint));
                }
                Ok(outputs)
            }
            ResourceKind::Volume => {
                let current = self.hcloud.describe_volume(id).await?;
                let size = u64_attr(attributes, "size")?;
                if size < current.size {
                    return Err(HetznerError::InvalidAttribute {
                        attribute: "size".to_string(),
                        message: format!("volumes cannot shrink ({} -> {})", current.size, size),
                    });
                }
                if size > current.size {
                    self.hcloud.resize_volume(id, size).await?;
                }
                let name = str_attr(attributes, "name")?;
                if name != current.name {
                    self.hcloud.rename_volume(id, name).await?;
                }
                let volume = self.hcloud.describe_volume(id).await?;
                Ok(volume_outputs(&volume).attributes)
            }
            ResourceKind::Server => {
                let name = str_attr(attributes, "name")?;
                self.hcloud.rename_server(id, name).await?;
                let server = self.hcloud.describe_server(id).await?;
                Ok(server_outputs(&server).attributes)
            }
            ResourceKind::VolumeAttachment => Err(HetznerError::Unsupported(
                "volume attachments are replaced, not updated".to_string(),
            )),
        }
    }

    async fn delete_resource(&self, kind: ResourceKind, id: &str) -> Result<()> {
        match kind {
            ResourceKind::SshKey => self.hcloud.delete_ssh_key(id).await,
            ResourceKind::Volume => self.hcloud.delete_volume(id).await,
            ResourceKind::Server => self.hcloud.delete_server(id).await,
            ResourceKind::VolumeAttachment => {
                let (volume, _server) = split_attachment_id(id)?;
                self.hcloud.detach_volume(volume).await
            }
        }
    }
}

impl Default for HcloudBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProvisioningBackend for HcloudBackend {
    fn name(&self) -> &str {
        "hetzner"
    }

    async fn check_auth(&self) -> bootflow_cloud::Result<AuthStatus> {
        match self.hcloud.check_auth().await {
            Ok(context) => Ok(AuthStatus::ok(context)),
            Err(HetznerError::HcloudNotFound) => {
                Ok(AuthStatus::failed("hcloud がインストールされていません"))
            }
            Err(e) => Ok(AuthStatus::failed(e.to_string())),
        }
    }

    async fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        attributes: &Attributes,
    ) -> bootflow_cloud::Result<ResourceOutputs> {
        tracing::info!("Creating {} {}", kind, name);
        self.create_resource(kind, attributes)
            .await
            .map_err(|e| CloudError::backend(name, "create", e))
    }

    async fn update(
        &self,
        kind: ResourceKind,
        id: &str,
        attributes: &Attributes,
    ) -> bootflow_cloud::Result<Attributes> {
        tracing::info!("Updating {} {}", kind, id);
        self.update_resource(kind, id, attributes)
            .await
            .map_err(|e| CloudError::backend(format!("{} {}", kind, id), "update", e))
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> bootflow_cloud::Result<()> {
        tracing::info!("Deleting {} {}", kind, id);
        self.delete_resource(kind, id)
            .await
            .map_err(|e| CloudError::backend(format!("{} {}", kind, id), "delete", e))
    }
}

fn volume_outputs(volume: &VolumeInfo) -> ResourceOutputs {
    let mut outputs = ResourceOutputs::new(volume.id.to_string())
        .with_attribute("name", json!(volume.name))
        .with_attribute("size", json!(volume.size));
    if let Some(device) = &volume.linux_device {
        outputs = outputs.with_attribute("linux_device", json!(device));
    }
    if let Some(location) = &volume.location {
        outputs = outputs.with_attribute("location", json!(location.name));
    }
    outputs
}

fn server_outputs(server: &ServerInfo) -> ResourceOutputs {
    let mut outputs = ResourceOutputs::new(server.id.to_string())
        .with_attribute("name", json!(server.name))
        .with_attribute("status", json!(server.status));
    if let Some(ip) = server.ipv4_address() {
        outputs = outputs.with_attribute("ipv4_address", json!(ip));
    }
    outputs
}

/// Attachments have no provider ID of their own
pub fn attachment_id(volume: &str, server: &str) -> String {
    format!("{}-{}", volume, server)
}

fn split_attachment_id(id: &str) -> Result<(&str, &str)> {
    id.split_once('-')
        .filter(|(volume, server)| !volume.is_empty() && !server.is_empty())
        .ok_or_else(|| HetznerError::InvalidAttribute {
            attribute: "id".to_string(),
            message: format!("not a volume attachment ID: {}", id),
        })
}

fn opt_str_attr<'a>(attributes: &'a Attributes, key: &str) -> Result<Option<&'a str>> {
    match attributes.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(HetznerError::InvalidAttribute {
            attribute: key.to_string(),
            message: format!("expected a string, got {}", other),
        }),
    }
}

fn str_attr<'a>(attributes: &'a Attributes, key: &str) -> Result<&'a str> {
    opt_str_attr(attributes, key)?.ok_or_else(|| HetznerError::MissingAttribute(key.to_string()))
}

fn u64_attr(attributes: &Attributes, key: &str) -> Result<u64> {
    match attributes.get(key) {
        None | Some(Value::Null) => Err(HetznerError::MissingAttribute(key.to_string())),
        Some(value) => value.as_u64().ok_or_else(|| HetznerError::InvalidAttribute {
            attribute: key.to_string(),
            message: format!("expected a positive integer, got {}", value),
        }),
    }
}

fn opt_bool_attr(attributes: &Attributes, key: &str) -> Result<Option<bool>> {
    match attributes.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(HetznerError::InvalidAttribute {
            attribute: key.to_string(),
            message: format!("expected a boolean, got {}", other),
        }),
    }
}

/// A list of IDs or names; numbers are accepted as IDs
fn str_list_attr(attributes: &Attributes, key: &str) -> Result<Vec<String>> {
    match attributes.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(HetznerError::InvalidAttribute {
                    attribute: key.to_string(),
                    message: format!("unexpected list item {}", other),
                }),
            })
            .collect(),
        Some(other) => Err(HetznerError::InvalidAttribute {
            attribute: key.to_string(),
            message: format!("expected a list, got {}", other),
        }),
    }
}
