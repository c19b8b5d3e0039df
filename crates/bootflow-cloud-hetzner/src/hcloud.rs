//! hcloud CLI wrapper
//!
//! Wraps the hcloud CLI commands for Hetzner Cloud operations.

use crate::error::{HetznerError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// hcloud CLI wrapper
pub struct Hcloud {
    /// hcloud context to use instead of the active one
    context: Option<String>,
}

impl Hcloud {
    pub fn new() -> Self {
        Self { context: None }
    }

    pub fn with_context(context: impl Into<String>) -> Self {
        Self {
            context: Some(context.into()),
        }
    }

    /// Check if hcloud is installed and can reach the API
    ///
    /// Returns the name of the context in use.
    pub async fn check_auth(&self) -> Result<String> {
        let which = Command::new("which").arg("hcloud").output().await?;
        if !which.status.success() {
            return Err(HetznerError::HcloudNotFound);
        }

        // any authenticated read will do
        self.run_command(&["location", "list", "-o", "json"], None)
            .await
            .map_err(|e| HetznerError::AuthenticationFailed(e.to_string()))?;

        if let Some(context) = &self.context {
            return Ok(context.clone());
        }
        if std::env::var("HCLOUD_TOKEN").is_ok() {
            return Ok("HCLOUD_TOKEN".to_string());
        }
        let active = self.run_command(&["context", "active"], None).await?;
        Ok(active.trim().to_string())
    }

    /// Run an hcloud command and return stdout
    async fn run_command(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let mut cmd = Command::new("hcloud");
        cmd.args(args);
        if let Some(context) = &self.context {
            cmd.env("HCLOUD_CONTEXT", context);
        }
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!("Running: hcloud {}", args.join(" "));

        let mut child = cmd.spawn()?;
        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input.as_bytes()).await?;
            // closing the pipe signals end of input
            drop(pipe);
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HetznerError::CommandFailed(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run a command returning JSON and extract the `key` object
    async fn run_json<T: DeserializeOwned>(
        &self,
        args: &[&str],
        stdin: Option<&str>,
        key: &str,
    ) -> Result<T> {
        let output = self.run_command(args, stdin).await?;
        parse_object(&output, key)
    }

    /// Create an SSH key
    pub async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKeyInfo> {
        self.run_json(
            &[
                "ssh-key",
                "create",
                "--name",
                name,
                "--public-key",
                public_key,
                "-o",
                "json",
            ],
            None,
            "ssh_key",
        )
        .await
    }

    pub async fn describe_ssh_key(&self, id: &str) -> Result<SshKeyInfo> {
        self.run_json(&["ssh-key", "describe", id, "-o", "json"], None, "ssh_key")
            .await
    }

    pub async fn rename_ssh_key(&self, id: &str, name: &str) -> Result<()> {
        self.run_command(&["ssh-key", "update", id, "--name", name], None)
            .await?;
        Ok(())
    }

    pub async fn delete_ssh_key(&self, id: &str) -> Result<()> {
        self.run_command(&["ssh-key", "delete", id], None).await?;
        Ok(())
    }

    /// Create a volume
    pub async fn create_volume(&self, config: &CreateVolumeConfig) -> Result<VolumeInfo> {
        let size = config.size.to_string();
        let mut args = vec![
            "volume",
            "create",
            "--name",
            config.name.as_str(),
            "--size",
            size.as_str(),
            "--location",
            config.location.as_str(),
        ];
        if let Some(ref format) = config.format {
            args.push("--format");
            args.push(format.as_str());
        }
        args.extend(["-o", "json"]);

        self.run_json(&args, None, "volume").await
    }

    pub async fn describe_volume(&self, id: &str) -> Result<VolumeInfo> {
        self.run_json(&["volume", "describe", id, "-o", "json"], None, "volume")
            .await
    }

    /// Grow a volume; volumes cannot shrink
    pub async fn resize_volume(&self, id: &str, size: u64) -> Result<()> {
        let size = size.to_string();
        self.run_command(&["volume", "resize", id, "--size", size.as_str()], None)
            .await?;
        Ok(())
    }

    pub async fn rename_volume(&self, id: &str, name: &str) -> Result<()> {
        self.run_command(&["volume", "update", id, "--name", name], None)
            .await?;
        Ok(())
    }

    pub async fn delete_volume(&self, id: &str) -> Result<()> {
        self.run_command(&["volume", "delete", id], None).await?;
        Ok(())
    }

    /// Attach a volume to a server
    pub async fn attach_volume(&self, volume: &str, server: &str, automount: bool) -> Result<()> {
        let mut args = vec!["volume", "attach", volume, "--server", server];
        if automount {
            args.push("--automount");
        }
        self.run_command(&args, None).await?;
        Ok(())
    }

    /// Detach a volume; a volume that is not attached is left as is
    pub async fn detach_volume(&self, volume: &str) -> Result<()> {
        let current = self.describe_volume(volume).await?;
        if current.server.is_none() {
            tracing::debug!("Volume {} is not attached", volume);
            return Ok(());
        }
        self.run_command(&["volume", "detach", volume], None).await?;
        Ok(())
    }

    /// Create a server; the user data is piped through stdin
    pub async fn create_server(&self, config: &CreateServerConfig) -> Result<ServerInfo> {
        let mut args = vec![
            "server",
            "create",
            "--name",
            config.name.as_str(),
            "--type",
            config.server_type.as_str(),
            "--image",
            config.image.as_str(),
            "--location",
            config.location.as_str(),
        ];
        for key in &config.ssh_keys {
            args.push("--ssh-key");
            args.push(key.as_str());
        }
        if config.user_data.is_some() {
            args.push("--user-data-from-file");
            args.push("-");
        }
        args.extend(["-o", "json"]);

        self.run_json(&args, config.user_data.as_deref(), "server")
            .await
    }

    pub async fn describe_server(&self, id: &str) -> Result<ServerInfo> {
        self.run_json(&["server", "describe", id, "-o", "json"], None, "server")
            .await
    }

    pub async fn rename_server(&self, id: &str, name: &str) -> Result<()> {
        self.run_command(&["server", "update", id, "--name", name], None)
            .await?;
        Ok(())
    }

    pub async fn delete_server(&self, id: &str) -> Result<()> {
        self.run_command(&["server", "delete", id], None).await?;
        Ok(())
    }
}

impl Default for Hcloud {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse hcloud JSON output
///
/// `create` commands wrap the object in an envelope (`{"server": {...},
/// "action": ...}`) while `describe` prints the bare object.
pub fn parse_object<T: DeserializeOwned>(output: &str, key: &str) -> Result<T> {
    let value: serde_json::Value = serde_json::from_str(output.trim())?;
    let object = match value {
        serde_json::Value::Object(mut map) if map.contains_key(key) && !map.contains_key("id") => {
            map.remove(key).unwrap_or_default()
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(map),
        other => {
            return Err(HetznerError::UnexpectedResponse(format!(
                "expected a {} object, got {}",
                key, other
            )));
        }
    };
    Ok(serde_json::from_value(object)?)
}

/// SSH key information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKeyInfo {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// Volume information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub id: u64,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub linux_device: Option<String>,
    /// ID of the server the volume is attached to
    #[serde(default)]
    pub server: Option<u64>,
    #[serde(default)]
    pub location: Option<LocationInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationInfo {
    pub name: String,
}

/// Server information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: u64,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub public_net: Option<PublicNet>,
}

impl ServerInfo {
    /// Public IPv4 address
    pub fn ipv4_address(&self) -> Option<String> {
        self.public_net.as_ref()?.ipv4.as_ref().map(|ip| ip.ip.clone())
    }

    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicNet {
    #[serde(default)]
    pub ipv4: Option<Ipv4Info>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ipv4Info {
    pub ip: String,
}

/// Configuration for creating a volume
#[derive(Debug, Clone)]
pub struct CreateVolumeConfig {
    pub name: String,
    pub size: u64,
    pub location: String,
    pub format: Option<String>,
}

/// Configuration for creating a server
#[derive(Debug, Clone)]
pub struct CreateServerConfig {
    pub name: String,
    pub server_type: String,
    pub image: String,
    pub location: String,
    pub ssh_keys: Vec<String>,
    pub user_data: Option<String>,
}
