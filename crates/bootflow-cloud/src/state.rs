//! State management for provisioned resources
//!
//! Manages the `.bootflow/state.json` file which records, per logical
//! resource, the provider ID together with the inputs it was provisioned with
//! and the outputs the backend reported.

use crate::error::{CloudError, Result};
use crate::resource::{Attributes, ResourceKind, ResourceOutputs};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const FORMAT_VERSION: u32 = 1;
const STATE_DIR: &str = ".bootflow";
const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "state.lock";

/// Locks older than this are left over from a crashed run
const LOCK_TTL_MINUTES: i64 = 60;

/// State of every resource of a stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    /// State file version
    pub version: u32,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    /// Resources indexed by logical name
    pub resources: BTreeMap<String, ResourceRecord>,
}

impl Default for StackState {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
            updated_at: Utc::now(),
            resources: BTreeMap::new(),
        }
    }
}

impl StackState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a resource
    pub fn set_resource(&mut self, name: impl Into<String>, record: ResourceRecord) {
        self.resources.insert(name.into(), record);
        self.updated_at = Utc::now();
    }

    /// Remove a resource
    pub fn remove_resource(&mut self, name: &str) -> Option<ResourceRecord> {
        let result = self.resources.remove(name);
        if result.is_some() {
            self.updated_at = Utc::now();
        }
        result
    }

    pub fn get_resource(&self, name: &str) -> Option<&ResourceRecord> {
        self.resources.get(name)
    }
}

/// Recorded state of a single resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Provider-assigned ID
    pub id: String,

    pub kind: ResourceKind,

    /// Last known lifecycle status
    pub status: ResourceStatus,

    /// Inputs the resource was provisioned with
    pub inputs: Attributes,

    /// Outputs reported by the backend
    pub outputs: Attributes,

    /// Resources this one depended on when it was provisioned
    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    /// Protection flag at provisioning time
    #[serde(default)]
    pub protect: bool,

    /// When the resource was created
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            status: ResourceStatus::Provisioned,
            inputs: Attributes::new(),
            outputs: Attributes::new(),
            depends_on: BTreeSet::new(),
            protect: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_inputs(mut self, inputs: Attributes) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_outputs(mut self, outputs: Attributes) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_output(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }

    pub fn with_depends_on<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(resources.into_iter().map(Into::into));
        self
    }

    pub fn with_protect(mut self, protect: bool) -> Self {
        self.protect = protect;
        self
    }

    pub fn get_output<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.outputs
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn to_outputs(&self) -> ResourceOutputs {
        ResourceOutputs {
            id: self.id.clone(),
            attributes: self.outputs.clone(),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Lifecycle status of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Declared, not yet acted on in this run
    Planned,
    /// Backend create call in flight
    Creating,
    /// Backend update call in flight
    Updating,
    /// Exists with the reported outputs
    Provisioned,
    /// Replacement decided, old and new instance being swapped
    Replacing,
    /// Backend delete call in flight
    Deleting,
    /// Gone
    Deleted,
    /// A backend call failed; terminal for the run
    Failed,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Planned => write!(f, "planned"),
            ResourceStatus::Creating => write!(f, "creating"),
            ResourceStatus::Updating => write!(f, "updating"),
            ResourceStatus::Provisioned => write!(f, "provisioned"),
            ResourceStatus::Replacing => write!(f, "replacing"),
            ResourceStatus::Deleting => write!(f, "deleting"),
            ResourceStatus::Deleted => write!(f, "deleted"),
            ResourceStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Reads and writes the state of one stack
///
/// Everything lives in `.bootflow/` under the directory the manager is
/// created for (the stack config's directory).
pub struct StateManager {
    dir: PathBuf,
}

impl StateManager {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: base_dir.as_ref().join(STATE_DIR),
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Load the state; a stack that was never applied has an empty state
    pub async fn load(&self) -> Result<StackState> {
        let path = self.state_path();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No state file yet");
                return Ok(StackState::new());
            }
            Err(e) => return Err(e.into()),
        };

        let state: StackState = serde_json::from_str(&content).map_err(|e| {
            CloudError::StateError(format!("{} is not a valid state file: {}", path.display(), e))
        })?;
        if state.version > FORMAT_VERSION {
            return Err(CloudError::StateError(format!(
                "{} uses format {}, this bootflow understands up to {}",
                path.display(),
                state.version,
                FORMAT_VERSION
            )));
        }

        tracing::debug!(resources = state.resources.len(), "Loaded state");
        Ok(state)
    }

    /// Replace the state file atomically, keeping the old one as
    /// `state.json.bak`
    pub async fn save(&self, state: &StackState) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.state_path();
        let staged = path.with_extension("json.tmp");
        fs::write(&staged, serde_json::to_vec_pretty(state)?).await?;

        if fs::try_exists(&path).await? {
            fs::copy(&path, path.with_extension("json.bak")).await?;
        }
        fs::rename(&staged, &path).await?;

        tracing::debug!(
            path = %path.display(),
            resources = state.resources.len(),
            "Saved state"
        );
        Ok(())
    }

    /// Take the run lock
    ///
    /// Fails with `LockError` while another run holds it. A lock past its TTL
    /// is broken. A lock that cannot be read may still be being written, so it
    /// is only broken once the file itself is older than the TTL.
    pub async fn acquire_lock(&self) -> Result<StateLock> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.lock_path();
        let body = serde_json::to_vec_pretty(&LockOwner::current())?;

        // second attempt only after breaking a stale lock
        for _ in 0..2 {
            match create_exclusive(&path, &body).await {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "Took state lock");
                    return Ok(StateLock { path: Some(path) });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            match LockOwner::read(&path).await {
                Some(owner) if !owner.is_stale() => {
                    return Err(CloudError::LockError(format!(
                        "state is locked by {} (pid {}) since {}",
                        owner.host, owner.pid, owner.acquired_at
                    )));
                }
                Some(owner) => tracing::warn!(?owner, "Breaking stale state lock"),
                None => match file_age(&path).await? {
                    // released in the meantime
                    None => continue,
                    Some(age) if age <= lock_ttl() => {
                        return Err(CloudError::LockError(format!(
                            "{} is held by a run that has not recorded its owner yet",
                            path.display()
                        )));
                    }
                    Some(age) => tracing::warn!(
                        path = %path.display(),
                        age_secs = age.as_secs(),
                        "Breaking unreadable state lock"
                    ),
                },
            }
            remove_if_exists(&path).await?;
        }

        Err(CloudError::LockError(format!(
            "could not take {}",
            path.display()
        )))
    }
}

async fn create_exclusive(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(body).await?;
    file.flush().await
}

fn lock_ttl() -> Duration {
    Duration::from_secs(LOCK_TTL_MINUTES as u64 * 60)
}

/// Time since `path` was last written, `None` if it does not exist
async fn file_age(path: &Path) -> std::io::Result<Option<Duration>> {
    match fs::metadata(path).await {
        Ok(meta) => {
            let modified = meta.modified()?;
            Ok(Some(
                SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or_default(),
            ))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Contents of the lock file
#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    host: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

impl LockOwner {
    fn current() -> Self {
        let host = ["HOSTNAME", "HOST"]
            .iter()
            .find_map(|var| std::env::var(var).ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            host,
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    async fn read(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).await.ok()?;
        serde_json::from_str(&content).ok()
    }

    fn is_stale(&self) -> bool {
        Utc::now() - self.acquired_at > chrono::Duration::minutes(LOCK_TTL_MINUTES)
    }
}

/// Held run lock, released on drop
pub struct StateLock {
    path: Option<PathBuf>,
}

impl StateLock {
    pub async fn release(mut self) -> Result<()> {
        if let Some(path) = self.path.take() {
            remove_if_exists(&path).await?;
            tracing::debug!("Released state lock");
        }
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record_with_device(id: &str) -> ResourceRecord {
        ResourceRecord::new(id, ResourceKind::Volume)
            .with_input("size", serde_json::json!(10))
            .with_output(
                "linux_device",
                serde_json::json!(format!("/dev/disk/by-id/scsi-0HC_Volume_{}", id)),
            )
            .with_protect(true)
    }

    #[tokio::test]
    async fn test_saved_state_loads_back() {
        let dir = tempdir().unwrap();
        let manager = StateManager::new(dir.path());

        let mut state = StackState::new();
        state.set_resource("backup-volume", record_with_device("123"));
        manager.save(&state).await.unwrap();

        let loaded = manager.load().await.unwrap();
        let record = loaded.get_resource("backup-volume").unwrap();
        assert!(record.protect);
        assert_eq!(record.inputs.get("size"), Some(&serde_json::json!(10)));
        assert_eq!(
            record.get_output::<String>("linux_device").as_deref(),
            Some("/dev/disk/by-id/scsi-0HC_Volume_123")
        );
        assert!(!dir.path().join(".bootflow/state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_previous_state_kept_as_backup() {
        let dir = tempdir().unwrap();
        let manager = StateManager::new(dir.path());

        let mut first = StackState::new();
        first.set_resource("backup-volume", record_with_device("1"));
        manager.save(&first).await.unwrap();
        manager.save(&StackState::new()).await.unwrap();

        let backup = std::fs::read_to_string(dir.path().join(".bootflow/state.json.bak")).unwrap();
        let backup: StackState = serde_json::from_str(&backup).unwrap();
        assert!(backup.get_resource("backup-volume").is_some());
        assert!(manager.load().await.unwrap().resources.is_empty());
    }

    #[tokio::test]
    async fn test_missing_state_is_empty() {
        let dir = tempdir().unwrap();
        let state = StateManager::new(dir.path()).load().await.unwrap();
        assert!(state.resources.is_empty());
        assert_eq!(state.version, FORMAT_VERSION);
    }

    #[tokio::test]
    async fn test_unreadable_state_is_rejected() {
        let dir = tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        std::fs::create_dir_all(dir.path().join(".bootflow")).unwrap();

        std::fs::write(manager.state_path(), "{ not json").unwrap();
        assert!(matches!(manager.load().await, Err(CloudError::StateError(_))));

        std::fs::write(
            manager.state_path(),
            r#"{"version": 99, "updated_at": "2026-01-01T00:00:00Z", "resources": {}}"#,
        )
        .unwrap();
        assert!(matches!(manager.load().await, Err(CloudError::StateError(_))));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        let lock_path = dir.path().join(".bootflow/state.lock");

        let lock = manager.acquire_lock().await.unwrap();
        assert!(lock_path.exists());
        assert!(matches!(
            manager.acquire_lock().await,
            Err(CloudError::LockError(_))
        ));

        lock.release().await.unwrap();
        assert!(!lock_path.exists());

        let again = manager.acquire_lock().await.unwrap();
        drop(again);
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        std::fs::create_dir_all(dir.path().join(".bootflow")).unwrap();

        let stale = LockOwner {
            host: "crashed".to_string(),
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        std::fs::write(
            dir.path().join(".bootflow/state.lock"),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        let lock = manager.acquire_lock().await.unwrap();
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_being_written_is_respected() {
        let dir = tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        std::fs::create_dir_all(dir.path().join(".bootflow")).unwrap();
        // another run has created the file but not written its owner yet
        std::fs::write(dir.path().join(".bootflow/state.lock"), "").unwrap();

        assert!(matches!(
            manager.acquire_lock().await,
            Err(CloudError::LockError(_))
        ));
        assert!(dir.path().join(".bootflow/state.lock").exists());
    }

    #[tokio::test]
    async fn test_old_garbage_lock_is_broken() {
        let dir = tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        std::fs::create_dir_all(dir.path().join(".bootflow")).unwrap();
        let lock_path = dir.path().join(".bootflow/state.lock");
        std::fs::write(&lock_path, "garbage").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&lock_path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(2 * 60 * 60))
            .unwrap();

        let lock = manager.acquire_lock().await.unwrap();
        let owner = LockOwner::read(&lock_path).await.unwrap();
        assert_eq!(owner.pid, std::process::id());
        lock.release().await.unwrap();
    }
}
