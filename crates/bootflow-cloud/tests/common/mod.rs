use async_trait::async_trait;
use bootflow_cloud::{
    Attributes, AuthStatus, Cancellation, CloudError, Deferred, LifecyclePolicy,
    ProvisioningBackend, ResourceKind, ResourceOutputs, ResourceSet, ResourceSpec, Result,
};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// A backend call observed by [`FakeBackend`]
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: &'static str,
    pub kind: ResourceKind,
    /// Logical name for creates, provider ID otherwise
    pub target: String,
}

/// In-memory backend recording every call
#[derive(Default)]
pub struct FakeBackend {
    next_id: AtomicU64,
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<(&'static str, String)>>,
    cancel_on_create: Mutex<Option<(String, Cancellation)>>,
    delay: Option<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `delay` before answering
    #[allow(dead_code)]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Fail `op` ("create", "update", "delete") on a name (create) or ID
    #[allow(dead_code)]
    pub fn fail(&self, op: &'static str, target: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert((op, target.to_string()));
    }

    /// Stop failing `op` on `target`
    #[allow(dead_code)]
    pub fn recover(&self, op: &'static str, target: &str) {
        self.failing
            .lock()
            .unwrap()
            .remove(&(op, target.to_string()));
    }

    /// Cancel the run as soon as `name` is being created
    #[allow(dead_code)]
    pub fn cancel_when_creating(&self, name: &str, cancellation: Cancellation) {
        *self.cancel_on_create.lock().unwrap() = Some((name.to_string(), cancellation));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn calls_of(&self, op: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    #[allow(dead_code)]
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn enter(&self, op: &'static str, kind: ResourceKind, target: &str) -> Result<()> {
        self.calls.lock().unwrap().push(Call {
            op,
            kind,
            target: target.to_string(),
        });

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self
            .failing
            .lock()
            .unwrap()
            .contains(&(op, target.to_string()))
        {
            return Err(CloudError::backend(target, op, "injected failure"));
        }
        Ok(())
    }

    fn outputs(kind: ResourceKind, id: &str) -> Attributes {
        let mut attributes = Attributes::new();
        match kind {
            ResourceKind::Volume => {
                attributes.insert(
                    "linux_device".to_string(),
                    json!(format!("/dev/disk/by-id/scsi-0HC_Volume_{id}")),
                );
            }
            ResourceKind::Server => {
                attributes.insert("ipv4_address".to_string(), json!(format!("203.0.113.{id}")));
                attributes.insert("status".to_string(), json!("running"));
            }
            _ => {}
        }
        attributes
    }
}

#[async_trait]
impl ProvisioningBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn check_auth(&self) -> Result<AuthStatus> {
        Ok(AuthStatus::ok("fake account"))
    }

    async fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        _attributes: &Attributes,
    ) -> Result<ResourceOutputs> {
        if let Some((target, cancellation)) = self.cancel_on_create.lock().unwrap().as_ref()
            && target == name
        {
            cancellation.cancel();
        }

        self.enter("create", kind, name).await?;
        let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 100).to_string();
        Ok(ResourceOutputs {
            attributes: Self::outputs(kind, &id),
            id,
        })
    }

    async fn update(
        &self,
        kind: ResourceKind,
        id: &str,
        _attributes: &Attributes,
    ) -> Result<Attributes> {
        self.enter("update", kind, id).await?;
        Ok(Self::outputs(kind, id))
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<()> {
        self.enter("delete", kind, id).await
    }
}

/// The bootflow fleet: SSH keys, a protected backup volume, a server and the
/// attachment binding the volume to the server
#[allow(dead_code)]
pub fn fleet(image: &str, keys: usize) -> ResourceSet {
    fleet_with(image, keys, "fsn1", 10)
}

pub fn fleet_with(image: &str, keys: usize, location: &str, size: u64) -> ResourceSet {
    let mut set = ResourceSet::new();
    let mut key_ids = Vec::new();

    for i in 0..keys {
        let name = format!("ssh-key-{i}");
        set.add(
            ResourceSpec::new(&name, ResourceKind::SshKey)
                .with_attr("name", format!("demo-key-{i}"))
                .with_attr("publicKey", format!("ssh-ed25519 AAAA{i}"))
                .with_policy(LifecyclePolicy::new().with_replace_triggers(["publicKey"])),
        );
        key_ids.push(Deferred::id(name));
    }

    set.add(
        ResourceSpec::new("backup-volume", ResourceKind::Volume)
            .with_attr("name", "demo-backup")
            .with_attr("size", size)
            .with_attr("location", location)
            .with_policy(
                LifecyclePolicy::new()
                    .with_protect()
                    .with_replace_triggers(["location"]),
            ),
    );

    let user_data = Deferred::output("backup-volume", "linux_device").map(|device| {
        Value::String(format!(
            "#cloud-config\nBACKUP_VOLUME_PATH={}",
            device.as_str().unwrap_or_default()
        ))
    });

    set.add(
        ResourceSpec::new("server", ResourceKind::Server)
            .with_attr("name", "demo")
            .with_attr("image", image)
            .with_attr("location", location)
            .with_deferred("sshKeys", Deferred::join_all(key_ids).map(Value::Array))
            .with_deferred("userData", user_data)
            .with_policy(LifecyclePolicy::new().with_replace_triggers(["userData", "image"])),
    );

    set.add(
        ResourceSpec::new("attachment", ResourceKind::VolumeAttachment)
            .with_deferred("serverId", Deferred::id("server"))
            .with_deferred("volumeId", Deferred::id("backup-volume"))
            .with_attr("automount", true)
            .with_policy(
                LifecyclePolicy::new()
                    .with_replace_triggers(["serverId", "volumeId"])
                    .with_delete_before_replace(),
            ),
    );

    set
}
