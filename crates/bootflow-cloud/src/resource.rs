//! Declarative resource specifications

use crate::deferred::Deferred;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Concrete attribute values, keyed by attribute name
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Kind of cloud resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    SshKey,
    Volume,
    Server,
    VolumeAttachment,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::SshKey => write!(f, "ssh-key"),
            ResourceKind::Volume => write!(f, "volume"),
            ResourceKind::Server => write!(f, "server"),
            ResourceKind::VolumeAttachment => write!(f, "volume-attachment"),
        }
    }
}

/// Identifier and output attributes reported by the backend for a
/// provisioned resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceOutputs {
    /// Provider-assigned ID
    pub id: String,

    /// Runtime attributes (device path, IP address, status, ...)
    pub attributes: Attributes,
}

impl ResourceOutputs {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Desired value of an input attribute
#[derive(Debug, Clone)]
pub enum AttrValue {
    /// Known when the specification is written
    Literal(serde_json::Value),

    /// Produced by another resource, known only after it is provisioned
    Deferred(Deferred<serde_json::Value>),
}

impl AttrValue {
    /// Resources this value needs before it can be resolved
    pub fn dependencies(&self) -> BTreeSet<String> {
        match self {
            AttrValue::Literal(_) => BTreeSet::new(),
            AttrValue::Deferred(deferred) => deferred.dependencies().clone(),
        }
    }
}

impl From<serde_json::Value> for AttrValue {
    fn from(value: serde_json::Value) -> Self {
        AttrValue::Literal(value)
    }
}

impl From<Deferred<serde_json::Value>> for AttrValue {
    fn from(value: Deferred<serde_json::Value>) -> Self {
        AttrValue::Deferred(value)
    }
}

/// How a resource may be changed and removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    /// Deletion (including the delete half of a replacement) is refused
    pub protect: bool,

    /// Attributes whose change forces destroy-and-recreate
    pub replace_triggers: BTreeSet<String>,

    /// Delete the old resource before creating its replacement
    pub delete_before_replace: bool,

    /// Explicit dependencies on other resources
    pub depends_on: BTreeSet<String>,
}

impl LifecyclePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protect(mut self) -> Self {
        self.protect = true;
        self
    }

    pub fn with_replace_triggers<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replace_triggers
            .extend(attributes.into_iter().map(Into::into));
        self
    }

    pub fn with_delete_before_replace(mut self) -> Self {
        self.delete_before_replace = true;
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
}

/// Declarative specification of one resource
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    /// Stable logical name
    pub name: String,

    pub kind: ResourceKind,

    /// Desired input attributes
    pub attributes: BTreeMap<String, AttrValue>,

    pub policy: LifecyclePolicy,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            attributes: BTreeMap::new(),
            policy: LifecyclePolicy::default(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes
            .insert(key.into(), AttrValue::Literal(value.into()));
        self
    }

    pub fn with_deferred(mut self, key: impl Into<String>, value: Deferred<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), AttrValue::Deferred(value));
        self
    }

    pub fn with_policy(mut self, policy: LifecyclePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Explicit dependencies plus those implied by deferred attributes
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut deps = self.policy.depends_on.clone();
        for value in self.attributes.values() {
            deps.extend(value.dependencies());
        }
        deps
    }
}

/// Set of resources to be managed, in declaration order
#[derive(Debug, Clone, Default)]
pub struct ResourceSet {
    resources: Vec<ResourceSpec>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, resource: ResourceSpec) {
        self.resources.push(resource);
    }

    pub fn with(mut self, resource: ResourceSpec) -> Self {
        self.add(resource);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ResourceSpec> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.resources.iter()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
