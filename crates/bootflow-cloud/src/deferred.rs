//! Deferred values
//!
//! A [`Deferred`] stands for a value that only exists once other resources are
//! provisioned, such as a server ID or a volume's device path. Deferred values
//! can be transformed and combined before they exist; the dependency set of
//! the result is the union of its inputs.
//!
//! Resolution happens against an [`OutputTable`] holding the outputs of
//! provisioned resources. [`Deferred::resolve`] is single assignment: the first
//! computed value is cached and every clone of the handle observes it.

use crate::error::{CloudError, Result};
use crate::resource::ResourceOutputs;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

type Compute<T> = dyn Fn(&OutputTable) -> Result<T> + Send + Sync;

/// Outputs of provisioned resources, indexed by resource name
#[derive(Debug, Clone, Default)]
pub struct OutputTable {
    resources: HashMap<String, ResourceOutputs>,
}

impl OutputTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, resource: impl Into<String>, outputs: ResourceOutputs) {
        self.resources.insert(resource.into(), outputs);
    }

    pub fn remove(&mut self, resource: &str) -> Option<ResourceOutputs> {
        self.resources.remove(resource)
    }

    pub fn get(&self, resource: &str) -> Option<&ResourceOutputs> {
        self.resources.get(resource)
    }

    pub fn is_provisioned(&self, resource: &str) -> bool {
        self.resources.contains_key(resource)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResourceOutputs)> {
        self.resources.iter()
    }
}

struct Inner<T> {
    dependencies: BTreeSet<String>,
    compute: Box<Compute<T>>,
    cell: OnceLock<T>,
}

/// A value produced by resource provisioning
pub struct Deferred<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("dependencies", &self.inner.dependencies)
            .field("resolved", &self.inner.cell.get().is_some())
            .finish()
    }
}

impl<T> Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn from_fn<F>(dependencies: BTreeSet<String>, compute: F) -> Self
    where
        F: Fn(&OutputTable) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                dependencies,
                compute: Box::new(compute),
                cell: OnceLock::new(),
            }),
        }
    }

    /// A value that is already known
    pub fn ready(value: T) -> Self {
        let cached = value.clone();
        let deferred = Self::from_fn(BTreeSet::new(), move |_| Ok(value.clone()));
        let _ = deferred.inner.cell.set(cached);
        deferred
    }

    /// Names of the resources this value waits for
    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.inner.dependencies
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.cell.get().is_some()
    }

    /// The resolved value, or `DependencyUnresolved` if it has not been
    /// resolved yet
    pub fn value(&self) -> Result<T> {
        self.inner
            .cell
            .get()
            .cloned()
            .ok_or_else(|| CloudError::DependencyUnresolved {
                pending: self.inner.dependencies.iter().cloned().collect(),
            })
    }

    fn ensure_provisioned(&self, table: &OutputTable) -> Result<()> {
        let pending: Vec<String> = self
            .inner
            .dependencies
            .iter()
            .filter(|dep| !table.is_provisioned(dep))
            .cloned()
            .collect();
        if pending.is_empty() {
            Ok(())
        } else {
            Err(CloudError::DependencyUnresolved { pending })
        }
    }

    /// Compute the value without caching it
    pub fn evaluate(&self, table: &OutputTable) -> Result<T> {
        if let Some(value) = self.inner.cell.get() {
            return Ok(value.clone());
        }
        self.ensure_provisioned(table)?;
        (self.inner.compute)(table)
    }

    /// Compute the value once and cache it
    ///
    /// Fails with `DependencyUnresolved` unless every dependency is present in
    /// `table`. Concurrent callers all observe the first stored value.
    pub fn resolve(&self, table: &OutputTable) -> Result<T> {
        if let Some(value) = self.inner.cell.get() {
            return Ok(value.clone());
        }
        self.ensure_provisioned(table)?;
        let value = (self.inner.compute)(table)?;
        Ok(self.inner.cell.get_or_init(|| value).clone())
    }

    /// Transform the value once it exists
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let parent = self.clone();
        Deferred::from_fn(self.inner.dependencies.clone(), move |table| {
            parent.evaluate(table).map(&f)
        })
    }

    /// Transform the value with a fallible function
    pub fn try_map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> Result<U> + Send + Sync + 'static,
    {
        let parent = self.clone();
        Deferred::from_fn(self.inner.dependencies.clone(), move |table| {
            parent.evaluate(table).and_then(&f)
        })
    }

    /// Combine with another deferred value
    pub fn combine<U, V, F>(&self, other: &Deferred<U>, f: F) -> Deferred<V>
    where
        U: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: Fn(T, U) -> V + Send + Sync + 'static,
    {
        let left = self.clone();
        let right = other.clone();
        let dependencies = left
            .dependencies()
            .union(right.dependencies())
            .cloned()
            .collect();
        Deferred::from_fn(dependencies, move |table| {
            Ok(f(left.evaluate(table)?, right.evaluate(table)?))
        })
    }

    /// Collect several deferred values into one
    pub fn join_all(items: impl IntoIterator<Item = Deferred<T>>) -> Deferred<Vec<T>> {
        let items: Vec<Deferred<T>> = items.into_iter().collect();
        let dependencies = items
            .iter()
            .flat_map(|item| item.dependencies().iter().cloned())
            .collect();
        Deferred::from_fn(dependencies, move |table| {
            items.iter().map(|item| item.evaluate(table)).collect()
        })
    }
}

impl Deferred<serde_json::Value> {
    /// Provider-assigned ID of `resource`
    pub fn id(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        let name = resource.clone();
        Self::from_fn(BTreeSet::from([resource]), move |table| {
            table
                .get(&name)
                .map(|outputs| serde_json::Value::String(outputs.id.clone()))
                .ok_or_else(|| CloudError::DependencyUnresolved {
                    pending: vec![name.clone()],
                })
        })
    }

    /// Output attribute `attribute` of `resource`
    pub fn output(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        let resource = resource.into();
        let attribute = attribute.into();
        let name = resource.clone();
        Self::from_fn(BTreeSet::from([resource]), move |table| {
            let outputs = table
                .get(&name)
                .ok_or_else(|| CloudError::DependencyUnresolved {
                    pending: vec![name.clone()],
                })?;
            outputs
                .attributes
                .get(&attribute)
                .cloned()
                .ok_or_else(|| CloudError::MissingOutput {
                    resource: name.clone(),
                    attribute: attribute.clone(),
                })
        })
    }
}
