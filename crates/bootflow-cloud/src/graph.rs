//! Resource dependency graph

use crate::error::{CloudError, Result};
use crate::resource::ResourceSet;
use std::collections::{BTreeMap, BTreeSet};

/// Directed acyclic graph of resource dependencies
///
/// Edges point from a resource to the resources it depends on. The
/// topological order is deterministic: among resources that are ready at the
/// same time, the name that sorts first comes first.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    dependencies: BTreeMap<String, BTreeSet<String>>,
    dependents: BTreeMap<String, BTreeSet<String>>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph of a resource set
    ///
    /// Edges come from `depends_on` and from deferred attribute references.
    pub fn build(resources: &ResourceSet) -> Result<Self> {
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for resource in resources.iter() {
            if edges.contains_key(&resource.name) {
                return Err(CloudError::DuplicateResource(resource.name.clone()));
            }
            edges.insert(resource.name.clone(), resource.dependencies());
        }

        for (name, deps) in &edges {
            if let Some(dependency) = deps.iter().find(|dep| !edges.contains_key(*dep)) {
                return Err(CloudError::UnknownDependency {
                    resource: name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        Self::from_edges(edges)
    }

    /// Build a graph from explicit edges
    ///
    /// Dependencies on nodes that are not part of `edges` are ignored.
    pub fn from_edges(mut edges: BTreeMap<String, BTreeSet<String>>) -> Result<Self> {
        let nodes: BTreeSet<String> = edges.keys().cloned().collect();
        for deps in edges.values_mut() {
            deps.retain(|dep| nodes.contains(dep));
        }

        let mut dependents: BTreeMap<String, BTreeSet<String>> =
            nodes.iter().map(|n| (n.clone(), BTreeSet::new())).collect();
        for (name, deps) in &edges {
            for dep in deps {
                if let Some(set) = dependents.get_mut(dep) {
                    set.insert(name.clone());
                }
            }
        }

        // Kahn's algorithm
        let mut remaining: BTreeMap<&str, usize> =
            edges.iter().map(|(n, d)| (n.as_str(), d.len())).collect();
        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(edges.len());

        while let Some(name) = ready.pop_first() {
            remaining.remove(name);
            order.push(name.to_string());
            for dependent in &dependents[name] {
                if let Some(count) = remaining.get_mut(dependent.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent.as_str());
                    }
                }
            }
        }

        if !remaining.is_empty() {
            let cycle: Vec<&str> = remaining.keys().copied().collect();
            return Err(CloudError::CircularDependency(cycle.join(", ")));
        }

        Ok(Self {
            dependencies: edges,
            dependents,
            order,
        })
    }

    /// Resources in dependency order (dependencies first)
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Resources in teardown order (dependents first)
    pub fn reverse_order(&self) -> impl Iterator<Item = &String> {
        self.order.iter().rev()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dependencies.contains_key(name)
    }

    /// Direct dependencies of `name`
    pub fn dependencies(&self, name: &str) -> impl Iterator<Item = &String> {
        self.dependencies.get(name).into_iter().flatten()
    }

    /// Direct dependents of `name`
    pub fn dependents(&self, name: &str) -> impl Iterator<Item = &String> {
        self.dependents.get(name).into_iter().flatten()
    }

    /// Every resource that depends on `name`, directly or not
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut stack: Vec<&String> = self.dependents(name).collect();
        while let Some(next) = stack.pop() {
            if found.insert(next.clone()) {
                stack.extend(self.dependents(next));
            }
        }
        found
    }
}
