//! Provisioning orchestrator
//!
//! Drives a [`ResourceSet`] to its desired state against a
//! [`ProvisioningBackend`].
//!
//! A run is a cooperative scheduler on the calling task. Every resource whose
//! dependencies are settled is decided by the policy engine and its backend
//! steps are pushed onto a [`FuturesUnordered`]; independent resources are in
//! flight at the same time, bounded by [`RunOptions::max_parallel`]. All
//! bookkeeping (statuses, state, the output table) happens on the scheduler
//! task between completions, so no lock is needed.
//!
//! Deferred values are single assignment. Build a fresh [`ResourceSet`] for
//! every orchestrator; reusing one across runs would replay values resolved by
//! the earlier run.

use crate::action::{Action, Instance, Plan, ResourceOutcome, RunReport, Transition};
use crate::deferred::OutputTable;
use crate::error::{CloudError, Result};
use crate::graph::DependencyGraph;
use crate::policy::{self, Decision, Planned, PlannedAttributes, ReplaceOrder};
use crate::provider::ProvisioningBackend;
use crate::resource::{
    AttrValue, Attributes, LifecyclePolicy, ResourceKind, ResourceOutputs, ResourceSet,
    ResourceSpec,
};
use crate::state::{ResourceRecord, ResourceStatus, StackState};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

const DEFAULT_MAX_PARALLEL: usize = 4;

/// Run-level cancellation flag
///
/// Cancelling stops further submissions. Backend calls already in flight are
/// awaited, and a resource whose first step was submitted finishes its
/// remaining steps.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Options of a single run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of backend calls in flight
    pub max_parallel: usize,

    pub cancellation: Cancellation,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            cancellation: Cancellation::new(),
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// Dependency-ordered lifecycle engine for one stack
pub struct Orchestrator {
    resources: ResourceSet,
    graph: DependencyGraph,
    backend: Arc<dyn ProvisioningBackend>,
    prior: StackState,
    options: RunOptions,
}

impl Orchestrator {
    /// Validate the resource graph and prepare a run against `prior`
    pub fn new(
        resources: ResourceSet,
        backend: Arc<dyn ProvisioningBackend>,
        prior: StackState,
    ) -> Result<Self> {
        let graph = DependencyGraph::build(&resources)?;
        Ok(Self {
            resources,
            graph,
            backend,
            prior,
            options: RunOptions::default(),
        })
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn prior_state(&self) -> &StackState {
        &self.prior
    }

    /// Recorded resources that are no longer declared
    fn orphans(&self) -> BTreeSet<String> {
        self.prior
            .resources
            .keys()
            .filter(|name| self.resources.get(name).is_none())
            .cloned()
            .collect()
    }

    /// Declared resources whose recorded instance depends on `orphan`
    ///
    /// A previous instance kept under `name#id` is referenced by whatever
    /// depended on `name`.
    fn referenced_by(&self, orphan: &str) -> BTreeSet<String> {
        let base = orphan.split_once('#').map_or(orphan, |(base, _)| base);
        self.prior
            .resources
            .iter()
            .filter(|(name, record)| {
                self.resources.get(name).is_some() && record.depends_on.contains(base)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Protection of a recorded resource; the declaration wins over the record
    fn is_protected(&self, name: &str) -> bool {
        match self.resources.get(name) {
            Some(spec) => spec.policy.protect,
            None => self.prior.get_resource(name).is_some_and(|r| r.protect),
        }
    }

    /// Preview the run without touching the backend
    ///
    /// Deferred inputs are evaluated against the prior outputs of resources
    /// that keep their identity. Inputs depending on a resource that will be
    /// (re)created are `Unknown`, which makes replacements cascade.
    ///
    /// Dependents of a refused resource are `Blocked`, as are orphans still
    /// referenced by one; `apply` skips them.
    #[tracing::instrument(skip(self))]
    pub fn plan(&self) -> Result<Plan> {
        let mut table = OutputTable::new();
        let mut actions = Vec::new();
        // resources that will not reach their desired state
        let mut held: BTreeMap<String, &'static str> = BTreeMap::new();

        for name in self.graph.order() {
            let Some(spec) = self.resources.get(name) else {
                continue;
            };
            let record = self.prior.get_resource(name);
            let desired = preview_inputs(spec, &table);
            let blocker = self.graph.dependencies(name).find_map(|dependency| {
                held.get(dependency)
                    .map(|how| format!("dependency {} {}", dependency, how))
            });
            let decision = match blocker {
                Some(reason) => Decision::Blocked { reason },
                None => policy::decide(&spec.policy, record.map(|r| &r.inputs), &desired),
            };

            match decision {
                Decision::DeleteRefused { .. } => {
                    held.insert(name.clone(), "is refused");
                }
                Decision::Blocked { .. } => {
                    held.insert(name.clone(), "is blocked");
                }
                _ => {}
            }
            if let Some(record) = record
                && matches!(
                    decision,
                    Decision::NoOp
                        | Decision::UpdateInPlace { .. }
                        | Decision::DeleteRefused { .. }
                        | Decision::Blocked { .. }
                )
            {
                table.insert(name.clone(), record.to_outputs());
            }

            tracing::debug!("Planned {}: {}", name, decision);
            actions.push(Action {
                resource: name.clone(),
                kind: spec.kind,
                decision,
                previous: record.map(|r| r.inputs.clone()),
                desired,
            });
        }

        let orphans = self.orphans();
        let retained: BTreeMap<String, String> = orphans
            .iter()
            .filter_map(|orphan| {
                self.referenced_by(orphan)
                    .into_iter()
                    .find(|r| held.contains_key(r))
                    .map(|r| (orphan.clone(), format!("still referenced by {}", r)))
            })
            .collect();
        let teardown = record_graph(&self.prior, &orphans)?;
        actions.extend(self.plan_teardown(&teardown, &retained));

        Ok(Plan::new(actions))
    }

    /// Preview a teardown of `targets` (every recorded resource if empty)
    pub fn plan_destroy(&self, targets: &[String]) -> Result<Plan> {
        let graph = self.teardown_graph(targets)?;
        Ok(Plan::new(self.plan_teardown(&graph, &BTreeMap::new())))
    }

    /// `retained` holds records kept alive by declared resources, with the
    /// reason
    fn plan_teardown(
        &self,
        graph: &DependencyGraph,
        retained: &BTreeMap<String, String>,
    ) -> Vec<Action> {
        let mut decisions: BTreeMap<&str, Decision> = BTreeMap::new();
        let mut actions = Vec::new();

        for name in graph.reverse_order() {
            let Some(record) = self.prior.get_resource(name) else {
                continue;
            };
            let policy = if self.is_protected(name) {
                LifecyclePolicy::new().with_protect()
            } else {
                LifecyclePolicy::new()
            };

            let mut decision = policy::decide_delete(&policy);
            if decision == Decision::Delete {
                let retained_dependent = graph
                    .dependents(name)
                    .find(|d| decisions.get(d.as_str()) != Some(&Decision::Delete))
                    .map(|d| format!("dependent {} is retained", d));
                if let Some(reason) = retained_dependent.or_else(|| retained.get(name).cloned()) {
                    decision = Decision::Blocked { reason };
                }
            }

            decisions.insert(name.as_str(), decision.clone());
            actions.push(Action {
                resource: name.clone(),
                kind: record.kind,
                decision,
                previous: Some(record.inputs.clone()),
                desired: PlannedAttributes::new(),
            });
        }
        actions
    }

    /// Selected records plus everything depending on them
    fn teardown_graph(&self, targets: &[String]) -> Result<DependencyGraph> {
        let all: BTreeSet<String> = self.prior.resources.keys().cloned().collect();
        if targets.is_empty() {
            return record_graph(&self.prior, &all);
        }

        let full = record_graph(&self.prior, &all)?;
        let mut selected = BTreeSet::new();
        for target in targets {
            if !full.contains(target) {
                return Err(CloudError::ResourceNotFound(target.clone()));
            }
            selected.insert(target.clone());
            selected.extend(full.transitive_dependents(target));
        }
        record_graph(&self.prior, &selected)
    }

    /// Bring every declared resource to its desired state, then tear down
    /// recorded resources that are no longer declared
    ///
    /// Backend failures are reported per resource in the [`RunReport`]. The
    /// run itself only fails when scheduling reads a deferred value whose
    /// dependencies are not provisioned.
    #[tracing::instrument(skip_all)]
    pub async fn apply(self) -> Result<RunReport> {
        let orphans = self.orphans();
        let teardown = record_graph(&self.prior, &orphans)?;

        tracing::info!(
            "Applying {} resources ({} orphaned) with {}",
            self.resources.len(),
            orphans.len(),
            self.backend.name()
        );
        Run::forward(self, teardown).drive().await
    }

    /// Delete `targets` (every recorded resource if empty) and everything
    /// depending on them, dependents first
    #[tracing::instrument(skip(self))]
    pub async fn destroy(self, targets: &[String]) -> Result<RunReport> {
        let teardown = self.teardown_graph(targets)?;
        tracing::info!("Destroying {} resources", teardown.order().len());
        Run::teardown_only(self, teardown).drive().await
    }

    /// Delete a single recorded resource (and its dependents)
    ///
    /// Fails with `PolicyViolation` before touching anything when the
    /// resource is protected.
    pub async fn delete(self, name: &str) -> Result<RunReport> {
        if self.prior.get_resource(name).is_none() {
            return Err(CloudError::ResourceNotFound(name.to_string()));
        }
        let policy = match self.resources.get(name) {
            Some(spec) => spec.policy.clone(),
            None if self.is_protected(name) => LifecyclePolicy::new().with_protect(),
            None => LifecyclePolicy::new(),
        };
        policy::check_delete(name, &policy)?;
        self.destroy(&[name.to_string()]).await
    }
}

/// Dependency graph of recorded resources, restricted to `names`
fn record_graph(state: &StackState, names: &BTreeSet<String>) -> Result<DependencyGraph> {
    let edges = names
        .iter()
        .filter_map(|name| {
            state
                .get_resource(name)
                .map(|record| (name.clone(), record.depends_on.clone()))
        })
        .collect();
    DependencyGraph::from_edges(edges)
}

/// State key of a previous instance that could not be deleted
pub fn previous_instance_key(resource: &str, id: &str) -> String {
    format!("{}#{}", resource, id)
}

/// Name the logical resource in a backend error reported against an ID
fn for_resource(resource: &str, err: CloudError) -> CloudError {
    match err {
        CloudError::Backend {
            resource: target,
            operation,
            message,
        } if target != resource => CloudError::Backend {
            resource: resource.to_string(),
            operation,
            message: format!("{} ({})", message, target),
        },
        other => other,
    }
}

fn preview_inputs(spec: &ResourceSpec, table: &OutputTable) -> PlannedAttributes {
    spec.attributes
        .iter()
        .map(|(key, value)| {
            let planned = match value {
                AttrValue::Literal(v) => Planned::Known(v.clone()),
                AttrValue::Deferred(deferred) => deferred
                    .evaluate(table)
                    .map(Planned::Known)
                    .unwrap_or(Planned::Unknown),
            };
            (key.clone(), planned)
        })
        .collect()
}

fn resolve_inputs(spec: &ResourceSpec, table: &OutputTable) -> Result<Attributes> {
    let mut inputs = Attributes::new();
    for (key, value) in &spec.attributes {
        let resolved = match value {
            AttrValue::Literal(v) => v.clone(),
            AttrValue::Deferred(deferred) => deferred.resolve(table)?,
        };
        inputs.insert(key.clone(), resolved);
    }
    Ok(inputs)
}

fn journal(
    transitions: &mut Vec<Transition>,
    resource: &str,
    instance: Instance,
    status: ResourceStatus,
) {
    tracing::debug!("{} ({}) -> {}", resource, instance, status);
    transitions.push(Transition {
        resource: resource.to_string(),
        instance,
        status,
    });
}

/// One backend call
#[derive(Debug, Clone)]
enum Step {
    Create,
    Update { id: String },
    /// Delete the instance being replaced
    DeletePrevious { id: String },
    /// Teardown of a recorded resource
    Delete { id: String },
}

impl Step {
    fn instance(&self) -> Instance {
        match self {
            Step::DeletePrevious { .. } => Instance::Previous,
            _ => Instance::Current,
        }
    }

    fn status(&self) -> ResourceStatus {
        match self {
            Step::Create => ResourceStatus::Creating,
            Step::Update { .. } => ResourceStatus::Updating,
            Step::DeletePrevious { .. } | Step::Delete { .. } => ResourceStatus::Deleting,
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            Step::Create => "create",
            Step::Update { .. } => "update",
            Step::DeletePrevious { .. } | Step::Delete { .. } => "delete",
        }
    }
}

enum StepOutput {
    Created(ResourceOutputs),
    Updated(Attributes),
    Deleted,
}

struct StepDone {
    resource: String,
    step: Step,
    result: Result<StepOutput>,
}

/// Scheduling state of a declared resource
struct Slot {
    kind: ResourceKind,
    status: ResourceStatus,
    previous: Option<ResourceRecord>,
    depends_on: BTreeSet<String>,
    protect: bool,
    decision: Option<Decision>,
    inputs: Option<Attributes>,
    steps: VecDeque<Step>,
    in_flight: bool,
    outcome: Option<ResourceOutcome>,
}

impl Slot {
    fn new(spec: &ResourceSpec, previous: Option<ResourceRecord>) -> Self {
        let status = if previous.is_some() {
            ResourceStatus::Provisioned
        } else {
            ResourceStatus::Planned
        };
        Self {
            kind: spec.kind,
            status,
            previous,
            depends_on: spec.dependencies(),
            protect: spec.policy.protect,
            decision: None,
            inputs: None,
            steps: VecDeque::new(),
            in_flight: false,
            outcome: None,
        }
    }

    /// Journal a transition; the previous instance going away does not change
    /// the status of an already provisioned replacement
    fn enter(
        &mut self,
        transitions: &mut Vec<Transition>,
        resource: &str,
        instance: Instance,
        status: ResourceStatus,
    ) {
        journal(transitions, resource, instance, status);
        if !(instance == Instance::Previous && self.status == ResourceStatus::Provisioned) {
            self.status = status;
        }
    }

    fn fail(
        &mut self,
        transitions: &mut Vec<Transition>,
        resource: &str,
        instance: Instance,
        error: &CloudError,
    ) {
        journal(transitions, resource, instance, ResourceStatus::Failed);
        self.status = ResourceStatus::Failed;
        self.steps.clear();
        self.outcome = Some(ResourceOutcome::Failed {
            error: error.to_string(),
            previous: self.previous.as_ref().map(|r| r.inputs.clone()),
            desired: self.inputs.clone(),
        });
    }
}

/// Scheduling state of a recorded resource being torn down
struct TeardownSlot {
    kind: ResourceKind,
    id: String,
    inputs: Attributes,
    protect: bool,
    status: ResourceStatus,
    /// Dependents that are part of the same teardown
    dependents: BTreeSet<String>,
    /// Declared resources whose previous instance used this one
    referenced_by: BTreeSet<String>,
    in_flight: bool,
    outcome: Option<ResourceOutcome>,
}

enum Gate {
    Ready,
    Wait,
    Blocked(String),
}

struct Run {
    backend: Arc<dyn ProvisioningBackend>,
    options: RunOptions,
    resources: ResourceSet,
    order: Vec<String>,
    slots: BTreeMap<String, Slot>,
    teardown_order: Vec<String>,
    teardown: BTreeMap<String, TeardownSlot>,
    table: OutputTable,
    state: StackState,
    transitions: Vec<Transition>,
    in_flight: FuturesUnordered<BoxFuture<'static, StepDone>>,
    halted: Option<CloudError>,
    cancelled: bool,
}

impl Run {
    fn forward(orchestrator: Orchestrator, teardown: DependencyGraph) -> Self {
        let references: BTreeMap<String, BTreeSet<String>> = teardown
            .order()
            .iter()
            .map(|orphan| (orphan.clone(), orchestrator.referenced_by(orphan)))
            .collect();

        let mut slots = BTreeMap::new();
        for name in orchestrator.graph.order() {
            if let Some(spec) = orchestrator.resources.get(name) {
                let previous = orchestrator.prior.get_resource(name).cloned();
                slots.insert(name.clone(), Slot::new(spec, previous));
            }
        }

        let order = orchestrator.graph.order().to_vec();
        let mut run = Self::teardown_only(orchestrator, teardown);
        run.order = order;
        run.slots = slots;

        for (orphan, referenced_by) in references {
            if let Some(slot) = run.teardown.get_mut(&orphan) {
                slot.referenced_by = referenced_by;
            }
        }
        run
    }

    fn teardown_only(orchestrator: Orchestrator, teardown: DependencyGraph) -> Self {
        let mut slots = BTreeMap::new();
        for name in teardown.order() {
            let Some(record) = orchestrator.prior.get_resource(name) else {
                continue;
            };
            slots.insert(
                name.clone(),
                TeardownSlot {
                    kind: record.kind,
                    id: record.id.clone(),
                    inputs: record.inputs.clone(),
                    protect: orchestrator.is_protected(name),
                    status: record.status,
                    dependents: teardown.dependents(name).cloned().collect(),
                    referenced_by: BTreeSet::new(),
                    in_flight: false,
                    outcome: None,
                },
            );
        }

        Self {
            backend: orchestrator.backend,
            options: orchestrator.options,
            resources: orchestrator.resources,
            order: Vec::new(),
            slots: BTreeMap::new(),
            teardown_order: teardown.reverse_order().cloned().collect(),
            teardown: slots,
            table: OutputTable::new(),
            state: orchestrator.prior,
            transitions: Vec::new(),
            in_flight: FuturesUnordered::new(),
            halted: None,
            cancelled: false,
        }
    }

    async fn drive(mut self) -> Result<RunReport> {
        let started = Instant::now();

        loop {
            while self.schedule() {}
            match self.in_flight.next().await {
                Some(done) => self.complete(done),
                None => break,
            }
        }

        match self.halted.take() {
            Some(err) => Err(CloudError::Halted {
                source: Box::new(err),
                report: Box::new(self.finish(started)),
            }),
            None => Ok(self.finish(started)),
        }
    }

    fn has_capacity(&self) -> bool {
        self.in_flight.len() < self.options.max_parallel.max(1)
    }

    /// One scheduling pass; returns whether anything changed
    fn schedule(&mut self) -> bool {
        if self.halted.is_some() {
            return false;
        }

        let cancelled = self.options.cancellation.is_cancelled();
        if cancelled && !self.cancelled {
            tracing::warn!("Run cancelled, waiting for in-flight steps");
            self.cancelled = true;
        }

        let mut progress = self.schedule_forward(cancelled);
        if !cancelled && self.slots.values().all(|slot| slot.outcome.is_some()) {
            progress |= self.schedule_teardown();
        }
        progress
    }

    fn schedule_forward(&mut self, cancelled: bool) -> bool {
        let mut progress = false;

        for name in self.order.clone() {
            if self.halted.is_some() {
                break;
            }
            let Some(slot) = self.slots.get(&name) else {
                continue;
            };
            if slot.outcome.is_some() || slot.in_flight {
                continue;
            }

            // a started resource finishes its steps even after cancellation
            if slot.decision.is_some() {
                if self.has_capacity() {
                    progress |= self.submit_next(&name);
                }
                continue;
            }
            if cancelled {
                continue;
            }

            match self.gate(&name) {
                Gate::Wait => {}
                Gate::Blocked(reason) => {
                    tracing::warn!("Skipping {}: {}", name, reason);
                    if let Some(slot) = self.slots.get_mut(&name) {
                        slot.outcome = Some(ResourceOutcome::Skipped { reason });
                    }
                    progress = true;
                }
                Gate::Ready => {
                    self.start(&name);
                    progress = true;
                }
            }
        }
        progress
    }

    fn gate(&self, name: &str) -> Gate {
        let Some(slot) = self.slots.get(name) else {
            return Gate::Wait;
        };

        let mut waiting = false;
        for dependency in &slot.depends_on {
            match self.slots.get(dependency).and_then(|s| s.outcome.as_ref()) {
                None => waiting = true,
                Some(outcome) if !outcome.is_ok() => {
                    return Gate::Blocked(format!("dependency {} {}", dependency, outcome));
                }
                Some(_) => {}
            }
        }

        if waiting { Gate::Wait } else { Gate::Ready }
    }

    /// Decide a resource whose dependencies are settled
    fn start(&mut self, name: &str) {
        let Some(spec) = self.resources.get(name) else {
            return;
        };
        let resolved = resolve_inputs(spec, &self.table);
        let policy = spec.policy.clone();

        let Some(slot) = self.slots.get_mut(name) else {
            return;
        };

        let inputs = match resolved {
            Ok(inputs) => inputs,
            Err(err) => {
                tracing::error!("Cannot resolve inputs of {}: {}", name, err);
                slot.fail(&mut self.transitions, name, Instance::Current, &err);
                if matches!(err, CloudError::DependencyUnresolved { .. }) {
                    self.halted = Some(err);
                }
                return;
            }
        };

        let decision = policy::decide(
            &policy,
            slot.previous.as_ref().map(|r| &r.inputs),
            &policy::known(&inputs),
        );
        tracing::info!("{}: {}", name, decision);

        let previous_id = slot
            .previous
            .as_ref()
            .map(|r| r.id.clone())
            .unwrap_or_default();
        slot.inputs = Some(inputs);
        slot.decision = Some(decision.clone());

        match decision {
            // decide() never yields Delete for a declared resource
            Decision::NoOp | Decision::Delete => {
                if let Some(previous) = &slot.previous {
                    self.table.insert(name.to_string(), previous.to_outputs());
                }
                if let Some(record) = self.state.resources.get_mut(name) {
                    record.depends_on = slot.depends_on.clone();
                    record.protect = slot.protect;
                }
                slot.outcome = Some(ResourceOutcome::Unchanged);
            }
            Decision::Create => slot.steps.push_back(Step::Create),
            Decision::UpdateInPlace { .. } => {
                slot.steps.push_back(Step::Update { id: previous_id })
            }
            Decision::Replace { order, .. } => {
                slot.enter(
                    &mut self.transitions,
                    name,
                    Instance::Current,
                    ResourceStatus::Replacing,
                );
                let delete = Step::DeletePrevious { id: previous_id };
                match order {
                    ReplaceOrder::DeleteBeforeCreate => {
                        slot.steps.extend([delete, Step::Create]);
                    }
                    ReplaceOrder::CreateBeforeDelete => {
                        slot.steps.extend([Step::Create, delete]);
                    }
                }
            }
            Decision::DeleteRefused { reason } => {
                tracing::warn!("Refusing to change {}: {}", name, reason);
                slot.outcome = Some(ResourceOutcome::Refused { reason });
            }
            // decide() only blocks during planning
            Decision::Blocked { reason } => {
                slot.outcome = Some(ResourceOutcome::Skipped { reason });
            }
        }
    }

    fn submit_next(&mut self, name: &str) -> bool {
        let Some(slot) = self.slots.get_mut(name) else {
            return false;
        };
        let Some(step) = slot.steps.pop_front() else {
            return false;
        };

        slot.enter(&mut self.transitions, name, step.instance(), step.status());
        slot.in_flight = true;
        let kind = slot.kind;
        let inputs = slot.inputs.clone().unwrap_or_default();
        self.submit(name, kind, step, inputs);
        true
    }

    fn submit(&mut self, resource: &str, kind: ResourceKind, step: Step, inputs: Attributes) {
        let backend = Arc::clone(&self.backend);
        let resource = resource.to_string();

        self.in_flight.push(
            async move {
                let result = match &step {
                    Step::Create => backend
                        .create(kind, &resource, &inputs)
                        .await
                        .map(StepOutput::Created),
                    Step::Update { id } => backend
                        .update(kind, id, &inputs)
                        .await
                        .map(StepOutput::Updated),
                    Step::DeletePrevious { id } | Step::Delete { id } => backend
                        .delete(kind, id)
                        .await
                        .map(|()| StepOutput::Deleted),
                };
                StepDone {
                    resource,
                    step,
                    result,
                }
            }
            .boxed(),
        );
    }

    fn complete(&mut self, done: StepDone) {
        let StepDone {
            resource,
            step,
            result,
        } = done;

        if matches!(step, Step::Delete { .. }) {
            self.complete_teardown(&resource, result);
            return;
        }

        let Some(slot) = self.slots.get_mut(&resource) else {
            return;
        };
        slot.in_flight = false;

        match result {
            Ok(StepOutput::Created(outputs)) => {
                slot.enter(
                    &mut self.transitions,
                    &resource,
                    Instance::Current,
                    ResourceStatus::Provisioned,
                );
                let record = ResourceRecord::new(outputs.id.clone(), slot.kind)
                    .with_inputs(slot.inputs.clone().unwrap_or_default())
                    .with_outputs(outputs.attributes.clone())
                    .with_depends_on(slot.depends_on.iter().cloned())
                    .with_protect(slot.protect);
                tracing::info!("Provisioned {} ({})", resource, outputs.id);
                self.state.set_resource(resource.clone(), record);
                self.table.insert(resource.clone(), outputs);
            }
            Ok(StepOutput::Updated(attributes)) => {
                slot.enter(
                    &mut self.transitions,
                    &resource,
                    Instance::Current,
                    ResourceStatus::Provisioned,
                );
                if let Some(previous) = &slot.previous {
                    let mut record = previous
                        .clone()
                        .with_status(ResourceStatus::Provisioned)
                        .with_inputs(slot.inputs.clone().unwrap_or_default())
                        .with_outputs(attributes);
                    record.depends_on = slot.depends_on.clone();
                    record.protect = slot.protect;
                    record.touch();
                    self.table.insert(resource.clone(), record.to_outputs());
                    self.state.set_resource(resource.clone(), record);
                }
            }
            Ok(StepOutput::Deleted) => {
                slot.enter(
                    &mut self.transitions,
                    &resource,
                    Instance::Previous,
                    ResourceStatus::Deleted,
                );
                // delete-before-create: the record is gone until the new
                // instance is provisioned
                if slot.status != ResourceStatus::Provisioned {
                    self.state.remove_resource(&resource);
                    self.table.remove(&resource);
                }
            }
            Err(err) => {
                let err = for_resource(&resource, err);
                tracing::error!(
                    "{} failed during {}: {}",
                    resource,
                    step.operation(),
                    err
                );
                let replacement_live = matches!(step, Step::DeletePrevious { .. })
                    && slot.status == ResourceStatus::Provisioned;
                if replacement_live {
                    // keep the old instance recorded so a later run tears it down
                    if let (Step::DeletePrevious { id }, Some(previous)) = (&step, &slot.previous) {
                        let key = previous_instance_key(&resource, id);
                        tracing::warn!(
                            "Previous instance {} of {} was not deleted, recorded as {}",
                            id,
                            resource,
                            key
                        );
                        let mut record = previous.clone().with_status(ResourceStatus::Failed);
                        record.touch();
                        self.state.set_resource(key, record);
                    }
                } else if !matches!(step, Step::Create)
                    && let Some(record) = self.state.resources.get_mut(&resource)
                {
                    record.status = ResourceStatus::Failed;
                    record.touch();
                }
                slot.fail(&mut self.transitions, &resource, step.instance(), &err);
                return;
            }
        }

        if slot.steps.is_empty() {
            let outcome = match slot.decision {
                Some(Decision::Create) => ResourceOutcome::Created,
                Some(Decision::UpdateInPlace { .. }) => ResourceOutcome::Updated,
                Some(Decision::Replace { .. }) => ResourceOutcome::Replaced,
                _ => ResourceOutcome::Unchanged,
            };
            tracing::info!("{} {}", resource, outcome);
            slot.outcome = Some(outcome);
        }
    }

    fn schedule_teardown(&mut self) -> bool {
        let mut progress = false;

        for name in self.teardown_order.clone() {
            let Some(slot) = self.teardown.get(&name) else {
                continue;
            };
            if slot.outcome.is_some() || slot.in_flight {
                continue;
            }

            if slot.protect {
                let reason = "protected resource cannot be deleted".to_string();
                tracing::warn!("Retaining {}: {}", name, reason);
                if let Some(slot) = self.teardown.get_mut(&name) {
                    slot.outcome = Some(ResourceOutcome::Refused { reason });
                }
                progress = true;
                continue;
            }

            let mut waiting = false;
            let mut blocked = None;
            for dependent in &slot.dependents {
                match self.teardown.get(dependent).and_then(|d| d.outcome.as_ref()) {
                    None => waiting = true,
                    Some(ResourceOutcome::Deleted) => {}
                    Some(_) => {
                        blocked.get_or_insert_with(|| {
                            format!("dependent {} was not deleted", dependent)
                        });
                    }
                }
            }
            if blocked.is_none() {
                blocked = slot
                    .referenced_by
                    .iter()
                    .find(|r| {
                        !self
                            .slots
                            .get(*r)
                            .and_then(|s| s.outcome.as_ref())
                            .is_some_and(ResourceOutcome::is_ok)
                    })
                    .map(|r| format!("still referenced by {}", r));
            }

            if let Some(reason) = blocked {
                tracing::warn!("Retaining {}: {}", name, reason);
                if let Some(slot) = self.teardown.get_mut(&name) {
                    slot.outcome = Some(ResourceOutcome::Skipped { reason });
                }
                progress = true;
                continue;
            }
            if waiting || !self.has_capacity() {
                continue;
            }

            let Some(slot) = self.teardown.get_mut(&name) else {
                continue;
            };
            journal(
                &mut self.transitions,
                &name,
                Instance::Current,
                ResourceStatus::Deleting,
            );
            slot.status = ResourceStatus::Deleting;
            slot.in_flight = true;
            let kind = slot.kind;
            let step = Step::Delete {
                id: slot.id.clone(),
            };
            self.submit(&name, kind, step, Attributes::new());
            progress = true;
        }
        progress
    }

    fn complete_teardown(&mut self, resource: &str, result: Result<StepOutput>) {
        let Some(slot) = self.teardown.get_mut(resource) else {
            return;
        };
        slot.in_flight = false;

        match result {
            Ok(_) => {
                journal(
                    &mut self.transitions,
                    resource,
                    Instance::Current,
                    ResourceStatus::Deleted,
                );
                tracing::info!("Deleted {} ({})", resource, slot.id);
                slot.status = ResourceStatus::Deleted;
                slot.outcome = Some(ResourceOutcome::Deleted);
                self.state.remove_resource(resource);
                self.table.remove(resource);
            }
            Err(err) => {
                let err = for_resource(resource, err);
                tracing::error!("{} failed during delete: {}", resource, err);
                journal(
                    &mut self.transitions,
                    resource,
                    Instance::Current,
                    ResourceStatus::Failed,
                );
                slot.status = ResourceStatus::Failed;
                slot.outcome = Some(ResourceOutcome::Failed {
                    error: err.to_string(),
                    previous: Some(slot.inputs.clone()),
                    desired: None,
                });
                if let Some(record) = self.state.resources.get_mut(resource) {
                    record.status = ResourceStatus::Failed;
                    record.touch();
                }
            }
        }
    }

    fn finish(self, started: Instant) -> RunReport {
        let reason = if self.cancelled {
            "run cancelled"
        } else {
            "not reached"
        };
        let unsettled = || ResourceOutcome::Skipped {
            reason: reason.to_string(),
        };

        let mut outcomes = BTreeMap::new();
        let mut statuses = BTreeMap::new();
        for (name, slot) in self.slots {
            outcomes.insert(name.clone(), slot.outcome.unwrap_or_else(unsettled));
            statuses.insert(name, slot.status);
        }
        for (name, slot) in self.teardown {
            outcomes.insert(name.clone(), slot.outcome.unwrap_or_else(unsettled));
            statuses.insert(name, slot.status);
        }

        let report = RunReport {
            outcomes,
            statuses,
            transitions: self.transitions,
            state: self.state,
            cancelled: self.cancelled,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            "Run finished in {}ms ({} not completed)",
            report.duration_ms,
            report.failures().len()
        );
        report
    }
}
