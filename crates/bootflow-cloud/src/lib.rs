//! bootflow Cloud Lifecycle Engine
//!
//! This crate provisions a small fleet of cloud resources from a declarative
//! [`ResourceSet`], in dependency order, applying per-resource lifecycle
//! policies (protection, forced replacement, delete-before-replace).
//!
//! Values that only exist after another resource is provisioned, such as a
//! server ID or a volume's device path, are expressed as [`Deferred`] values
//! and wired into the attributes of the resources that need them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  bootflow CLI                    │
//! │              (boot plan/up/destroy)              │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │               bootflow-cloud                     │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  Orchestrator (graph + policy + steps)   │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────┐            │
//! │  │   Deferred   │  │  State Mgmt  │            │
//! │  └──────────────┘  └──────────────┘            │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  trait ProvisioningBackend { ... }        │   │
//! │  └──────────────────────────────────────────┘   │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//!           ┌───────▼───────┐
//!           │    hetzner    │
//!           │    backend    │
//!           └───────────────┘
//! ```

pub mod action;
pub mod deferred;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod policy;
pub mod provider;
pub mod resource;
pub mod state;

// Re-exports
pub use action::{Action, Instance, Plan, PlanSummary, ResourceOutcome, RunReport, Transition};
pub use deferred::{Deferred, OutputTable};
pub use error::{CloudError, Result};
pub use graph::DependencyGraph;
pub use orchestrator::{Cancellation, Orchestrator, RunOptions, previous_instance_key};
pub use policy::{Decision, Planned, PlannedAttributes, ReplaceOrder};
pub use provider::{AuthStatus, ProvisioningBackend};
pub use resource::{
    AttrValue, Attributes, LifecyclePolicy, ResourceKind, ResourceOutputs, ResourceSet,
    ResourceSpec,
};
pub use state::{ResourceRecord, ResourceStatus, StackState, StateLock, StateManager};
