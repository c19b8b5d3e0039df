//! Plan and run report types

use crate::policy::{Decision, PlannedAttributes};
use crate::resource::{Attributes, ResourceKind};
use crate::state::{ResourceStatus, StackState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A planned action for one resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Logical resource name
    pub resource: String,

    pub kind: ResourceKind,

    pub decision: Decision,

    /// Inputs recorded in the previous state, if any
    pub previous: Option<Attributes>,

    /// Desired inputs (empty for deletions)
    pub desired: PlannedAttributes,
}

impl Action {
    /// Human readable description of the action
    pub fn description(&self) -> String {
        match &self.decision {
            Decision::Create => format!("{} {} will be created", self.kind, self.resource),
            Decision::NoOp => format!("{} {} is up to date", self.kind, self.resource),
            Decision::UpdateInPlace { changed } => format!(
                "{} {} will be updated in place ({})",
                self.kind,
                self.resource,
                changed.join(", ")
            ),
            Decision::Replace { triggers, .. } => format!(
                "{} {} will be replaced ({} changed)",
                self.kind,
                self.resource,
                triggers.join(", ")
            ),
            Decision::Delete => format!("{} {} will be deleted", self.kind, self.resource),
            Decision::DeleteRefused { reason } => {
                format!("{} {} cannot be changed: {}", self.kind, self.resource, reason)
            }
            Decision::Blocked { reason } => {
                format!("{} {} will be left alone: {}", self.kind, self.resource, reason)
            }
        }
    }
}

/// Plan containing the action of every resource, in execution order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub actions: Vec<Action>,

    /// Whether the plan has any changes
    pub has_changes: bool,
}

impl Plan {
    pub fn new(actions: Vec<Action>) -> Self {
        let has_changes = actions.iter().any(|a| a.decision.is_change());
        Self {
            actions,
            has_changes,
        }
    }

    /// Action for a resource
    pub fn action(&self, resource: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.resource == resource)
    }

    /// Decision for a resource
    pub fn decision(&self, resource: &str) -> Option<&Decision> {
        self.action(resource).map(|a| &a.decision)
    }

    /// Whether some requested change is refused by policy
    pub fn has_refusals(&self) -> bool {
        self.actions
            .iter()
            .any(|a| matches!(a.decision, Decision::DeleteRefused { .. }))
    }

    /// Summary of the plan
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for action in &self.actions {
            match action.decision {
                Decision::Create => summary.create += 1,
                Decision::UpdateInPlace { .. } => summary.update += 1,
                Decision::Replace { .. } => summary.replace += 1,
                Decision::Delete => summary.delete += 1,
                Decision::DeleteRefused { .. } => summary.refused += 1,
                Decision::Blocked { .. } => summary.blocked += 1,
                Decision::NoOp => summary.no_change += 1,
            }
        }
        summary
    }
}

/// Summary of planned actions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub refused: usize,
    pub blocked: usize,
    pub no_change: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete, {} refused, {} blocked, {} unchanged",
            self.create,
            self.update,
            self.replace,
            self.delete,
            self.refused,
            self.blocked,
            self.no_change
        )
    }
}

/// Which instance of a logical resource a transition refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instance {
    /// The instance matching the desired inputs
    Current,
    /// The instance being replaced
    Previous,
}

impl std::fmt::Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instance::Current => write!(f, "current"),
            Instance::Previous => write!(f, "previous"),
        }
    }
}

/// One entry of the run's transition journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub resource: String,
    pub instance: Instance,
    pub status: ResourceStatus,
}

/// Final outcome of a resource in a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResourceOutcome {
    Unchanged,
    Created,
    Updated,
    Replaced,
    Deleted,

    /// Refused by lifecycle policy
    Refused { reason: String },

    /// A backend call failed
    Failed {
        error: String,
        previous: Option<Attributes>,
        desired: Option<Attributes>,
    },

    /// Never submitted (failed dependency, retained dependent, cancellation)
    Skipped { reason: String },
}

impl ResourceOutcome {
    /// Whether the resource reached the state the run asked for
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            ResourceOutcome::Unchanged
                | ResourceOutcome::Created
                | ResourceOutcome::Updated
                | ResourceOutcome::Replaced
                | ResourceOutcome::Deleted
        )
    }
}

impl std::fmt::Display for ResourceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceOutcome::Unchanged => write!(f, "unchanged"),
            ResourceOutcome::Created => write!(f, "created"),
            ResourceOutcome::Updated => write!(f, "updated"),
            ResourceOutcome::Replaced => write!(f, "replaced"),
            ResourceOutcome::Deleted => write!(f, "deleted"),
            ResourceOutcome::Refused { reason } => write!(f, "refused: {}", reason),
            ResourceOutcome::Failed { error, .. } => write!(f, "failed: {}", error),
            ResourceOutcome::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

/// Result of an apply or destroy run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Outcome per resource
    pub outcomes: BTreeMap<String, ResourceOutcome>,

    /// Final lifecycle status per resource
    pub statuses: BTreeMap<String, ResourceStatus>,

    /// Every status transition, in the order it happened
    pub transitions: Vec<Transition>,

    /// State to persist after the run
    pub state: StackState,

    /// Whether the run was cancelled before every resource was submitted
    pub cancelled: bool,

    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

impl RunReport {
    /// Whether every resource reached the requested state
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.outcomes.values().all(ResourceOutcome::is_ok)
    }

    pub fn outcome(&self, resource: &str) -> Option<&ResourceOutcome> {
        self.outcomes.get(resource)
    }

    pub fn status(&self, resource: &str) -> Option<ResourceStatus> {
        self.statuses.get(resource).copied()
    }

    /// Resources that did not reach the requested state
    pub fn failures(&self) -> Vec<(&String, &ResourceOutcome)> {
        self.outcomes.iter().filter(|(_, o)| !o.is_ok()).collect()
    }

    /// Journal index of a transition, if it happened
    pub fn position(&self, resource: &str, instance: Instance, status: ResourceStatus) -> Option<usize> {
        self.transitions
            .iter()
            .position(|t| t.resource == resource && t.instance == instance && t.status == status)
    }

    /// Transitions of one resource
    pub fn transitions_of(&self, resource: &str) -> Vec<&Transition> {
        self.transitions
            .iter()
            .filter(|t| t.resource == resource)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ReplaceOrder;

    fn action(resource: &str, decision: Decision) -> Action {
        Action {
            resource: resource.to_string(),
            kind: ResourceKind::Server,
            decision,
            previous: None,
            desired: PlannedAttributes::new(),
        }
    }

    #[test]
    fn test_plan_summary() {
        let plan = Plan::new(vec![
            action("a", Decision::Create),
            action("b", Decision::NoOp),
            action(
                "c",
                Decision::Replace {
                    changed: vec!["image".to_string()],
                    triggers: vec!["image".to_string()],
                    order: ReplaceOrder::CreateBeforeDelete,
                },
            ),
            action(
                "d",
                Decision::DeleteRefused {
                    reason: "protected".to_string(),
                },
            ),
            action(
                "e",
                Decision::Blocked {
                    reason: "dependency d is refused".to_string(),
                },
            ),
        ]);

        assert!(plan.has_changes);
        assert!(plan.has_refusals());
        assert_eq!(
            plan.summary().to_string(),
            "1 to create, 0 to update, 1 to replace, 0 to delete, 1 refused, 1 blocked, 1 unchanged"
        );
        assert_eq!(plan.decision("a"), Some(&Decision::Create));
    }

    #[test]
    fn test_noop_plan_has_no_changes() {
        let plan = Plan::new(vec![action("a", Decision::NoOp)]);
        assert!(!plan.has_changes);

        let blocked = Plan::new(vec![action(
            "a",
            Decision::Blocked {
                reason: "dependency b is refused".to_string(),
            },
        )]);
        assert!(!blocked.has_changes);
    }

    #[test]
    fn test_outcome_classification() {
        assert!(ResourceOutcome::Replaced.is_ok());
        assert!(!ResourceOutcome::Refused { reason: "p".to_string() }.is_ok());
        assert!(!ResourceOutcome::Skipped { reason: "s".to_string() }.is_ok());
    }
}
