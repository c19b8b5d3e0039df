//! Resource lifecycle policy engine
//!
//! Decides what has to happen to a resource given its previous provisioned
//! inputs, its desired inputs and its [`LifecyclePolicy`].

use crate::error::{CloudError, Result};
use crate::resource::{Attributes, LifecyclePolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A desired attribute value during planning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Planned {
    Known(serde_json::Value),

    /// Only computable after a dependency is (re)created
    Unknown,
}

/// Desired attributes, some of which may still be unknown
pub type PlannedAttributes = BTreeMap<String, Planned>;

/// Lift fully resolved attributes into planned ones
pub fn known(attributes: &Attributes) -> PlannedAttributes {
    attributes
        .iter()
        .map(|(k, v)| (k.clone(), Planned::Known(v.clone())))
        .collect()
}

/// Ordering of the two halves of a replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceOrder {
    /// The old resource reaches `Deleted` before the new one is created
    DeleteBeforeCreate,

    /// The old resource is deleted once the new one is `Provisioned`
    CreateBeforeDelete,
}

/// Outcome of a policy decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    /// No previous state
    Create,

    /// Inputs unchanged
    NoOp,

    /// Changed inputs, none of them a replace trigger
    UpdateInPlace { changed: Vec<String> },

    /// A replace trigger changed
    Replace {
        changed: Vec<String>,
        triggers: Vec<String>,
        order: ReplaceOrder,
    },

    Delete,

    /// Deletion requested (directly or by a replacement) on a protected resource
    DeleteRefused { reason: String },

    /// Left alone because a resource it is tied to will not reach its
    /// desired state
    Blocked { reason: String },
}

impl Decision {
    /// Whether the decision mutates anything
    pub fn is_change(&self) -> bool {
        !matches!(
            self,
            Decision::NoOp | Decision::DeleteRefused { .. } | Decision::Blocked { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Decision::Create => "create",
            Decision::NoOp => "no-op",
            Decision::UpdateInPlace { .. } => "update",
            Decision::Replace { .. } => "replace",
            Decision::Delete => "delete",
            Decision::DeleteRefused { .. } => "delete-refused",
            Decision::Blocked { .. } => "blocked",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Replace { order, .. } => {
                let order = match order {
                    ReplaceOrder::DeleteBeforeCreate => "delete-before-create",
                    ReplaceOrder::CreateBeforeDelete => "create-before-delete",
                };
                write!(f, "replace ({})", order)
            }
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Attributes whose desired value differs from the previous one
///
/// Unknown values always count as changed, and so do attributes that were set
/// before and are no longer desired.
pub fn changed_attributes(previous: &Attributes, desired: &PlannedAttributes) -> Vec<String> {
    let mut changed: Vec<String> = desired
        .iter()
        .filter(|(key, value)| match value {
            Planned::Unknown => true,
            Planned::Known(v) => previous.get(*key) != Some(v),
        })
        .map(|(key, _)| key.clone())
        .collect();

    changed.extend(
        previous
            .keys()
            .filter(|key| !desired.contains_key(*key))
            .cloned(),
    );
    changed.sort();
    changed
}

/// Decide how to bring a resource to its desired inputs
pub fn decide(
    policy: &LifecyclePolicy,
    previous: Option<&Attributes>,
    desired: &PlannedAttributes,
) -> Decision {
    let Some(previous) = previous else {
        return Decision::Create;
    };

    let changed = changed_attributes(previous, desired);
    if changed.is_empty() {
        return Decision::NoOp;
    }

    let triggers: Vec<String> = changed
        .iter()
        .filter(|attr| policy.replace_triggers.contains(*attr))
        .cloned()
        .collect();
    if triggers.is_empty() {
        return Decision::UpdateInPlace { changed };
    }

    if policy.protect {
        return Decision::DeleteRefused {
            reason: format!(
                "protected resource cannot be replaced (triggered by {})",
                triggers.join(", ")
            ),
        };
    }

    let order = if policy.delete_before_replace {
        ReplaceOrder::DeleteBeforeCreate
    } else {
        ReplaceOrder::CreateBeforeDelete
    };

    Decision::Replace {
        changed,
        triggers,
        order,
    }
}

/// Decide on a deletion request
pub fn decide_delete(policy: &LifecyclePolicy) -> Decision {
    if policy.protect {
        Decision::DeleteRefused {
            reason: "protected resource cannot be deleted".to_string(),
        }
    } else {
        Decision::Delete
    }
}

/// Fail with `PolicyViolation` if `resource` may not be deleted
pub fn check_delete(resource: &str, policy: &LifecyclePolicy) -> Result<()> {
    match decide_delete(policy) {
        Decision::DeleteRefused { reason } => Err(CloudError::policy_violation(resource, reason)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, serde_json::Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn server_policy() -> LifecyclePolicy {
        LifecyclePolicy::new().with_replace_triggers(["userData", "image"])
    }

    fn server_attrs(image: &str) -> Attributes {
        attrs(&[
            ("image", json!(image)),
            ("name", json!("supreme-computing")),
            ("userData", json!("#cloud-config")),
        ])
    }

    #[test]
    fn test_create_without_previous() {
        let decision = decide(&server_policy(), None, &known(&server_attrs("docker-ce")));
        assert_eq!(decision, Decision::Create);
    }

    #[test]
    fn test_noop_when_unchanged() {
        let previous = server_attrs("docker-ce");
        let decision = decide(&server_policy(), Some(&previous), &known(&previous));
        assert_eq!(decision, Decision::NoOp);
        assert!(!decision.is_change());
    }

    #[test]
    fn test_update_in_place_for_non_trigger() {
        let previous = server_attrs("docker-ce");
        let mut desired = previous.clone();
        desired.insert("name".to_string(), json!("renamed"));

        let decision = decide(&server_policy(), Some(&previous), &known(&desired));
        assert_eq!(
            decision,
            Decision::UpdateInPlace {
                changed: vec!["name".to_string()]
            }
        );
    }

    #[test]
    fn test_replace_on_trigger() {
        let previous = server_attrs("docker-ce");
        let decision = decide(&server_policy(), Some(&previous), &known(&server_attrs("ubuntu-24.04")));
        assert_eq!(
            decision,
            Decision::Replace {
                changed: vec!["image".to_string()],
                triggers: vec!["image".to_string()],
                order: ReplaceOrder::CreateBeforeDelete,
            }
        );
    }

    #[test]
    fn test_delete_before_replace_order() {
        let policy = LifecyclePolicy::new()
            .with_replace_triggers(["serverId"])
            .with_delete_before_replace();
        let previous = attrs(&[("serverId", json!("1"))]);
        let mut desired = PlannedAttributes::new();
        desired.insert("serverId".to_string(), Planned::Unknown);

        match decide(&policy, Some(&previous), &desired) {
            Decision::Replace { order, triggers, .. } => {
                assert_eq!(order, ReplaceOrder::DeleteBeforeCreate);
                assert_eq!(triggers, vec!["serverId".to_string()]);
            }
            other => panic!("expected replace, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_value_counts_as_changed() {
        let previous = attrs(&[("volumeId", json!("9"))]);
        let mut desired = PlannedAttributes::new();
        desired.insert("volumeId".to_string(), Planned::Unknown);
        assert_eq!(changed_attributes(&previous, &desired), vec!["volumeId".to_string()]);
    }

    #[test]
    fn test_removed_attribute_counts_as_changed() {
        let previous = attrs(&[("labels", json!({"a": "b"})), ("size", json!(10))]);
        let desired = known(&attrs(&[("size", json!(10))]));
        let decision = decide(&LifecyclePolicy::new(), Some(&previous), &desired);
        assert_eq!(
            decision,
            Decision::UpdateInPlace {
                changed: vec!["labels".to_string()]
            }
        );
    }

    #[test]
    fn test_protected_replacement_is_refused() {
        let policy = LifecyclePolicy::new()
            .with_protect()
            .with_replace_triggers(["location"]);
        let previous = attrs(&[("location", json!("fsn1")), ("size", json!(10))]);
        let desired = known(&attrs(&[("location", json!("nbg1")), ("size", json!(10))]));

        let decision = decide(&policy, Some(&previous), &desired);
        assert!(matches!(decision, Decision::DeleteRefused { .. }));
        assert!(!decision.is_change());
    }

    #[test]
    fn test_protected_update_in_place_allowed() {
        let policy = LifecyclePolicy::new()
            .with_protect()
            .with_replace_triggers(["location"]);
        let previous = attrs(&[("location", json!("fsn1")), ("size", json!(10))]);
        let desired = known(&attrs(&[("location", json!("fsn1")), ("size", json!(20))]));

        assert!(matches!(
            decide(&policy, Some(&previous), &desired),
            Decision::UpdateInPlace { .. }
        ));
    }

    #[test]
    fn test_delete_decisions() {
        let open = LifecyclePolicy::new();
        let protected = LifecyclePolicy::new().with_protect();

        assert_eq!(decide_delete(&open), Decision::Delete);
        assert!(matches!(decide_delete(&protected), Decision::DeleteRefused { .. }));
        assert!(check_delete("ssh-key-0", &open).is_ok());

        let err = check_delete("backup-volume", &protected).unwrap_err();
        assert!(matches!(err, CloudError::PolicyViolation { ref resource, .. } if resource == "backup-volume"));
    }

    #[test]
    fn test_decision_display() {
        let decision = Decision::Replace {
            changed: vec![],
            triggers: vec![],
            order: ReplaceOrder::DeleteBeforeCreate,
        };
        assert_eq!(decision.to_string(), "replace (delete-before-create)");
        assert_eq!(Decision::NoOp.to_string(), "no-op");
    }
}
