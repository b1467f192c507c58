//! Helpers to inspect the status conditions of backend workloads
//!
//! Deployments and KubeVirt instances report failures through conditions with
//! the usual `type`/`status`/`reason`/`message` shape. [`ConditionFields`]
//! gives both a common borrowed view.

use crate::crd::VirtualMachineInstanceCondition;
use k8s_openapi::api::apps::v1::DeploymentCondition;

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

// Deployment condition types
pub const DEPLOYMENT_CONDITION_REPLICA_FAILURE: &str = "ReplicaFailure";

// VirtualMachineInstance condition types
pub const VMI_CONDITION_READY: &str = "Ready";
pub const VMI_CONDITION_SYNCHRONIZED: &str = "Synchronized";

/// Reason reported when pods cannot be created
pub const REASON_FAILED_CREATE: &str = "FailedCreate";

/// Marker of the admission error raised by ResourceQuota
pub const QUOTA_EXCEEDED_MESSAGE: &str = "exceeded quota";

/// Borrowed view of a status condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionFields<'a> {
    pub condition_type: &'a str,
    pub status: &'a str,
    pub reason: &'a str,
    pub message: &'a str,
}

impl<'a> From<&'a DeploymentCondition> for ConditionFields<'a> {
    fn from(c: &'a DeploymentCondition) -> Self {
        Self {
            condition_type: &c.type_,
            status: &c.status,
            reason: c.reason.as_deref().unwrap_or_default(),
            message: c.message.as_deref().unwrap_or_default(),
        }
    }
}

impl<'a> From<&'a VirtualMachineInstanceCondition> for ConditionFields<'a> {
    fn from(c: &'a VirtualMachineInstanceCondition) -> Self {
        Self {
            condition_type: &c.type_,
            status: &c.status,
            reason: &c.reason,
            message: &c.message,
        }
    }
}

/// Finds the condition of the given type.
pub fn find_condition<'a, C>(conditions: &'a [C], condition_type: &str) -> Option<ConditionFields<'a>>
where
    &'a C: Into<ConditionFields<'a>>,
{
    conditions
        .iter()
        .map(Into::<ConditionFields<'a>>::into)
        .find(|c| c.condition_type == condition_type)
}

/// Whether the condition of the given type is `True`.
pub fn is_condition_true<'a, C>(conditions: &'a [C], condition_type: &str) -> bool
where
    &'a C: Into<ConditionFields<'a>>,
{
    find_condition(conditions, condition_type).is_some_and(|c| c.status == CONDITION_TRUE)
}

/// Whether a condition reports pod creation rejected by a ResourceQuota.
///
/// `failing_status` is the status the condition carries when it signals a
/// failure: `True` for `ReplicaFailure`, `False` for `Synchronized`.
pub fn quota_exceeded<'a, C>(conditions: &'a [C], condition_type: &str, failing_status: &str) -> bool
where
    &'a C: Into<ConditionFields<'a>>,
{
    find_condition(conditions, condition_type).is_some_and(|c| {
        c.status == failing_status
            && c.reason == REASON_FAILED_CREATE
            && c.message.contains(QUOTA_EXCEEDED_MESSAGE)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment_condition(type_: &str, status: &str, reason: &str, message: &str) -> DeploymentCondition {
        DeploymentCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            ..Default::default()
        }
    }

    fn vmi_condition(type_: &str, status: &str, reason: &str, message: &str) -> VirtualMachineInstanceCondition {
        VirtualMachineInstanceCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn test_find_condition() {
        let conditions = vec![
            deployment_condition("Available", CONDITION_TRUE, "MinimumReplicasAvailable", ""),
            deployment_condition("Progressing", CONDITION_TRUE, "NewReplicaSetAvailable", ""),
        ];
        let found = find_condition(&conditions, "Progressing").unwrap();
        assert_eq!(found.reason, "NewReplicaSetAvailable");
        assert!(find_condition(&conditions, DEPLOYMENT_CONDITION_REPLICA_FAILURE).is_none());
    }

    #[test]
    fn test_deployment_quota_exceeded() {
        let conditions = vec![deployment_condition(
            DEPLOYMENT_CONDITION_REPLICA_FAILURE,
            CONDITION_TRUE,
            REASON_FAILED_CREATE,
            "pods \"x\" is forbidden: exceeded quota: compute, requested: cpu=2",
        )];
        assert!(quota_exceeded(&conditions, DEPLOYMENT_CONDITION_REPLICA_FAILURE, CONDITION_TRUE));

        let other = vec![deployment_condition(
            DEPLOYMENT_CONDITION_REPLICA_FAILURE,
            CONDITION_TRUE,
            REASON_FAILED_CREATE,
            "serviceaccount not found",
        )];
        assert!(!quota_exceeded(&other, DEPLOYMENT_CONDITION_REPLICA_FAILURE, CONDITION_TRUE));
    }

    #[test]
    fn test_vmi_conditions() {
        let conditions = vec![
            vmi_condition(VMI_CONDITION_READY, CONDITION_FALSE, "", ""),
            vmi_condition(
                VMI_CONDITION_SYNCHRONIZED,
                CONDITION_FALSE,
                REASON_FAILED_CREATE,
                "exceeded quota: limits",
            ),
        ];
        assert!(!is_condition_true(&conditions, VMI_CONDITION_READY));
        assert!(quota_exceeded(&conditions, VMI_CONDITION_SYNCHRONIZED, CONDITION_FALSE));
        assert!(!quota_exceeded(&conditions, VMI_CONDITION_SYNCHRONIZED, CONDITION_TRUE));
    }
}
