//! Derivation of the instance phase from the backend workloads

use crate::conditions::{
    is_condition_true, quota_exceeded, CONDITION_FALSE, CONDITION_TRUE,
    DEPLOYMENT_CONDITION_REPLICA_FAILURE, VMI_CONDITION_READY, VMI_CONDITION_SYNCHRONIZED,
};
use crate::crd::{EnvironmentPhase, VirtualMachine, VirtualMachineInstance};
use k8s_openapi::api::apps::v1::Deployment;

/// Phase of a container environment.
pub fn phase_from_deployment(deployment: &Deployment) -> EnvironmentPhase {
    if deployment.metadata.deletion_timestamp.is_some() {
        return EnvironmentPhase::Stopping;
    }

    let replicas = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    if replicas == 0 {
        return EnvironmentPhase::Off;
    }

    let status = deployment.status.clone().unwrap_or_default();
    if status.ready_replicas.unwrap_or(0) == replicas {
        return EnvironmentPhase::Ready;
    }
    let conditions = status.conditions.unwrap_or_default();
    if quota_exceeded(&conditions, DEPLOYMENT_CONDITION_REPLICA_FAILURE, CONDITION_TRUE) {
        return EnvironmentPhase::ResourceQuotaExceeded;
    }
    EnvironmentPhase::Starting
}

/// Phase of a persistent VM, looking at its instance for quota failures.
pub fn phase_from_virtual_machine(
    vm: &VirtualMachine,
    vmi: Option<&VirtualMachineInstance>,
) -> EnvironmentPhase {
    let status = vm.status.clone().unwrap_or_default();
    match status.printable_status.as_str() {
        "Starting" if vmi.is_some_and(vmi_quota_exceeded) => EnvironmentPhase::ResourceQuotaExceeded,
        "Starting" => EnvironmentPhase::Starting,
        "Provisioning" => EnvironmentPhase::Importing,
        "Stopping" | "Terminating" => EnvironmentPhase::Stopping,
        "Stopped" => EnvironmentPhase::Off,
        "Running" if status.ready => EnvironmentPhase::Ready,
        "Running" => EnvironmentPhase::Running,
        _ => EnvironmentPhase::Unset,
    }
}

/// Phase of a standalone VMI.
pub fn phase_from_virtual_machine_instance(vmi: &VirtualMachineInstance) -> EnvironmentPhase {
    if vmi.metadata.deletion_timestamp.is_some() {
        return EnvironmentPhase::Stopping;
    }

    let phase = vmi.status.as_ref().map(|s| s.phase.as_str()).unwrap_or_default();
    match phase {
        "Pending" if vmi_quota_exceeded(vmi) => EnvironmentPhase::ResourceQuotaExceeded,
        "Pending" | "Scheduling" | "Scheduled" => EnvironmentPhase::Starting,
        "Unknown" | "Failed" | "Succeeded" => EnvironmentPhase::Failed,
        "Running" if vmi_ready(vmi) => EnvironmentPhase::Ready,
        "Running" => EnvironmentPhase::Running,
        _ => EnvironmentPhase::Unset,
    }
}

fn vmi_ready(vmi: &VirtualMachineInstance) -> bool {
    vmi.status
        .as_ref()
        .is_some_and(|s| is_condition_true(&s.conditions, VMI_CONDITION_READY))
}

fn vmi_quota_exceeded(vmi: &VirtualMachineInstance) -> bool {
    vmi.status.as_ref().is_some_and(|s| {
        quota_exceeded(&s.conditions, VMI_CONDITION_SYNCHRONIZED, CONDITION_FALSE)
    })
}
