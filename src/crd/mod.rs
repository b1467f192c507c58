//! Custom Resource Definitions used by the Instance operator
//!
//! - Instance, Template, Tenant, SharedVolume: the virtual-lab API
//! - KubeVirt and Cluster-API kinds: backend workloads owned by instances

mod capi;
mod instance;
mod kubevirt;
mod template;
mod tenant;

pub use capi::{
    CapiCluster, CapiClusterSpec, KamajiControlPlane, KamajiControlPlaneSpec,
    KubeadmConfigTemplate, KubeadmConfigTemplateSpec, KubevirtCluster, KubevirtClusterSpec,
    KubevirtMachineTemplate, KubevirtMachineTemplateSpec, MachineDeployment,
    MachineDeploymentSpec, ObjectRef,
};
pub use instance::{
    EnvironmentPhase, EnvironmentStatus, GenericRef, Instance, InstancePublicExposure,
    InstanceSpec, InstanceStatus, PublicExposurePhase, PublicExposureStatus, PublicServicePort,
};
pub use kubevirt::{
    TemplateMetadata, VirtualMachine, VirtualMachineInstance, VirtualMachineInstanceCondition,
    VirtualMachineInstanceSpec, VirtualMachineInstanceStatus, VirtualMachineInstanceTemplate,
    VirtualMachineSpec, VirtualMachineStatus,
};
pub use template::{
    ClusterNetwork, ClusterTemplate, ContainerStartupOptions, Environment, EnvironmentMode,
    EnvironmentResources, EnvironmentType, ReplicaSettings, SharedVolumeMountInfo, Template,
    TemplateSpec, TemplateStatus,
};
pub use tenant::{
    workspace_manager_selector, SharedVolume, SharedVolumeSpec, SharedVolumeStatus, Tenant,
    TenantSpec, TenantWorkspaceEntry, WorkspaceRole, WORKSPACE_LABEL_PREFIX,
};
