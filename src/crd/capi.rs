//! Cluster-API, KubeVirt provider and Kamaji control plane resources used by
//! `Cluster` environments. Only the fields the operator manages are typed.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Cluster-API Cluster
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    root = "CapiCluster",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CapiClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_network: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_ref: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectRef>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Typed reference between Cluster-API objects
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// KubeVirt infrastructure provider cluster
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "KubevirtCluster",
    namespaced
)]
pub struct KubevirtClusterSpec {
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Kamaji hosted control plane
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "controlplane.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "KamajiControlPlane",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KamajiControlPlaneSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Cluster-API MachineDeployment
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "MachineDeployment",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentSpec {
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub template: Value,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Template of the worker VMs
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "KubevirtMachineTemplate",
    namespaced
)]
pub struct KubevirtMachineTemplateSpec {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub template: Value,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Kubeadm bootstrap configuration of the workers
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "bootstrap.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "KubeadmConfigTemplate",
    namespaced
)]
pub struct KubeadmConfigTemplateSpec {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub template: Value,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}
