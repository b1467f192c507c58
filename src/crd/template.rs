//! Template Custom Resource Definition
//!
//! A Template lists the environments an Instance is made of.

use super::GenericRef;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Template is the Schema for the templates API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "crownlabs.polito.it",
    version = "v1alpha2",
    kind = "Template",
    namespaced,
    status = "TemplateStatus",
    shortname = "tmpl",
    printcolumn = r#"{"name":"Pretty Name","type":"string","jsonPath":".spec.prettyName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    /// Human-friendly name of the template
    #[serde(default)]
    pub pretty_name: String,

    /// Free-form description
    #[serde(default)]
    pub description: String,

    /// Workspace the template belongs to
    #[serde(rename = "workspace.crownlabs.polito.it/WorkspaceRef", default)]
    pub workspace_ref: GenericRef,

    /// Environments composing an instance of this template
    #[serde(default)]
    pub environment_list: Vec<Environment>,

    /// Whether instances may request a public exposure
    #[serde(default)]
    pub allow_public_exposure: bool,
}

/// Status of the template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateStatus {
    /// Where the kubeconfig of a cluster environment can be retrieved
    #[serde(default)]
    pub kubeconfig_location: String,
}

/// A single workload shape declared by a template
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub name: String,

    /// Container image, VM disk image or (CloudVM) image URL
    #[serde(default)]
    pub image: String,

    pub environment_type: EnvironmentType,

    #[serde(default = "default_true")]
    pub gui_enabled: bool,

    #[serde(default)]
    pub persistent: bool,

    #[serde(default)]
    pub mode: EnvironmentMode,

    #[serde(default)]
    pub mount_my_drive_volume: bool,

    #[serde(default)]
    pub resources: EnvironmentResources,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_startup_options: Option<ContainerStartupOptions>,

    /// Storage class of the persistent volume, cluster default when empty
    #[serde(default)]
    pub storage_class_name: String,

    #[serde(default)]
    pub shared_volume_mounts: Vec<SharedVolumeMountInfo>,

    /// Cluster-API settings, only for the `Cluster` environment type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterTemplate>,
}

impl Environment {
    pub fn is_vm_like(&self) -> bool {
        matches!(
            self.environment_type,
            EnvironmentType::VirtualMachine | EnvironmentType::CloudVm
        )
    }

    pub fn is_container_like(&self) -> bool {
        matches!(
            self.environment_type,
            EnvironmentType::Container | EnvironmentType::Standalone
        )
    }
}

/// Kind of workload backing an environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum EnvironmentType {
    #[default]
    VirtualMachine,
    Container,
    #[serde(rename = "CloudVM")]
    CloudVm,
    Standalone,
    Cluster,
}

impl fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvironmentType::VirtualMachine => "VirtualMachine",
            EnvironmentType::Container => "Container",
            EnvironmentType::CloudVm => "CloudVM",
            EnvironmentType::Standalone => "Standalone",
            EnvironmentType::Cluster => "Cluster",
        };
        f.write_str(s)
    }
}

/// Usage scope of an environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum EnvironmentMode {
    #[default]
    Standard,
    Exam,
    Exercise,
}

impl EnvironmentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentMode::Standard => "standard",
            EnvironmentMode::Exam => "exam",
            EnvironmentMode::Exercise => "exercise",
        }
    }
}

/// Compute and storage resources of an environment
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentResources {
    /// Number of CPU cores
    #[serde(default = "default_cpu")]
    pub cpu: u32,

    /// Share of the cores reserved as request, in percent
    #[serde(rename = "reservedCPUPercentage", default = "default_reserved_cpu")]
    pub reserved_cpu_percentage: u32,

    /// Memory quantity (e.g. "2Gi")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// Disk quantity, required for persistent environments
    #[serde(default)]
    pub disk: Option<String>,
}

impl Default for EnvironmentResources {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            reserved_cpu_percentage: default_reserved_cpu(),
            memory: default_memory(),
            disk: None,
        }
    }
}

/// Extra options of container environments
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStartupOptions {
    /// Archive downloaded into the content path before start
    #[serde(rename = "sourceArchiveURL", default)]
    pub source_archive_url: String,
    #[serde(default)]
    pub content_path: String,
    #[serde(default)]
    pub startup_args: Vec<String>,
}

/// Mount of a SharedVolume inside an environment
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SharedVolumeMountInfo {
    #[serde(rename = "sharedVolume")]
    pub shared_volume_ref: GenericRef,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Cluster-API parameters of a `Cluster` environment
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTemplate {
    pub name: String,
    /// Kubernetes version of the control plane
    pub version: String,
    /// Service type of the control plane endpoint
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_net: Option<ClusterNetwork>,
    #[serde(default)]
    pub control_plane: ReplicaSettings,
    #[serde(default)]
    pub machine_deployment: ReplicaSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetwork {
    #[serde(rename = "certSAN", default)]
    pub cert_san: String,
    #[serde(default)]
    pub nginx_target_port: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReplicaSettings {
    #[serde(default = "default_replicas")]
    pub replicas: i32,
}

impl Default for ReplicaSettings {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cpu() -> u32 {
    1
}

fn default_reserved_cpu() -> u32 {
    50
}

fn default_memory() -> String {
    "1Gi".to_string()
}

fn default_service_type() -> String {
    "LoadBalancer".to_string()
}

fn default_replicas() -> i32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults() {
        let env: Environment =
            serde_json::from_str(r#"{"name":"app","environmentType":"Container"}"#).unwrap();
        assert!(env.gui_enabled);
        assert!(!env.persistent);
        assert_eq!(env.mode, EnvironmentMode::Standard);
        assert_eq!(env.resources.cpu, 1);
        assert_eq!(env.resources.reserved_cpu_percentage, 50);
        assert!(env.is_container_like());
        assert!(!env.is_vm_like());
    }

    #[test]
    fn test_cloud_vm_type_name() {
        let t: EnvironmentType = serde_json::from_str(r#""CloudVM""#).unwrap();
        assert_eq!(t, EnvironmentType::CloudVm);
        assert_eq!(t.to_string(), "CloudVM");
    }

    #[test]
    fn test_template_spec_workspace_ref() {
        let spec: TemplateSpec = serde_json::from_str(
            r#"{"workspace.crownlabs.polito.it/WorkspaceRef":{"name":"netlab"},"environmentList":[]}"#,
        )
        .unwrap();
        assert_eq!(spec.workspace_ref.name, "netlab");
        assert!(!spec.allow_public_exposure);
    }
}
