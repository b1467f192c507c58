//! Instance Custom Resource Definition
//!
//! An Instance is a tenant's running (or stopped) copy of a Template.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Instance is the Schema for the instances API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "crownlabs.polito.it",
    version = "v1alpha2",
    kind = "Instance",
    namespaced,
    status = "InstanceStatus",
    shortname = "inst",
    printcolumn = r#"{"name":"Pretty Name","type":"string","jsonPath":".spec.prettyName"}"#,
    printcolumn = r#"{"name":"Running","type":"boolean","jsonPath":".spec.running"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Template this instance is created from
    #[serde(rename = "template.crownlabs.polito.it/TemplateRef")]
    pub template: GenericRef,

    /// Tenant owning this instance
    #[serde(rename = "tenant.crownlabs.polito.it/TenantRef")]
    pub tenant: GenericRef,

    /// Whether the instance should be running
    #[serde(default = "default_true")]
    pub running: bool,

    /// Human-friendly name, generated when left empty
    #[serde(default)]
    pub pretty_name: String,

    /// Optional request to expose ports on an external IP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_exposure: Option<InstancePublicExposure>,
}

/// Reference to another object by name (and namespace, when namespaced)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GenericRef {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

/// Public exposure request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct InstancePublicExposure {
    #[serde(default)]
    pub ports: Vec<PublicServicePort>,
}

/// A single exposed port. `port == 0` asks for automatic assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PublicServicePort {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub port: i32,
    pub target_port: i32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

impl PublicServicePort {
    /// Protocol with the empty value mapped to TCP.
    pub fn normalized_protocol(&self) -> &str {
        if self.protocol.is_empty() {
            "TCP"
        } else {
            &self.protocol
        }
    }
}

/// Status of the instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: EnvironmentPhase,

    /// Per-environment exposition data, indexed like the template environment list
    #[serde(default)]
    pub environments: Vec<EnvironmentStatus>,

    /// URL of the graphical interface, if any
    #[serde(default)]
    pub url: String,

    /// URL of the personal drive file manager, if any
    #[serde(default)]
    pub my_drive_url: String,

    /// Node hosting the instance workload
    #[serde(default)]
    pub node_name: String,

    /// Node selector applied to the instance workload
    #[serde(default)]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Time elapsed between creation and the first Ready phase
    #[serde(default)]
    pub initial_ready_time: String,

    /// Outcome of the public exposure request. Serialized as null when
    /// absent so that a merge patch removes it.
    #[serde(default)]
    pub public_exposure: Option<PublicExposureStatus>,
}

/// Exposition data of a single environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EnvironmentStatus {
    /// Cluster-internal IP of the environment Service
    #[serde(default)]
    pub ip: String,
}

/// Lifecycle phase of an instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum EnvironmentPhase {
    #[default]
    #[serde(rename = "")]
    Unset,
    Importing,
    Starting,
    ResourceQuotaExceeded,
    Running,
    Ready,
    Stopping,
    Off,
    Failed,
    CreationLoopBackoff,
}

impl EnvironmentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentPhase::Unset => "",
            EnvironmentPhase::Importing => "Importing",
            EnvironmentPhase::Starting => "Starting",
            EnvironmentPhase::ResourceQuotaExceeded => "ResourceQuotaExceeded",
            EnvironmentPhase::Running => "Running",
            EnvironmentPhase::Ready => "Ready",
            EnvironmentPhase::Stopping => "Stopping",
            EnvironmentPhase::Off => "Off",
            EnvironmentPhase::Failed => "Failed",
            EnvironmentPhase::CreationLoopBackoff => "CreationLoopBackoff",
        }
    }
}

impl fmt::Display for EnvironmentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of the public exposure request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PublicExposureStatus {
    #[serde(default)]
    pub phase: PublicExposurePhase,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "externalIP")]
    pub external_ip: String,
    #[serde(default)]
    pub ports: Vec<PublicServicePort>,
}

/// Phase of the public exposure request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PublicExposurePhase {
    #[default]
    Provisioning,
    Ready,
    Error,
}

impl Instance {
    /// Mutable access to the status, creating an empty one if needed.
    pub fn status_mut(&mut self) -> &mut InstanceStatus {
        self.status.get_or_insert_with(InstanceStatus::default)
    }

    /// Current phase, `Unset` when no status has been recorded.
    pub fn phase(&self) -> EnvironmentPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// The requested public ports, empty when nothing is requested.
    pub fn requested_ports(&self) -> &[PublicServicePort] {
        self.spec
            .public_exposure
            .as_ref()
            .map(|pe| pe.ports.as_slice())
            .unwrap_or_default()
    }
}

fn default_true() -> bool {
    true
}

fn default_protocol() -> String {
    "TCP".to_string()
}
