//! Tenant and SharedVolume Custom Resource Definitions
//!
//! Both are read-only inputs of the instance reconciliation.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label prefix marking workspace membership on tenants (`<prefix><workspace>=<role>`)
pub const WORKSPACE_LABEL_PREFIX: &str = "crownlabs.polito.it/workspace-";

/// Tenant is the Schema for the tenants API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "crownlabs.polito.it",
    version = "v1alpha2",
    kind = "Tenant",
    shortname = "tn",
    printcolumn = r#"{"name":"Email","type":"string","jsonPath":".spec.email"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TenantSpec {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,

    /// Workspaces the tenant belongs to
    #[serde(default)]
    pub workspaces: Vec<TenantWorkspaceEntry>,

    /// SSH public keys injected into VM environments
    #[serde(default)]
    pub public_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TenantWorkspaceEntry {
    pub name: String,
    pub role: WorkspaceRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceRole {
    Manager,
    User,
}

/// SharedVolume is an NFS share mountable by several instances
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "crownlabs.polito.it",
    version = "v1alpha2",
    kind = "SharedVolume",
    namespaced,
    status = "SharedVolumeStatus",
    shortname = "shvol"
)]
#[serde(rename_all = "camelCase")]
pub struct SharedVolumeSpec {
    #[serde(default)]
    pub pretty_name: String,
    #[serde(default)]
    pub size: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SharedVolumeStatus {
    #[serde(default)]
    pub server_address: String,
    #[serde(default)]
    pub export_path: String,
    #[serde(default)]
    pub phase: String,
}

/// Label selector matching the managers of a workspace.
pub fn workspace_manager_selector(workspace: &str) -> std::collections::BTreeMap<String, String> {
    std::collections::BTreeMap::from([(
        format!("{}{}", WORKSPACE_LABEL_PREFIX, workspace),
        "manager".to_string(),
    )])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_selector() {
        let selector = workspace_manager_selector("netlab");
        assert_eq!(
            selector.get("crownlabs.polito.it/workspace-netlab").map(String::as_str),
            Some("manager")
        );
    }

    #[test]
    fn test_tenant_spec_defaults() {
        let spec: TenantSpec = serde_json::from_str("{}").unwrap();
        assert!(spec.public_keys.is_empty());
        assert!(spec.workspaces.is_empty());
    }
}
