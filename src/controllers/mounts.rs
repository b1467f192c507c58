//! Resolution of the inputs of VM and container environments that live in
//! other objects: NFS exports and SSH public keys.

use super::InstanceReconciler;
use crate::crd::{workspace_manager_selector, Environment, Instance, SharedVolume, Template, Tenant};
use crate::error::{OperatorError, Result};
use crate::events::EventSink;
use crate::resources::nfs::{
    NfsMountInfo, NFS_SECRET_NAME, NFS_SECRET_PATH_KEY, NFS_SECRET_SERVER_NAME_KEY,
};
use crate::store::ObjectStore;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::debug;

impl<S: ObjectStore, E: EventSink> InstanceReconciler<S, E> {
    /// NFS exports mounted by the environment: the personal drive, when
    /// requested, followed by the shared volumes in declaration order.
    pub(super) async fn nfs_mounts(
        &self,
        instance: &Instance,
        environment: &Environment,
    ) -> Result<Vec<NfsMountInfo>> {
        let namespace = instance.namespace().unwrap_or_default();
        let mut mounts = Vec::new();

        if environment.mount_my_drive_volume {
            let (server, path) = self.my_drive_export(&namespace).await?;
            if !server.is_empty() && !path.is_empty() {
                mounts.push(NfsMountInfo::my_drive(&server, &path));
            } else {
                debug!("personal drive export not provisioned yet");
            }
        }

        for (index, mount) in environment.shared_volume_mounts.iter().enumerate() {
            let reference = &mount.shared_volume_ref;
            let shvol_namespace = if reference.namespace.is_empty() {
                namespace.as_str()
            } else {
                reference.namespace.as_str()
            };
            let shvol = self
                .store
                .get::<SharedVolume>(Some(shvol_namespace), &reference.name)
                .await?
                .ok_or_else(|| {
                    OperatorError::MissingDependency(format!(
                        "shared volume {}/{} not found",
                        shvol_namespace, reference.name
                    ))
                })?;
            mounts.push(NfsMountInfo::shared_volume(index, &shvol, mount));
        }
        Ok(mounts)
    }

    /// Server and path of the personal drive, read from the `mydrive-info` secret.
    async fn my_drive_export(&self, namespace: &str) -> Result<(String, String)> {
        let secret = self
            .store
            .get::<Secret>(Some(namespace), NFS_SECRET_NAME)
            .await?
            .ok_or_else(|| {
                OperatorError::MissingDependency(format!("secret {}/{} not found", namespace, NFS_SECRET_NAME))
            })?;
        let data = secret.data.unwrap_or_default();
        let value = |key: &str| {
            data.get(key)
                .map(|v| String::from_utf8_lossy(&v.0).into_owned())
                .ok_or_else(|| {
                    OperatorError::MissingDependency(format!(
                        "secret {}/{} has no {} key",
                        namespace, NFS_SECRET_NAME, key
                    ))
                })
        };
        Ok((value(NFS_SECRET_SERVER_NAME_KEY)?, value(NFS_SECRET_PATH_KEY)?))
    }

    /// SSH keys authorized in VM environments: the tenant's own keys, then
    /// those of the managers of the template workspace. Duplicates are dropped.
    pub(super) async fn public_keys(&self, tenant: &Tenant, template: &Template) -> Result<Vec<String>> {
        let owner = tenant.name_any();
        let managers = self
            .store
            .list::<Tenant>(None, &workspace_manager_selector(&template.spec.workspace_ref.name))
            .await?;

        let mut keys: Vec<String> = Vec::new();
        let tenants = std::iter::once(tenant).chain(managers.iter().filter(|m| m.name_any() != owner));
        for key in tenants.flat_map(|t| t.spec.public_keys.iter()) {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use crate::controllers::testing::reconciler;
    use crate::crd::{
        EnvironmentType, GenericRef, SharedVolumeMountInfo, SharedVolumeSpec, SharedVolumeStatus,
    };
    use crate::resources::nfs::MY_DRIVE_NFS_MOUNT_PATH;
    use crate::resources::testing::{environment, instance, template, tenant};
    use crate::crd::{workspace_manager_selector, SharedVolume};
    use crate::OperatorError;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn my_drive_secret(server: &str, path: &str) -> Secret {
        let mut secret = Secret::default();
        secret.metadata.name = Some("mydrive-info".to_string());
        secret.metadata.namespace = Some("tenant-s123456".to_string());
        secret.data = Some(BTreeMap::from([
            ("server-name".to_string(), ByteString(server.as_bytes().to_vec())),
            ("path".to_string(), ByteString(path.as_bytes().to_vec())),
        ]));
        secret
    }

    fn shared_volume(name: &str) -> SharedVolume {
        let mut shvol = SharedVolume::new(
            name,
            SharedVolumeSpec {
                pretty_name: "Datasets".to_string(),
                size: "10Gi".to_string(),
            },
        );
        shvol.metadata.namespace = Some("workspace-netlab".to_string());
        shvol.status = Some(SharedVolumeStatus {
            server_address: "nfs.example.com".to_string(),
            export_path: "/export/datasets".to_string(),
            phase: "Ready".to_string(),
        });
        shvol
    }

    #[tokio::test]
    async fn test_my_drive_and_shared_volume_mounts() {
        let r = reconciler();
        r.store.insert(my_drive_secret("nfs.example.com", "/export/s123456")).await;
        r.store.insert(shared_volume("datasets")).await;

        let mut env = environment(EnvironmentType::VirtualMachine);
        env.mount_my_drive_volume = true;
        env.shared_volume_mounts = vec![SharedVolumeMountInfo {
            shared_volume_ref: GenericRef {
                name: "datasets".to_string(),
                namespace: "workspace-netlab".to_string(),
            },
            mount_path: "/mnt/datasets".to_string(),
            read_only: true,
        }];

        let mounts = r.nfs_mounts(&instance("lab"), &env).await.unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].mount_path, MY_DRIVE_NFS_MOUNT_PATH);
        assert_eq!(mounts[0].export_path, "/export/s123456");
        assert_eq!(mounts[1].volume_name, "nfs0");
        assert!(mounts[1].read_only);
    }

    #[tokio::test]
    async fn test_missing_dependencies_are_fatal() {
        let r = reconciler();
        let mut env = environment(EnvironmentType::Container);
        env.mount_my_drive_volume = true;
        let err = r.nfs_mounts(&instance("lab"), &env).await.unwrap_err();
        assert!(matches!(err, OperatorError::MissingDependency(_)));

        env.mount_my_drive_volume = false;
        env.shared_volume_mounts = vec![SharedVolumeMountInfo {
            shared_volume_ref: GenericRef {
                name: "ghost".to_string(),
                namespace: String::new(),
            },
            mount_path: "/mnt/ghost".to_string(),
            read_only: false,
        }];
        let err = r.nfs_mounts(&instance("lab"), &env).await.unwrap_err();
        assert!(err.to_string().contains("tenant-s123456/ghost"));
    }

    #[tokio::test]
    async fn test_unprovisioned_drive_is_skipped() {
        let r = reconciler();
        r.store.insert(my_drive_secret("", "")).await;
        let mut env = environment(EnvironmentType::Container);
        env.mount_my_drive_volume = true;
        assert!(r.nfs_mounts(&instance("lab"), &env).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_public_keys_include_managers_once() {
        let r = reconciler();
        let owner = tenant("s123456", &["ssh-ed25519 OWNER", "ssh-ed25519 SHARED"]);
        let mut manager = tenant("t000001", &["ssh-ed25519 SHARED", "ssh-ed25519 MANAGER"]);
        manager.metadata.labels = Some(workspace_manager_selector("netlab"));
        let mut owner_as_manager = owner.clone();
        owner_as_manager.metadata.labels = Some(workspace_manager_selector("netlab"));
        r.store.insert(manager).await;
        r.store.insert(owner_as_manager).await;
        r.store.insert(tenant("s654321", &["ssh-ed25519 STUDENT"])).await;

        let keys = r.public_keys(&owner, &template(vec![])).await.unwrap();
        assert_eq!(
            keys,
            vec!["ssh-ed25519 OWNER", "ssh-ed25519 SHARED", "ssh-ed25519 MANAGER"]
        );
    }
}
