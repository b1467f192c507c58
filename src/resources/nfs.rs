//! NFS mount descriptors for the personal drive and shared volumes

use crate::crd::{SharedVolume, SharedVolumeMountInfo};
use k8s_openapi::api::core::v1::{NFSVolumeSource, Volume, VolumeMount};

/// Secret in the instance namespace describing the personal drive export
pub const NFS_SECRET_NAME: &str = "mydrive-info";
pub const NFS_SECRET_SERVER_NAME_KEY: &str = "server-name";
pub const NFS_SECRET_PATH_KEY: &str = "path";

pub const MY_DRIVE_NFS_VOLUME_NAME: &str = "mydrive-nfs";
pub const MY_DRIVE_NFS_MOUNT_PATH: &str = "/media/mydrive";

const NFS_MOUNT_OPTIONS: &str = "tcp,hard,intr,rsize=8192,wsize=8192,timeo=14,_netdev,user";
const INVALID_SHARED_VOLUME_COMMENT: &str = "Here lies an invalid SharedVolume mount";

/// A volume to be mounted through NFS inside an environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsMountInfo {
    pub volume_name: String,
    pub server_address: String,
    pub export_path: String,
    pub mount_path: String,
    pub read_only: bool,
}

impl NfsMountInfo {
    /// The tenant personal drive, always writable.
    pub fn my_drive(server_address: &str, export_path: &str) -> Self {
        Self {
            volume_name: MY_DRIVE_NFS_VOLUME_NAME.to_string(),
            server_address: server_address.to_string(),
            export_path: export_path.to_string(),
            mount_path: MY_DRIVE_NFS_MOUNT_PATH.to_string(),
            read_only: false,
        }
    }

    /// The `index`-th shared volume mount of an environment.
    pub fn shared_volume(index: usize, shvol: &SharedVolume, mount: &SharedVolumeMountInfo) -> Self {
        let status = shvol.status.clone().unwrap_or_default();
        Self {
            volume_name: format!("nfs{}", index),
            server_address: status.server_address,
            export_path: status.export_path,
            mount_path: mount.mount_path.clone(),
            read_only: mount.read_only,
        }
    }

    fn is_valid(&self) -> bool {
        !self.server_address.is_empty() && !self.export_path.is_empty()
    }

    /// fstab-like line used by cloud-init `mounts`.
    pub fn fstab_entry(&self) -> Vec<String> {
        if !self.is_valid() {
            return comment_mount(INVALID_SHARED_VOLUME_COMMENT);
        }
        let permission = if self.read_only { "ro" } else { "rw" };
        vec![
            format!("{}:{}", self.server_address, self.export_path),
            self.mount_path.clone(),
            "nfs".to_string(),
            format!("{},{}", permission, NFS_MOUNT_OPTIONS),
            "0".to_string(),
            "0".to_string(),
        ]
    }

    /// Pod volume backed by the NFS export.
    pub fn pod_volume(&self) -> Volume {
        Volume {
            name: self.volume_name.clone(),
            nfs: Some(NFSVolumeSource {
                server: self.server_address.clone(),
                path: self.export_path.clone(),
                read_only: Some(self.read_only),
            }),
            ..Default::default()
        }
    }

    pub fn pod_volume_mount(&self) -> VolumeMount {
        VolumeMount {
            name: self.volume_name.clone(),
            mount_path: self.mount_path.clone(),
            read_only: Some(self.read_only),
            ..Default::default()
        }
    }
}

fn comment_mount(comment: &str) -> Vec<String> {
    let mut entry = vec![format!("# {}", comment)];
    entry.extend(std::iter::repeat(String::new()).take(5));
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GenericRef, SharedVolumeSpec, SharedVolumeStatus};

    fn shvol(server: &str, path: &str) -> SharedVolume {
        let mut shvol = SharedVolume::new("data", SharedVolumeSpec::default());
        shvol.status = Some(SharedVolumeStatus {
            server_address: server.to_string(),
            export_path: path.to_string(),
            phase: "Ready".to_string(),
        });
        shvol
    }

    fn mount(path: &str, read_only: bool) -> SharedVolumeMountInfo {
        SharedVolumeMountInfo {
            shared_volume_ref: GenericRef {
                name: "data".to_string(),
                namespace: "workspace-netlab".to_string(),
            },
            mount_path: path.to_string(),
            read_only,
        }
    }

    #[test]
    fn test_my_drive_fstab_entry() {
        let info = NfsMountInfo::my_drive("nfs.example.com", "/export/s123456");
        assert_eq!(
            info.fstab_entry(),
            vec![
                "nfs.example.com:/export/s123456",
                "/media/mydrive",
                "nfs",
                "rw,tcp,hard,intr,rsize=8192,wsize=8192,timeo=14,_netdev,user",
                "0",
                "0",
            ]
        );
    }

    #[test]
    fn test_shared_volume_read_only() {
        let info = NfsMountInfo::shared_volume(2, &shvol("10.0.0.5", "/vol"), &mount("/data", true));
        assert_eq!(info.volume_name, "nfs2");
        assert!(info.fstab_entry()[3].starts_with("ro,"));
        let volume = info.pod_volume();
        assert_eq!(volume.nfs.unwrap().server, "10.0.0.5");
        assert_eq!(info.pod_volume_mount().read_only, Some(true));
    }

    #[test]
    fn test_incomplete_shared_volume_is_commented_out() {
        let info = NfsMountInfo::shared_volume(0, &shvol("", "/vol"), &mount("/data", false));
        let entry = info.fstab_entry();
        assert_eq!(entry.len(), 6);
        assert_eq!(entry[0], "# Here lies an invalid SharedVolume mount");
        assert!(entry[1..].iter().all(String::is_empty));
    }
}
