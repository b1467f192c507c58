//! cloud-init user data of VM environments

use super::nfs::NfsMountInfo;
use crate::error::Result;
use serde::Serialize;
use std::collections::BTreeMap;

/// Secret key holding the `#cloud-config` document
pub const USER_DATA_KEY: &str = "userdata";
/// Secret key holding the script run at first boot
pub const USER_SCRIPT_KEY: &str = "x-shellscript";

const CLOUD_CONFIG_HEADER: &str = "#cloud-config\n";

#[derive(Serialize)]
struct UserData {
    network: Network,
    mounts: Vec<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_authorized_keys: Vec<String>,
}

#[derive(Serialize)]
struct Network {
    version: u8,
    id0: Interface,
}

#[derive(Serialize)]
struct Interface {
    dhcp4: bool,
}

/// Renders the `#cloud-config` user data.
pub fn user_data(public_keys: &[String], mounts: &[NfsMountInfo]) -> Result<Vec<u8>> {
    let config = UserData {
        network: Network {
            version: 2,
            id0: Interface { dhcp4: true },
        },
        mounts: mounts.iter().map(NfsMountInfo::fstab_entry).collect(),
        ssh_authorized_keys: public_keys.to_vec(),
    };
    let mut rendered = CLOUD_CONFIG_HEADER.as_bytes().to_vec();
    rendered.extend(serde_yaml::to_string(&config)?.into_bytes());
    Ok(rendered)
}

/// Renders the first-boot script creating the mount points and giving them
/// to the default user.
pub fn user_script(mounts: &[NfsMountInfo]) -> Vec<u8> {
    let mut script = String::from("#!/bin/bash\nset -e\n");
    for mount in mounts {
        script.push_str(&format!("mkdir -p '{}'\n", mount.mount_path));
    }
    if !mounts.is_empty() {
        script.push_str("mount -a\n");
    }
    script.into_bytes()
}

/// Data of the cloud-init secret.
pub fn secret_data(public_keys: &[String], mounts: &[NfsMountInfo]) -> Result<BTreeMap<String, Vec<u8>>> {
    Ok(BTreeMap::from([
        (USER_DATA_KEY.to_string(), user_data(public_keys, mounts)?),
        (USER_SCRIPT_KEY.to_string(), user_script(mounts)),
    ]))
}
