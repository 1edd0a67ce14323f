//! Request bodies for the management API.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::net::GuestMac;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permissions {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentState {
    #[default]
    Attached,
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceSpec {
    pub drive_id: String,
    #[serde(rename = "path_on_host")]
    pub host_path: PathBuf,
    #[serde(rename = "is_root_device")]
    pub is_root: bool,
    pub permissions: Permissions,
    pub state: AttachmentState,
}

impl BlockDeviceSpec {
    /// A read-write root filesystem drive.
    pub fn root(drive_id: impl Into<String>, host_path: impl Into<PathBuf>) -> Self {
        Self {
            drive_id: drive_id.into(),
            host_path: host_path.into(),
            is_root: true,
            permissions: Permissions::ReadWrite,
            state: AttachmentState::Attached,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    #[default]
    LocalImage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalImage {
    pub kernel_image_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSourceSpec {
    #[serde(rename = "boot_source_id")]
    pub id: String,
    #[serde(rename = "source_type")]
    pub source_kind: SourceKind,
    pub local_image: LocalImage,
}

impl BootSourceSpec {
    pub fn local_kernel(id: impl Into<String>, kernel_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            source_kind: SourceKind::LocalImage,
            local_image: LocalImage {
                kernel_image_path: kernel_path.into(),
            },
        }
    }

    pub fn kernel_path(&self) -> &PathBuf {
        &self.local_image.kernel_image_path
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceSpec {
    pub iface_id: String,
    #[serde(rename = "host_dev_name")]
    pub host_device_name: String,
    #[serde(rename = "guest_mac")]
    pub guest_mac_address: GuestMac,
    pub state: AttachmentState,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    InstanceStart,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceActionSpec {
    pub action_id: String,
    pub action_type: ActionType,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::Ipv4Addr;

    #[test]
    fn block_device_body() {
        let spec = BlockDeviceSpec::root("rootfs", "/images/rootfs.ext4");
        assert_eq!(
            serde_json::to_value(&spec).unwrap(),
            json!({
                "drive_id": "rootfs",
                "path_on_host": "/images/rootfs.ext4",
                "is_root_device": true,
                "permissions": "rw",
                "state": "Attached",
            })
        );
    }

    #[test]
    fn boot_source_body() {
        let spec = BootSourceSpec::local_kernel("1", "/images/vmlinux.bin");
        assert_eq!(
            serde_json::to_value(&spec).unwrap(),
            json!({
                "boot_source_id": "1",
                "source_type": "LocalImage",
                "local_image": { "kernel_image_path": "/images/vmlinux.bin" },
            })
        );
    }

    #[test]
    fn network_interface_body() {
        let spec = NetworkInterfaceSpec {
            iface_id: "1".to_owned(),
            host_device_name: "tap0".to_owned(),
            guest_mac_address: GuestMac::for_guest_ip(Ipv4Addr::new(192, 168, 241, 2)),
            state: AttachmentState::Attached,
        };
        assert_eq!(
            serde_json::to_value(&spec).unwrap(),
            json!({
                "iface_id": "1",
                "host_dev_name": "tap0",
                "guest_mac": "06:00:C0:A8:F1:02",
                "state": "Attached",
            })
        );
    }

    #[test]
    fn start_action_body() {
        let spec = InstanceActionSpec {
            action_id: "1".to_owned(),
            action_type: ActionType::InstanceStart,
        };
        assert_eq!(
            serde_json::to_value(&spec).unwrap(),
            json!({ "action_id": "1", "action_type": "InstanceStart" })
        );
    }
}
