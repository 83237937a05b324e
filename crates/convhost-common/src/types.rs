//! Descriptors exchanged between the controller and platform providers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Platform metadata about a source VM
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmMetadata {
    /// Platform-native reference to the VM (moref, path, ...)
    #[serde(default)]
    pub vm_ref: String,
    /// Whether the VM already carries snapshots
    #[serde(default)]
    pub has_snapshots: bool,
    /// Whether change tracking is already enabled
    #[serde(default)]
    pub cbt_enabled: bool,
}

/// CPU topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTopology {
    pub sockets: u32,
    pub cores_per_socket: u32,
}

impl Default for CpuTopology {
    fn default() -> Self {
        Self {
            sockets: 1,
            cores_per_socket: 1,
        }
    }
}

impl CpuTopology {
    /// Total number of virtual CPUs
    pub fn vcpus(&self) -> u32 {
        self.sockets * self.cores_per_socket
    }
}

/// A source disk as reported by the source platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    /// Stable disk identifier (backing UUID)
    pub id: String,
    /// Device key used by change-tracking queries
    #[serde(default)]
    pub key: i64,
    /// Human-readable label
    #[serde(default)]
    pub name: String,
    /// Capacity in bytes
    pub size: u64,
    /// Platform path of the disk backing
    pub path: String,
    /// Storage the disk lives on (datastore, pool, ...)
    #[serde(default)]
    pub storage_name: String,
    /// Thin-provisioned backing
    #[serde(default)]
    pub is_sparse: bool,
}

/// A source network interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicDescriptor {
    #[serde(default)]
    pub name: String,
    pub mac_address: String,
    /// Source network name
    pub network: String,
}

/// Source VM hardware as returned by `inspect_hardware`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareDescriptor {
    #[serde(default)]
    pub metadata: VmMetadata,
    #[serde(default)]
    pub cpu: CpuTopology,
    /// Memory in bytes
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub disks: Vec<DiskDescriptor>,
    #[serde(default)]
    pub nics: Vec<NicDescriptor>,
}

/// Guest operating system facts gathered during inspection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingSystemDescriptor {
    /// `linux`, `windows`, ...
    #[serde(default, rename = "type")]
    pub os_type: String,
    #[serde(default)]
    pub distro: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub product_variant: String,
    #[serde(default)]
    pub major_version: u32,
    #[serde(default)]
    pub minor_version: u32,
    #[serde(default)]
    pub hostname: String,
    /// Mountpoint → device
    #[serde(default)]
    pub mountpoints: BTreeMap<String, String>,
}

/// A byte range reported as changed since a reference point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeExtent {
    pub start: u64,
    pub length: u64,
}

impl ChangeExtent {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// Exclusive end offset
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// On-disk format of a destination disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    #[default]
    Raw,
    Qcow2,
}

/// A destination disk created during provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationDisk {
    /// Platform id, filled in by `create_disk`
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub storage_name: String,
    pub size: u64,
    pub format: DiskFormat,
    pub sparse: bool,
    /// Device path on the staging VM, filled in after attachment
    #[serde(default)]
    pub local_path: Option<PathBuf>,
}

/// Source disk paired with its destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskMapping {
    pub source: DiskDescriptor,
    pub destination: DestinationDisk,
}

/// NIC to create on the destination VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicSpec {
    pub name: String,
    pub mac_address: String,
    /// Destination network name
    pub network: String,
}

/// Destination VM description handed to the converter and `create_vm`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub cpu: CpuTopology,
    pub memory: u64,
    /// Destination disk ids, in boot order
    pub disks: Vec<String>,
    /// Local device paths of the same disks, in the same order
    pub disk_paths: Vec<PathBuf>,
    pub nics: Vec<NicSpec>,
    #[serde(default)]
    pub operating_system: Option<OperatingSystemDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_defaults_fill_missing_sections() {
        let hw: HardwareDescriptor = serde_json::from_str(
            r#"{"memory": 2147483648, "disks": [{"id": "d1", "size": 1024, "path": "/a"}]}"#,
        )
        .unwrap();
        assert_eq!(hw.cpu.vcpus(), 1);
        assert_eq!(hw.disks[0].key, 0);
        assert!(hw.nics.is_empty());
    }

    #[test]
    fn test_operating_system_type_field() {
        let os: OperatingSystemDescriptor =
            serde_json::from_str(r#"{"type": "linux", "distro": "rhel", "major_version": 8}"#)
                .unwrap();
        assert_eq!(os.os_type, "linux");
        assert_eq!(os.major_version, 8);
    }

    #[test]
    fn test_change_extent_end() {
        assert_eq!(ChangeExtent::new(4096, 512).end(), 4608);
    }
}
