//! Capability contracts the migration controller needs from platforms
//!
//! Source and destination platforms, the disk exposure helper, the guest
//! inspector and the converter are separate traits so a run can mix
//! implementations. [`Platforms`] bundles one of each, resolved once at
//! startup.

use crate::error::ProviderResult;

use async_trait::async_trait;
use convhost_common::{
    ChangeExtent, DestinationDisk, DiskDescriptor, DiskFormat, HardwareDescriptor, NicSpec,
    OperatingSystemDescriptor, VmSpec,
};
use convhost_sync::BlockTransport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Change-tracking reference meaning "since the disk was created"
pub const FROM_CREATION: &str = "*";

/// Per-disk view of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDisk {
    /// Platform locator of the frozen disk content
    pub path: String,
    /// Change-tracking id at the time of the snapshot
    #[serde(default)]
    pub change_id: Option<String>,
}

/// Handle to a source snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub id: String,
    pub name: String,
    /// Keyed by source disk id
    #[serde(default)]
    pub disks: BTreeMap<String, SnapshotDisk>,
}

impl SnapshotRef {
    pub fn disk(&self, disk_id: &str) -> Option<&SnapshotDisk> {
        self.disks.get(disk_id)
    }

    /// Change id a pass over `disk_id` reaches when syncing from this snapshot
    pub fn change_id(&self, disk_id: &str) -> &str {
        self.disks
            .get(disk_id)
            .and_then(|d| d.change_id.as_deref())
            .unwrap_or(FROM_CREATION)
    }
}

/// Options for one disk exposure session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Directory for sockets and helper files
    pub socket_dir: PathBuf,
    pub read_only: bool,
}

#[async_trait]
pub trait SourcePlatform: Send + Sync {
    async fn inspect_hardware(&self, vm_id: &str) -> ProviderResult<HardwareDescriptor>;

    async fn enable_change_tracking(&self, vm_id: &str) -> ProviderResult<()>;

    async fn create_snapshot(&self, vm_id: &str, name: &str) -> ProviderResult<SnapshotRef>;

    async fn remove_snapshot(&self, vm_id: &str, name: &str) -> ProviderResult<()>;

    async fn remove_all_snapshots(&self, vm_id: &str) -> ProviderResult<()>;

    /// Byte ranges of `disk` that changed between `since_change_id` and
    /// `snapshot`, ascending and non-overlapping
    async fn query_changed_extents(
        &self,
        vm_id: &str,
        snapshot: &SnapshotRef,
        disk: &DiskDescriptor,
        since_change_id: &str,
    ) -> ProviderResult<Vec<ChangeExtent>>;
}

#[async_trait]
pub trait DiskExposer: Send + Sync {
    /// Open a fresh read session on `disk` as frozen in `snapshot`
    async fn expose_disk(
        &self,
        disk: &DiskDescriptor,
        snapshot: &SnapshotRef,
        options: &SessionOptions,
    ) -> ProviderResult<Box<dyn BlockTransport>>;
}

#[async_trait]
pub trait GuestInspector: Send + Sync {
    async fn inspect_operating_system(
        &self,
        hardware: &HardwareDescriptor,
        snapshot: &SnapshotRef,
    ) -> ProviderResult<OperatingSystemDescriptor>;
}

#[async_trait]
pub trait DestinationPlatform: Send + Sync {
    /// Format and allocation for a disk copied from `source`
    fn best_fit_disk_format(&self, source: &DiskDescriptor) -> (DiskFormat, bool);

    async fn create_disk(&self, disk: &DestinationDisk) -> ProviderResult<String>;

    async fn disk_ready(&self, disk_id: &str) -> ProviderResult<bool>;

    async fn attach_disk(&self, vm_id: &str, disk_id: &str) -> ProviderResult<()>;

    /// Local device path of an attached disk, once visible
    async fn local_device_path(&self, vm_id: &str, disk_id: &str) -> ProviderResult<Option<PathBuf>>;

    async fn detach_disk(&self, vm_id: &str, disk_id: &str) -> ProviderResult<()>;

    async fn attachment_active(&self, vm_id: &str, disk_id: &str) -> ProviderResult<bool>;

    async fn create_vm(&self, spec: &VmSpec) -> ProviderResult<String>;

    async fn add_nic(&self, vm_id: &str, nic: &NicSpec) -> ProviderResult<()>;
}

/// A running conversion
#[async_trait]
pub trait ConversionJob: Send {
    fn pid(&self) -> Option<u32>;

    /// Block until the conversion exits; returns its exit status
    async fn wait(&mut self) -> ProviderResult<i32>;
}

#[async_trait]
pub trait Converter: Send + Sync {
    async fn start(&self, descriptor: &VmSpec) -> ProviderResult<Box<dyn ConversionJob>>;
}

/// One implementation of every capability, chosen at startup
#[derive(Clone)]
pub struct Platforms {
    pub source: Arc<dyn SourcePlatform>,
    pub exposer: Arc<dyn DiskExposer>,
    pub inspector: Arc<dyn GuestInspector>,
    pub destination: Arc<dyn DestinationPlatform>,
    pub converter: Arc<dyn Converter>,
}
