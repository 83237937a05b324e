//! Directory-backed source platform
//!
//! Snapshots are full copies of each disk image taken under the platform
//! lock. When change tracking is on, every snapshot also records a
//! [`DigestMap`] per disk; those outlive the snapshot itself so the next
//! round can diff against a released reference.

use super::tracking::DigestMap;
use super::{read_json, write_json_atomic};
use crate::capabilities::{SnapshotDisk, SnapshotRef, SourcePlatform, FROM_CREATION};
use crate::error::{ProviderError, ProviderResult};
use crate::snapshot::SnapshotTree;

use async_trait::async_trait;
use convhost_common::{
    ChangeExtent, CpuTopology, DiskDescriptor, HardwareDescriptor, NicDescriptor, VmMetadata,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Hardware record stored as `vm.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    #[serde(default)]
    pub cpu: CpuTopology,
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub disks: Vec<DiskRecord>,
    #[serde(default)]
    pub nics: Vec<NicDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub id: String,
    #[serde(default)]
    pub key: i64,
    #[serde(default)]
    pub name: String,
    /// Image file, relative to the VM directory unless absolute
    pub file: PathBuf,
    #[serde(default)]
    pub storage_name: String,
    #[serde(default)]
    pub is_sparse: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PlatformRecord {
    #[serde(default)]
    change_tracking: bool,
    #[serde(default)]
    snapshots: SnapshotTree,
}

struct Inner {
    root: PathBuf,
    /// Serializes read-modify-write of `platform.json`
    lock: Mutex<()>,
}

#[derive(Clone)]
pub struct LocalSource {
    inner: Arc<Inner>,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Write a VM record, creating its directory
    pub fn register_vm(&self, vm_id: &str, record: &VmRecord) -> ProviderResult<PathBuf> {
        let dir = self.inner.vm_dir(vm_id);
        write_json_atomic(&dir.join("vm.json"), record)?;
        Ok(dir)
    }

    async fn blocking<T, F>(&self, f: F) -> ProviderResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> ProviderResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| ProviderError::Io(std::io::Error::other(e)))?
    }
}

impl Inner {
    fn vm_dir(&self, vm_id: &str) -> PathBuf {
        self.root.join("vms").join(vm_id)
    }

    fn vm_record(&self, vm_id: &str) -> ProviderResult<VmRecord> {
        read_json(&self.vm_dir(vm_id).join("vm.json"))?
            .ok_or_else(|| ProviderError::NotFound(format!("VM {vm_id}")))
    }

    fn platform(&self, vm_id: &str) -> ProviderResult<PlatformRecord> {
        Ok(read_json(&self.vm_dir(vm_id).join("platform.json"))?.unwrap_or_default())
    }

    fn save_platform(&self, vm_id: &str, record: &PlatformRecord) -> ProviderResult<()> {
        write_json_atomic(&self.vm_dir(vm_id).join("platform.json"), record)
    }

    fn digest_path(&self, vm_id: &str, change_id: &str, disk_id: &str) -> PathBuf {
        self.vm_dir(vm_id)
            .join("changes")
            .join(change_id)
            .join(format!("{disk_id}.json"))
    }

    fn snapshot_dir(&self, vm_id: &str, snapshot_id: &str) -> PathBuf {
        self.vm_dir(vm_id).join("snapshots").join(snapshot_id)
    }

    fn inspect_hardware(&self, vm_id: &str) -> ProviderResult<HardwareDescriptor> {
        let record = self.vm_record(vm_id)?;
        let platform = self.platform(vm_id)?;
        let dir = self.vm_dir(vm_id);

        let mut disks = Vec::with_capacity(record.disks.len());
        for disk in &record.disks {
            let path = dir.join(&disk.file);
            let size = std::fs::metadata(&path)
                .map_err(|e| ProviderError::NotFound(format!("disk {} ({e})", path.display())))?
                .len();
            disks.push(DiskDescriptor {
                id: disk.id.clone(),
                key: disk.key,
                name: disk.name.clone(),
                size,
                path: path.display().to_string(),
                storage_name: disk.storage_name.clone(),
                is_sparse: disk.is_sparse,
            });
        }

        Ok(HardwareDescriptor {
            metadata: VmMetadata {
                vm_ref: dir.display().to_string(),
                has_snapshots: !platform.snapshots.is_empty(),
                cbt_enabled: platform.change_tracking,
            },
            cpu: record.cpu,
            memory: record.memory,
            disks,
            nics: record.nics,
        })
    }

    fn create_snapshot(&self, vm_id: &str, name: &str) -> ProviderResult<SnapshotRef> {
        let _guard = self.lock.lock();
        let record = self.vm_record(vm_id)?;
        let mut platform = self.platform(vm_id)?;
        let vm_dir = self.vm_dir(vm_id);

        let id = uuid::Uuid::new_v4().to_string();
        let snapshot_dir = self.snapshot_dir(vm_id, &id);
        std::fs::create_dir_all(&snapshot_dir)?;

        let mut disks = BTreeMap::new();
        for disk in &record.disks {
            let frozen = snapshot_dir.join(format!("{}.img", disk.id));
            std::fs::copy(vm_dir.join(&disk.file), &frozen)?;

            let change_id = if platform.change_tracking {
                let digests = DigestMap::compute(&frozen)?;
                write_json_atomic(&self.digest_path(vm_id, &id, &disk.id), &digests)?;
                Some(id.clone())
            } else {
                None
            };
            disks.insert(
                disk.id.clone(),
                SnapshotDisk {
                    path: frozen.display().to_string(),
                    change_id,
                },
            );
        }

        let created_at = chrono::Utc::now().to_rfc3339();
        let index = platform
            .snapshots
            .push(id.clone(), name.to_string(), created_at, disks);
        let snapshot = platform
            .snapshots
            .get(index)
            .map(|node| node.to_ref())
            .ok_or_else(|| ProviderError::Platform(format!("snapshot {id} vanished")))?;
        self.save_platform(vm_id, &platform)?;

        info!("Created snapshot '{name}' ({id}) of VM {vm_id}");
        Ok(snapshot)
    }

    fn remove_snapshot(&self, vm_id: &str, name: &str) -> ProviderResult<()> {
        let _guard = self.lock.lock();
        let mut platform = self.platform(vm_id)?;
        let node = platform
            .snapshots
            .find_by_name(name)
            .and_then(|index| platform.snapshots.remove(index))
            .ok_or_else(|| ProviderError::SnapshotNotFound(name.to_string()))?;
        self.save_platform(vm_id, &platform)?;
        remove_dir_if_present(&self.snapshot_dir(vm_id, &node.id))?;
        info!("Removed snapshot '{name}' ({}) of VM {vm_id}", node.id);
        Ok(())
    }

    fn remove_all_snapshots(&self, vm_id: &str) -> ProviderResult<()> {
        let _guard = self.lock.lock();
        let mut platform = self.platform(vm_id)?;
        let removed = platform.snapshots.clear();
        self.save_platform(vm_id, &platform)?;
        for node in &removed {
            remove_dir_if_present(&self.snapshot_dir(vm_id, &node.id))?;
        }
        info!("Removed {} snapshot(s) of VM {vm_id}", removed.len());
        Ok(())
    }

    fn query_changed_extents(
        &self,
        vm_id: &str,
        snapshot: &SnapshotRef,
        disk_id: &str,
        since: &str,
    ) -> ProviderResult<Vec<ChangeExtent>> {
        let platform = self.platform(vm_id)?;
        if !platform.change_tracking {
            return Err(ProviderError::ChangeTrackingDisabled(vm_id.to_string()));
        }

        let current = match read_json::<DigestMap>(&self.digest_path(vm_id, &snapshot.id, disk_id))? {
            Some(map) => map,
            None => {
                let frozen = snapshot.disk(disk_id).ok_or_else(|| {
                    ProviderError::SnapshotNotFound(format!("{} has no disk {disk_id}", snapshot.name))
                })?;
                DigestMap::compute(Path::new(&frozen.path))?
            }
        };

        let base = if since == FROM_CREATION {
            None
        } else {
            Some(
                read_json::<DigestMap>(&self.digest_path(vm_id, since, disk_id))?
                    .ok_or_else(|| ProviderError::UnknownChangeId(since.to_string()))?,
            )
        };

        let extents = current.changed_since(base.as_ref());
        debug!(
            "Disk {disk_id}: {} changed extent(s) since '{since}'",
            extents.len()
        );
        Ok(extents)
    }
}

fn remove_dir_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[async_trait]
impl SourcePlatform for LocalSource {
    async fn inspect_hardware(&self, vm_id: &str) -> ProviderResult<HardwareDescriptor> {
        let vm_id = vm_id.to_string();
        self.blocking(move |inner| inner.inspect_hardware(&vm_id)).await
    }

    async fn enable_change_tracking(&self, vm_id: &str) -> ProviderResult<()> {
        let vm_id = vm_id.to_string();
        self.blocking(move |inner| {
            let _guard = inner.lock.lock();
            inner.vm_record(&vm_id)?;
            let mut platform = inner.platform(&vm_id)?;
            if !platform.change_tracking {
                platform.change_tracking = true;
                inner.save_platform(&vm_id, &platform)?;
                info!("Enabled change tracking on VM {vm_id}");
            }
            Ok(())
        })
        .await
    }

    async fn create_snapshot(&self, vm_id: &str, name: &str) -> ProviderResult<SnapshotRef> {
        let (vm_id, name) = (vm_id.to_string(), name.to_string());
        self.blocking(move |inner| inner.create_snapshot(&vm_id, &name)).await
    }

    async fn remove_snapshot(&self, vm_id: &str, name: &str) -> ProviderResult<()> {
        let (vm_id, name) = (vm_id.to_string(), name.to_string());
        self.blocking(move |inner| inner.remove_snapshot(&vm_id, &name)).await
    }

    async fn remove_all_snapshots(&self, vm_id: &str) -> ProviderResult<()> {
        let vm_id = vm_id.to_string();
        self.blocking(move |inner| inner.remove_all_snapshots(&vm_id)).await
    }

    async fn query_changed_extents(
        &self,
        vm_id: &str,
        snapshot: &SnapshotRef,
        disk: &DiskDescriptor,
        since_change_id: &str,
    ) -> ProviderResult<Vec<ChangeExtent>> {
        let vm_id = vm_id.to_string();
        let snapshot = snapshot.clone();
        let disk_id = disk.id.clone();
        let since = since_change_id.to_string();
        self.blocking(move |inner| inner.query_changed_extents(&vm_id, &snapshot, &disk_id, &since))
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::local::tracking::GRANULE;
    use std::io::{Seek, SeekFrom, Write};

    pub(crate) fn seed_vm(root: &Path, vm_id: &str, disk_len: u64) -> LocalSource {
        let source = LocalSource::new(root);
        let record = VmRecord {
            name: "web01".to_string(),
            cpu: CpuTopology {
                sockets: 1,
                cores_per_socket: 2,
            },
            memory: 2 << 30,
            disks: vec![DiskRecord {
                id: "disk-a".to_string(),
                key: 2000,
                name: "Hard disk 1".to_string(),
                file: PathBuf::from("disk-a.img"),
                storage_name: "ds1".to_string(),
                is_sparse: true,
            }],
            nics: vec![NicDescriptor {
                name: "Network adapter 1".to_string(),
                mac_address: "00:50:56:aa:bb:cc".to_string(),
                network: "VM Network".to_string(),
            }],
        };
        let dir = source.register_vm(vm_id, &record).unwrap();
        std::fs::File::create(dir.join("disk-a.img"))
            .unwrap()
            .set_len(disk_len)
            .unwrap();
        source
    }

    pub(crate) fn write_disk(root: &Path, vm_id: &str, offset: u64, data: &[u8]) {
        let path = root.join("vms").join(vm_id).join("disk-a.img");
        let mut f = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        f.seek(SeekFrom::Start(offset)).unwrap();
        f.write_all(data).unwrap();
    }

    #[tokio::test]
    async fn test_inspect_hardware() {
        let root = tempfile::tempdir().unwrap();
        let source = seed_vm(root.path(), "vm-1", 8 * GRANULE);

        let hw = source.inspect_hardware("vm-1").await.unwrap();
        assert_eq!(hw.cpu.vcpus(), 2);
        assert_eq!(hw.disks.len(), 1);
        assert_eq!(hw.disks[0].size, 8 * GRANULE);
        assert!(hw.disks[0].path.ends_with("disk-a.img"));
        assert!(!hw.metadata.has_snapshots);
        assert!(!hw.metadata.cbt_enabled);

        let err = source.inspect_hardware("vm-missing").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_snapshot_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let source = seed_vm(root.path(), "vm-1", 4 * GRANULE);

        let snapshot = source.create_snapshot("vm-1", "inspection").await.unwrap();
        let frozen = PathBuf::from(&snapshot.disk("disk-a").unwrap().path);
        assert!(frozen.exists());
        assert_eq!(snapshot.change_id("disk-a"), FROM_CREATION);
        assert!(source.inspect_hardware("vm-1").await.unwrap().metadata.has_snapshots);

        source.remove_snapshot("vm-1", "inspection").await.unwrap();
        assert!(!frozen.exists());
        let err = source.remove_snapshot("vm-1", "inspection").await.unwrap_err();
        assert!(matches!(err, ProviderError::SnapshotNotFound(_)));

        source.create_snapshot("vm-1", "a").await.unwrap();
        source.create_snapshot("vm-1", "b").await.unwrap();
        source.remove_all_snapshots("vm-1").await.unwrap();
        assert!(!source.inspect_hardware("vm-1").await.unwrap().metadata.has_snapshots);
    }

    #[tokio::test]
    async fn test_changed_extents_between_snapshots() {
        let root = tempfile::tempdir().unwrap();
        let source = seed_vm(root.path(), "vm-1", 8 * GRANULE);
        let disk = source.inspect_hardware("vm-1").await.unwrap().disks[0].clone();

        let first = source.create_snapshot("vm-1", "untracked").await.unwrap();
        let err = source
            .query_changed_extents("vm-1", &first, &disk, FROM_CREATION)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ChangeTrackingDisabled(_)));
        source.remove_snapshot("vm-1", "untracked").await.unwrap();

        source.enable_change_tracking("vm-1").await.unwrap();
        write_disk(root.path(), "vm-1", 0, b"boot");
        let s1 = source.create_snapshot("vm-1", "conversion-1").await.unwrap();
        assert_eq!(s1.change_id("disk-a"), s1.id);
        let extents = source
            .query_changed_extents("vm-1", &s1, &disk, FROM_CREATION)
            .await
            .unwrap();
        assert_eq!(extents, vec![ChangeExtent::new(0, GRANULE)]);
        source.remove_snapshot("vm-1", "conversion-1").await.unwrap();

        write_disk(root.path(), "vm-1", 5 * GRANULE, b"delta");
        let s2 = source.create_snapshot("vm-1", "conversion-2").await.unwrap();
        let extents = source
            .query_changed_extents("vm-1", &s2, &disk, &s1.id)
            .await
            .unwrap();
        assert_eq!(extents, vec![ChangeExtent::new(5 * GRANULE, GRANULE)]);

        let err = source
            .query_changed_extents("vm-1", &s2, &disk, "no-such-change")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnknownChangeId(_)));
    }
}
