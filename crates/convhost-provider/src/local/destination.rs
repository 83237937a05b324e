//! Directory-backed destination platform
//!
//! Disks are raw image files under `storage/<storage name>/`. Attaching a
//! disk to the conversion host makes its image path the local device path.
//! All bookkeeping lives in `inventory.json`, rewritten after each change.

use super::{read_json, write_json_atomic};
use crate::capabilities::DestinationPlatform;
use crate::error::{ProviderError, ProviderResult};

use async_trait::async_trait;
use convhost_common::{DestinationDisk, DiskDescriptor, DiskFormat, NicSpec, VmSpec};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DiskEntry {
    name: String,
    storage_name: String,
    size: u64,
    format: DiskFormat,
    sparse: bool,
    path: PathBuf,
    #[serde(default)]
    attached_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmEntry {
    pub spec: VmSpec,
    #[serde(default)]
    pub nics: Vec<NicSpec>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inventory {
    #[serde(default)]
    disks: BTreeMap<String, DiskEntry>,
    #[serde(default)]
    vms: BTreeMap<String, VmEntry>,
}

#[derive(Clone)]
pub struct LocalDestination {
    root: PathBuf,
    inventory: Arc<Mutex<Inventory>>,
}

impl LocalDestination {
    /// Open the platform rooted at `root`, loading any previous inventory
    pub fn open(root: impl Into<PathBuf>) -> ProviderResult<Self> {
        let root = root.into();
        let inventory = read_json(&root.join("inventory.json"))?.unwrap_or_default();
        Ok(Self {
            root,
            inventory: Arc::new(Mutex::new(inventory)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Image path of a destination disk
    pub fn disk_path(&self, disk_id: &str) -> Option<PathBuf> {
        self.inventory.lock().disks.get(disk_id).map(|d| d.path.clone())
    }

    pub fn vm(&self, vm_id: &str) -> Option<VmEntry> {
        self.inventory.lock().vms.get(vm_id).cloned()
    }

    fn save(&self, inventory: &Inventory) -> ProviderResult<()> {
        write_json_atomic(&self.root.join("inventory.json"), inventory)
    }

    fn with_disk<T>(
        &self,
        disk_id: &str,
        f: impl FnOnce(&mut DiskEntry) -> ProviderResult<(T, bool)>,
    ) -> ProviderResult<T> {
        let mut inventory = self.inventory.lock();
        let disk = inventory
            .disks
            .get_mut(disk_id)
            .ok_or_else(|| ProviderError::NotFound(format!("disk {disk_id}")))?;
        let (value, dirty) = f(disk)?;
        if dirty {
            self.save(&inventory)?;
        }
        Ok(value)
    }
}

#[async_trait]
impl DestinationPlatform for LocalDestination {
    fn best_fit_disk_format(&self, source: &DiskDescriptor) -> (DiskFormat, bool) {
        (DiskFormat::Raw, source.is_sparse)
    }

    async fn create_disk(&self, disk: &DestinationDisk) -> ProviderResult<String> {
        if disk.storage_name.is_empty() || disk.storage_name.contains('/') {
            return Err(ProviderError::Platform(format!(
                "invalid storage name '{}'",
                disk.storage_name
            )));
        }
        if disk.format != DiskFormat::Raw {
            return Err(ProviderError::Unsupported(format!(
                "{:?} images on local storage",
                disk.format
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let dir = self.root.join("storage").join(&disk.storage_name);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{id}.img"));
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(disk.size)?;

        let mut inventory = self.inventory.lock();
        inventory.disks.insert(
            id.clone(),
            DiskEntry {
                name: disk.name.clone(),
                storage_name: disk.storage_name.clone(),
                size: disk.size,
                format: disk.format,
                sparse: disk.sparse,
                path,
                attached_to: None,
            },
        );
        self.save(&inventory)?;
        info!("Created disk {} ({id}, {} bytes)", disk.name, disk.size);
        Ok(id)
    }

    async fn disk_ready(&self, disk_id: &str) -> ProviderResult<bool> {
        self.with_disk(disk_id, |disk| Ok((disk.path.exists(), false)))
    }

    async fn attach_disk(&self, vm_id: &str, disk_id: &str) -> ProviderResult<()> {
        self.with_disk(disk_id, |disk| match &disk.attached_to {
            Some(owner) if owner == vm_id => Ok(((), false)),
            Some(owner) => Err(ProviderError::Platform(format!(
                "disk {disk_id} is attached to {owner}"
            ))),
            None => {
                disk.attached_to = Some(vm_id.to_string());
                Ok(((), true))
            }
        })?;
        debug!("Attached disk {disk_id} to {vm_id}");
        Ok(())
    }

    async fn local_device_path(&self, vm_id: &str, disk_id: &str) -> ProviderResult<Option<PathBuf>> {
        self.with_disk(disk_id, |disk| {
            let visible = disk.attached_to.as_deref() == Some(vm_id);
            Ok((visible.then(|| disk.path.clone()), false))
        })
    }

    async fn detach_disk(&self, vm_id: &str, disk_id: &str) -> ProviderResult<()> {
        self.with_disk(disk_id, |disk| {
            if disk.attached_to.as_deref() == Some(vm_id) {
                disk.attached_to = None;
                Ok(((), true))
            } else {
                Ok(((), false))
            }
        })?;
        debug!("Detached disk {disk_id} from {vm_id}");
        Ok(())
    }

    async fn attachment_active(&self, vm_id: &str, disk_id: &str) -> ProviderResult<bool> {
        self.with_disk(disk_id, |disk| {
            Ok((disk.attached_to.as_deref() == Some(vm_id), false))
        })
    }

    async fn create_vm(&self, spec: &VmSpec) -> ProviderResult<String> {
        let mut inventory = self.inventory.lock();
        for disk_id in &spec.disks {
            match inventory.disks.get(disk_id) {
                None => return Err(ProviderError::NotFound(format!("disk {disk_id}"))),
                Some(disk) if disk.attached_to.is_some() => {
                    return Err(ProviderError::Platform(format!(
                        "disk {disk_id} is still attached"
                    )));
                }
                Some(_) => {}
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        inventory.vms.insert(
            id.clone(),
            VmEntry {
                spec: spec.clone(),
                nics: Vec::new(),
            },
        );
        self.save(&inventory)?;
        info!("Created VM {} ({id})", spec.name);
        Ok(id)
    }

    async fn add_nic(&self, vm_id: &str, nic: &NicSpec) -> ProviderResult<()> {
        let mut inventory = self.inventory.lock();
        let vm = inventory
            .vms
            .get_mut(vm_id)
            .ok_or_else(|| ProviderError::NotFound(format!("VM {vm_id}")))?;
        vm.nics.push(nic.clone());
        self.save(&inventory)?;
        debug!("Added {} ({}) on {} to VM {vm_id}", nic.name, nic.mac_address, nic.network);
        Ok(())
    }
}
