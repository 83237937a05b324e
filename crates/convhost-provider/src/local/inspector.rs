//! Guest inspection for directory-backed VMs
//!
//! Guest facts are read from `os.json` next to the VM record. Inspection
//! only succeeds against a snapshot whose frozen disks are all present.

use super::read_json;
use crate::capabilities::{GuestInspector, SnapshotRef};
use crate::error::{ProviderError, ProviderResult};

use async_trait::async_trait;
use convhost_common::{HardwareDescriptor, OperatingSystemDescriptor};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct LocalInspector;

impl LocalInspector {
    pub fn new() -> Self {
        Self
    }
}

fn inspect(
    vm_dir: &Path,
    disk_ids: &[String],
    snapshot: &SnapshotRef,
) -> ProviderResult<OperatingSystemDescriptor> {
    for disk_id in disk_ids {
        let frozen = snapshot.disk(disk_id).ok_or_else(|| {
            ProviderError::Inspection(format!("snapshot '{}' lacks disk {disk_id}", snapshot.name))
        })?;
        if !Path::new(&frozen.path).exists() {
            return Err(ProviderError::Inspection(format!(
                "frozen disk {} is gone",
                frozen.path
            )));
        }
    }

    read_json::<OperatingSystemDescriptor>(&vm_dir.join("os.json"))?.ok_or_else(|| {
        ProviderError::Inspection(format!("no operating system found in {}", vm_dir.display()))
    })
}

#[async_trait]
impl GuestInspector for LocalInspector {
    async fn inspect_operating_system(
        &self,
        hardware: &HardwareDescriptor,
        snapshot: &SnapshotRef,
    ) -> ProviderResult<OperatingSystemDescriptor> {
        let vm_dir = PathBuf::from(&hardware.metadata.vm_ref);
        let disk_ids: Vec<String> = hardware.disks.iter().map(|d| d.id.clone()).collect();
        let snapshot = snapshot.clone();
        let os = tokio::task::spawn_blocking(move || inspect(&vm_dir, &disk_ids, &snapshot))
            .await
            .map_err(|e| ProviderError::Io(std::io::Error::other(e)))??;
        info!(
            "Guest OS: {} {} {}.{} ({})",
            os.os_type, os.distro, os.major_version, os.minor_version, os.arch
        );
        Ok(os)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::SourcePlatform;
    use crate::local::source::tests::seed_vm;

    #[tokio::test]
    async fn test_reads_guest_facts_from_snapshot() {
        let root = tempfile::tempdir().unwrap();
        let source = seed_vm(root.path(), "vm-1", 4096);
        let hw = source.inspect_hardware("vm-1").await.unwrap();
        let snapshot = source.create_snapshot("vm-1", "inspection").await.unwrap();
        let inspector = LocalInspector::new();

        let err = inspector
            .inspect_operating_system(&hw, &snapshot)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Inspection(_)));

        std::fs::write(
            Path::new(&hw.metadata.vm_ref).join("os.json"),
            r#"{"type": "linux", "distro": "rhel", "arch": "x86_64", "major_version": 8, "minor_version": 4}"#,
        )
        .unwrap();
        let os = inspector.inspect_operating_system(&hw, &snapshot).await.unwrap();
        assert_eq!(os.os_type, "linux");
        assert_eq!(os.major_version, 8);

        source.remove_snapshot("vm-1", "inspection").await.unwrap();
        let err = inspector
            .inspect_operating_system(&hw, &snapshot)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Inspection(_)));
    }
}
