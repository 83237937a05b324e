//! Directory-backed platform
//!
//! The `local` platform keeps its inventory on the filesystem so the whole
//! migration flow can run on one host:
//!
//! ```text
//! <source root>/vms/<vm id>/vm.json            hardware record
//! <source root>/vms/<vm id>/os.json            guest facts (optional)
//! <source root>/vms/<vm id>/platform.json      tracking flag + snapshot tree
//! <source root>/vms/<vm id>/snapshots/<id>/    frozen disk copies
//! <source root>/vms/<vm id>/changes/<id>/      per-disk digest maps
//!
//! <destination root>/inventory.json            disks, attachments, VMs
//! <destination root>/storage/<name>/<id>.img   destination disk images
//! ```

pub mod destination;
pub mod inspector;
pub mod source;
pub mod tracking;

pub use destination::LocalDestination;
pub use inspector::LocalInspector;
pub use source::LocalSource;

use crate::error::{ProviderError, ProviderResult};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Replace `path` with the JSON form of `value` via rename
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> ProviderResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| ProviderError::Platform(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ProviderError::Io(e.error))?;
    Ok(())
}

/// Read a JSON file, `None` when it does not exist
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> ProviderResult<Option<T>> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
