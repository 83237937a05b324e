//! Change tracking for directory-backed disks
//!
//! Every tracked snapshot stores a crc32c digest per 64 KiB granule of each
//! disk. Changed extents are the granules whose digest differs from the
//! reference map; from creation, they are the granules that are not all zero.

use convhost_common::ChangeExtent;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Tracking granularity
pub const GRANULE: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestMap {
    pub size: u64,
    pub granule: u64,
    pub digests: Vec<u32>,
}

impl DigestMap {
    /// Digest a disk image
    pub fn compute(path: &Path) -> std::io::Result<Self> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        let mut digests = Vec::with_capacity(size.div_ceil(GRANULE) as usize);
        let mut buf = vec![0u8; GRANULE as usize];
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(GRANULE) as usize;
            file.read_exact(&mut buf[..n])?;
            digests.push(crc32c::crc32c(&buf[..n]));
            remaining -= n as u64;
        }
        Ok(Self {
            size,
            granule: GRANULE,
            digests,
        })
    }

    fn granule_len(&self, index: usize) -> u64 {
        let start = index as u64 * self.granule;
        (self.size - start).min(self.granule)
    }

    /// Extents that differ from `base`, or that hold data when `base` is
    /// `None`. Ascending, merged, clipped to the disk size.
    pub fn changed_since(&self, base: Option<&DigestMap>) -> Vec<ChangeExtent> {
        let full_zero = crc32c::crc32c(&vec![0u8; self.granule as usize]);
        let comparable = base.is_some_and(|b| b.granule == self.granule);

        let mut extents: Vec<ChangeExtent> = Vec::new();
        for (index, digest) in self.digests.iter().enumerate() {
            let len = self.granule_len(index);
            let changed = match base {
                None => {
                    let zero = if len == self.granule {
                        full_zero
                    } else {
                        crc32c::crc32c(&vec![0u8; len as usize])
                    };
                    *digest != zero
                }
                Some(base) => {
                    !comparable
                        || base.digests.get(index) != Some(digest)
                        || base.granule_len_checked(index) != Some(len)
                }
            };
            if !changed {
                continue;
            }

            let start = index as u64 * self.granule;
            match extents.last_mut() {
                Some(last) if last.end() == start => last.length += len,
                _ => extents.push(ChangeExtent::new(start, len)),
            }
        }
        extents
    }

    fn granule_len_checked(&self, index: usize) -> Option<u64> {
        (index < self.digests.len()).then(|| self.granule_len(index))
    }
}
