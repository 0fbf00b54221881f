// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-process shared-memory region.
//!
//! The region is a plain file of [`SHM_REGION_SIZE`] bytes created under the
//! configured prefix and mapped shared into both sides: writable here,
//! read-only in the client. Only the server ever stores to it. Stores use
//! release ordering and the client pairs them with acquire loads, so the
//! word-sized counter doubles as the publication point for the request.

use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use anyhow::Context;
use anyhow::Result;
use log::warn;
use memmap2::MmapMut;

use crate::proto::SHM_PREEMPTED_OFFSET;
use crate::proto::SHM_RELEASE_COUNT_OFFSET;
use crate::proto::SHM_REGION_SIZE;

pub struct ShmRegion {
    path: PathBuf,
    file: File,
    map: MmapMut,
}

impl ShmRegion {
    /// Create (or truncate) and map the region for a process, zeroed.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating shared memory directory {dir:?}"))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("creating shared memory file {path:?}"))?;
        file.set_len(SHM_REGION_SIZE as u64)
            .with_context(|| format!("sizing shared memory file {path:?}"))?;
        let map = unsafe { MmapMut::map_mut(&file) }
            .with_context(|| format!("mapping shared memory file {path:?}"))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
        })
    }

    /// The fd handed to the client over SCM_RIGHTS during registration.
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn release_request_count_atomic(&self) -> &AtomicU64 {
        // The region outlives every borrow of self and the counter is
        // naturally aligned at offset 0.
        unsafe { &*(self.map.as_ptr().add(SHM_RELEASE_COUNT_OFFSET) as *const AtomicU64) }
    }

    fn preempted_atomic(&self) -> &AtomicU8 {
        unsafe { &*(self.map.as_ptr().add(SHM_PREEMPTED_OFFSET) as *const AtomicU8) }
    }

    pub fn release_request_count(&self) -> u64 {
        self.release_request_count_atomic().load(Ordering::Acquire)
    }

    /// Bump the release-request counter by one and return the new value.
    pub fn bump_release_request_count(&self) -> u64 {
        self.release_request_count_atomic()
            .fetch_add(1, Ordering::Release)
            + 1
    }

    pub fn thread_preempted(&self) -> bool {
        self.preempted_atomic().load(Ordering::Acquire) != 0
    }

    pub fn set_thread_preempted(&self, preempted: bool) {
        self.preempted_atomic()
            .store(preempted as u8, Ordering::Release);
    }

    /// Unlink the backing file. Mappings already held by the client stay
    /// valid until it unmaps.
    pub fn unlink(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to unlink shared memory file {:?}: {}", self.path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_region_starts_zeroed() {
        let tmp = TempDir::new().unwrap();
        let shm = ShmRegion::create(&tmp.path().join("shm_1")).unwrap();
        assert_eq!(shm.release_request_count(), 0);
        assert!(!shm.thread_preempted());
    }

    #[test]
    fn test_counter_is_monotonic() {
        let tmp = TempDir::new().unwrap();
        let shm = ShmRegion::create(&tmp.path().join("shm_2")).unwrap();
        assert_eq!(shm.bump_release_request_count(), 1);
        assert_eq!(shm.bump_release_request_count(), 2);
        assert_eq!(shm.release_request_count(), 2);
    }

    #[test]
    fn test_preempted_flag() {
        let tmp = TempDir::new().unwrap();
        let shm = ShmRegion::create(&tmp.path().join("shm_3")).unwrap();
        shm.set_thread_preempted(true);
        assert!(shm.thread_preempted());
        shm.set_thread_preempted(false);
        assert!(!shm.thread_preempted());
    }

    #[test]
    fn test_unlink_removes_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("shm_4");
        let shm = ShmRegion::create(&path).unwrap();
        assert!(path.exists());
        shm.unlink();
        assert!(!path.exists());
    }
}
