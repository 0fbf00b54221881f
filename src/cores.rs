// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Static registry of the managed cores and the unmanaged cpuset handle.

use std::fs::File;
use std::io::Write;
use std::os::unix::io::RawFd;

use anyhow::Result;

use crate::cpuset::CpusetController;

/// One managed core. Entries are created at startup and live for the
/// server's lifetime; only the ownership fields change.
pub struct CoreEntry {
    /// CPU ID, matching what a thread running here would observe from the OS.
    pub cpu: usize,

    /// Open handle on the core cpuset's task list.
    tasks: File,

    /// Socket fd of the session running exclusively here, if any.
    pub owner: Option<RawFd>,

    /// A release request against this core is outstanding.
    pub release_pending: bool,
}

impl CoreEntry {
    /// Migrate a thread onto this core by writing its ID into the cpuset
    /// task list. Fails if the thread no longer exists.
    pub fn adopt_thread(&mut self, tid: libc::pid_t) -> std::io::Result<()> {
        self.tasks.write_all(format!("{tid}\n").as_bytes())
    }
}

pub struct CoreTable {
    pub cores: Vec<CoreEntry>,
    unmanaged_tasks: File,
}

impl CoreTable {
    /// Open task-list handles for every managed core plus the unmanaged
    /// cpuset. `CpusetController::setup` must already have run.
    pub fn open(cpusets: &CpusetController, managed: &[usize]) -> Result<Self> {
        let mut cores = Vec::with_capacity(managed.len());
        for &cpu in managed {
            cores.push(CoreEntry {
                cpu,
                tasks: cpusets.open_tasks(&cpusets.core_path(cpu))?,
                owner: None,
                release_pending: false,
            });
        }
        let unmanaged_tasks = cpusets.open_tasks(&cpusets.unmanaged_path())?;
        Ok(Self {
            cores,
            unmanaged_tasks,
        })
    }

    /// Migrate a thread into the unmanaged cpuset.
    pub fn banish_thread(&mut self, tid: libc::pid_t) -> std::io::Result<()> {
        self.unmanaged_tasks.write_all(format!("{tid}\n").as_bytes())
    }

    /// Index of some core with no exclusive thread.
    pub fn find_unoccupied(&self) -> Option<usize> {
        self.cores.iter().position(|c| c.owner.is_none())
    }

    pub fn num_unoccupied(&self) -> u32 {
        self.cores.iter().filter(|c| c.owner.is_none()).count() as u32
    }

    pub fn num_release_pending(&self) -> u32 {
        self.cores.iter().filter(|c| c.release_pending).count() as u32
    }
}
