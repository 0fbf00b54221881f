// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Cpuset filesystem plumbing.
//!
//! The arbiter owns a cpuset subtree at `<root>/arbiter/` with one
//! single-CPU child per managed core (`Core<id>`) and one `Unmanaged` child
//! holding every other CPU. Writing a decimal thread ID into a child's
//! `tasks` file is the sole migration mechanism; the server never calls
//! thread-affinity syscalls on client threads.
//!
//! The root is configurable so tests can point the controller at a scratch
//! directory instead of a mounted cpuset filesystem.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;

use crate::config::format_cpulist;

const ARBITER_DIR: &str = "arbiter";
const UNMANAGED_NAME: &str = "Unmanaged";

pub struct CpusetController {
    root: PathBuf,
    arbiter: PathBuf,
}

impl CpusetController {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = PathBuf::from(root.as_ref());
        let arbiter = root.join(ARBITER_DIR);
        Self { root, arbiter }
    }

    pub fn core_path(&self, cpu: usize) -> PathBuf {
        self.arbiter.join(format!("Core{}", cpu))
    }

    pub fn unmanaged_path(&self) -> PathBuf {
        self.arbiter.join(UNMANAGED_NAME)
    }

    fn root_tasks(&self) -> PathBuf {
        self.root.join("tasks")
    }

    /// Build the arbiter subtree: a child cpuset per managed core, the
    /// unmanaged cpuset with every remaining CPU, and every task currently
    /// in the root cpuset migrated into the unmanaged one. Stale children
    /// from a previous run are cleared out first.
    pub fn setup(&self, managed: &[usize], all_cpus: &[usize]) -> Result<()> {
        std::fs::create_dir_all(&self.arbiter)
            .with_context(|| format!("creating arbiter cpuset {:?}", self.arbiter))?;
        self.remove_stale_cpusets();

        let mems = self.read_root_mems();

        let unmanaged: Vec<usize> = all_cpus
            .iter()
            .copied()
            .filter(|cpu| !managed.contains(cpu))
            .collect();
        self.create_cpuset(&self.unmanaged_path(), &format_cpulist(&unmanaged), &mems)?;

        for &cpu in managed {
            self.create_cpuset(&self.core_path(cpu), &format_cpulist(&[cpu]), &mems)?;
        }

        // Evacuate everything already running in the root cpuset so the
        // managed cores start out empty.
        self.move_tasks(&self.root_tasks(), &self.unmanaged_path().join("tasks"));

        info!(
            "cpusets ready under {:?}: managed [{}], unmanaged [{}]",
            self.arbiter,
            format_cpulist(managed),
            format_cpulist(&unmanaged)
        );
        Ok(())
    }

    /// Open the `tasks` file of a cpuset for repeated migration writes.
    pub fn open_tasks(&self, cpuset: &Path) -> Result<File> {
        let path = cpuset.join("tasks");
        OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("opening cpuset tasks file {path:?}"))
    }

    fn create_cpuset(&self, path: &Path, cpus: &str, mems: &str) -> Result<()> {
        std::fs::create_dir_all(path).with_context(|| format!("creating cpuset {path:?}"))?;
        write_cpuset_file(&path.join("cpuset.cpus"), cpus)?;
        write_cpuset_file(&path.join("cpuset.mems"), mems)?;
        Ok(())
    }

    /// Memory nodes of the root cpuset; "0" when unreadable, which covers
    /// both scratch-directory tests and single-node machines.
    fn read_root_mems(&self) -> String {
        match std::fs::read_to_string(self.root.join("cpuset.mems")) {
            Ok(mems) if !mems.trim().is_empty() => mems.trim().to_string(),
            _ => "0".to_string(),
        }
    }

    /// Move every task listed in `from` into `to`, one thread ID at a time.
    /// Individual failures are expected (kernel threads refuse to move,
    /// tasks exit between the read and the write) and are skipped.
    pub fn move_tasks(&self, from: &Path, to: &Path) {
        let tids = match std::fs::read_to_string(from) {
            Ok(contents) => contents,
            Err(e) => {
                debug!("no tasks to move from {:?}: {}", from, e);
                return;
            }
        };
        let mut dest = match OpenOptions::new().write(true).create(true).open(to) {
            Ok(f) => f,
            Err(e) => {
                warn!("cannot open {:?} for task migration: {}", to, e);
                return;
            }
        };
        for tid in tids.split_whitespace() {
            if let Err(e) = dest.write_all(format!("{tid}\n").as_bytes()) {
                debug!("task {} would not move to {:?}: {}", tid, to, e);
            }
        }
    }

    /// Best-effort removal of child cpusets left over from a prior run.
    /// Children that still hold tasks are evacuated into the root first;
    /// ones that cannot be removed are skipped.
    fn remove_stale_cpusets(&self) {
        let entries = match std::fs::read_dir(&self.arbiter) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            self.move_tasks(&path.join("tasks"), &self.root_tasks());
            match remove_cpuset_dir(&path) {
                Ok(()) => debug!("removed stale cpuset {:?}", path),
                Err(e) => warn!("leaving stale cpuset {:?} in place: {}", path, e),
            }
        }
    }

    /// Restore the pre-run state: move every task in our children back to
    /// the root cpuset and remove the subtree.
    pub fn teardown(&self) {
        if let Ok(entries) = std::fs::read_dir(&self.arbiter) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                self.move_tasks(&path.join("tasks"), &self.root_tasks());
                if let Err(e) = remove_cpuset_dir(&path) {
                    warn!("failed to remove cpuset {:?}: {}", path, e);
                }
            }
        }
        if let Err(e) = remove_cpuset_dir(&self.arbiter) {
            warn!("failed to remove cpuset {:?}: {}", self.arbiter, e);
        }
        info!("cpusets restored under {:?}", self.root);
    }
}

fn write_cpuset_file(path: &Path, contents: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("opening {path:?}"))?;
    f.write_all(contents.as_bytes())
        .with_context(|| format!("writing {path:?}"))?;
    Ok(())
}

/// A cpuset directory only holds kernel-managed control files, so on a real
/// cpuset filesystem rmdir is the removal operation. On a scratch directory
/// the control files we created have to go first.
fn remove_cpuset_dir(path: &Path) -> std::io::Result<()> {
    for name in ["cpuset.cpus", "cpuset.mems", "tasks"] {
        let file = path.join(name);
        if file.is_file() {
            let _ = std::fs::remove_file(&file);
        }
    }
    std::fs::remove_dir(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_setup_creates_subtree() {
        let tmp = TempDir::new().unwrap();
        let ctl = CpusetController::new(tmp.path());
        ctl.setup(&[1, 2], &[0, 1, 2, 3]).unwrap();

        assert_eq!(read(&ctl.core_path(1).join("cpuset.cpus")), "1");
        assert_eq!(read(&ctl.core_path(2).join("cpuset.cpus")), "2");
        assert_eq!(read(&ctl.unmanaged_path().join("cpuset.cpus")), "0,3");
        assert_eq!(read(&ctl.core_path(1).join("cpuset.mems")), "0");
    }

    #[test]
    fn test_setup_respects_root_mems() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("cpuset.mems"), "0-1\n").unwrap();
        let ctl = CpusetController::new(tmp.path());
        ctl.setup(&[1], &[0, 1]).unwrap();
        assert_eq!(read(&ctl.core_path(1).join("cpuset.mems")), "0-1");
    }

    #[test]
    fn test_setup_evacuates_root_tasks() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("tasks"), "100\n200\n").unwrap();
        let ctl = CpusetController::new(tmp.path());
        ctl.setup(&[1], &[0, 1]).unwrap();
        // Tasks were appended to the unmanaged tasks file.
        let tasks = read(&ctl.unmanaged_path().join("tasks"));
        assert!(tasks.contains("100"));
        assert!(tasks.contains("200"));
    }

    #[test]
    fn test_stale_cpusets_removed_on_setup() {
        let tmp = TempDir::new().unwrap();
        let ctl = CpusetController::new(tmp.path());
        ctl.setup(&[1], &[0, 1]).unwrap();
        // A second run on the same root replaces the old children.
        let stale = ctl.core_path(1);
        ctl.setup(&[2], &[0, 1, 2]).unwrap();
        assert!(!stale.exists());
        assert!(ctl.core_path(2).exists());
    }

    #[test]
    fn test_teardown_removes_subtree() {
        let tmp = TempDir::new().unwrap();
        let ctl = CpusetController::new(tmp.path());
        ctl.setup(&[1], &[0, 1]).unwrap();
        std::fs::write(ctl.core_path(1).join("tasks"), "42\n").unwrap();
        ctl.teardown();
        assert!(!tmp.path().join(ARBITER_DIR).exists());
        // The evicted task went back to the root cpuset.
        assert!(read(&tmp.path().join("tasks")).contains("42"));
    }
}
