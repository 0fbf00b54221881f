// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::bail;
use anyhow::Result;
use sscanf::sscanf;

/// Server configuration. Defaults are suitable for a production run on a
/// machine with the cpuset filesystem mounted at /sys/fs/cpuset; tests
/// redirect `cpuset_root`, `socket_path` and `shared_mem_path_prefix` into a
/// scratch directory.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the Unix-domain listen socket.
    pub socket_path: String,

    /// Filename prefix for per-process shared-memory regions. The region
    /// for process `pid` lives at `<prefix><pid>`.
    pub shared_mem_path_prefix: String,

    /// CPU IDs to manage exclusively. Empty means every CPU except 0.
    pub exclusive_cores: Vec<usize>,

    /// Root of the mounted cpuset filesystem.
    pub cpuset_root: String,

    /// Milliseconds to wait for a voluntary release before forcibly
    /// preempting a thread off its exclusive core.
    pub preemption_timeout_ms: u64,

    /// Enter the event loop from `run()` without an explicit
    /// `start_arbitration()` call.
    pub arbitrate_immediately: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: "/var/run/core_arbiter/socket".into(),
            shared_mem_path_prefix: "/var/run/core_arbiter/shm_".into(),
            exclusive_cores: vec![],
            cpuset_root: "/sys/fs/cpuset".into(),
            preemption_timeout_ms: 10,
            arbitrate_immediately: true,
        }
    }
}

/// Parse a kernel-style cpulist ("0-3,5,7-8") into CPU IDs.
pub fn parse_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim().trim_end_matches('\0');
    let mut cpu_ids = vec![];
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => bail!("Failed to parse cpulist {}", group.trim()),
            },
        };
        if min > max {
            bail!("Invalid cpulist range {}-{}", min, max);
        }
        for i in min..=max {
            cpu_ids.push(i);
        }
    }
    Ok(cpu_ids)
}

/// Format CPU IDs as a compact cpulist, collapsing runs into ranges. The
/// input does not have to be sorted.
pub fn format_cpulist(cpus: &[usize]) -> String {
    let mut cpus = cpus.to_vec();
    cpus.sort_unstable();
    cpus.dedup();

    let mut groups: Vec<String> = vec![];
    let mut i = 0;
    while i < cpus.len() {
        let start = cpus[i];
        let mut end = start;
        while i + 1 < cpus.len() && cpus[i + 1] == end + 1 {
            end = cpus[i + 1];
            i += 1;
        }
        if start == end {
            groups.push(format!("{}", start));
        } else {
            groups.push(format!("{}-{}", start, end));
        }
        i += 1;
    }
    groups.join(",")
}

/// Number of online CPUs as reported by the OS.
pub fn num_online_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}
