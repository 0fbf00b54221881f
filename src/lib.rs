// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! User-space core arbiter.
//!
//! The arbiter is a privileged daemon that hands out physical CPU cores
//! exclusively to cooperating application threads across multiple processes,
//! replacing the kernel's time-shared scheduling on a configured set of
//! managed cores. Threads register over a Unix-domain socket, declare how
//! many cores their process wants at each priority level, and block until
//! they are granted a core of their own. When the arbiter needs a core back
//! it asks the owning process to release one through a shared-memory
//! counter, and forcibly preempts the thread onto the shared unmanaged
//! cpuset if the process does not comply within the preemption timeout.
//!
//! All allocation state is owned by a single-threaded epoll loop; the only
//! cross-process channels are the client sockets and the per-process
//! shared-memory region, which is written exclusively by the server.

mod alloc;
mod config;
mod cores;
mod cpuset;
mod proto;
mod registry;
mod server;
mod shm;

pub use config::{format_cpulist, parse_cpulist, Config};
pub use cpuset::CpusetController;
pub use proto::{
    MsgKind, CORES_REQUESTED_LEN, NUM_PRIORITIES, REGISTER_LEN, SHM_REGION_SIZE, WAKEUP_BYTE,
};
pub use registry::ThreadState;
pub use server::{request_termination, CoreArbiterServer};
