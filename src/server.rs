// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The arbiter daemon: connection lifecycle and the epoll event loop.
//!
//! Everything runs on one thread. The loop blocks in `epoll_wait` on the
//! listen socket, every client socket, every armed preemption timer and the
//! termination eventfd; handlers mutate the core table, the registry and
//! the priority queues directly and re-run the allocator when demand,
//! supply or ownership changed. No internal locking exists because nothing
//! else touches this state.

use std::collections::HashMap;
use std::io::Read;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::timerfd::TimerFd;

use crate::config::{num_online_cpus, Config};
use crate::cores::CoreTable;
use crate::cpuset::CpusetController;
use crate::proto::{self, MsgKind, NUM_PRIORITIES};
use crate::registry::{PriorityQueues, Registry, Session, ThreadState};
use crate::shm::ShmRegion;

/// Upper bound on ready descriptors processed per epoll wake.
const MAX_EPOLL_EVENTS: usize = 1000;

/// Termination eventfd of the most recently constructed server, for the
/// signal path. POSIX handlers cannot carry user data, so this is
/// process-wide state: only one server may exist per process.
static MOST_RECENT_TERMINATION_FD: AtomicI32 = AtomicI32::new(-1);

/// Ask the most recently constructed server to leave its event loop. Safe
/// to call from the signal-handling thread; a no-op when no server exists.
pub fn request_termination() {
    let fd = MOST_RECENT_TERMINATION_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        write_eventfd(fd);
    }
}

fn write_eventfd(fd: RawFd) {
    let val = 1u64.to_ne_bytes();
    // Best-effort: the only failure modes are the server already gone or
    // the eventfd counter saturated, both of which mean we are done.
    unsafe {
        libc::write(fd, val.as_ptr() as *const libc::c_void, val.len());
    }
}

pub(crate) struct ReleaseTimer {
    pub pid: libc::pid_t,
    pub tfd: TimerFd,
}

pub struct CoreArbiterServer {
    pub(crate) cfg: Config,
    epoll: Epoll,
    listener: UnixListener,
    termination: EventFd,
    cpusets: CpusetController,
    pub(crate) cores: CoreTable,
    pub(crate) registry: Registry,
    pub(crate) queues: PriorityQueues,
    pub(crate) timers: HashMap<RawFd, ReleaseTimer>,
    unregistered: HashMap<RawFd, UnixStream>,
    pub(crate) grant_seq: u64,
}

impl CoreArbiterServer {
    /// Build the cpuset subtree, bind the listen socket and set up the
    /// event loop. Any failure here is fatal; the machine is left with the
    /// cpusets restored by `Drop` of whatever was constructed.
    pub fn new(cfg: Config) -> Result<Self> {
        let all_cpus: Vec<usize> = (0..num_online_cpus()).collect();
        let managed = if cfg.exclusive_cores.is_empty() {
            // Default: manage everything except CPU 0, which stays behind
            // for the unmanaged cpuset and the arbiter itself.
            all_cpus[1..].to_vec()
        } else {
            cfg.exclusive_cores.clone()
        };
        if managed.is_empty() {
            bail!("no managed cores configured");
        }
        if all_cpus.iter().all(|cpu| managed.contains(cpu)) {
            bail!("at least one CPU must remain unmanaged");
        }

        let cpusets = CpusetController::new(&cfg.cpuset_root);
        cpusets.setup(&managed, &all_cpus)?;
        let cores = CoreTable::open(&cpusets, &managed)?;

        let listener = bind_listener(&cfg.socket_path)?;
        let termination = EventFd::from_value_and_flags(0, EfdFlags::empty())
            .context("creating termination eventfd")?;

        let epoll = Epoll::new(EpollCreateFlags::empty()).context("creating epoll instance")?;
        epoll
            .add(
                &listener,
                EpollEvent::new(EpollFlags::EPOLLIN, listener.as_raw_fd() as u64),
            )
            .context("registering listen socket")?;
        epoll
            .add(
                &termination,
                EpollEvent::new(EpollFlags::EPOLLIN, termination.as_fd().as_raw_fd() as u64),
            )
            .context("registering termination eventfd")?;

        let prev = MOST_RECENT_TERMINATION_FD.swap(
            termination.as_fd().as_raw_fd(),
            Ordering::SeqCst,
        );
        if prev >= 0 {
            warn!("multiple arbiter servers in one process; signals reach the newest only");
        }

        info!(
            "arbitrating {} cores on socket {}",
            managed.len(),
            cfg.socket_path
        );

        Ok(Self {
            cfg,
            epoll,
            listener,
            termination,
            cpusets,
            cores,
            registry: Registry::default(),
            queues: PriorityQueues::default(),
            timers: HashMap::new(),
            unregistered: HashMap::new(),
            grant_seq: 0,
        })
    }

    /// Convenience entry point honoring `arbitrate_immediately`.
    pub fn run(cfg: Config) -> Result<()> {
        let arbitrate = cfg.arbitrate_immediately;
        let mut server = Self::new(cfg)?;
        if arbitrate {
            server.start_arbitration()?;
        }
        Ok(())
    }

    /// Block in the event loop until `end_arbitration` or a signal.
    pub fn start_arbitration(&mut self) -> Result<()> {
        info!("arbitration started");
        while self.handle_events()? {}
        info!("arbitration stopped");
        Ok(())
    }

    /// Make `start_arbitration` return. Callable from any thread.
    pub fn end_arbitration(&self) {
        write_eventfd(self.termination.as_fd().as_raw_fd());
    }

    /// One pass of the multiplexer. Returns false once termination is
    /// requested.
    fn handle_events(&mut self) -> Result<bool> {
        let mut events = vec![EpollEvent::empty(); MAX_EPOLL_EVENTS];
        let n = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(true),
            Err(e) => return Err(e).context("epoll_wait"),
        };

        for event in &events[..n] {
            let fd = event.data() as RawFd;

            if fd == self.termination.as_fd().as_raw_fd() {
                return Ok(false);
            }
            if fd == self.listener.as_raw_fd() {
                self.accept_connection();
                continue;
            }
            if self.timers.contains_key(&fd) {
                self.timeout_thread_preemption(fd);
                continue;
            }
            if event
                .events()
                .intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR)
            {
                self.cleanup_connection(fd);
                continue;
            }
            self.handle_client_readable(fd);
        }
        Ok(true)
    }

    fn accept_connection(&mut self) {
        let stream = match self.listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("failed to accept connection: {}", e);
                return;
            }
        };
        let fd = stream.as_raw_fd();
        if let Err(e) = self
            .epoll
            .add(&stream, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64))
        {
            warn!("failed to watch new connection: {}", e);
            return;
        }
        debug!("accepted connection on socket {}", fd);
        self.unregistered.insert(fd, stream);
    }

    /// Read and dispatch one message from a client socket. Any read error,
    /// protocol violation or EOF tears the connection down.
    pub(crate) fn handle_client_readable(&mut self, fd: RawFd) {
        let kind = match self.read_message_kind(fd) {
            Ok(kind) => kind,
            Err(e) => {
                debug!("closing socket {}: {}", fd, e);
                self.cleanup_connection(fd);
                return;
            }
        };

        if self.unregistered.contains_key(&fd) {
            // The only message a fresh connection may send is registration.
            match kind {
                MsgKind::ThreadRegister => self.handle_register(fd),
                kind => {
                    warn!("socket {} sent {:?} before registering", fd, kind);
                    self.cleanup_connection(fd);
                }
            }
            return;
        }

        match kind {
            MsgKind::ThreadRegister => {
                warn!(
                    "thread {} sent a duplicate registration",
                    self.registry.session(fd).tid
                );
                self.cleanup_connection(fd);
            }
            MsgKind::CoresRequested => self.handle_cores_requested(fd),
            MsgKind::ThreadBlock => self.thread_blocking(fd),
            MsgKind::CountBlockedThreads => self.count_blocked_threads(fd),
            MsgKind::TotalAvailableCores => self.total_available_cores(fd),
        }
    }

    fn read_message_kind(&mut self, fd: RawFd) -> Result<MsgKind> {
        let sock = self.socket_for(fd)?;
        let mut tag = [0u8; 1];
        (&mut &*sock)
            .read_exact(&mut tag)
            .context("reading message kind")?;
        MsgKind::try_from(tag[0])
    }

    fn socket_for(&self, fd: RawFd) -> Result<&UnixStream> {
        if let Some(sock) = self.unregistered.get(&fd) {
            return Ok(sock);
        }
        if let Some(session) = self.registry.sessions.get(&fd) {
            return Ok(&session.sock);
        }
        bail!("no connection for socket {fd}")
    }

    /// THREAD_REGISTER: create the process on first contact (shared-memory
    /// region included, fd pushed back over the socket), then index the new
    /// session as RUNNING_UNMANAGED.
    fn handle_register(&mut self, fd: RawFd) {
        let (pid, tid) = {
            let sock = self.unregistered.get(&fd).expect("registering socket");
            match proto::read_register(&mut &*sock) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!("bad registration on socket {}: {}", fd, e);
                    self.cleanup_connection(fd);
                    return;
                }
            }
        };

        if self.registry.processes.get(&pid).is_some_and(|process| {
            process
                .by_state
                .iter_all()
                .any(|sfd| self.registry.session(sfd).tid == tid)
        }) {
            warn!("thread {} of process {} registered twice", tid, pid);
            self.cleanup_connection(fd);
            return;
        }

        if !self.registry.processes.contains_key(&pid) {
            let shm_path = format!("{}{}", self.cfg.shared_mem_path_prefix, pid);
            let shm = match ShmRegion::create(Path::new(&shm_path)) {
                Ok(shm) => shm,
                Err(e) => {
                    warn!("cannot create shared memory for process {}: {:#}", pid, e);
                    self.cleanup_connection(fd);
                    return;
                }
            };
            if let Err(e) = proto::send_fd(fd, 0, shm.fd()) {
                warn!("cannot send shared memory fd to process {}: {:#}", pid, e);
                shm.unlink();
                self.cleanup_connection(fd);
                return;
            }
            self.registry
                .processes
                .insert(pid, crate::registry::Process::new(pid, shm));
            debug!("created process {}", pid);
        }

        let sock = self.unregistered.remove(&fd).expect("registering socket");
        self.registry.add_session(
            fd,
            Session {
                tid,
                pid,
                sock,
                core: None,
                grant_prio: None,
                grant_seq: 0,
                state: ThreadState::RunningUnmanaged,
            },
        );
        debug!("registered thread {} of process {}", tid, pid);
    }

    /// CORES_REQUESTED: replace the process's desired-core vector and
    /// reconcile queue membership at every priority level.
    fn handle_cores_requested(&mut self, fd: RawFd) {
        let desired = {
            let sock = &self.registry.session(fd).sock;
            match proto::read_cores_requested(&mut &*sock) {
                Ok(desired) => desired,
                Err(e) => {
                    warn!("bad core request on socket {}: {}", fd, e);
                    self.cleanup_connection(fd);
                    return;
                }
            }
        };
        let pid = self.registry.session(fd).pid;
        debug!("process {} requested {:?}", pid, desired);
        self.registry.process_mut(pid).desired = desired;
        self.update_queue_membership(pid);
        self.distribute_cores();
    }

    /// COUNT_BLOCKED_THREADS: blocked-thread count of the caller's process.
    fn count_blocked_threads(&mut self, fd: RawFd) {
        let session = self.registry.session(fd);
        let count = self
            .registry
            .process(session.pid)
            .by_state
            .count(ThreadState::Blocked);
        self.send_u32(fd, count);
    }

    /// TOTAL_AVAILABLE_CORES: managed cores without an exclusive thread.
    fn total_available_cores(&mut self, fd: RawFd) {
        let count = self.cores.num_unoccupied();
        self.send_u32(fd, count);
    }

    fn send_u32(&mut self, fd: RawFd, value: u32) {
        let result = {
            let sock = &self.registry.session(fd).sock;
            (&mut &*sock).write_all(&value.to_le_bytes())
        };
        if let Err(e) = result {
            warn!("failed to answer socket {}: {}", fd, e);
            self.cleanup_connection(fd);
        }
    }

    pub(crate) fn send_wakeup(&self, fd: RawFd) -> std::io::Result<()> {
        let sock = &self.registry.session(fd).sock;
        (&mut &*sock).write_all(&[proto::WAKEUP_BYTE])
    }

    /// Tear down one connection: evict the thread from its core if it held
    /// one, unindex the session, and retire the process (shared memory
    /// included) when this was its last thread.
    pub(crate) fn cleanup_connection(&mut self, fd: RawFd) {
        if let Some(stream) = self.unregistered.remove(&fd) {
            let _ = self.epoll.delete(&stream);
            return;
        }
        if !self.registry.sessions.contains_key(&fd) {
            return;
        }

        let (pid, tid, state) = {
            let session = self.registry.session(fd);
            (session.pid, session.tid, session.state)
        };
        debug!("cleaning up thread {} of process {}", tid, pid);

        if state == ThreadState::RunningExclusive {
            let was_marked = self.remove_thread_from_exclusive_core(fd);
            // A disconnect hands the core back just as a voluntary block
            // would, so it settles an outstanding release request.
            let owed = {
                let process = self.registry.process_mut(pid);
                process.total_cores_owned -= 1;
                if process.owes_release() {
                    process.release_count += 1;
                    true
                } else {
                    false
                }
            };
            if owed {
                self.consume_release_marker(pid, was_marked);
            }
        }

        let session = self.registry.remove_session(fd);
        let _ = self.epoll.delete(&session.sock);
        drop(session);

        if self.registry.process(pid).by_state.total() == 0 {
            self.queues.remove_process(pid);
            let process = self.registry.processes.remove(&pid).unwrap();
            process.shm.unlink();
            debug!("removed process {}", pid);
            // Pending release timers for this pid fire harmlessly later.
        } else {
            self.update_queue_membership(pid);
        }

        self.distribute_cores();
    }

    /// Check the structural invariants tying cores, sessions, processes
    /// and queues together. Test harnesses call this between steps; a
    /// violation is a server bug, so it panics.
    pub fn assert_invariants(&self) {
        let mut owned_cores: u32 = 0;
        for (idx, core) in self.cores.cores.iter().enumerate() {
            if let Some(fd) = core.owner {
                owned_cores += 1;
                let session = self.registry.session(fd);
                assert_eq!(
                    session.core,
                    Some(idx),
                    "core {} and session {} disagree on ownership",
                    core.cpu,
                    session.tid
                );
                assert_eq!(session.state, ThreadState::RunningExclusive);
            }
        }

        let mut total_owned = 0;
        for (pid, process) in &self.registry.processes {
            total_owned += process.total_cores_owned;
            assert!(
                process.by_state.total() > 0,
                "process {} exists with no sessions",
                pid
            );
            assert!(
                process.shm.release_request_count() >= process.release_count,
                "process {} released more cores than requested",
                pid
            );
            assert!(
                process.shm.release_request_count() - process.release_count
                    <= process.total_cores_owned as u64,
                "process {} owes more releases than cores it owns",
                pid
            );
            assert_eq!(
                process.total_cores_owned,
                process.by_state.count(ThreadState::RunningExclusive),
                "process {} core count does not match its exclusive sessions",
                pid
            );
            for p in 0..NUM_PRIORITIES {
                assert_eq!(
                    self.queues.contains(p, *pid),
                    self.registry.unsatisfied(*pid, p),
                    "process {} queue membership at priority {} is stale",
                    pid,
                    p
                );
            }
        }
        assert_eq!(total_owned, owned_cores);

        for (fd, session) in &self.registry.sessions {
            match session.state {
                ThreadState::RunningExclusive => {
                    let core = session.core.expect("exclusive session without a core");
                    assert_eq!(self.cores.cores[core].owner, Some(*fd));
                }
                _ => assert!(session.core.is_none()),
            }
        }
    }

    pub(crate) fn epoll_add_timer(&self, tfd: &TimerFd) -> Result<()> {
        let raw = tfd.as_fd().as_raw_fd();
        self.epoll
            .add(tfd, EpollEvent::new(EpollFlags::EPOLLIN, raw as u64))
            .context("registering preemption timer")?;
        Ok(())
    }

    pub(crate) fn epoll_delete_timer(&self, tfd: &TimerFd) {
        let _ = self.epoll.delete(tfd);
    }

    #[cfg(test)]
    pub(crate) fn adopt_unregistered(&mut self, stream: UnixStream) -> RawFd {
        let fd = stream.as_raw_fd();
        self.epoll
            .add(&stream, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64))
            .unwrap();
        self.unregistered.insert(fd, stream);
        fd
    }
}

impl Drop for CoreArbiterServer {
    fn drop(&mut self) {
        let _ = MOST_RECENT_TERMINATION_FD.compare_exchange(
            self.termination.as_fd().as_raw_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        for (_, process) in self.registry.processes.drain() {
            process.shm.unlink();
        }
        self.cpusets.teardown();
        if let Err(e) = std::fs::remove_file(&self.cfg.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove socket {}: {}", self.cfg.socket_path, e);
            }
        }
    }
}

fn bind_listener(socket_path: &str) -> Result<UnixListener> {
    let path = Path::new(socket_path);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {dir:?}"))?;
    }
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            return Err(e).with_context(|| format!("deleting stale socket {path:?}"));
        }
        _ => {}
    }
    let listener =
        UnixListener::bind(path).with_context(|| format!("binding UNIX socket {path:?}"))?;
    // Clients run as arbitrary users; the socket is the public interface.
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
        .with_context(|| format!("setting permissions on {path:?}"))?;
    Ok(listener)
}
