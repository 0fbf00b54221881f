// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Session and process bookkeeping.
//!
//! Sessions are keyed by their socket fd and processes by pid; cores refer
//! to sessions and sessions to cores through those keys only, so the
//! session/process/core cycles of the data model never turn into owning
//! reference cycles. `Registry::change_thread_state` is the only mutator of
//! both a session's state field and the per-process state sets, which keeps
//! the two views consistent by construction.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::os::unix::net::UnixStream;
use std::os::unix::io::RawFd;

use crate::proto::NUM_PRIORITIES;
use crate::shm::ShmRegion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    /// Running alone on a managed core.
    RunningExclusive,

    /// Running on the unmanaged cpuset; the state every thread starts in.
    RunningUnmanaged,

    /// Forcibly moved to the unmanaged cpuset after a release timed out.
    RunningPreempted,

    /// Parked in the arbiter, waiting to be put on a core.
    Blocked,
}

const NUM_STATES: usize = 4;

impl ThreadState {
    fn index(self) -> usize {
        match self {
            ThreadState::RunningExclusive => 0,
            ThreadState::RunningUnmanaged => 1,
            ThreadState::RunningPreempted => 2,
            ThreadState::Blocked => 3,
        }
    }
}

pub struct Session {
    /// Thread ID, self-reported at registration. Unique within a process.
    pub tid: libc::pid_t,

    pub pid: libc::pid_t,

    pub sock: UnixStream,

    /// Index into the core table while running exclusively.
    pub core: Option<usize>,

    /// Priority level the current core was granted at.
    pub grant_prio: Option<usize>,

    /// Global grant sequence number, for most-recent-grant tie-breaks.
    pub grant_seq: u64,

    pub state: ThreadState,
}

/// Per-state session sets, insertion-ordered. Grants pull the oldest
/// blocked session, so order matters and the sets stay small.
#[derive(Default)]
pub struct StateSets {
    sets: [Vec<RawFd>; NUM_STATES],
}

impl StateSets {
    fn add(&mut self, state: ThreadState, fd: RawFd) {
        let set = &mut self.sets[state.index()];
        debug_assert!(!set.contains(&fd));
        set.push(fd);
    }

    fn remove(&mut self, state: ThreadState, fd: RawFd) {
        self.sets[state.index()].retain(|&f| f != fd);
    }

    pub fn first(&self, state: ThreadState) -> Option<RawFd> {
        self.sets[state.index()].first().copied()
    }

    pub fn count(&self, state: ThreadState) -> u32 {
        self.sets[state.index()].len() as u32
    }

    pub fn iter(&self, state: ThreadState) -> impl Iterator<Item = RawFd> + '_ {
        self.sets[state.index()].iter().copied()
    }

    pub fn total(&self) -> usize {
        self.sets.iter().map(|s| s.len()).sum()
    }

    pub fn iter_all(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.sets.iter().flatten().copied()
    }
}

pub struct Process {
    pub pid: libc::pid_t,

    pub shm: ShmRegion,

    /// Cores this process has released (voluntarily or by preemption).
    /// `shm.release_request_count() - release_count > 0` means it owes one.
    pub release_count: u64,

    pub total_cores_owned: u32,

    /// Desired core counts per priority level, index 0 highest.
    pub desired: [u32; NUM_PRIORITIES],

    pub by_state: StateSets,
}

impl Process {
    pub fn new(pid: libc::pid_t, shm: ShmRegion) -> Self {
        Self {
            pid,
            shm,
            release_count: 0,
            total_cores_owned: 0,
            desired: [0; NUM_PRIORITIES],
            by_state: StateSets::default(),
        }
    }

    pub fn owes_release(&self) -> bool {
        self.shm.release_request_count() > self.release_count
    }
}

#[derive(Default)]
pub struct Registry {
    pub sessions: HashMap<RawFd, Session>,
    pub processes: HashMap<libc::pid_t, Process>,
}

impl Registry {
    pub fn session(&self, fd: RawFd) -> &Session {
        self.sessions
            .get(&fd)
            .unwrap_or_else(|| panic!("no session for socket {fd}"))
    }

    pub fn session_mut(&mut self, fd: RawFd) -> &mut Session {
        self.sessions
            .get_mut(&fd)
            .unwrap_or_else(|| panic!("no session for socket {fd}"))
    }

    pub fn process(&self, pid: libc::pid_t) -> &Process {
        self.processes
            .get(&pid)
            .unwrap_or_else(|| panic!("no process {pid}"))
    }

    pub fn process_mut(&mut self, pid: libc::pid_t) -> &mut Process {
        self.processes
            .get_mut(&pid)
            .unwrap_or_else(|| panic!("no process {pid}"))
    }

    /// Insert a freshly registered session and index it under its process.
    pub fn add_session(&mut self, fd: RawFd, session: Session) {
        let pid = session.pid;
        let state = session.state;
        self.process_mut(pid).by_state.add(state, fd);
        self.sessions.insert(fd, session);
    }

    /// Drop a session from the registry and its process's indices. Returns
    /// the removed session; the process itself is left in place even if
    /// this was its last session.
    pub fn remove_session(&mut self, fd: RawFd) -> Session {
        let session = self
            .sessions
            .remove(&fd)
            .unwrap_or_else(|| panic!("no session for socket {fd}"));
        self.process_mut(session.pid)
            .by_state
            .remove(session.state, fd);
        session
    }

    /// The single mutator of a session's state and the state-set index.
    pub fn change_thread_state(&mut self, fd: RawFd, new_state: ThreadState) {
        let session = self
            .sessions
            .get_mut(&fd)
            .unwrap_or_else(|| panic!("no session for socket {fd}"));
        let old_state = session.state;
        if old_state == new_state {
            return;
        }
        session.state = new_state;
        let pid = session.pid;
        let by_state = &mut self.process_mut(pid).by_state;
        by_state.remove(old_state, fd);
        by_state.add(new_state, fd);
    }

    /// Cores granted to `pid` at priority `p` or higher (index <= p).
    pub fn granted_at_or_above(&self, pid: libc::pid_t, p: usize) -> u32 {
        self.process(pid)
            .by_state
            .iter(ThreadState::RunningExclusive)
            .filter(|&fd| {
                let prio = self.session(fd).grant_prio;
                matches!(prio, Some(gp) if gp <= p)
            })
            .count() as u32
    }

    /// Whether `pid` wants more cores at priority `p` than it has been
    /// granted at `p` or above.
    pub fn unsatisfied(&self, pid: libc::pid_t, p: usize) -> bool {
        self.process(pid).desired[p] > self.granted_at_or_above(pid, p)
    }

    /// Remaining demand of `pid` at priority `p`, capped by the number of
    /// blocked threads that could actually use a grant.
    pub fn grantable_demand(&self, pid: libc::pid_t, p: usize) -> u32 {
        let process = self.process(pid);
        let unmet = process.desired[p].saturating_sub(self.granted_at_or_above(pid, p));
        unmet.min(process.by_state.count(ThreadState::Blocked))
    }

    /// The victim for a release within a process: its lowest-priority
    /// exclusive session, most recently granted on ties.
    pub fn lowest_priority_exclusive(&self, pid: libc::pid_t) -> Option<RawFd> {
        self.process(pid)
            .by_state
            .iter(ThreadState::RunningExclusive)
            .max_by_key(|&fd| {
                let s = self.session(fd);
                (s.grant_prio, s.grant_seq)
            })
    }
}

/// Eight FIFO queues of processes with unsatisfied demand, one per
/// priority level.
#[derive(Default)]
pub struct PriorityQueues {
    queues: [VecDeque<libc::pid_t>; NUM_PRIORITIES],
}

impl PriorityQueues {
    pub fn contains(&self, p: usize, pid: libc::pid_t) -> bool {
        self.queues[p].contains(&pid)
    }

    /// Reconcile one process's membership at one priority level: enqueue
    /// at the tail when demand appears, drop out when it is satisfied.
    /// A process already queued keeps its position.
    pub fn set_membership(&mut self, p: usize, pid: libc::pid_t, wanted: bool) {
        let present = self.contains(p, pid);
        if wanted && !present {
            self.queues[p].push_back(pid);
        } else if !wanted && present {
            self.queues[p].retain(|&q| q != pid);
        }
    }

    pub fn remove_process(&mut self, pid: libc::pid_t) {
        for q in self.queues.iter_mut() {
            q.retain(|&p| p != pid);
        }
    }

    /// Processes queued at priority `p`, FIFO order.
    pub fn at(&self, p: usize) -> impl Iterator<Item = libc::pid_t> + '_ {
        self.queues[p].iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_process(tmp: &TempDir, pid: libc::pid_t) -> Process {
        let shm = ShmRegion::create(&tmp.path().join(format!("shm_{pid}"))).unwrap();
        Process::new(pid, shm)
    }

    fn test_session(pid: libc::pid_t, tid: libc::pid_t) -> (RawFd, Session) {
        use std::os::unix::io::AsRawFd;
        let (sock, peer) = UnixStream::pair().unwrap();
        // Leak the peer so the fd stays valid for the test's lifetime.
        std::mem::forget(peer);
        let fd = sock.as_raw_fd();
        (
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
        )
    }

    fn grant(registry: &mut Registry, fd: RawFd, core: usize, prio: usize, seq: u64) {
        registry.change_thread_state(fd, ThreadState::RunningExclusive);
        let session = registry.session_mut(fd);
        session.core = Some(core);
        session.grant_prio = Some(prio);
        session.grant_seq = seq;
        let pid = session.pid;
        registry.process_mut(pid).total_cores_owned += 1;
    }

    #[test]
    fn test_change_thread_state_keeps_sets_consistent() {
        let tmp = TempDir::new().unwrap();
        let mut registry = Registry::default();
        registry.processes.insert(7, test_process(&tmp, 7));
        let (fd, session) = test_session(7, 70);
        registry.add_session(fd, session);

        assert_eq!(
            registry.process(7).by_state.count(ThreadState::RunningUnmanaged),
            1
        );
        registry.change_thread_state(fd, ThreadState::Blocked);
        assert_eq!(registry.session(fd).state, ThreadState::Blocked);
        assert_eq!(
            registry.process(7).by_state.count(ThreadState::RunningUnmanaged),
            0
        );
        assert_eq!(registry.process(7).by_state.first(ThreadState::Blocked), Some(fd));
    }

    #[test]
    fn test_blocked_set_preserves_insertion_order() {
        let tmp = TempDir::new().unwrap();
        let mut registry = Registry::default();
        registry.processes.insert(7, test_process(&tmp, 7));
        let (fd_a, sess_a) = test_session(7, 70);
        let (fd_b, sess_b) = test_session(7, 71);
        registry.add_session(fd_a, sess_a);
        registry.add_session(fd_b, sess_b);

        registry.change_thread_state(fd_a, ThreadState::Blocked);
        registry.change_thread_state(fd_b, ThreadState::Blocked);
        assert_eq!(registry.process(7).by_state.first(ThreadState::Blocked), Some(fd_a));

        registry.change_thread_state(fd_a, ThreadState::RunningExclusive);
        assert_eq!(registry.process(7).by_state.first(ThreadState::Blocked), Some(fd_b));
    }

    #[test]
    fn test_granted_at_or_above_counts_higher_priority_grants() {
        let tmp = TempDir::new().unwrap();
        let mut registry = Registry::default();
        registry.processes.insert(7, test_process(&tmp, 7));
        let (fd_a, sess_a) = test_session(7, 70);
        let (fd_b, sess_b) = test_session(7, 71);
        registry.add_session(fd_a, sess_a);
        registry.add_session(fd_b, sess_b);
        registry.change_thread_state(fd_a, ThreadState::Blocked);
        registry.change_thread_state(fd_b, ThreadState::Blocked);

        grant(&mut registry, fd_a, 0, 0, 1);
        grant(&mut registry, fd_b, 1, 3, 2);

        // A priority-0 grant counts toward demand at every level; the
        // priority-3 grant only from level 3 down.
        assert_eq!(registry.granted_at_or_above(7, 0), 1);
        assert_eq!(registry.granted_at_or_above(7, 2), 1);
        assert_eq!(registry.granted_at_or_above(7, 3), 2);
        assert_eq!(registry.granted_at_or_above(7, 7), 2);
    }

    #[test]
    fn test_unsatisfied_demand() {
        let tmp = TempDir::new().unwrap();
        let mut registry = Registry::default();
        registry.processes.insert(7, test_process(&tmp, 7));
        let (fd, session) = test_session(7, 70);
        registry.add_session(fd, session);
        registry.change_thread_state(fd, ThreadState::Blocked);

        registry.process_mut(7).desired[2] = 1;
        assert!(registry.unsatisfied(7, 2));

        grant(&mut registry, fd, 0, 2, 1);
        assert!(!registry.unsatisfied(7, 2));
    }

    #[test]
    fn test_grantable_demand_capped_by_blocked_threads() {
        let tmp = TempDir::new().unwrap();
        let mut registry = Registry::default();
        registry.processes.insert(7, test_process(&tmp, 7));
        let (fd_a, sess_a) = test_session(7, 70);
        let (fd_b, sess_b) = test_session(7, 71);
        registry.add_session(fd_a, sess_a);
        registry.add_session(fd_b, sess_b);

        registry.process_mut(7).desired[0] = 3;
        // No blocked threads yet: demand exists but nothing is grantable.
        assert!(registry.unsatisfied(7, 0));
        assert_eq!(registry.grantable_demand(7, 0), 0);

        registry.change_thread_state(fd_a, ThreadState::Blocked);
        registry.change_thread_state(fd_b, ThreadState::Blocked);
        assert_eq!(registry.grantable_demand(7, 0), 2);
    }

    #[test]
    fn test_victim_is_lowest_priority_most_recent() {
        let tmp = TempDir::new().unwrap();
        let mut registry = Registry::default();
        registry.processes.insert(7, test_process(&tmp, 7));
        let (fd_a, sess_a) = test_session(7, 70);
        let (fd_b, sess_b) = test_session(7, 71);
        let (fd_c, sess_c) = test_session(7, 72);
        registry.add_session(fd_a, sess_a);
        registry.add_session(fd_b, sess_b);
        registry.add_session(fd_c, sess_c);
        for fd in [fd_a, fd_b, fd_c] {
            registry.change_thread_state(fd, ThreadState::Blocked);
        }

        grant(&mut registry, fd_a, 0, 1, 1);
        grant(&mut registry, fd_b, 1, 5, 2);
        grant(&mut registry, fd_c, 2, 5, 3);

        // Priority 5 loses before priority 1; the newer of the two
        // priority-5 grants goes first.
        assert_eq!(registry.lowest_priority_exclusive(7), Some(fd_c));
    }

    #[test]
    fn test_priority_queue_fifo_and_membership() {
        let mut queues = PriorityQueues::default();
        queues.set_membership(0, 10, true);
        queues.set_membership(0, 20, true);
        queues.set_membership(0, 10, true); // no duplicate, keeps position
        assert_eq!(queues.at(0).collect::<Vec<_>>(), vec![10, 20]);

        queues.set_membership(0, 10, false);
        assert_eq!(queues.at(0).collect::<Vec<_>>(), vec![20]);

        queues.set_membership(3, 20, true);
        queues.remove_process(20);
        assert!(queues.is_empty());
    }
}
