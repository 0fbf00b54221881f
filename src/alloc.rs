// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Core allocation policy.
//!
//! `distribute_cores` runs after every event that changes demand, supply or
//! ownership. Phase one hands unoccupied cores to the oldest blocked thread
//! of the frontmost process in the highest non-empty priority queue. Phase
//! two walks the remaining unsatisfied demand in the same order and asks
//! lower-priority holders to give a core back, one shared-memory counter
//! bump and one preemption timer per reclaimed core.

use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

use log::debug;
use log::info;
use log::warn;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use crate::proto::NUM_PRIORITIES;
use crate::registry::ThreadState;
use crate::server::{CoreArbiterServer, ReleaseTimer};

impl CoreArbiterServer {
    /// THREAD_BLOCK: the thread parks in the arbiter. For an exclusive
    /// thread this is the voluntary half of the release protocol; the core
    /// comes back and the release debt is paid. Threads that block without
    /// being asked give their core up anyway, they just do not get credit.
    pub(crate) fn thread_blocking(&mut self, fd: RawFd) {
        let (pid, tid, state) = {
            let session = self.registry.session(fd);
            (session.pid, session.tid, session.state)
        };

        match state {
            ThreadState::Blocked => {
                warn!("thread {} is already blocked", tid);
            }
            ThreadState::RunningUnmanaged => {
                self.registry.change_thread_state(fd, ThreadState::Blocked);
                self.distribute_cores();
            }
            ThreadState::RunningPreempted => {
                self.registry.change_thread_state(fd, ThreadState::Blocked);
                let process = self.registry.process(pid);
                if process.by_state.count(ThreadState::RunningPreempted) == 0 {
                    process.shm.set_thread_preempted(false);
                }
                self.distribute_cores();
            }
            ThreadState::RunningExclusive => {
                let owed = self.registry.process(pid).owes_release();
                if !owed {
                    warn!(
                        "thread {} of process {} blocked without a pending release request",
                        tid, pid
                    );
                }
                let was_marked = self.remove_thread_from_exclusive_core(fd);
                if owed {
                    self.registry.process_mut(pid).release_count += 1;
                    self.consume_release_marker(pid, was_marked);
                }
                self.registry.process_mut(pid).total_cores_owned -= 1;
                self.registry.change_thread_state(fd, ThreadState::Blocked);
                self.update_queue_membership(pid);
                self.distribute_cores();
            }
        }
    }

    /// Reconcile one process's priority-queue membership after its desire
    /// or ownership changed.
    pub(crate) fn update_queue_membership(&mut self, pid: libc::pid_t) {
        for p in 0..NUM_PRIORITIES {
            let wanted = self.registry.unsatisfied(pid, p);
            self.queues.set_membership(p, pid, wanted);
        }
    }

    pub(crate) fn distribute_cores(&mut self) {
        // Phase 1: fill idle cores from the queues, highest priority and
        // oldest demand first.
        loop {
            let Some(core_idx) = self.cores.find_unoccupied() else {
                break;
            };
            let Some((fd, prio)) = self.find_grant_candidate() else {
                break;
            };
            self.move_thread_to_exclusive_core(fd, core_idx, prio);
        }

        // Phase 2: demand that could not be met from idle cores reclaims
        // cores held at lower priority.
        self.request_needed_releases();
    }

    /// The thread to grant the next idle core to: the oldest blocked
    /// session of the first process with grantable demand in the highest
    /// non-empty queue.
    fn find_grant_candidate(&self) -> Option<(RawFd, usize)> {
        for p in 0..NUM_PRIORITIES {
            for pid in self.queues.at(p) {
                if self.registry.grantable_demand(pid, p) == 0 {
                    continue;
                }
                if let Some(fd) = self
                    .registry
                    .process(pid)
                    .by_state
                    .first(ThreadState::Blocked)
                {
                    return Some((fd, p));
                }
            }
        }
        None
    }

    /// Ask holders to release cores for demand that phase one left unmet.
    /// Cores with a release already in flight count against the demand so
    /// repeated allocator passes do not stack requests.
    fn request_needed_releases(&mut self) {
        let mut in_flight = self.cores.num_release_pending();
        for p in 0..NUM_PRIORITIES {
            let waiters: Vec<libc::pid_t> = self.queues.at(p).collect();
            for pid in waiters {
                let mut need = self.registry.grantable_demand(pid, p);
                while need > 0 {
                    if in_flight > 0 {
                        in_flight -= 1;
                        need -= 1;
                        continue;
                    }
                    match self.find_release_victim(p, pid) {
                        Some(core_idx) => {
                            self.request_core_release(core_idx);
                            need -= 1;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// A core that can be taken for demand at priority `p`: held by some
    /// other process at strictly lower priority, no release pending. Of
    /// the candidates, the one granted at the lowest priority loses, most
    /// recent grant first on ties, so low-priority work drains first.
    fn find_release_victim(&self, p: usize, waiter: libc::pid_t) -> Option<usize> {
        self.cores
            .cores
            .iter()
            .enumerate()
            .filter_map(|(idx, core)| {
                let fd = core.owner?;
                if core.release_pending {
                    return None;
                }
                let session = self.registry.session(fd);
                let prio = session.grant_prio.expect("owned core without a priority");
                if session.pid == waiter || prio <= p {
                    return None;
                }
                Some((idx, prio, session.grant_seq))
            })
            .max_by_key(|&(_, prio, seq)| (prio, seq))
            .map(|(idx, _, _)| idx)
    }

    /// Bump the holder's release-request counter and start the preemption
    /// clock. The process is expected to block one of its threads before
    /// the timer fires.
    fn request_core_release(&mut self, core_idx: usize) {
        let fd = self.cores.cores[core_idx]
            .owner
            .expect("release requested for an idle core");
        let pid = self.registry.session(fd).pid;
        let process = self.registry.process(pid);
        let requests = process.shm.bump_release_request_count();
        debug!(
            "requested release {} from process {} (holds core {})",
            requests, pid, self.cores.cores[core_idx].cpu
        );

        match self.arm_preemption_timer(pid) {
            Ok(timer) => {
                let raw = timer.tfd.as_fd().as_raw_fd();
                self.timers.insert(raw, timer);
            }
            Err(e) => {
                // The request stands; without a timer it just cannot be
                // enforced.
                warn!("failed to arm preemption timer for process {}: {:#}", pid, e);
            }
        }
        self.cores.cores[core_idx].release_pending = true;
    }

    fn arm_preemption_timer(&self, pid: libc::pid_t) -> anyhow::Result<ReleaseTimer> {
        let tfd = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::empty())?;
        tfd.set(
            Expiration::OneShot(TimeSpec::from_duration(Duration::from_millis(
                self.cfg.preemption_timeout_ms,
            ))),
            TimerSetTimeFlags::empty(),
        )?;
        self.epoll_add_timer(&tfd)?;
        Ok(ReleaseTimer { pid, tfd })
    }

    /// A preemption timer fired. If the process has not honored the
    /// release request by now, its lowest-priority exclusive thread is
    /// forced onto the unmanaged cpuset and the core handed back to the
    /// allocator.
    pub(crate) fn timeout_thread_preemption(&mut self, timer_fd: RawFd) {
        let Some(timer) = self.timers.remove(&timer_fd) else {
            return;
        };
        self.epoll_delete_timer(&timer.tfd);
        let pid = timer.pid;
        drop(timer);

        if !self.registry.processes.contains_key(&pid) {
            // The whole process disconnected while the clock was running.
            return;
        }
        if !self.registry.process(pid).owes_release() {
            debug!("process {} released a core before the timeout", pid);
            return;
        }
        let Some(fd) = self.registry.lowest_priority_exclusive(pid) else {
            debug!("process {} owes a release but owns no cores", pid);
            return;
        };

        let tid = self.registry.session(fd).tid;
        info!(
            "process {} did not release a core within {}ms, preempting thread {}",
            pid, self.cfg.preemption_timeout_ms, tid
        );

        self.registry.process(pid).shm.set_thread_preempted(true);
        let was_marked = self.remove_thread_from_exclusive_core(fd);
        self.registry
            .change_thread_state(fd, ThreadState::RunningPreempted);
        let process = self.registry.process_mut(pid);
        process.release_count += 1;
        process.total_cores_owned -= 1;
        self.consume_release_marker(pid, was_marked);
        self.update_queue_membership(pid);
        self.distribute_cores();
    }

    /// A release debt was just paid. If the core that came back was not
    /// the one the request was marked against, drop one stale marker from
    /// the process's remaining cores so pending-release accounting does
    /// not undercount future demand.
    pub(crate) fn consume_release_marker(&mut self, pid: libc::pid_t, released_was_marked: bool) {
        if released_was_marked {
            return;
        }
        for core in self.cores.cores.iter_mut() {
            if !core.release_pending {
                continue;
            }
            let Some(fd) = core.owner else { continue };
            if self.registry.session(fd).pid == pid {
                core.release_pending = false;
                return;
            }
        }
    }

    /// Pin a blocked thread to an idle core and wake it. Granting to a
    /// thread in any other state is a state-machine bug.
    pub(crate) fn move_thread_to_exclusive_core(
        &mut self,
        fd: RawFd,
        core_idx: usize,
        prio: usize,
    ) {
        let (tid, pid, state) = {
            let session = self.registry.session(fd);
            (session.tid, session.pid, session.state)
        };
        if state != ThreadState::Blocked {
            panic!("granting core to thread {} in state {:?}", tid, state);
        }
        assert!(
            self.cores.cores[core_idx].owner.is_none(),
            "granting occupied core {}",
            self.cores.cores[core_idx].cpu
        );

        if let Err(e) = self.cores.cores[core_idx].adopt_thread(tid) {
            // The task list rejected the tid: the thread is gone.
            warn!(
                "cannot move thread {} to core {}: {}",
                tid, self.cores.cores[core_idx].cpu, e
            );
            self.cleanup_connection(fd);
            return;
        }

        self.grant_seq += 1;
        let grant_seq = self.grant_seq;
        {
            let core = &mut self.cores.cores[core_idx];
            core.owner = Some(fd);
            core.release_pending = false;
        }
        self.registry
            .change_thread_state(fd, ThreadState::RunningExclusive);
        {
            let session = self.registry.session_mut(fd);
            session.core = Some(core_idx);
            session.grant_prio = Some(prio);
            session.grant_seq = grant_seq;
        }
        self.registry.process_mut(pid).total_cores_owned += 1;
        self.update_queue_membership(pid);
        debug!(
            "granted core {} to thread {} of process {} at priority {}",
            self.cores.cores[core_idx].cpu, tid, pid, prio
        );

        if let Err(e) = self.send_wakeup(fd) {
            warn!("cannot wake thread {} on its new core: {}", tid, e);
            self.cleanup_connection(fd);
        }
    }

    /// Evict a thread from its exclusive core onto the unmanaged cpuset
    /// and unlink both sides. Ownership counters are the caller's to
    /// update. Returns whether the freed core had a release marked
    /// against it.
    pub(crate) fn remove_thread_from_exclusive_core(&mut self, fd: RawFd) -> bool {
        let (tid, core_idx) = {
            let session = self.registry.session(fd);
            (session.tid, session.core)
        };
        let Some(core_idx) = core_idx else {
            panic!("removing thread {} that is not on a core", tid);
        };

        if let Err(e) = self.cores.banish_thread(tid) {
            // Already gone; its cpuset membership died with it.
            warn!("cannot move thread {} to the unmanaged cpuset: {}", tid, e);
        }

        let core = &mut self.cores.cores[core_idx];
        let was_marked = core.release_pending;
        core.owner = None;
        core.release_pending = false;
        let session = self.registry.session_mut(fd);
        session.core = None;
        session.grant_prio = None;
        was_marked
    }
}
