// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Wire protocol between client threads and the arbiter.
//!
//! Every message is a packed little-endian byte sequence over a Unix-domain
//! stream socket, starting with a one-byte kind tag. There is no framing
//! beyond the fixed field widths; the server reads exactly the number of
//! bytes the tag implies. Server-to-client traffic is limited to raw `u32`
//! replies for the count queries, a single wakeup byte when a core is
//! granted, and the shared-memory file descriptor passed as SCM_RIGHTS
//! ancillary data during the first registration of a process.

use std::io::IoSlice;
use std::io::Read;
use std::os::unix::io::RawFd;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use nix::sys::socket::sendmsg;
use nix::sys::socket::ControlMessage;
use nix::sys::socket::MsgFlags;

/// Number of priority levels. Index 0 is the highest priority.
pub const NUM_PRIORITIES: usize = 8;

/// Size in bytes of the per-process shared-memory region: a 64-bit release
/// request counter at offset 0 and a one-byte preemption flag at offset 8,
/// padded to keep the counter naturally aligned across versions.
pub const SHM_REGION_SIZE: usize = 16;

/// Byte offset of the release-request counter within the region.
pub const SHM_RELEASE_COUNT_OFFSET: usize = 0;

/// Byte offset of the thread-preempted flag within the region.
pub const SHM_PREEMPTED_OFFSET: usize = 8;

/// Byte sent on a session socket to wake a thread granted a core.
pub const WAKEUP_BYTE: u8 = 1;

/// Payload length of THREAD_REGISTER after the kind tag: two pid_t fields.
pub const REGISTER_LEN: usize = 8;

/// Payload length of CORES_REQUESTED after the kind tag.
pub const CORES_REQUESTED_LEN: usize = 4 * NUM_PRIORITIES;

/// Client-to-server message kinds. The discriminant is the wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgKind {
    /// `pid_t process_id, pid_t thread_id`; replied to with the process's
    /// shared-memory fd (ancillary) on the first registration only.
    ThreadRegister = 1,

    /// `u32 desired[NUM_PRIORITIES]`; no reply, triggers the allocator.
    CoresRequested = 2,

    /// No payload. The thread parks in a socket read until a grant wakes it.
    ThreadBlock = 3,

    /// No payload; replied to with a `u32` count.
    CountBlockedThreads = 4,

    /// No payload; replied to with a `u32` count.
    TotalAvailableCores = 5,
}

impl TryFrom<u8> for MsgKind {
    type Error = anyhow::Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(MsgKind::ThreadRegister),
            2 => Ok(MsgKind::CoresRequested),
            3 => Ok(MsgKind::ThreadBlock),
            4 => Ok(MsgKind::CountBlockedThreads),
            5 => Ok(MsgKind::TotalAvailableCores),
            tag => Err(anyhow!("unknown message kind {}", tag)),
        }
    }
}

/// Read the fixed-size payload of a THREAD_REGISTER message.
pub fn read_register(sock: &mut impl Read) -> Result<(libc::pid_t, libc::pid_t)> {
    let mut buf = [0u8; REGISTER_LEN];
    sock.read_exact(&mut buf)
        .context("short read in THREAD_REGISTER")?;
    let pid = i32::from_le_bytes(buf[0..4].try_into().unwrap());
    let tid = i32::from_le_bytes(buf[4..8].try_into().unwrap());
    Ok((pid, tid))
}

/// Read the fixed-size payload of a CORES_REQUESTED message.
pub fn read_cores_requested(sock: &mut impl Read) -> Result<[u32; NUM_PRIORITIES]> {
    let mut buf = [0u8; CORES_REQUESTED_LEN];
    sock.read_exact(&mut buf)
        .context("short read in CORES_REQUESTED")?;
    let mut desired = [0u32; NUM_PRIORITIES];
    for (i, out) in desired.iter_mut().enumerate() {
        *out = u32::from_le_bytes(buf[4 * i..4 * i + 4].try_into().unwrap());
    }
    Ok(desired)
}

/// Encode a THREAD_REGISTER message, tag included. This is the client side
/// of the exchange; the server's tests use it to speak the protocol.
pub fn encode_register(pid: libc::pid_t, tid: libc::pid_t) -> [u8; 1 + REGISTER_LEN] {
    let mut buf = [0u8; 1 + REGISTER_LEN];
    buf[0] = MsgKind::ThreadRegister as u8;
    buf[1..5].copy_from_slice(&pid.to_le_bytes());
    buf[5..9].copy_from_slice(&tid.to_le_bytes());
    buf
}

/// Encode a CORES_REQUESTED message, tag included.
pub fn encode_cores_requested(desired: &[u32; NUM_PRIORITIES]) -> [u8; 1 + CORES_REQUESTED_LEN] {
    let mut buf = [0u8; 1 + CORES_REQUESTED_LEN];
    buf[0] = MsgKind::CoresRequested as u8;
    for (i, d) in desired.iter().enumerate() {
        buf[1 + 4 * i..5 + 4 * i].copy_from_slice(&d.to_le_bytes());
    }
    buf
}

/// Send one payload byte with a file descriptor attached as SCM_RIGHTS
/// ancillary data. A non-empty payload is required for the control message
/// to be delivered.
pub fn send_fd(sock_fd: RawFd, payload: u8, fd: RawFd) -> Result<()> {
    let buf = [payload];
    let iov = [IoSlice::new(&buf)];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(sock_fd, &iov, &cmsg, MsgFlags::empty(), None)
        .context("sending shared memory fd")?;
    Ok(())
}
