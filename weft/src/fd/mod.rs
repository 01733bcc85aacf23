//! Per-fd metadata registry.
//!
//! Tracks, per file descriptor, whether it is a socket, who set it
//! non-blocking (the runtime or the user), and the send/receive
//! timeouts consulted by the cooperative I/O operations in
//! [`crate::io::ops`]. The reactor core itself never reads these
//! records.

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::socket::sockopt::{ReceiveTimeout, SendTimeout};
use nix::sys::socket::{getsockopt, setsockopt};
use nix::sys::stat::{SFlag, fstat};
use nix::sys::time::TimeVal;
use parking_lot::RwLock;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Sentinel for "no timeout configured".
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Which of the two per-fd timeouts to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`: read-side operations.
    Recv,
    /// `SO_SNDTIMEO`: write-side operations.
    Send,
}

#[derive(Debug)]
pub struct FdRecord {
    fd: RawFd,
    is_socket: bool,
    /// Non-blocking because the runtime made it so (every fd handed to
    /// the reactor is).
    sys_nonblock: AtomicBool,
    /// Non-blocking because the user explicitly asked.
    user_nonblock: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdRecord {
    fn probe(fd: RawFd) -> Self {
        let is_socket = fstat(fd).is_ok_and(|st| {
            SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT == SFlag::S_IFSOCK
        });
        Self {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    pub(crate) fn set_sys_nonblock(&self, value: bool) {
        self.sys_nonblock.store(value, Ordering::Release);
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, value: bool) {
        self.user_nonblock.store(value, Ordering::Release);
    }

    /// Timeout in milliseconds for `kind`-side operations, or
    /// [`NO_TIMEOUT`].
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    /// Record a timeout and, for sockets, mirror it into the kernel via
    /// `SO_RCVTIMEO`/`SO_SNDTIMEO` so non-cooperative callers observe
    /// it too.
    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) -> nix::Result<()> {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
        if !self.is_socket {
            return Ok(());
        }
        let tv = if ms == NO_TIMEOUT {
            TimeVal::new(0, 0)
        } else {
            TimeVal::new((ms / 1_000) as _, ((ms % 1_000) * 1_000) as _)
        };
        // Safety: callers of the registry guarantee the fd is open while
        // its record is in use.
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        match kind {
            TimeoutKind::Recv => setsockopt(&fd, ReceiveTimeout, &tv),
            TimeoutKind::Send => setsockopt(&fd, SendTimeout, &tv),
        }
    }

    /// Read the kernel-side timeout back, in milliseconds.
    pub fn kernel_timeout(&self, kind: TimeoutKind) -> nix::Result<u64> {
        // Safety: as in `set_timeout`.
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let tv = match kind {
            TimeoutKind::Recv => getsockopt(&fd, ReceiveTimeout)?,
            TimeoutKind::Send => getsockopt(&fd, SendTimeout)?,
        };
        Ok(tv.tv_sec() as u64 * 1_000 + tv.tv_usec() as u64 / 1_000)
    }
}

/// Process-wide registry of [`FdRecord`]s, indexed by fd and grown on
/// demand.
pub struct FdManager {
    records: RwLock<Vec<Option<Arc<FdRecord>>>>,
}

impl FdManager {
    fn new() -> Self {
        Self {
            records: RwLock::new(vec![None; 64]),
        }
    }

    /// Look up the record for `fd`, creating it when `auto_create`.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdRecord>> {
        if fd < 0 {
            return None;
        }
        let index = fd as usize;
        {
            let records = self.records.read();
            match records.get(index) {
                Some(Some(record)) => return Some(record.clone()),
                Some(None) | None if !auto_create => return None,
                _ => {}
            }
        }

        let mut records = self.records.write();
        if index >= records.len() {
            records.resize(index * 3 / 2 + 1, None);
        }
        let record = records[index]
            .get_or_insert_with(|| Arc::new(FdRecord::probe(fd)))
            .clone();
        Some(record)
    }

    /// Drop the record for `fd` (after the fd is closed).
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut records = self.records.write();
        if let Some(slot) = records.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

/// The process-wide registry.
pub fn fd_manager() -> &'static FdManager {
    static MANAGER: OnceLock<FdManager> = OnceLock::new();
    MANAGER.get_or_init(FdManager::new)
}

/// Set `O_NONBLOCK` on `fd`, returning the previous flags.
pub fn set_nonblocking(fd: RawFd) -> nix::Result<OFlag> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    if !flags.contains(OFlag::O_NONBLOCK) {
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    }
    if let Some(record) = fd_manager().get(fd, false) {
        record.set_sys_nonblock(true);
    }
    Ok(flags)
}
