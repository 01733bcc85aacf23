//! Cooperative socket operations.
//!
//! These run inside a scheduled coroutine: each tries the non-blocking
//! syscall, and on `EAGAIN` registers the matching fd event with the
//! current coroutine and yields. Readiness (or a timeout) reschedules
//! the coroutine and the syscall is retried. Per-fd timeouts come from
//! the [`crate::fd`] registry; a timeout arms a condition timer that
//! cancels the registration, waking the coroutine to return
//! [`IoError::TimedOut`].
//!
//! This layer replaces blocking syscalls for code living on the
//! runtime; it never blocks the worker thread.

use crate::coroutine::Coroutine;
use crate::fd::{NO_TIMEOUT, TimeoutKind, fd_manager};
use crate::io::{Event, IoError, IoManager};
use crate::utils::ScopeGuard;
use nix::errno::Errno;
use nix::sys::socket::sockopt::{ReuseAddr, SocketError};
use nix::sys::socket::{
    AddressFamily, MsgFlags, SockFlag, SockType, SockaddrIn, accept4, bind, connect, getsockname,
    getsockopt, recv as sys_recv, send as sys_send, setsockopt, socket,
};
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Create a non-blocking TCP listener bound to `addr` with
/// `SO_REUSEADDR`; enough surface for servers built on the runtime, no
/// protocol layer attached.
pub fn listen_tcp(addr: SocketAddrV4) -> Result<OwnedFd, IoError> {
    let sock = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    setsockopt(&sock, ReuseAddr, &true)?;
    bind(sock.as_raw_fd(), &SockaddrIn::from(addr))?;
    // Safety: plain listen(2) on a socket we just created.
    if unsafe { libc::listen(sock.as_raw_fd(), 128) } != 0 {
        return Err(IoError::Os(Errno::last()));
    }
    fd_manager().get(sock.as_raw_fd(), true);
    Ok(sock)
}

/// Local address of a bound socket; how tests discover an ephemeral
/// port.
pub fn local_addr(fd: RawFd) -> Result<SockaddrIn, IoError> {
    Ok(getsockname::<SockaddrIn>(fd)?)
}

/// Accept one connection, parking the current coroutine until the
/// listener is readable. The accepted fd comes back non-blocking.
pub fn accept(io: &Arc<IoManager>, listen_fd: RawFd) -> Result<OwnedFd, IoError> {
    ensure_nonblocking(listen_fd);
    loop {
        match accept4(listen_fd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
            Ok(fd) => {
                fd_manager().get(fd, true);
                // Safety: accept4 returned a freshly opened fd we now
                // own.
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
            Err(Errno::EAGAIN) => {
                wait_event(io, listen_fd, Event::READ, op_timeout(listen_fd, TimeoutKind::Recv))?
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(IoError::Os(errno)),
        }
    }
}

/// Read from any fd (pipe, socket, ...), parking the current coroutine
/// until it is readable. `Ok(0)` means end of stream.
pub fn read(io: &Arc<IoManager>, fd: RawFd, buf: &mut [u8]) -> Result<usize, IoError> {
    ensure_nonblocking(fd);
    loop {
        // Safety: plain read(2) into a caller-provided buffer.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        match Errno::last() {
            Errno::EAGAIN => wait_event(io, fd, Event::READ, op_timeout(fd, TimeoutKind::Recv))?,
            Errno::EINTR => continue,
            errno => return Err(IoError::Os(errno)),
        }
    }
}

/// Write to any fd, parking the current coroutine until it is writable.
/// Returns the short count the kernel accepted.
pub fn write(io: &Arc<IoManager>, fd: RawFd, buf: &[u8]) -> Result<usize, IoError> {
    ensure_nonblocking(fd);
    loop {
        // Safety: plain write(2) from a caller-provided buffer.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        match Errno::last() {
            Errno::EAGAIN => wait_event(io, fd, Event::WRITE, op_timeout(fd, TimeoutKind::Send))?,
            Errno::EINTR => continue,
            errno => return Err(IoError::Os(errno)),
        }
    }
}

/// Receive bytes, parking the current coroutine until the socket is
/// readable. `Ok(0)` means the peer closed.
pub fn recv(io: &Arc<IoManager>, fd: RawFd, buf: &mut [u8]) -> Result<usize, IoError> {
    ensure_nonblocking(fd);
    loop {
        match sys_recv(fd, buf, MsgFlags::empty()) {
            Ok(n) => return Ok(n),
            Err(Errno::EAGAIN) => {
                wait_event(io, fd, Event::READ, op_timeout(fd, TimeoutKind::Recv))?
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(IoError::Os(errno)),
        }
    }
}

/// Send bytes, parking the current coroutine until the socket is
/// writable. Returns the short count the kernel accepted; callers loop
/// for full delivery.
pub fn send(io: &Arc<IoManager>, fd: RawFd, buf: &[u8]) -> Result<usize, IoError> {
    ensure_nonblocking(fd);
    loop {
        match sys_send(fd, buf, MsgFlags::MSG_NOSIGNAL) {
            Ok(n) => return Ok(n),
            Err(Errno::EAGAIN) => {
                wait_event(io, fd, Event::WRITE, op_timeout(fd, TimeoutKind::Send))?
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(IoError::Os(errno)),
        }
    }
}

/// Send the whole buffer, looping over short writes.
pub fn send_all(io: &Arc<IoManager>, fd: RawFd, mut buf: &[u8]) -> Result<(), IoError> {
    while !buf.is_empty() {
        let n = send(io, fd, buf)?;
        buf = &buf[n..];
    }
    Ok(())
}

/// Connect a non-blocking socket, parking the current coroutine until
/// the handshake finishes, then surfacing `SO_ERROR`.
pub fn connect_addr(
    io: &Arc<IoManager>,
    fd: RawFd,
    addr: &SockaddrIn,
    timeout_ms: Option<u64>,
) -> Result<(), IoError> {
    ensure_nonblocking(fd);
    match connect(fd, addr) {
        Ok(()) => return Ok(()),
        Err(Errno::EINPROGRESS) | Err(Errno::EINTR) => {}
        Err(errno) => return Err(IoError::Os(errno)),
    }

    wait_event(io, fd, Event::WRITE, timeout_ms)?;

    // Safety: the caller keeps `fd` open across the call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let err = getsockopt(&borrowed, SocketError)?;
    if err != 0 {
        return Err(IoError::Os(Errno::from_raw(err)));
    }
    Ok(())
}

/// Close a descriptor together with its metadata record. Records are
/// keyed by fd number, so one left behind would be inherited by
/// whatever descriptor the kernel hands that number to next.
pub fn close(fd: OwnedFd) {
    fd_manager().del(fd.as_raw_fd());
    drop(fd);
}

/// Timeout configured for `kind`-side operations on `fd`, if any.
fn op_timeout(fd: RawFd, kind: TimeoutKind) -> Option<u64> {
    fd_manager()
        .get(fd, false)
        .map(|record| record.timeout(kind))
        .filter(|&ms| ms != NO_TIMEOUT)
}

/// A blocking fd would park the whole worker inside the syscall instead
/// of this coroutine; force `O_NONBLOCK` before the first attempt. The
/// fd record remembers the switch so repeat calls skip the fcntl.
fn ensure_nonblocking(fd: RawFd) {
    let record = fd_manager().get(fd, true);
    if record.is_some_and(|r| r.sys_nonblock()) {
        return;
    }
    if let Err(errno) = crate::fd::set_nonblocking(fd) {
        tracing::warn!(fd, ?errno, "could not set O_NONBLOCK");
    }
}

/// Park the current coroutine until `event` fires on `fd`.
///
/// With a timeout, a condition timer cancels the registration when it
/// elapses first; `cancel_event`'s final trigger then reschedules the
/// coroutine and the wait reports [`IoError::TimedOut`]. The condition
/// anchor lives on this frame, so a late timer firing after the wait
/// has returned upgrades to nothing and cannot disturb a re-used fd.
fn wait_event(
    io: &Arc<IoManager>,
    fd: RawFd,
    event: Event,
    timeout_ms: Option<u64>,
) -> Result<(), IoError> {
    let Some(ms) = timeout_ms else {
        io.add_event(fd, event, None)?;
        Coroutine::current().yield_now();
        return Ok(());
    };

    let timed_out = Arc::new(AtomicBool::new(false));
    let anchor = Arc::new(());

    let weak_io = Arc::downgrade(io);
    let flag = timed_out.clone();
    let timer = io.add_condition_timer(
        ms,
        Arc::new(move || {
            flag.store(true, Ordering::SeqCst);
            if let Some(io) = weak_io.upgrade() {
                io.cancel_event(fd, event);
            }
        }),
        Arc::downgrade(&anchor),
        false,
    );
    // The timer must not outlive this wait on any path.
    let timer_for_guard = timer.clone();
    let _cancel_guard = ScopeGuard::new(move || {
        timer_for_guard.cancel();
    });

    io.add_event(fd, event, None)?;
    Coroutine::current().yield_now();

    if timed_out.load(Ordering::SeqCst) {
        return Err(IoError::TimedOut);
    }
    Ok(())
}
