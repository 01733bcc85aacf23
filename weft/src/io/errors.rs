use crate::io::Event;
use std::os::fd::RawFd;

/// Errors surfaced by the fd-event API and the cooperative I/O
/// operations. Precondition violations (wrong coroutine state, stopping
/// rules) are panics, not errors; this type covers what a correct
/// caller can still hit at runtime.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum IoError {
    /// The same event is already registered on this fd; a caller bug.
    #[error("event {event:?} already registered on fd {fd}")]
    EventExists { fd: RawFd, event: Event },

    /// The kernel rejected an epoll_ctl; the fd's registration state is
    /// unchanged.
    #[error("epoll_ctl on fd {fd} failed: {source}")]
    EpollCtl {
        fd: RawFd,
        #[source]
        source: nix::errno::Errno,
    },

    /// A cooperative operation ran past its configured timeout.
    #[error("operation timed out")]
    TimedOut,

    /// Any other OS-level failure.
    #[error("os error: {0}")]
    Os(#[from] nix::errno::Errno),
}
