//! The epoll-backed scheduler flavor.
//!
//! [`IoManager`] is the plain scheduler extended with an I/O reactor and
//! a timer manager: its idle coroutine blocks in `epoll_wait` instead of
//! busy-spinning, and fd readiness, timer expirations and cross-thread
//! tickles all turn into ordinary scheduler tasks.
//!
//! Every fd is registered edge-triggered; consumers drain until
//! `EAGAIN`. Registrations are one-shot from the user's point of view:
//! a trigger clears the interest and observing the next edge requires a
//! fresh [`IoManager::add_event`].

mod errors;
pub use errors::IoError;

mod fd_context;
pub use fd_context::Event;
use fd_context::FdContext;

pub mod ops;

#[cfg(test)]
mod tests;

use crate::context;
use crate::coroutine::{Coroutine, State};
use crate::fd;
use crate::scheduler::{Callback, Handle, Scheduler, Task, TaskPayload, init_caller};
use crate::timer::{Timer, TimerManager};
use anyhow::{Context as _, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::unistd::pipe2;
use parking_lot::RwLock;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Upper bound on readiness notifications consumed per `epoll_wait`.
const MAX_EVENTS: usize = 256;

/// Longest the reactor sleeps with nothing to wait for; bounds shutdown
/// latency when a tickle is missed.
const MAX_IDLE_WAIT_MS: u64 = 5_000;

/// Initial size of the fd-context vector.
const INITIAL_FD_CONTEXTS: usize = 32;

pub struct IoManager {
    scheduler: Scheduler,
    timers: Arc<TimerManager>,

    epoll: Epoll,
    /// Non-blocking wake channel; the read end sits edge-triggered in
    /// the epoll set so `tickle` can interrupt a sleeping reactor.
    wake_read: OwnedFd,
    wake_write: OwnedFd,

    /// Per-fd contexts, indexed by fd, grown on demand and never
    /// shrunk. epoll data carries the fd, so lookups come back through
    /// this vector rather than a pointer.
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,

    /// Registered (fd, event) interests that have not fired yet. The
    /// runtime refuses to stop while this is non-zero.
    pending_events: AtomicUsize,
}

impl IoManager {
    /// Create the manager and start its workers immediately. `workers`
    /// counts the caller thread when `use_caller` is set.
    pub fn new(workers: usize, use_caller: bool, name: impl Into<String>) -> Result<Arc<Self>> {
        let scheduler = Scheduler::new_core(workers, use_caller, name);
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("epoll_create")?;
        let (wake_read, wake_write) = pipe2(OFlag::O_NONBLOCK).context("wake pipe")?;

        let manager = Arc::new(Self {
            scheduler,
            timers: TimerManager::new(),
            epoll,
            wake_read,
            wake_write,
            fd_contexts: RwLock::new(Vec::new()),
            pending_events: AtomicUsize::new(0),
        });

        manager
            .epoll
            .add(
                &manager.wake_read,
                EpollEvent::new(
                    EpollFlags::EPOLLIN | EpollFlags::EPOLLET,
                    manager.wake_read.as_raw_fd() as u64,
                ),
            )
            .context("register wake pipe")?;

        manager.grow_contexts(INITIAL_FD_CONTEXTS);

        let weak: Weak<IoManager> = Arc::downgrade(&manager);
        manager.timers.set_front_notifier(move || {
            // A new front deadline invalidates the reactor's current
            // wait timeout.
            if let Some(io) = weak.upgrade() {
                io.tickle();
            }
        });

        init_caller(&Handle::Io(manager.clone()));
        manager.scheduler.start_with(&Handle::Io(manager.clone()))?;
        tracing::debug!(name = manager.name(), "io manager running");
        Ok(manager)
    }

    pub fn name(&self) -> &str {
        self.scheduler.name()
    }

    pub(crate) fn core(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn handle(self: &Arc<Self>) -> Handle {
        Handle::Io(self.clone())
    }

    /// The io manager the current thread dispatches for, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        match context::current_scheduler() {
            Some(Handle::Io(io)) => Some(io),
            _ => None,
        }
    }

    /// Append a task, waking a sleeping worker through the pipe if the
    /// queue was empty.
    pub fn schedule(self: &Arc<Self>, task: impl Into<Task>) {
        self.handle().schedule(task);
    }

    /// Stop once every task has drained and no fd event or timer is
    /// pending.
    pub fn stop(self: &Arc<Self>) {
        self.handle().stop();
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    // Timer surface, delegated to the owned manager so callbacks wake
    // the reactor through the front notifier.

    pub fn add_timer(&self, period_ms: u64, callback: Callback, recurring: bool) -> Arc<Timer> {
        self.timers.add_timer(period_ms, callback, recurring)
    }

    pub fn add_condition_timer<T: ?Sized + Send + Sync + 'static>(
        &self,
        period_ms: u64,
        callback: Callback,
        condition: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer> {
        self.timers
            .add_condition_timer(period_ms, callback, condition, recurring)
    }

    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    /// Register interest in `event` on `fd`. The handler is `callback`
    /// if given, otherwise the currently running coroutine, which is
    /// rescheduled (once) when the event fires. The fd is made
    /// non-blocking.
    ///
    /// Fails if the same event is already registered; that is a caller
    /// bug and also trips a debug assertion.
    pub fn add_event(
        self: &Arc<Self>,
        fd: RawFd,
        event: Event,
        callback: Option<Callback>,
    ) -> Result<(), IoError> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "add_event takes exactly one of READ or WRITE"
        );

        let fd_context = self
            .context_for(fd, true)
            .expect("fd context exists after growth");
        let mut inner = fd_context.inner.lock();

        if inner.events.contains(event) {
            tracing::error!(fd, ?event, registered = ?inner.events, "duplicate event registration");
            debug_assert!(false, "duplicate event registration on fd");
            return Err(IoError::EventExists { fd, event });
        }

        self.epoll_update(fd, inner.events, inner.events | event)?;
        let _ = fd::set_nonblocking(fd);

        self.pending_events.fetch_add(1, Ordering::SeqCst);
        inner.events |= event;

        let event_context = inner.context_mut(event);
        debug_assert!(
            event_context.scheduler.is_none() && event_context.payload.is_none(),
            "event context of an unregistered event must be clear"
        );
        event_context.scheduler =
            Some(context::current_scheduler().unwrap_or_else(|| Handle::Io(self.clone())));
        event_context.payload = Some(match callback {
            Some(cb) => TaskPayload::Call(cb),
            None => {
                let current = Coroutine::current();
                debug_assert_eq!(current.state(), State::Running);
                TaskPayload::Coroutine(current)
            }
        });

        tracing::trace!(fd, ?event, "event added");
        Ok(())
    }

    /// Remove `event` from `fd` without running its handler. Returns
    /// `false` if it was not registered.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(fd_context) = self.context_for(fd, false) else {
            return false;
        };
        let mut inner = fd_context.inner.lock();
        if !inner.events.contains(event) {
            return false;
        }

        let remaining = inner.events - event;
        if self.epoll_update(fd, inner.events, remaining).is_err() {
            return false;
        }

        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        inner.events = remaining;
        inner.context_mut(event).reset();
        true
    }

    /// Remove `event` from `fd`, running its handler one final time.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(fd_context) = self.context_for(fd, false) else {
            return false;
        };
        let mut inner = fd_context.inner.lock();
        if !inner.events.contains(event) {
            return false;
        }

        let remaining = inner.events - event;
        if self.epoll_update(fd, inner.events, remaining).is_err() {
            return false;
        }

        inner.trigger(event);
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Remove every registered event on `fd`, running each handler one
    /// final time, Read first, then Write. The fd leaves the epoll set
    /// even if the kernel-side removal fails.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(fd_context) = self.context_for(fd, false) else {
            return false;
        };
        let mut inner = fd_context.inner.lock();
        if inner.events.is_empty() {
            return false;
        }

        if let Err(err) = self.epoll_update(fd, inner.events, Event::empty()) {
            tracing::warn!(fd, %err, "cancel_all: kernel-side removal failed");
        }

        if inner.events.contains(Event::READ) {
            inner.trigger(Event::READ);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        if inner.events.contains(Event::WRITE) {
            inner.trigger(Event::WRITE);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }

        debug_assert!(inner.events.is_empty());
        true
    }

    /// Put `fd` into non-blocking mode, as `add_event` does implicitly.
    pub fn set_nonblocking(fd: RawFd) -> nix::Result<OFlag> {
        fd::set_nonblocking(fd)
    }

    /// Wake one sleeping worker. A no-op while every worker is busy:
    /// they re-examine the queue on their next dispatch pass anyway.
    pub(crate) fn tickle(&self) {
        if !self.scheduler.has_idle_workers() {
            return;
        }
        // Safety: one-byte write to our own open pipe fd.
        let n = unsafe { libc::write(self.wake_write.as_raw_fd(), b"T".as_ptr().cast(), 1) };
        if n != 1 {
            let errno = Errno::last();
            // A full pipe already guarantees a pending wake-up.
            if errno != Errno::EAGAIN {
                tracing::error!(?errno, "wake pipe write failed");
            }
        }
    }

    /// The io flavor may stop only when the scheduler has drained *and*
    /// no fd event or timer remains.
    pub(crate) fn stopping(&self) -> bool {
        self.pending_events.load(Ordering::SeqCst) == 0
            && !self.timers.has_timer()
            && self.scheduler.stopping_core()
    }

    /// Reactor loop, run as each worker's idle coroutine.
    pub(crate) fn run_reactor(self: &Arc<Self>) {
        tracing::debug!(name = self.name(), "reactor running");
        let mut events = vec![EpollEvent::empty(); MAX_EVENTS];
        let mut expired: Vec<Callback> = Vec::new();

        loop {
            if self.stopping() {
                tracing::debug!(name = self.name(), "reactor stopping");
                break;
            }

            let timeout_ms = self.timers.next_timer_ms().min(MAX_IDLE_WAIT_MS);
            let ready = loop {
                match self.epoll.wait(&mut events, EpollTimeout::from(timeout_ms as u16)) {
                    Ok(n) => break n,
                    Err(Errno::EINTR) => continue,
                    Err(errno) => {
                        tracing::error!(?errno, "epoll_wait failed");
                        break 0;
                    }
                }
            };

            expired.clear();
            self.timers.list_expired(&mut expired);
            for callback in expired.drain(..) {
                self.handle().schedule(Task::from(callback));
            }

            for ready_event in &events[..ready] {
                if ready_event.data() == self.wake_read.as_raw_fd() as u64 {
                    self.drain_wake_pipe();
                    continue;
                }

                let fd = ready_event.data() as RawFd;
                let Some(fd_context) = self.context_for(fd, false) else {
                    continue;
                };
                let mut inner = fd_context.inner.lock();

                let mut flags = ready_event.events();
                if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
                    // An error or hang-up must fire both directions the
                    // fd still cares about, or a registration could
                    // stall forever.
                    flags |= (EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT) & inner.events.to_epoll();
                }

                let fired = Event::from_epoll(flags) & inner.events;
                if fired.is_empty() {
                    continue;
                }

                // Re-register what did not fire before running handlers.
                let remaining = inner.events - fired;
                if self.epoll_update(fd, inner.events, remaining).is_err() {
                    continue;
                }

                if fired.contains(Event::READ) {
                    inner.trigger(Event::READ);
                    self.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
                if fired.contains(Event::WRITE) {
                    inner.trigger(Event::WRITE);
                    self.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Hand control back so the dispatcher runs whatever we just
            // scheduled. This frame is only torn down after the loop
            // breaks and the coroutine terminates, so it must not park a
            // strong self-reference across the yield.
            let idle = Coroutine::current();
            let raw = Arc::as_ptr(&idle);
            drop(idle);
            // Safety: the dispatcher owns the idle coroutine and keeps
            // it alive across this suspension.
            unsafe { (*raw).yield_now() };
        }
    }

    /// Apply a registration change to the kernel. State transitions are
    /// derived from the old and new interest sets; on failure nothing
    /// has been mutated and the error is reported to the caller.
    fn epoll_update(&self, fd: RawFd, old: Event, new: Event) -> Result<(), IoError> {
        // Safety: the caller owns `fd` and keeps it open for the
        // duration of the call.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let result = if new.is_empty() {
            self.epoll.delete(borrowed)
        } else {
            let mut epoll_event = EpollEvent::new(EpollFlags::EPOLLET | new.to_epoll(), fd as u64);
            if old.is_empty() {
                self.epoll.add(borrowed, epoll_event)
            } else {
                self.epoll.modify(borrowed, &mut epoll_event)
            }
        };
        result.map_err(|source| {
            tracing::error!(fd, ?old, ?new, ?source, "epoll_ctl failed");
            IoError::EpollCtl { fd, source }
        })
    }

    /// Look up the context for `fd`, growing the vector (x1.5) when
    /// `create` is set.
    fn context_for(&self, fd: RawFd, create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let index = fd as usize;
        {
            let contexts = self.fd_contexts.read();
            if index < contexts.len() {
                return Some(contexts[index].clone());
            }
        }
        if !create {
            return None;
        }
        self.grow_contexts(index * 3 / 2 + 1);
        Some(self.fd_contexts.read()[index].clone())
    }

    fn grow_contexts(&self, size: usize) {
        let mut contexts = self.fd_contexts.write();
        while contexts.len() < size {
            let next = contexts.len() as RawFd;
            contexts.push(Arc::new(FdContext::new(next)));
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            // Safety: reading our own non-blocking pipe into a local
            // buffer; edge triggering requires draining it dry.
            let n = unsafe {
                libc::read(
                    self.wake_read.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.scheduler)
            .field("timers", &self.timers)
            .field("pending_events", &self.pending_events.load(Ordering::Relaxed))
            .finish()
    }
}
