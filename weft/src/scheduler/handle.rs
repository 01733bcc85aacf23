use crate::io::IoManager;
use crate::scheduler::{Scheduler, Task};
use std::sync::{Arc, Weak};

/// A cloneable, type-erased reference to a running scheduler flavor.
///
/// The plain scheduler and the [`IoManager`] share the dispatcher loop
/// but differ in how they tickle workers, decide when they may stop, and
/// what their idle coroutine does. The handle hides the flavor behind an
/// enum; matching on it keeps thread-local storage and event contexts
/// free of trait objects.
#[derive(Clone)]
pub enum Handle {
    Plain(Arc<Scheduler>),
    Io(Arc<IoManager>),
}

impl Handle {
    pub(crate) fn core(&self) -> &Scheduler {
        match self {
            Handle::Plain(s) => s,
            Handle::Io(io) => io.core(),
        }
    }

    pub fn name(&self) -> &str {
        self.core().name()
    }

    /// Append a task to the queue, waking one worker if the queue was
    /// empty. Safe from any thread and from inside a running coroutine.
    pub fn schedule(&self, task: impl Into<Task>) {
        if self.core().enqueue(task.into()) {
            self.tickle();
        }
    }

    /// Stop the underlying scheduler; see [`Scheduler::stop`].
    pub fn stop(&self) {
        super::dispatch::stop(self);
    }

    /// Wake a worker so it re-examines the queue or the reactor
    /// deadline.
    pub(crate) fn tickle(&self) {
        match self {
            // Plain workers busy-spin between dispatcher and idle, so a
            // new task is observed on their next pass.
            Handle::Plain(_) => tracing::trace!("tickle scheduler"),
            Handle::Io(io) => io.tickle(),
        }
    }

    /// Whether the runtime has fully drained and may shut down.
    pub(crate) fn stopping(&self) -> bool {
        match self {
            Handle::Plain(s) => s.stopping_core(),
            Handle::Io(io) => io.stopping(),
        }
    }

    /// Body of the per-worker idle coroutine.
    pub(crate) fn run_idle(&self) {
        match self {
            Handle::Plain(s) => s.run_busy_idle(),
            Handle::Io(io) => io.run_reactor(),
        }
    }

    pub(crate) fn downgrade(&self) -> HandleRef {
        match self {
            Handle::Plain(s) => HandleRef::Plain(Arc::downgrade(s)),
            Handle::Io(io) => HandleRef::Io(Arc::downgrade(io)),
        }
    }

    /// Identity of the underlying scheduler core, for "is this thread
    /// dispatching for me" checks.
    pub(crate) fn is(&self, core: &Scheduler) -> bool {
        std::ptr::eq(self.core(), core)
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flavor = match self {
            Handle::Plain(_) => "plain",
            Handle::Io(_) => "io",
        };
        f.debug_struct("Handle")
            .field("flavor", &flavor)
            .field("name", &self.name())
            .finish()
    }
}

/// Weak counterpart of [`Handle`], held by thread-local storage so a
/// worker's TLS never keeps its runtime alive.
pub(crate) enum HandleRef {
    Plain(Weak<Scheduler>),
    Io(Weak<IoManager>),
}

impl HandleRef {
    pub(crate) fn upgrade(&self) -> Option<Handle> {
        match self {
            HandleRef::Plain(w) => w.upgrade().map(Handle::Plain),
            HandleRef::Io(w) => w.upgrade().map(Handle::Io),
        }
    }
}
