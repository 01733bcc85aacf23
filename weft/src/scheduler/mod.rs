//! Hybrid N:M coroutine scheduler.
//!
//! A [`Scheduler`] multiplexes coroutine and callback tasks over a fixed
//! pool of worker threads. With `use_caller` the constructing thread
//! contributes one worker slot: a dedicated dispatcher coroutine is
//! created for it and resumed by [`Scheduler::stop`] to drain whatever
//! is left in the queue.
//!
//! The plain scheduler busy-spins between its dispatcher and idle
//! coroutines when the queue is empty; the epoll-backed flavor lives in
//! [`crate::io`] and parks in the kernel instead.

mod task;
pub use task::{Callback, Task, TaskPayload, WorkerId};

mod handle;
pub use handle::Handle;
pub(crate) use handle::HandleRef;

mod dispatch;
pub(crate) use dispatch::{dispatch, dispatcher_entry};


use crate::context;
use crate::coroutine::Coroutine;
use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

pub struct Scheduler {
    name: String,
    /// OS threads this scheduler spawns (excludes the caller slot).
    pub(crate) worker_threads: usize,
    pub(crate) use_caller: bool,

    /// FIFO task queue with affinity hints, scanned from the head.
    pub(crate) queue: Mutex<VecDeque<Task>>,
    pub(crate) threads: Mutex<Vec<thread::JoinHandle<()>>>,

    /// Workers currently running a task.
    pub(crate) active: AtomicUsize,
    /// Workers currently parked in their idle coroutine.
    pub(crate) idle: AtomicUsize,

    pub(crate) stop_requested: AtomicBool,
    started: AtomicBool,

    /// Dispatcher coroutine of the caller thread (`use_caller` only).
    pub(crate) caller_dispatcher: OnceLock<Arc<Coroutine>>,
}

impl Scheduler {
    /// Create a plain scheduler. `workers` counts the caller thread when
    /// `use_caller` is set, so `workers - 1` OS threads get spawned.
    pub fn new(workers: usize, use_caller: bool, name: impl Into<String>) -> Arc<Self> {
        let scheduler = Arc::new(Self::new_core(workers, use_caller, name));
        init_caller(&Handle::Plain(scheduler.clone()));
        scheduler
    }

    /// Construct the core without binding the caller thread; the io
    /// flavor wraps this and finishes initialization with its own
    /// handle.
    pub(crate) fn new_core(workers: usize, use_caller: bool, name: impl Into<String>) -> Self {
        assert!(workers >= 1, "scheduler needs at least one worker");
        Self {
            name: name.into(),
            worker_threads: workers - use_caller as usize,
            use_caller,
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
            caller_dispatcher: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The scheduler handle bound to the current thread, if the thread
    /// dispatches for one (or created one with `use_caller`).
    pub fn current() -> Option<Handle> {
        context::current_scheduler()
    }

    /// The current thread's dispatcher coroutine.
    pub fn dispatcher() -> Option<Arc<Coroutine>> {
        context::dispatcher()
    }

    /// Append a task; wakes a worker if the queue was empty.
    pub fn schedule(&self, task: impl Into<Task>) {
        if self.enqueue(task.into()) {
            tracing::trace!(name = %self.name, "tickle scheduler");
        }
    }

    /// Returns whether the queue was empty (i.e. a tickle is due).
    pub(crate) fn enqueue(&self, task: Task) -> bool {
        let mut queue = self.queue.lock();
        let was_empty = queue.is_empty();
        queue.push_back(task);
        was_empty
    }

    /// Spawn the worker threads. A runtime that cannot spawn its pool
    /// cannot run anything, so spawn failure is fatal.
    pub fn start(self: &Arc<Self>) {
        self.start_with(&Handle::Plain(self.clone()))
            .expect("failed to start scheduler");
    }

    pub(crate) fn start_with(&self, handle: &Handle) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.stop_requested.load(Ordering::SeqCst) {
            tracing::error!(name = %self.name, "start after stop is ignored");
            return Ok(());
        }
        tracing::debug!(name = %self.name, workers = self.worker_threads, "scheduler starting");

        let mut threads = self.threads.lock();
        let base = self.use_caller as usize;
        for i in 0..self.worker_threads {
            let worker_handle = handle.clone();
            let worker_id = base + i;
            let thread = thread::Builder::new()
                .name(format!("{}-{}", self.name, worker_id))
                .spawn(move || dispatcher_entry(worker_handle, worker_id))
                .context("failed to spawn worker thread")?;
            threads.push(thread);
        }
        Ok(())
    }

    /// Mark stopping, wake every worker, drain remaining tasks on the
    /// caller dispatcher (with `use_caller`), and join all workers.
    /// Returns once every dequeued task has run to completion or to a
    /// yield that leaves no further scheduling.
    pub fn stop(self: &Arc<Self>) {
        dispatch::stop(&Handle::Plain(self.clone()));
    }

    /// True iff stop was requested, the queue is empty, and no worker is
    /// mid-task.
    pub(crate) fn stopping_core(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
            && self.active.load(Ordering::SeqCst) == 0
            && self.queue.lock().is_empty()
    }

    pub(crate) fn has_idle_workers(&self) -> bool {
        self.idle.load(Ordering::SeqCst) > 0
    }

    /// Idle coroutine of the plain scheduler: hand control straight back
    /// so the dispatcher re-polls the queue.
    pub(crate) fn run_busy_idle(&self) {
        while !self.stopping_core() {
            Coroutine::current().yield_now();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        tracing::debug!(name = %self.name, "scheduler dropped");
        if !self.stop_requested.load(Ordering::SeqCst) && !thread::panicking() {
            // Dropping a scheduler that was never stopped strands its
            // workers; surface the bug instead of hanging in a join.
            panic!("scheduler '{}' dropped without stop()", self.name);
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("worker_threads", &self.worker_threads)
            .field("use_caller", &self.use_caller)
            .field("queued", &self.queue.lock().len())
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("idle", &self.idle.load(Ordering::Relaxed))
            .finish()
    }
}

/// Bind the caller thread into a `use_caller` scheduler: adopt the
/// primordial coroutine, claim the thread's scheduler slot, and create
/// the caller dispatcher coroutine that `stop()` later resumes.
pub(crate) fn init_caller(handle: &Handle) {
    let core = handle.core();
    if !core.use_caller {
        return;
    }

    Coroutine::current();
    assert!(
        context::current_scheduler().is_none(),
        "thread already dispatches for a scheduler"
    );
    context::set_scheduler(handle.downgrade());

    // Weak capture: the dispatcher coroutine is owned by the scheduler
    // it would otherwise keep alive.
    let weak = handle.downgrade();
    let dispatcher = Coroutine::with_options(
        move || {
            if let Some(handle) = weak.upgrade() {
                dispatch(&handle);
            }
        },
        0,
        false,
    );
    core.caller_dispatcher
        .set(dispatcher.clone())
        .expect("caller dispatcher initialized twice");
    context::set_dispatcher(dispatcher);
    context::set_worker_id(0);
}
