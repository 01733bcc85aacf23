use crate::coroutine::Coroutine;
use std::fmt;
use std::sync::Arc;

/// A schedulable callback. `Arc<dyn Fn>` rather than a boxed `FnOnce`
/// because timers re-fire the same callback and event contexts clone it
/// when re-arming.
pub type Callback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Index of a worker inside one scheduler. With `use_caller` the caller
/// thread is worker `0` and spawned workers follow; without it the
/// spawned workers are `0..N`.
pub type WorkerId = usize;

/// What a task runs: an existing coroutine, or a callback the dispatcher
/// wraps in its reusable callback coroutine.
#[derive(Clone)]
pub enum TaskPayload {
    Coroutine(Arc<Coroutine>),
    Call(Callback),
}

/// One entry in the scheduler queue: a payload plus an optional worker
/// affinity. A task is created when submitted and drained exactly once.
#[derive(Clone)]
pub struct Task {
    payload: TaskPayload,
    affinity: Option<WorkerId>,
}

impl Task {
    pub fn callback(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            payload: TaskPayload::Call(Arc::new(f)),
            affinity: None,
        }
    }

    pub fn coroutine(co: Arc<Coroutine>) -> Self {
        Self {
            payload: TaskPayload::Coroutine(co),
            affinity: None,
        }
    }

    /// Pin this task to one worker; only that worker's dispatcher will
    /// pick it up.
    pub fn on_worker(mut self, worker: WorkerId) -> Self {
        self.affinity = Some(worker);
        self
    }

    pub fn affinity(&self) -> Option<WorkerId> {
        self.affinity
    }

    pub(crate) fn payload(&self) -> &TaskPayload {
        &self.payload
    }

    pub(crate) fn into_payload(self) -> TaskPayload {
        self.payload
    }
}

impl From<Arc<Coroutine>> for Task {
    fn from(co: Arc<Coroutine>) -> Self {
        Task::coroutine(co)
    }
}

impl From<Callback> for Task {
    fn from(cb: Callback) -> Self {
        Task {
            payload: TaskPayload::Call(cb),
            affinity: None,
        }
    }
}

impl From<TaskPayload> for Task {
    fn from(payload: TaskPayload) -> Self {
        Task {
            payload,
            affinity: None,
        }
    }
}

impl fmt::Debug for TaskPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPayload::Coroutine(co) => write!(f, "Coroutine({})", co.id()),
            TaskPayload::Call(_) => write!(f, "Call(<fn>)"),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("payload", &self.payload)
            .field("affinity", &self.affinity)
            .finish()
    }
}
