//! weft: a stackful coroutine runtime for Linux.
//!
//! The crate layers four pieces: a stackful [`Coroutine`] primitive with
//! explicit resume/yield, an N:M [`Scheduler`] multiplexing coroutines
//! over a fixed thread pool, a [`TimerManager`] ordering deadlines on
//! the monotonic raw clock, and the epoll-backed [`IoManager`] whose
//! idle coroutine turns fd readiness and timer expirations into
//! scheduler wake-ups.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use weft::{IoManager, Task};
//!
//! let io = IoManager::new(2, false, "example").unwrap();
//! let done = Arc::new(AtomicBool::new(false));
//! let flag = done.clone();
//! io.schedule(Task::callback(move || flag.store(true, Ordering::SeqCst)));
//! # while !done.load(Ordering::SeqCst) {}
//! io.stop();
//! ```

pub(crate) mod arch;

pub mod coroutine;
pub use coroutine::{Coroutine, DEFAULT_STACK_SIZE, State};

pub(crate) mod context;

pub mod scheduler;
pub use scheduler::{Callback, Handle, Scheduler, Task, TaskPayload, WorkerId};

pub mod timer;
pub use timer::{NO_TIMER, Timer, TimerManager};

pub mod io;
pub use io::{Event, IoError, IoManager};

pub mod fd;
pub use fd::{FdManager, FdRecord, fd_manager};

pub mod utils;
pub use utils::now_ms;

#[cfg(test)]
pub(crate) mod test_utils;
