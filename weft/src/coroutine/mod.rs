//! Stackful coroutines.
//!
//! A [`Coroutine`] is a user-space execution context with its own mapped
//! stack, switched explicitly: `resume()` enters it, `yield_now()` leaves
//! it. The first coroutine of every thread is the "primordial" one: the
//! thread's native stack adopted as a coroutine so there is always a swap
//! partner to return to. Coroutines that participate in scheduling
//! (`run_in_scheduler`) swap with the thread's dispatcher coroutine
//! instead, so a worker's task-pull loop stays out of the picture for
//! plain, hand-driven coroutines.
//!
//! Hand-driven coroutines cannot nest: a coroutine that resumes another
//! coroutine directly would clobber the primordial's saved context. Run
//! one coroutine from inside another by scheduling it instead.

mod stack;
pub use stack::DEFAULT_STACK_SIZE;
use stack::Stack;

use crate::arch::{seed_stack, weft_swap_context};
use crate::context;
use parking_lot::Mutex;
use std::cell::{RefCell, UnsafeCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Entry callback of a coroutine. Consumed on first run; `reset`
/// installs a fresh one.
pub type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// Execution state of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Runnable: freshly created, reset, or suspended mid-execution.
    Ready = 0,
    /// Currently executing on some thread.
    Running = 1,
    /// Entry callback has returned; only `reset` revives it.
    Term = 2,
}

impl From<u8> for State {
    fn from(v: u8) -> Self {
        match v {
            0 => State::Ready,
            1 => State::Running,
            2 => State::Term,
            _ => unreachable!("invalid coroutine state {v}"),
        }
    }
}

/// Process-wide id source and live-coroutine counter.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static LIVE_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// The coroutine currently executing on this thread.
    static CURRENT: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
    /// The adopted native-stack coroutine of this thread.
    static PRIMORDIAL: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
}

pub struct Coroutine {
    id: u64,
    state: AtomicU8,
    /// Whether yield swaps back to the thread's dispatcher coroutine
    /// (scheduled coroutines) or to the thread's primordial coroutine
    /// (hand-driven coroutines and the caller-thread dispatcher itself).
    run_in_scheduler: bool,
    /// `None` only for the primordial coroutine.
    stack: Option<Stack>,
    /// Saved stack pointer while suspended. Garbage while Running.
    sp: UnsafeCell<*mut u8>,
    entry: Mutex<Option<EntryFn>>,
}

// Safety: `sp` is only read or written by the context-switch paths
// (`resume`/`yield_now`), and those run on exactly one thread at a time:
// the dispatcher never resumes a Running coroutine, so a coroutine's sp
// is touched either by the thread it runs on or, while fully suspended,
// by the single thread that picks it up next.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

impl Coroutine {
    /// Create a coroutine with the default stack size that participates
    /// in scheduler dispatch.
    pub fn new(entry: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Self::with_options(entry, 0, true)
    }

    /// Create a coroutine with an explicit stack size (`0` means
    /// [`DEFAULT_STACK_SIZE`]) and yield-partner selection.
    ///
    /// Stack mapping failure is fatal: a runtime that cannot map a
    /// coroutine stack cannot make progress.
    pub fn with_options(
        entry: impl FnOnce() + Send + 'static,
        stack_size: usize,
        run_in_scheduler: bool,
    ) -> Arc<Self> {
        let size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
        let stack = Stack::alloc(size).expect("failed to map coroutine stack");
        let sp = unsafe { seed_stack(stack.top(), trampoline) };

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_COUNT.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(id, size = stack.size(), "coroutine created");

        Arc::new(Self {
            id,
            state: AtomicU8::new(State::Ready as u8),
            run_in_scheduler,
            stack: Some(stack),
            sp: UnsafeCell::new(sp),
            entry: Mutex::new(Some(Box::new(entry))),
        })
    }

    /// Adopt the calling thread's native stack as this thread's
    /// primordial coroutine. Only called when the thread has no
    /// coroutine yet.
    fn adopt_thread() -> Arc<Self> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_COUNT.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(id, "primordial coroutine adopted");

        let co = Arc::new(Self {
            id,
            state: AtomicU8::new(State::Running as u8),
            run_in_scheduler: false,
            stack: None,
            sp: UnsafeCell::new(ptr::null_mut()),
            entry: Mutex::new(None),
        });

        CURRENT.with(|c| {
            let mut cur = c.borrow_mut();
            assert!(cur.is_none(), "thread already has a running coroutine");
            *cur = Some(co.clone());
        });
        PRIMORDIAL.with(|p| *p.borrow_mut() = Some(co.clone()));
        co
    }

    /// The coroutine currently running on this thread, adopting the
    /// thread as a primordial coroutine on first use.
    pub fn current() -> Arc<Coroutine> {
        if let Some(co) = CURRENT.with(|c| c.borrow().clone()) {
            return co;
        }
        Self::adopt_thread()
    }

    /// Id of the current coroutine, `0` if the thread has none yet.
    pub fn current_id() -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map_or(0, |co| co.id))
    }

    /// Number of live coroutines in the process, primordials included.
    pub fn total_count() -> u64 {
        LIVE_COUNT.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Enter this coroutine from the current one.
    ///
    /// The execution context of the caller is saved into the swap
    /// partner (dispatcher or primordial, per `run_in_scheduler`), so
    /// control comes back here when this coroutine yields.
    pub fn resume(self: &Arc<Self>) {
        assert_eq!(
            self.state(),
            State::Ready,
            "coroutine {} resumed while not Ready",
            self.id
        );
        let partner = self.swap_partner();
        assert!(
            !Arc::ptr_eq(self, &partner),
            "coroutine {} cannot resume itself",
            self.id
        );

        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
        self.set_state(State::Running);

        // Safety: `partner.sp` is writable storage for the outgoing
        // context, and `self.sp` holds either a seeded frame or the sp
        // stored by this coroutine's last yield; its stack is alive
        // because `self` is.
        unsafe { weft_swap_context(partner.sp.get(), *self.sp.get()) };

        // The coroutine yielded (or terminated) back to us. The
        // Running -> Ready transition happens here, on the thread that
        // just executed the yield's context save: publishing Ready any
        // earlier would let another worker resume off a stale stack
        // pointer.
        if self.state() == State::Running {
            self.set_state(State::Ready);
        }
    }

    /// Leave this coroutine, switching back to its swap partner.
    ///
    /// Valid while Running (suspends, state becomes Ready) and from the
    /// trampoline once Term.
    pub fn yield_now(&self) {
        let st = self.state();
        assert!(
            st == State::Running || st == State::Term,
            "coroutine {} yielded while {:?}",
            self.id,
            st
        );

        let primordial = ensure_primordial();
        CURRENT.with(|c| *c.borrow_mut() = Some(primordial.clone()));
        // A Running coroutine stays Running until the resumer observes
        // the completed swap; see `resume`.

        let partner = if self.run_in_scheduler {
            context::dispatcher().expect("yield_now: thread has no dispatcher coroutine")
        } else {
            primordial
        };

        // Safety: symmetric to `resume`: we save into our own sp slot
        // and jump to the partner's saved context.
        unsafe { weft_swap_context(self.sp.get(), *partner.sp.get()) };
    }

    /// Rebind a terminated coroutine to a new entry callback, reusing
    /// its stack.
    pub fn reset(&self, entry: impl FnOnce() + Send + 'static) {
        let stack = self
            .stack
            .as_ref()
            .expect("cannot reset a primordial coroutine");
        assert_eq!(
            self.state(),
            State::Term,
            "coroutine {} reset while not Term",
            self.id
        );

        *self.entry.lock() = Some(Box::new(entry));
        // Safety: we own the stack and the coroutine is not running.
        unsafe { *self.sp.get() = seed_stack(stack.top(), trampoline) };
        self.set_state(State::Ready);
    }

    fn swap_partner(self: &Arc<Self>) -> Arc<Coroutine> {
        if self.run_in_scheduler {
            context::dispatcher().expect("resume: thread has no dispatcher coroutine")
        } else {
            ensure_primordial()
        }
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        LIVE_COUNT.fetch_sub(1, Ordering::Relaxed);
        tracing::trace!(id = self.id, "coroutine destroyed");

        if self.stack.is_some() {
            // A stackful coroutine must have run to completion; dropping
            // a suspended one would strand its frames without unwinding.
            if self.state() != State::Term && !std::thread::panicking() {
                panic!(
                    "coroutine {} dropped while {:?}",
                    self.id,
                    self.state()
                );
            }
        } else if !std::thread::panicking() {
            // Primordial: lives as long as its thread, so it is Running.
            assert_eq!(self.state(), State::Running);
        }
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("run_in_scheduler", &self.run_in_scheduler)
            .field("primordial", &self.stack.is_none())
            .finish()
    }
}

fn ensure_primordial() -> Arc<Coroutine> {
    if let Some(co) = PRIMORDIAL.with(|p| p.borrow().clone()) {
        return co;
    }
    Coroutine::adopt_thread()
}

/// Entry point of every stackful coroutine, reached by the first swap
/// into a seeded stack. Runs the entry callback, marks the coroutine
/// Term and yields one final time.
extern "C" fn trampoline() {
    let cur = Coroutine::current();
    let entry = cur
        .entry
        .lock()
        .take()
        .expect("coroutine resumed without an entry callback");

    if let Err(payload) = catch_unwind(AssertUnwindSafe(entry)) {
        // There is no caller frame to unwind into on this stack; a
        // panicking task takes the process down, loudly.
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".into());
        tracing::error!(id = cur.id, %msg, "FATAL: coroutine panicked");
        eprintln!("FATAL: coroutine {} panicked: {msg}", cur.id);
        std::process::abort();
    }

    cur.set_state(State::Term);

    // The final yield must not happen while this frame still owns a
    // strong reference, or the coroutine leaks together with its stack:
    // this frame is never unwound. Whoever resumed us still holds one.
    let raw = Arc::as_ptr(&cur);
    drop(cur);
    // Safety: see above: the resuming context keeps the allocation
    // alive until `resume()` returns over there.
    unsafe { (*raw).yield_now() };
    unreachable!("terminated coroutine resumed");
}
