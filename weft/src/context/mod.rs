//! Thread-local runtime context.
//!
//! Every worker thread (and the caller thread of a `use_caller`
//! scheduler) carries three pieces of state: which scheduler it belongs
//! to, its worker id, and its dispatcher coroutine, the swap target for
//! scheduled coroutines. The scheduler reference is stored weak and
//! type-erased behind [`HandleRef`] so TLS never keeps a runtime alive
//! and never needs dynamic dispatch.

use crate::coroutine::Coroutine;
use crate::scheduler::{Handle, HandleRef, WorkerId};
use std::cell::RefCell;
use std::sync::Arc;

#[derive(Default)]
struct ThreadContext {
    scheduler: Option<HandleRef>,
    dispatcher: Option<Arc<Coroutine>>,
    worker_id: Option<WorkerId>,
}

thread_local! {
    static CONTEXT: RefCell<ThreadContext> = RefCell::new(ThreadContext::default());
}

/// The scheduler this thread dispatches for, if any.
pub(crate) fn current_scheduler() -> Option<Handle> {
    CONTEXT.with(|ctx| ctx.borrow().scheduler.as_ref().and_then(HandleRef::upgrade))
}

pub(crate) fn set_scheduler(handle: HandleRef) {
    CONTEXT.with(|ctx| ctx.borrow_mut().scheduler = Some(handle));
}

pub(crate) fn clear_scheduler() {
    CONTEXT.with(|ctx| ctx.borrow_mut().scheduler = None);
}

/// This thread's dispatcher coroutine: the primordial coroutine on
/// worker threads, a dedicated coroutine on the caller thread of a
/// `use_caller` scheduler.
pub(crate) fn dispatcher() -> Option<Arc<Coroutine>> {
    CONTEXT.with(|ctx| ctx.borrow().dispatcher.clone())
}

pub(crate) fn set_dispatcher(co: Arc<Coroutine>) {
    CONTEXT.with(|ctx| ctx.borrow_mut().dispatcher = Some(co));
}

pub(crate) fn clear_dispatcher() {
    CONTEXT.with(|ctx| ctx.borrow_mut().dispatcher = None);
}

pub(crate) fn worker_id() -> Option<WorkerId> {
    CONTEXT.with(|ctx| ctx.borrow().worker_id)
}

pub(crate) fn set_worker_id(id: WorkerId) {
    CONTEXT.with(|ctx| ctx.borrow_mut().worker_id = Some(id));
}

pub(crate) fn clear_worker_id() {
    CONTEXT.with(|ctx| ctx.borrow_mut().worker_id = None);
}
