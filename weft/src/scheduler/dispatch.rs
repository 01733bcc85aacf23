//! The per-worker dispatcher loop and the stop sequence.

use crate::context;
use crate::coroutine::{Coroutine, State};
use crate::scheduler::{Handle, Task, TaskPayload, WorkerId};
use crate::utils::ScopeGuard;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Entry point of a spawned worker thread: bind the thread into the
/// scheduler's context, adopt its native stack as both primordial and
/// dispatcher coroutine, then run the dispatcher loop.
pub(crate) fn dispatcher_entry(handle: Handle, worker_id: WorkerId) {
    context::set_scheduler(handle.downgrade());
    context::set_worker_id(worker_id);
    // On a worker thread the dispatcher *is* the root context; only the
    // caller thread gets a separate dispatcher coroutine.
    let primordial = Coroutine::current();
    context::set_dispatcher(primordial);

    dispatch(&handle);
}

/// The dispatcher loop: pull tasks and resume them until the idle
/// coroutine terminates.
///
/// Runs on a worker thread's native stack, or inside the caller-thread
/// dispatcher coroutine while `stop()` drains.
pub(crate) fn dispatch(handle: &Handle) {
    let core = handle.core();
    let my_id = context::worker_id().expect("dispatch outside a worker context");
    tracing::debug!(name = core.name(), worker = my_id, "dispatcher running");

    let idle_handle = handle.clone();
    let idle = Coroutine::new(move || idle_handle.run_idle());
    // Reused across callback tasks; replaced whenever a callback parks
    // itself mid-run.
    let mut cb_coroutine: Option<Arc<Coroutine>> = None;

    loop {
        let mut task: Option<Task> = None;
        let mut tickle_me = false;
        {
            let mut queue = core.queue.lock();
            let mut i = 0;
            while i < queue.len() {
                let candidate = &queue[i];

                // Pinned to another worker: skip, but make sure that
                // worker gets woken.
                if candidate.affinity().is_some_and(|a| a != my_id) {
                    tickle_me = true;
                    i += 1;
                    continue;
                }

                // A coroutine that registered an fd event can be woken
                // and re-queued before it managed to yield; it is still
                // Running on some thread. Leave it for a later pass
                // instead of asserting.
                if let TaskPayload::Coroutine(co) = candidate.payload() {
                    if co.state() == State::Running {
                        i += 1;
                        continue;
                    }
                }

                task = queue.remove(i);
                core.active.fetch_add(1, Ordering::SeqCst);
                break;
            }
            // Work remains beyond what we took: other workers should
            // look too.
            if task.is_some() && i < queue.len() {
                tickle_me = true;
            }
        }
        if tickle_me {
            handle.tickle();
        }

        match task.map(Task::into_payload) {
            Some(TaskPayload::Coroutine(co)) => {
                // When resume returns the coroutine either finished or
                // yielded after arranging its own wake-up; the task is
                // done either way.
                co.resume();
                core.active.fetch_sub(1, Ordering::SeqCst);
            }
            Some(TaskPayload::Call(cb)) => {
                let co = match cb_coroutine.take() {
                    Some(co) => {
                        co.reset(move || cb());
                        co
                    }
                    None => Coroutine::new(move || cb()),
                };
                co.resume();
                core.active.fetch_sub(1, Ordering::SeqCst);
                // Only a cleanly finished coroutine can be reset and
                // reused. One that yielded mid-callback now lives in an
                // event context and must not be touched here.
                if co.state() == State::Term {
                    cb_coroutine = Some(co);
                }
            }
            None => {
                if idle.state() == State::Term {
                    tracing::debug!(name = core.name(), worker = my_id, "dispatcher exiting");
                    break;
                }
                core.idle.fetch_add(1, Ordering::SeqCst);
                let _idle_guard = ScopeGuard::new(|| {
                    core.idle.fetch_sub(1, Ordering::SeqCst);
                });
                idle.resume();
            }
        }
    }
}

/// Stop a scheduler: mark it stopping, wake everything, drain remaining
/// tasks on the caller dispatcher if there is one, and join the workers.
pub(crate) fn stop(handle: &Handle) {
    let core = handle.core();
    if handle.stopping() {
        return;
    }
    tracing::debug!(name = core.name(), "scheduler stopping");
    core.stop_requested.store(true, Ordering::SeqCst);

    let on_own_thread = context::current_scheduler().is_some_and(|h| h.is(core));
    if core.use_caller {
        // Only the caller thread still has the dispatcher coroutine that
        // can drain the queue.
        assert!(
            on_own_thread,
            "a use_caller scheduler must be stopped from its caller thread"
        );
    } else {
        assert!(
            !on_own_thread,
            "a scheduler without use_caller must be stopped from outside its workers"
        );
    }

    for _ in 0..core.worker_threads {
        handle.tickle();
    }
    if core.caller_dispatcher.get().is_some() {
        handle.tickle();
    }

    if let Some(dispatcher) = core.caller_dispatcher.get() {
        dispatcher.resume();
        tracing::debug!(name = core.name(), "caller dispatcher drained");
    }

    let workers = std::mem::take(&mut *core.threads.lock());
    for worker in workers {
        let _ = worker.join();
    }

    if core.use_caller {
        context::clear_scheduler();
        context::clear_dispatcher();
        context::clear_worker_id();
    }
}
