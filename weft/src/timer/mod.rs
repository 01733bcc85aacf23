//! Deadline timers.
//!
//! A [`TimerManager`] keeps pending timers in a set ordered by
//! `(deadline, identity)` on the monotonic raw clock. It produces the
//! callbacks of expired timers on demand; the owner (the reactor) polls
//! [`TimerManager::next_timer_ms`] to size its wait and drains with
//! [`TimerManager::list_expired`]. Inserting a new front timer fires a
//! registered notifier at most once until the next `next_timer_ms` call,
//! so redundant reactor wake-ups collapse.

use crate::scheduler::Callback;
use crate::utils::now_ms;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Returned by [`TimerManager::next_timer_ms`] when no timer is pending.
pub const NO_TIMER: u64 = u64::MAX;

/// A backwards jump of the monotonic clock larger than this is treated
/// as a rollover and flushes every pending timer. Defensive only:
/// CLOCK_MONOTONIC_RAW does not run backwards.
const ROLLOVER_THRESHOLD_MS: u64 = 60 * 60 * 1_000;

/// A single pending (or fired) timer. Shared between the user, who may
/// cancel or reschedule it, and its manager, which holds it in the
/// ordered set until it fires.
pub struct Timer {
    period_ms: AtomicU64,
    deadline_ms: AtomicU64,
    /// Cleared on cancel and after a one-shot fires.
    callback: Mutex<Option<Callback>>,
    recurring: bool,
    manager: Weak<TimerManager>,
}

impl Timer {
    fn new(period_ms: u64, callback: Callback, recurring: bool, manager: &Arc<TimerManager>) -> Arc<Self> {
        Arc::new(Self {
            period_ms: AtomicU64::new(period_ms),
            deadline_ms: AtomicU64::new(now_ms() + period_ms),
            callback: Mutex::new(Some(callback)),
            recurring,
            manager: Arc::downgrade(manager),
        })
    }

    fn deadline(&self) -> u64 {
        self.deadline_ms.load(Ordering::Acquire)
    }

    /// Remove this timer from its manager before it fires. Returns
    /// `false` if it already fired (or was cancelled).
    pub fn cancel(self: &Arc<Self>) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut set = manager.timers.write();
        if self.callback.lock().take().is_none() {
            return false;
        }
        set.remove(&Entry(self.clone()));
        true
    }

    /// Push the deadline out to `now + period`. Returns `false` if the
    /// timer is no longer pending.
    pub fn refresh(self: &Arc<Self>) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut set = manager.timers.write();
        if self.callback.lock().is_none() {
            return false;
        }
        if !set.remove(&Entry(self.clone())) {
            return false;
        }
        self.deadline_ms
            .store(now_ms() + self.period_ms.load(Ordering::Acquire), Ordering::Release);
        set.insert(Entry(self.clone()));
        true
    }

    /// Change the period. With `from_now` the deadline restarts from the
    /// current instant; otherwise it is recomputed from the timer's
    /// original start. An unchanged period without `from_now` is a
    /// no-op.
    pub fn reset(self: &Arc<Self>, period_ms: u64, from_now: bool) -> bool {
        if period_ms == self.period_ms.load(Ordering::Acquire) && !from_now {
            return true;
        }
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let at_front;
        {
            let mut set = manager.timers.write();
            if self.callback.lock().is_none() {
                return false;
            }
            if !set.remove(&Entry(self.clone())) {
                return false;
            }
            let start = if from_now {
                now_ms()
            } else {
                self.deadline() - self.period_ms.load(Ordering::Acquire)
            };
            self.period_ms.store(period_ms, Ordering::Release);
            self.deadline_ms.store(start + period_ms, Ordering::Release);
            at_front = manager.insert_locked(&mut set, self.clone());
        }
        if at_front {
            manager.notify_front_inserted();
        }
        true
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("period_ms", &self.period_ms.load(Ordering::Relaxed))
            .field("deadline_ms", &self.deadline_ms.load(Ordering::Relaxed))
            .field("recurring", &self.recurring)
            .field("pending", &self.callback.lock().is_some())
            .finish()
    }
}

/// Set entry ordering timers by `(deadline, identity)`. The identity
/// tie-break keeps same-deadline timers in a stable, deterministic
/// order.
struct Entry(Arc<Timer>);

impl Entry {
    fn key(&self) -> (u64, usize) {
        (self.0.deadline(), Arc::as_ptr(&self.0) as usize)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

pub struct TimerManager {
    timers: RwLock<BTreeSet<Entry>>,
    /// Last time observed by `list_expired`, for rollover detection.
    previous_ms: AtomicU64,
    /// Set when a front insertion has already notified the owner;
    /// cleared by `next_timer_ms`. Collapses redundant wake-ups.
    tickled: AtomicBool,
    /// Invoked (outside the set lock) when a timer becomes the new
    /// front while `tickled` is clear. The io manager points this at its
    /// `tickle`.
    front_notifier: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl TimerManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            timers: RwLock::new(BTreeSet::new()),
            previous_ms: AtomicU64::new(now_ms()),
            tickled: AtomicBool::new(false),
            front_notifier: OnceLock::new(),
        })
    }

    /// Install the front-insertion notifier. May be set once.
    pub(crate) fn set_front_notifier(&self, notifier: impl Fn() + Send + Sync + 'static) {
        if self.front_notifier.set(Box::new(notifier)).is_err() {
            panic!("timer front notifier installed twice");
        }
    }

    /// Schedule `callback` to fire in `period_ms` milliseconds,
    /// re-arming with the same period when `recurring`.
    pub fn add_timer(self: &Arc<Self>, period_ms: u64, callback: Callback, recurring: bool) -> Arc<Timer> {
        let timer = Timer::new(period_ms, callback, recurring, self);
        let at_front = {
            let mut set = self.timers.write();
            self.insert_locked(&mut set, timer.clone())
        };
        if at_front {
            self.notify_front_inserted();
        }
        timer
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only runs
    /// if `condition` can still be upgraded at fire time; otherwise the
    /// firing is dropped silently. The idiomatic way to tie a scheduled
    /// callback to the lifetime of its subject.
    pub fn add_condition_timer<T: ?Sized + Send + Sync + 'static>(
        self: &Arc<Self>,
        period_ms: u64,
        callback: Callback,
        condition: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer> {
        let gated: Callback = Arc::new(move || {
            if condition.upgrade().is_some() {
                callback();
            }
        });
        self.add_timer(period_ms, gated, recurring)
    }

    /// Milliseconds until the earliest deadline: `0` if already due,
    /// [`NO_TIMER`] if the set is empty. Clears the front-insertion
    /// flag, re-arming the notifier.
    pub fn next_timer_ms(&self) -> u64 {
        self.tickled.store(false, Ordering::Release);
        let set = self.timers.read();
        match set.first() {
            None => NO_TIMER,
            Some(front) => front.0.deadline().saturating_sub(now_ms()),
        }
    }

    /// Move the callbacks of every timer whose deadline has passed into
    /// `out`. Recurring timers are re-queued at `now + period`;
    /// one-shots release their callback.
    pub fn list_expired(&self, out: &mut Vec<Callback>) {
        let now = now_ms();
        {
            let set = self.timers.read();
            if set.is_empty() {
                return;
            }
        }

        let mut set = self.timers.write();
        if set.is_empty() {
            return;
        }

        let rollover = self.detect_rollover(now);
        if !rollover && set.first().is_some_and(|e| e.0.deadline() > now) {
            return;
        }

        let mut expired = Vec::new();
        loop {
            match set.first() {
                Some(front) if rollover || front.0.deadline() <= now => {
                    expired.push(set.pop_first().expect("front exists"));
                }
                _ => break,
            }
        }

        out.reserve(expired.len());
        for Entry(timer) in expired {
            let mut slot = timer.callback.lock();
            if timer.recurring {
                let callback = slot.clone().expect("pending timer has a callback");
                timer
                    .deadline_ms
                    .store(now + timer.period_ms.load(Ordering::Acquire), Ordering::Release);
                drop(slot);
                set.insert(Entry(timer));
                out.push(callback);
            } else if let Some(callback) = slot.take() {
                out.push(callback);
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.timers.read().is_empty()
    }

    /// Insert under the write lock; returns whether the owner should be
    /// notified of a new front.
    fn insert_locked(&self, set: &mut BTreeSet<Entry>, timer: Arc<Timer>) -> bool {
        set.insert(Entry(timer.clone()));
        let is_front = set
            .first()
            .is_some_and(|front| Arc::ptr_eq(&front.0, &timer));
        is_front && !self.tickled.swap(true, Ordering::AcqRel)
    }

    fn notify_front_inserted(&self) {
        if let Some(notifier) = self.front_notifier.get() {
            notifier();
        }
    }

    /// Rollover: `now` is more than an hour behind the last observation.
    fn detect_rollover(&self, now: u64) -> bool {
        let previous = self.previous_ms.swap(now, Ordering::AcqRel);
        now < previous && previous - now > ROLLOVER_THRESHOLD_MS
    }

    /// Pretend the clock was last observed at `ms`, to exercise the
    /// rollover path without a mockable clock.
    #[cfg(test)]
    fn force_previous_ms(&self, ms: u64) {
        self.previous_ms.store(ms, Ordering::Release);
    }
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager")
            .field("pending", &self.timers.read().len())
            .field("tickled", &self.tickled.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;
    use std::time::Duration;

    fn counter_cb(counter: &Arc<AtomicUsize>) -> Callback {
        let counter = counter.clone();
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn next_timer_ms_tracks_the_front() {
        let manager = TimerManager::new();
        assert_eq!(manager.next_timer_ms(), NO_TIMER);

        let hits = Arc::new(AtomicUsize::new(0));
        manager.add_timer(50, counter_cb(&hits), false);
        manager.add_timer(500, counter_cb(&hits), false);

        let next = manager.next_timer_ms();
        assert!(next <= 50, "front deadline should win: {next}");
        assert!(manager.has_timer());
    }

    #[test]
    fn one_shot_expires_once_and_leaves_the_set() {
        let manager = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        manager.add_timer(10, counter_cb(&hits), false);

        sleep(Duration::from_millis(20));
        let mut callbacks = Vec::new();
        manager.list_expired(&mut callbacks);
        assert_eq!(callbacks.len(), 1);
        for cb in &callbacks {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!manager.has_timer());

        // Second drain finds nothing.
        callbacks.clear();
        manager.list_expired(&mut callbacks);
        assert!(callbacks.is_empty());
    }

    #[test]
    fn recurring_timer_requeues_itself() {
        let manager = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timer = manager.add_timer(10, counter_cb(&hits), true);

        for _ in 0..3 {
            sleep(Duration::from_millis(15));
            let mut callbacks = Vec::new();
            manager.list_expired(&mut callbacks);
            assert_eq!(callbacks.len(), 1);
            callbacks[0]();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(manager.has_timer());
        assert!(timer.cancel());
        assert!(!manager.has_timer());
    }

    #[test]
    fn cancel_before_fire_wins_cancel_after_fire_is_noop() {
        let manager = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let early = manager.add_timer(10_000, counter_cb(&hits), false);
        assert!(early.cancel());
        assert!(!early.cancel(), "double cancel reports already gone");
        assert!(!manager.has_timer());

        let fired = manager.add_timer(5, counter_cb(&hits), false);
        sleep(Duration::from_millis(10));
        let mut callbacks = Vec::new();
        manager.list_expired(&mut callbacks);
        assert_eq!(callbacks.len(), 1);
        assert!(!fired.cancel(), "cancel after fire is a no-op");
    }

    #[test]
    fn refresh_advances_by_one_period() {
        let manager = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timer = manager.add_timer(50, counter_cb(&hits), false);

        let before = timer.deadline();
        sleep(Duration::from_millis(20));
        assert!(timer.refresh());
        let after = timer.deadline();
        assert!(after >= before + 15, "deadline moved with now: {before} -> {after}");

        // Refresh keeps identity and callback.
        assert!(manager.has_timer());
        assert!(timer.cancel());
    }

    #[test]
    fn reset_with_same_period_and_not_from_now_is_noop() {
        let manager = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timer = manager.add_timer(100, counter_cb(&hits), false);

        let deadline = timer.deadline();
        assert!(timer.reset(100, false));
        assert_eq!(timer.deadline(), deadline);
    }

    #[test]
    fn reset_from_origin_rebases_on_the_old_start() {
        let manager = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timer = manager.add_timer(100, counter_cb(&hits), false);

        let origin = timer.deadline() - 100;
        assert!(timer.reset(300, false));
        assert_eq!(timer.deadline(), origin + 300);

        assert!(timer.cancel());
        assert!(!timer.reset(50, true), "reset after cancel fails");
    }

    #[test]
    fn condition_timer_drops_when_condition_is_gone() {
        let manager = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let alive = Arc::new(());
        manager.add_condition_timer(5, counter_cb(&hits), Arc::downgrade(&alive), false);
        let dead = Arc::new(());
        let dead_weak = Arc::downgrade(&dead);
        drop(dead);
        manager.add_condition_timer(5, counter_cb(&hits), dead_weak, false);

        sleep(Duration::from_millis(10));
        let mut callbacks = Vec::new();
        manager.list_expired(&mut callbacks);
        assert_eq!(callbacks.len(), 2, "both gated callbacks expire");
        for cb in &callbacks {
            cb();
        }
        // Only the one whose condition survived actually ran.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn same_deadline_timers_fire_in_stable_order() {
        let manager = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        // Freeze a shared deadline by adding before any time passes.
        for tag in 0..4u32 {
            let order = order.clone();
            manager.add_timer(
                20,
                Arc::new(move || order.lock().push(tag)),
                false,
            );
        }

        sleep(Duration::from_millis(30));
        let mut callbacks = Vec::new();
        manager.list_expired(&mut callbacks);
        assert_eq!(callbacks.len(), 4);
        for cb in &callbacks {
            cb();
        }
        assert_eq!(order.lock().len(), 4);
    }

    #[test]
    fn clock_rollover_flushes_every_timer() {
        let manager = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        manager.add_timer(60_000, counter_cb(&hits), false);
        manager.add_timer(120_000, counter_cb(&hits), false);

        // Make the last observation sit far in the future: the next
        // drain sees the clock more than an hour "behind" and treats
        // everything as expired.
        manager.force_previous_ms(now_ms() + 2 * ROLLOVER_THRESHOLD_MS);

        let mut callbacks = Vec::new();
        manager.list_expired(&mut callbacks);
        assert_eq!(callbacks.len(), 2);
        assert!(!manager.has_timer());
    }

    #[test]
    fn front_insert_notifies_once_until_rearmed() {
        let manager = TimerManager::new();
        let notifications = Arc::new(AtomicUsize::new(0));
        let n = notifications.clone();
        manager.set_front_notifier(move || {
            n.fetch_add(1, Ordering::SeqCst);
        });

        let hits = Arc::new(AtomicUsize::new(0));
        manager.add_timer(1_000, counter_cb(&hits), false);
        assert_eq!(notifications.load(Ordering::SeqCst), 1);

        // A new, earlier front while the flag is still set: no second
        // notification.
        manager.add_timer(500, counter_cb(&hits), false);
        assert_eq!(notifications.load(Ordering::SeqCst), 1);

        // `next_timer_ms` re-arms the notifier.
        let _ = manager.next_timer_ms();
        manager.add_timer(100, counter_cb(&hits), false);
        assert_eq!(notifications.load(Ordering::SeqCst), 2);

        // Inserting behind the front never notifies.
        manager.add_timer(50_000, counter_cb(&hits), false);
        assert_eq!(notifications.load(Ordering::SeqCst), 2);
    }
}
