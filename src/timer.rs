//! Deadline timers.
//!
//! [`TimerManager`] keeps a thread-safe ordered set of pending timers
//! keyed by absolute deadline, and answers two questions for the
//! reactor's wait loop: "how long until the earliest deadline?" and
//! "which callbacks are due right now?". It has no thread of its own;
//! whoever drives the event loop polls it.
//!
//! When a newly inserted timer becomes the earliest deadline, the
//! manager fires the `on_timer_inserted_at_front` hook once so a
//! blocked wait can be shortened instead of sleeping past the new
//! deadline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::log;
use crate::scheduler::SchedulerHooks;
use crate::sync::{Mutex, RwLock};

/// Timer callbacks may fire more than once (recurring timers), so they
/// are shared `Fn` closures.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Wall-clock milliseconds since the Unix epoch.
///
/// Deliberately the wall clock, not a monotonic source: deadlines
/// follow system time, and [`TimerManager`] compensates for large
/// backward jumps (see `detect_clock_rollover`).
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A clock rollback larger than this expires every pending timer.
const ROLLOVER_THRESHOLD_MS: u64 = 60 * 60 * 1000;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Mutable timer fields. Locked after the manager's set lock; never
/// the other way around.
struct TimerState {
    /// Absolute deadline in wall-clock ms. Matches the key this timer
    /// is stored under whenever it is in the set.
    deadline: u64,
    /// Firing period in ms.
    period: u64,
    recurring: bool,
    /// Cleared on cancel and after a one-shot fire.
    callback: Option<TimerCallback>,
}

/// A handle to a pending timer.
///
/// Obtained from [`TimerManager::add_timer`]; the manager holds its
/// own reference while the timer is pending, so dropping the handle
/// does not cancel the timer.
pub struct Timer {
    id: u64,
    state: Mutex<TimerState>,
    manager: Weak<TimerShared>,
}

impl Timer {
    /// Remove the timer from its manager and drop the callback.
    ///
    /// Returns false if the timer already fired (one-shot), was
    /// already cancelled, or outlived its manager.
    pub fn cancel(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut set = manager.set.write();
        let mut state = self.state.lock();
        if state.callback.is_none() {
            return false;
        }
        state.callback = None;
        set.entries.remove(&(state.deadline, self.id));
        true
    }

    /// Push the deadline out to now + period, keeping the period.
    ///
    /// Returns false if the timer is not currently pending (fired,
    /// cancelled, or mid-fire).
    pub fn refresh(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let at_front;
        {
            let mut set = manager.set.write();
            let mut state = self.state.lock();
            if state.callback.is_none() {
                return false;
            }
            let Some(timer) = set.entries.remove(&(state.deadline, self.id)) else {
                return false;
            };
            state.deadline = now_ms() + state.period;
            at_front = set.insert_entry(state.deadline, self.id, timer, &manager.tickled);
        }
        if at_front {
            manager.notify_front();
        }
        true
    }

    /// Change the period to `ms` and recompute the deadline: from the
    /// current instant when `from_now` is set, otherwise from the
    /// timer's original start so the firing phase is preserved.
    ///
    /// Returns false if the timer is not currently pending.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let at_front;
        {
            let mut set = manager.set.write();
            let mut state = self.state.lock();
            if ms == state.period && !from_now {
                return true;
            }
            if state.callback.is_none() {
                return false;
            }
            let Some(timer) = set.entries.remove(&(state.deadline, self.id)) else {
                return false;
            };
            let start = if from_now {
                now_ms()
            } else {
                state.deadline - state.period
            };
            state.period = ms;
            state.deadline = start + ms;
            at_front = set.insert_entry(state.deadline, self.id, timer, &manager.tickled);
        }
        if at_front {
            manager.notify_front();
        }
        true
    }

    /// The timer's firing period in ms (0 would mean immediate refire
    /// and is rejected at creation).
    pub fn period(&self) -> u64 {
        self.state.lock().period
    }

    /// Whether the timer refires after each expiry.
    pub fn is_recurring(&self) -> bool {
        self.state.lock().recurring
    }

    #[cfg(test)]
    pub(crate) fn deadline_ms(&self) -> u64 {
        self.state.lock().deadline
    }
}

/// The deadline-ordered set, guarded by the manager's rwlock.
struct TimerSet {
    /// Keyed by (deadline ms, timer id): deadline order with a total
    /// tie-break, and mutations never touch a stored key.
    entries: BTreeMap<(u64, u64), Arc<Timer>>,
    /// Last wall-clock reading, for rollback detection.
    previous_ms: u64,
}

impl TimerSet {
    /// Insert and report whether this entry became the new front while
    /// no front-insertion notification is outstanding.
    fn insert_entry(
        &mut self,
        deadline: u64,
        id: u64,
        timer: Arc<Timer>,
        tickled: &AtomicBool,
    ) -> bool {
        self.entries.insert((deadline, id), timer);
        let at_front = self.entries.keys().next() == Some(&(deadline, id));
        at_front && !tickled.swap(true, Ordering::SeqCst)
    }
}

struct TimerShared {
    set: RwLock<TimerSet>,
    /// Set when a front insertion has been notified and not yet
    /// observed via `next_timer`. Suppresses duplicate notifications
    /// between polls; see the module notes in DESIGN.md.
    tickled: AtomicBool,
    hooks: RwLock<Option<Weak<dyn SchedulerHooks>>>,
}

impl TimerShared {
    fn notify_front(&self) {
        let hooks = self.hooks.read().clone();
        if let Some(h) = hooks.and_then(|w| w.upgrade()) {
            h.on_timer_inserted_at_front();
        }
    }
}

/// A thread-safe ordered set of pending timers.
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TimerShared {
                set: RwLock::new(TimerSet {
                    entries: BTreeMap::new(),
                    previous_ms: now_ms(),
                }),
                tickled: AtomicBool::new(false),
                hooks: RwLock::new(None),
            }),
        }
    }

    /// Install the hook receiving front-insertion notifications.
    pub(crate) fn set_hooks(&self, hooks: Weak<dyn SchedulerHooks>) {
        *self.shared.hooks.write() = Some(hooks);
    }

    /// Schedule `callback` to fire once (or every, if `recurring`)
    /// `ms` milliseconds from now.
    ///
    /// `ms` must be non-zero for recurring timers; a zero period would
    /// refire without ever sleeping.
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        assert!(!(recurring && ms == 0), "recurring timer with zero period");
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let timer = Arc::new(Timer {
            id,
            state: Mutex::new(TimerState {
                deadline: now_ms() + ms,
                period: ms,
                recurring,
                callback: Some(Arc::new(callback)),
            }),
            manager: Arc::downgrade(&self.shared),
        });
        let at_front = {
            let mut set = self.shared.set.write();
            let deadline = timer.state.lock().deadline;
            set.insert_entry(deadline, id, timer.clone(), &self.shared.tickled)
        };
        if at_front {
            self.shared.notify_front();
        }
        timer
    }

    /// Like [`add_timer`](Self::add_timer), but the callback is
    /// skipped if `condition` no longer upgrades at fire time. Ties
    /// the timer to the lifetime of an unrelated object without
    /// keeping that object alive.
    pub fn add_condition_timer<F, T>(
        &self,
        ms: u64,
        callback: F,
        condition: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if condition.upgrade().is_some() {
                    callback();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline: `Some(0)` if already
    /// overdue, `None` if no timer is pending.
    ///
    /// Clears the front-insertion-notified flag: the caller is about
    /// to act on the returned deadline, so a later, earlier insertion
    /// must notify again.
    pub fn next_timer(&self) -> Option<u64> {
        self.shared.tickled.store(false, Ordering::SeqCst);
        let set = self.shared.set.read();
        let (&(deadline, _), _) = set.entries.iter().next()?;
        Some(deadline.saturating_sub(now_ms()))
    }

    /// Whether any timer is pending.
    pub fn has_timer(&self) -> bool {
        !self.shared.set.read().entries.is_empty()
    }

    /// Remove every expired timer and return its callback, reinserting
    /// recurring timers at now + period.
    ///
    /// If the wall clock jumped backwards by more than an hour, every
    /// pending timer is treated as expired, since a forward-sorted pop
    /// would otherwise never reach them.
    pub fn expired_callbacks(&self) -> Vec<TimerCallback> {
        {
            let set = self.shared.set.read();
            if set.entries.is_empty() {
                return Vec::new();
            }
        }
        let now = now_ms();
        let mut set = self.shared.set.write();

        let rollover = detect_clock_rollover(&mut set, now);
        match set.entries.keys().next() {
            Some(&(deadline, _)) if rollover || deadline <= now => {}
            _ => return Vec::new(),
        }
        if rollover {
            log::warn(format!(
                "timer: clock rollback detected, expiring all {} pending timers",
                set.entries.len()
            ));
        }

        let expired = if rollover {
            std::mem::take(&mut set.entries)
        } else {
            // Split below (now + 1, 0): everything with deadline <= now.
            let later = set.entries.split_off(&(now + 1, 0));
            std::mem::replace(&mut set.entries, later)
        };

        let mut callbacks = Vec::with_capacity(expired.len());
        for (_, timer) in expired {
            let mut state = timer.state.lock();
            let Some(callback) = state.callback.clone() else {
                continue;
            };
            if state.recurring {
                state.deadline = now + state.period;
                let (deadline, id) = (state.deadline, timer.id);
                drop(state);
                set.entries.insert((deadline, id), timer);
            } else {
                state.callback = None;
            }
            callbacks.push(callback);
        }
        callbacks
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

/// True if `now` sits more than [`ROLLOVER_THRESHOLD_MS`] before the
/// previous reading. Updates the reading either way.
fn detect_clock_rollover(set: &mut TimerSet, now: u64) -> bool {
    let rollover =
        now < set.previous_ms && now < set.previous_ms.saturating_sub(ROLLOVER_THRESHOLD_MS);
    set.previous_ms = now;
    rollover
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_next_timer_states() {
        let manager = TimerManager::new();
        assert_eq!(manager.next_timer(), None);
        assert!(!manager.has_timer());

        manager.add_timer(5_000, || {}, false);
        assert!(manager.has_timer());
        let next = manager.next_timer().unwrap();
        assert!(next > 4_000 && next <= 5_000, "next = {}", next);

        manager.add_timer(0, || {}, false);
        assert_eq!(manager.next_timer(), Some(0));
    }

    #[test]
    fn test_expired_pop_order_and_extraction() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let fired = fired.clone();
            manager.add_timer(
                10,
                move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                },
                false,
            );
        }
        manager.add_timer(60_000, || unreachable!("not yet due"), false);

        thread::sleep(Duration::from_millis(20));
        let callbacks = manager.expired_callbacks();
        assert_eq!(callbacks.len(), 3);
        for cb in &callbacks {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        // The far timer stays.
        assert!(manager.has_timer());
        assert!(manager.expired_callbacks().is_empty());
    }

    #[test]
    fn test_recurring_reinserted_at_pop_time_plus_period() {
        let manager = TimerManager::new();
        let timer = manager.add_timer(10, || {}, true);
        thread::sleep(Duration::from_millis(25));

        let before = now_ms();
        let callbacks = manager.expired_callbacks();
        let after = now_ms();
        assert_eq!(callbacks.len(), 1);

        // Reinserted relative to the pop instant, not the original start.
        let deadline = timer.deadline_ms();
        assert!(deadline >= before + 10 && deadline <= after + 10);
        assert!(manager.has_timer());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let manager = TimerManager::new();
        let timer = manager.add_timer(10_000, || {}, false);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!manager.has_timer());
        assert!(!timer.refresh());
        assert!(!timer.reset(5, true));
    }

    #[test]
    fn test_one_shot_cannot_be_reused_after_fire() {
        let manager = TimerManager::new();
        let timer = manager.add_timer(5, || {}, false);
        thread::sleep(Duration::from_millis(15));
        assert_eq!(manager.expired_callbacks().len(), 1);
        assert!(!timer.cancel());
        assert!(!timer.refresh());
    }

    #[test]
    fn test_refresh_pushes_deadline_out() {
        let manager = TimerManager::new();
        let timer = manager.add_timer(40, || {}, false);
        thread::sleep(Duration::from_millis(30));
        assert!(timer.refresh());
        thread::sleep(Duration::from_millis(20));
        // 50ms elapsed but the refresh rebased the 40ms deadline.
        assert!(manager.expired_callbacks().is_empty());
        thread::sleep(Duration::from_millis(30));
        assert_eq!(manager.expired_callbacks().len(), 1);
    }

    #[test]
    fn test_reset_preserves_phase_unless_from_now() {
        let manager = TimerManager::new();
        let timer = manager.add_timer(1_000, || {}, false);
        let original_start = timer.deadline_ms() - 1_000;

        assert!(timer.reset(2_000, false));
        assert_eq!(timer.deadline_ms(), original_start + 2_000);

        let before = now_ms();
        assert!(timer.reset(3_000, true));
        assert!(timer.deadline_ms() >= before + 3_000);

        // Same period, not from_now: no-op success.
        let deadline = timer.deadline_ms();
        assert!(timer.reset(3_000, false));
        assert_eq!(timer.deadline_ms(), deadline);
    }

    #[test]
    fn test_condition_timer_skipped_when_token_gone() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicU32::new(0));

        let token = Arc::new(());
        let fired2 = fired.clone();
        manager.add_condition_timer(
            5,
            move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&token),
            false,
        );

        let live_token = Arc::new(());
        let fired3 = fired.clone();
        manager.add_condition_timer(
            5,
            move || {
                fired3.fetch_add(10, Ordering::SeqCst);
            },
            Arc::downgrade(&live_token),
            false,
        );

        drop(token);
        thread::sleep(Duration::from_millis(15));
        for cb in manager.expired_callbacks() {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    struct FrontCounter {
        notified: AtomicU32,
    }

    impl SchedulerHooks for FrontCounter {
        fn tickle(&self) {}
        fn stopping(&self) -> bool {
            false
        }
        fn idle(&self) -> bool {
            true
        }
        fn on_timer_inserted_at_front(&self) {
            self.notified.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_front_notification_suppressed_until_next_poll() {
        let manager = TimerManager::new();
        let hooks = Arc::new(FrontCounter {
            notified: AtomicU32::new(0),
        });
        manager.set_hooks(Arc::downgrade(&hooks) as Weak<dyn SchedulerHooks>);

        manager.add_timer(10_000, || {}, false);
        assert_eq!(hooks.notified.load(Ordering::SeqCst), 1);

        // Earlier than the current front, but the outstanding
        // notification suppresses a second wake-up until the poller
        // re-reads the deadline. This is inherited behavior; see
        // DESIGN.md before "fixing" it.
        manager.add_timer(5_000, || {}, false);
        assert_eq!(hooks.notified.load(Ordering::SeqCst), 1);

        // Polling re-arms the notification.
        assert!(manager.next_timer().is_some());
        manager.add_timer(1_000, || {}, false);
        assert_eq!(hooks.notified.load(Ordering::SeqCst), 2);

        // A non-front insertion never notifies.
        manager.add_timer(2_000, || {}, false);
        assert_eq!(hooks.notified.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dropping_handle_keeps_timer_pending() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        let timer = manager.add_timer(
            5,
            move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        drop(timer);
        thread::sleep(Duration::from_millis(15));
        for cb in manager.expired_callbacks() {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
