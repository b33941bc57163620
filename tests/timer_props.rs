//! Property tests for the timer set: extraction, cancellation, and
//! deadline tracking hold for arbitrary timer populations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use weft::TimerManager;

const FAR_MS: u64 = 600_000;

proptest! {
    /// Popping expired callbacks returns exactly the due timers:
    /// every timer armed with zero delay, none armed far in the
    /// future, regardless of insertion order.
    #[test]
    fn expired_extraction_is_exactly_the_due_set(due_flags in prop::collection::vec(any::<bool>(), 1..32)) {
        let manager = TimerManager::new();
        let counters: Vec<Arc<AtomicU32>> =
            (0..due_flags.len()).map(|_| Arc::new(AtomicU32::new(0))).collect();

        for (i, &due) in due_flags.iter().enumerate() {
            let delay = if due { 0 } else { FAR_MS };
            let counter = counters[i].clone();
            manager.add_timer(delay, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }, false);
        }

        let callbacks = manager.expired_callbacks();
        let due_count = due_flags.iter().filter(|&&d| d).count();
        prop_assert_eq!(callbacks.len(), due_count);

        for cb in &callbacks {
            cb();
        }
        for (i, &due) in due_flags.iter().enumerate() {
            prop_assert_eq!(counters[i].load(Ordering::SeqCst), u32::from(due));
        }

        // Far timers stay pending; a second pop finds nothing new.
        prop_assert_eq!(manager.has_timer(), due_count < due_flags.len());
        prop_assert!(manager.expired_callbacks().is_empty());
    }

    /// A cancelled timer never surfaces from the expired pop, and
    /// cancellation of some timers never disturbs the rest.
    #[test]
    fn cancelled_timers_never_fire(cancel_flags in prop::collection::vec(any::<bool>(), 1..32)) {
        let manager = TimerManager::new();
        let counters: Vec<Arc<AtomicU32>> =
            (0..cancel_flags.len()).map(|_| Arc::new(AtomicU32::new(0))).collect();

        let handles: Vec<_> = counters.iter().map(|counter| {
            let counter = counter.clone();
            manager.add_timer(0, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }, false)
        }).collect();

        for (handle, &cancel) in handles.iter().zip(&cancel_flags) {
            if cancel {
                prop_assert!(handle.cancel());
            }
        }

        let callbacks = manager.expired_callbacks();
        let kept = cancel_flags.iter().filter(|&&c| !c).count();
        prop_assert_eq!(callbacks.len(), kept);

        for cb in &callbacks {
            cb();
        }
        for (i, &cancel) in cancel_flags.iter().enumerate() {
            prop_assert_eq!(counters[i].load(Ordering::SeqCst), u32::from(!cancel));
        }
    }

    /// `next_timer` always reports the earliest pending deadline.
    #[test]
    fn next_timer_tracks_earliest(delays in prop::collection::vec(1_000u64..FAR_MS, 1..16)) {
        let manager = TimerManager::new();
        for &delay in &delays {
            manager.add_timer(delay, || {}, false);
        }
        let min = *delays.iter().min().unwrap();
        let next = manager.next_timer().expect("timers pending");
        // Allow for the clock advancing between arm and read.
        prop_assert!(next <= min);
        prop_assert!(next + 1_000 >= min);
    }
}
