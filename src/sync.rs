//! Synchronization primitives.
//!
//! The lock vocabulary used across the runtime:
//!
//! - [`Mutex`] / [`RwLock`] / [`Condvar`] - re-exported from
//!   `parking_lot` (no poisoning, scoped guards)
//! - [`SpinLock`] - busy-wait lock for tiny critical sections
//! - [`Semaphore`] - counting semaphore with blocking `wait`/`notify`
//!
//! These are OS-thread primitives. Holding one across a fiber yield
//! blocks the worker thread, not just the fiber.

pub use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Busy-wait lock. Appropriate only where the critical section is a
/// handful of instructions and never yields.
pub type SpinLock<T> = spin::Mutex<T>;

/// Guard type for [`SpinLock`].
pub type SpinLockGuard<'a, T> = spin::MutexGuard<'a, T>;

/// A counting semaphore.
///
/// `wait` blocks the calling OS thread until a permit is available;
/// `notify` releases one permit. Used by the scheduler to hand-shake
/// worker-thread startup.
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Create a semaphore holding `permits` initial permits.
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Take a permit if one is available without blocking.
    pub fn try_wait(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Release one permit, waking a blocked waiter if any.
    pub fn notify(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.cond.notify_one();
    }
}

// ============================================================================
// Tests
// ============================================================================
