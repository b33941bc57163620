//! Epoll-backed reactor.
//!
//! [`IoManager`] bridges the scheduler's fiber model to descriptor
//! readiness: callers register READ/WRITE interest on a descriptor
//! with either a callback or, when called from inside a running
//! fiber with no callback, the current fiber captured as the
//! continuation. The registration is edge-triggered and one-shot per
//! event: when epoll reports readiness the consumed bits are dropped
//! from the registration and the stored continuation is scheduled.
//!
//! The reactor provides the scheduler's idle behavior through
//! [`SchedulerHooks`]: workers with nothing to run block in
//! `epoll_wait`, with the timeout bounded by the timer set's next
//! deadline (capped at 3 s). A private pipe ("tickle") interrupts the
//! wait when new work or a new earliest timer arrives; the bytes carry
//! no payload.
//!
//! Blocking-style code therefore reads as:
//!
//! ```rust,ignore
//! io.add_event(fd, Event::READ)?;   // capture this fiber
//! Fiber::yield_hold();              // park until the fd is readable
//! // ... resumed here by the reactor ...
//! ```

use std::any::Any;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use thiserror::Error;

use crate::fiber::{Fiber, FiberState};
use crate::log;
use crate::scheduler::{Scheduler, SchedulerHooks, Task};
use crate::sync::{Mutex, RwLock};
use crate::timer::{Timer, TimerManager};

/// Hard cap on one blocking wait, so a worker re-checks the world at
/// least this often even with no timers pending.
const MAX_TIMEOUT_MS: u64 = 3000;

/// Readiness events delivered per wait call.
const MAX_EVENTS: usize = 64;

const EPOLLET: u32 = libc::EPOLLET as u32;
const EPOLLIN: u32 = libc::EPOLLIN as u32;
const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
const EPOLLERR: u32 = libc::EPOLLERR as u32;
const EPOLLHUP: u32 = libc::EPOLLHUP as u32;

/// Descriptor event set: READ, WRITE, or both. The bit values are the
/// epoll ones.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event(u32);

impl Event {
    /// No interest.
    pub const NONE: Event = Event(0);
    /// Read readiness.
    pub const READ: Event = Event(EPOLLIN);
    /// Write readiness.
    pub const WRITE: Event = Event(EPOLLOUT);

    /// Raw epoll bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True when no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every bit of `other` is set in `self`.
    pub const fn contains(self, other: Event) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set in `self`.
    pub const fn intersects(self, other: Event) -> bool {
        self.0 & other.0 != 0
    }

    /// Both sets combined.
    pub const fn union(self, other: Event) -> Event {
        Event(self.0 | other.0)
    }

    /// Bits common to both sets.
    pub const fn intersection(self, other: Event) -> Event {
        Event(self.0 & other.0)
    }

    /// `self` without the bits of `other`.
    pub const fn remove(self, other: Event) -> Event {
        Event(self.0 & !other.0)
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.contains(Event::READ), self.contains(Event::WRITE)) {
            (true, true) => f.write_str("READ|WRITE"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (false, false) => f.write_str("NONE"),
        }
    }
}

/// Failure registering, removing, or cancelling descriptor interest.
#[derive(Debug, Error)]
pub enum EventError {
    /// The descriptor has no such interest registered.
    #[error("fd {fd} has no {event:?} interest registered")]
    NotRegistered {
        /// The descriptor.
        fd: RawFd,
        /// The event that was not registered.
        event: Event,
    },
    /// The OS rejected the epoll operation.
    #[error(transparent)]
    Os(#[from] io::Error),
}

/// A stored continuation for one direction of one descriptor.
#[derive(Default)]
struct EventSlot {
    /// Scheduler the continuation will be scheduled onto.
    scheduler: Option<Arc<Scheduler>>,
    /// Captured fiber, when interest was registered without a
    /// callback.
    fiber: Option<Arc<Fiber>>,
    /// Callback, when one was provided.
    callback: Option<Box<dyn FnOnce() + Send>>,
}

impl EventSlot {
    fn is_vacant(&self) -> bool {
        self.fiber.is_none() && self.callback.is_none()
    }

    fn clear(&mut self) {
        self.scheduler = None;
        self.fiber = None;
        self.callback = None;
    }
}

/// Per-descriptor registration state, guarded by a per-fd mutex.
struct FdState {
    /// Currently registered events.
    events: Event,
    read: EventSlot,
    write: EventSlot,
}

impl FdState {
    fn new() -> Self {
        Self {
            events: Event::NONE,
            read: EventSlot::default(),
            write: EventSlot::default(),
        }
    }

    fn slot_mut(&mut self, event: Event) -> &mut EventSlot {
        match event {
            Event::READ => &mut self.read,
            Event::WRITE => &mut self.write,
            _ => unreachable!("slot for compound event {:?}", event),
        }
    }

    /// Fire the continuation for `event` as if it occurred: clear the
    /// registration bit and schedule the stored fiber or callback.
    /// `event` must be registered.
    fn trigger(&mut self, fd: RawFd, event: Event) {
        assert!(
            self.events.contains(event),
            "fd {}: triggering unregistered event {:?}",
            fd,
            event
        );
        self.events = self.events.remove(event);
        let slot = self.slot_mut(event);
        let scheduler = slot
            .scheduler
            .take()
            .expect("event slot without a scheduler");
        if let Some(cb) = slot.callback.take() {
            scheduler.schedule(Task::Callback(cb), None);
        } else if let Some(fiber) = slot.fiber.take() {
            scheduler.schedule(Task::Fiber(fiber), None);
        } else {
            unreachable!("fd {}: registered {:?} with an empty slot", fd, event);
        }
    }
}

struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

/// Scheduler specialization that multiplexes descriptor readiness via
/// epoll and feeds ready continuations back into the dispatch queue.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    timers: TimerManager,
    epoll: OwnedFd,
    wake_read: OwnedFd,
    wake_write: OwnedFd,
    /// Per-descriptor contexts, indexed by fd. Table growth is rare
    /// and takes the write lock; per-fd mutation takes the fd's own
    /// mutex.
    contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
    /// Registered-and-unfired event count, part of the stopping
    /// condition.
    pending_events: AtomicUsize,
}

impl IoManager {
    /// Create a reactor-backed scheduler and start its workers.
    ///
    /// Fails with the underlying OS error if the epoll instance or
    /// the wake-up pipe cannot be created or registered.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> io::Result<Arc<IoManager>> {
        let epoll = unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            OwnedFd::from_raw_fd(fd)
        };

        let mut pipe_fds = [0 as libc::c_int; 2];
        let rt = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rt != 0 {
            return Err(io::Error::last_os_error());
        }
        let (wake_read, wake_write) = unsafe {
            (
                OwnedFd::from_raw_fd(pipe_fds[0]),
                OwnedFd::from_raw_fd(pipe_fds[1]),
            )
        };

        epoll_ctl(
            epoll.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            wake_read.as_raw_fd(),
            EPOLLIN | EPOLLET,
        )?;

        let manager = Arc::new(IoManager {
            scheduler: Scheduler::new(threads, use_caller, name),
            timers: TimerManager::new(),
            epoll,
            wake_read,
            wake_write,
            contexts: RwLock::new(Vec::new()),
            pending_events: AtomicUsize::new(0),
        });

        let weak = Arc::downgrade(&manager);
        let hooks: Weak<dyn SchedulerHooks> = weak.clone();
        manager.scheduler.set_hooks(hooks.clone());
        manager.timers.set_hooks(hooks);
        let owner: Weak<dyn Any + Send + Sync> = weak;
        manager.scheduler.set_owner(owner);

        manager.scheduler.start();
        Ok(manager)
    }

    /// The reactor driving the current thread, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        let scheduler = Scheduler::current()?;
        scheduler.owner()?.downcast::<IoManager>().ok()
    }

    /// The underlying scheduler.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Schedule a plain callback onto the reactor's scheduler.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.spawn(f);
    }

    /// Register interest in `event` on `fd`, capturing the *current
    /// fiber* as the continuation: when the event fires (or is
    /// cancelled) the fiber is rescheduled. The caller must park with
    /// [`Fiber::yield_hold`] afterwards; registration itself does not
    /// suspend.
    ///
    /// Registering the same event twice without it firing is a fatal
    /// programmer error; OS-level registration failure is returned.
    pub fn add_event(&self, fd: RawFd, event: Event) -> Result<(), EventError> {
        self.add_event_inner(fd, event, None)
    }

    /// Like [`add_event`](Self::add_event), but fires `callback`
    /// instead of resuming the calling fiber.
    pub fn add_event_with<F>(&self, fd: RawFd, event: Event, callback: F) -> Result<(), EventError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_event_inner(fd, event, Some(Box::new(callback)))
    }

    fn add_event_inner(
        &self,
        fd: RawFd,
        event: Event,
        callback: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<(), EventError> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "register exactly one of READ or WRITE, got {:?}",
            event
        );
        let ctx = self.context(fd);
        let mut state = ctx.state.lock();
        assert!(
            !state.events.contains(event),
            "fd {}: {:?} interest registered twice",
            fd,
            event
        );

        let op = if state.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let bits = EPOLLET | state.events.union(event).bits();
        if let Err(err) = epoll_ctl(self.epoll.as_raw_fd(), op, fd, bits) {
            log::error(format!(
                "fd {}: epoll_ctl({}, {:#x}) failed: {}",
                fd, op, bits, err
            ));
            return Err(EventError::Os(err));
        }

        self.pending_events.fetch_add(1, Ordering::SeqCst);
        state.events = state.events.union(event);
        let scheduler = Scheduler::current().unwrap_or_else(|| self.scheduler.clone());
        let slot = state.slot_mut(event);
        assert!(slot.is_vacant(), "fd {}: stale continuation in slot", fd);
        slot.scheduler = Some(scheduler);
        match callback {
            Some(cb) => slot.callback = Some(cb),
            None => {
                let cur = Fiber::current();
                assert!(
                    cur.id() != 0 && cur.state() == FiberState::Exec,
                    "add_event without a callback must run inside a fiber"
                );
                slot.fiber = Some(cur);
            }
        }
        Ok(())
    }

    /// Remove interest in `event` on `fd` without firing the stored
    /// continuation (the operation was abandoned).
    pub fn del_event(&self, fd: RawFd, event: Event) -> Result<(), EventError> {
        let ctx = self
            .lookup(fd)
            .ok_or(EventError::NotRegistered { fd, event })?;
        let mut state = ctx.state.lock();
        if !state.events.contains(event) {
            return Err(EventError::NotRegistered { fd, event });
        }

        let left = state.events.remove(event);
        self.rearm(fd, left)?;
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        state.events = left;
        state.slot_mut(event).clear();
        Ok(())
    }

    /// Remove interest in `event` on `fd` AND fire the stored
    /// continuation immediately, as if the event had occurred; used
    /// to unblock a parked fiber early (e.g. on close). The woken
    /// party must treat the wake-up as "recheck", not "ready".
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> Result<(), EventError> {
        let ctx = self
            .lookup(fd)
            .ok_or(EventError::NotRegistered { fd, event })?;
        let mut state = ctx.state.lock();
        if !state.events.contains(event) {
            return Err(EventError::NotRegistered { fd, event });
        }

        let left = state.events.remove(event);
        self.rearm(fd, left)?;
        state.trigger(fd, event);
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    /// Cancel both read and write interest on `fd`, firing whichever
    /// continuations were registered.
    pub fn cancel_all(&self, fd: RawFd) -> Result<(), EventError> {
        let ctx = self.lookup(fd).ok_or(EventError::NotRegistered {
            fd,
            event: Event::NONE,
        })?;
        let mut state = ctx.state.lock();
        if state.events.is_empty() {
            return Err(EventError::NotRegistered {
                fd,
                event: Event::NONE,
            });
        }

        self.rearm(fd, Event::NONE)?;
        if state.events.contains(Event::READ) {
            state.trigger(fd, Event::READ);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        if state.events.contains(Event::WRITE) {
            state.trigger(fd, Event::WRITE);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert!(state.events.is_empty());
        Ok(())
    }

    /// Request shutdown and join the workers. Pending events and
    /// timers block the wind-down: cancel them first.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    // Timer surface (the reactor owns the deadline set its wait loop
    // consults).

    /// Schedule `callback` in `ms` milliseconds (repeating every `ms`
    /// if `recurring`).
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, callback, recurring)
    }

    /// Timer whose callback is skipped if `condition` no longer
    /// upgrades at fire time.
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
        self.timers.add_condition_timer(ms, callback, condition, recurring)
    }

    /// Whether any timer is pending.
    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    /// Registered-and-unfired event count.
    pub fn pending_events(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    /// Stopping condition and next-deadline in one timer-set read
    /// (the deadline doubles as the wait timeout).
    fn stopping_with_timeout(&self) -> (bool, Option<u64>) {
        let next = self.timers.next_timer();
        let stopping = next.is_none()
            && self.pending_events.load(Ordering::SeqCst) == 0
            && self.scheduler.base_stopping();
        (stopping, next)
    }

    /// Get or lazily create the context for `fd`, growing the table
    /// by half-steps as descriptors climb.
    fn context(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "negative file descriptor");
        let idx = fd as usize;
        {
            let table = self.contexts.read();
            if let Some(Some(ctx)) = table.get(idx) {
                return ctx.clone();
            }
        }
        let mut table = self.contexts.write();
        if table.len() <= idx {
            let new_len = idx + idx / 2 + 1;
            table.resize_with(new_len, || None);
        }
        table[idx]
            .get_or_insert_with(|| {
                Arc::new(FdContext {
                    fd,
                    state: Mutex::new(FdState::new()),
                })
            })
            .clone()
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.contexts.read().get(fd as usize)?.clone()
    }

    /// Re-register `fd` with `left` (dropping consumed/cancelled
    /// bits), logging and surfacing OS failures.
    fn rearm(&self, fd: RawFd, left: Event) -> Result<(), EventError> {
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let bits = EPOLLET | left.bits();
        epoll_ctl(self.epoll.as_raw_fd(), op, fd, bits).map_err(|err| {
            log::error(format!(
                "fd {}: epoll_ctl({}, {:#x}) failed: {}",
                fd, op, bits, err
            ));
            EventError::Os(err)
        })
    }

    /// Drain wake-up bytes; they carry no payload.
    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let rt = unsafe {
                libc::read(
                    self.wake_read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if rt <= 0 {
                break;
            }
        }
    }
}

impl SchedulerHooks for IoManager {
    /// Wake a blocked `epoll_wait` by writing one byte into the wake
    /// pipe, but only when some worker is actually idle; busy workers
    /// re-check the queue on their own.
    fn tickle(&self) {
        if !self.scheduler.has_idle_threads() {
            return;
        }
        let byte = [b'T'];
        let rt = unsafe {
            libc::write(
                self.wake_write.as_raw_fd(),
                byte.as_ptr() as *const libc::c_void,
                1,
            )
        };
        if rt < 0 {
            let err = io::Error::last_os_error();
            // A full pipe already holds enough wake-ups.
            if err.kind() != io::ErrorKind::WouldBlock {
                log::warn(format!("reactor wake-up write failed: {}", err));
            }
        }
    }

    fn stopping(&self) -> bool {
        self.stopping_with_timeout().0
    }

    /// One reactor cycle: wait for readiness or the next deadline,
    /// then turn expired timers and fired events into scheduled work.
    fn idle(&self) -> bool {
        let (stopping, next_timer) = self.stopping_with_timeout();
        if stopping {
            log::info(format!(
                "{}: reactor exiting, no events or timers pending",
                self.scheduler.name()
            ));
            return true;
        }

        let timeout = next_timer.map_or(MAX_TIMEOUT_MS, |ms| ms.min(MAX_TIMEOUT_MS));
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let ready = loop {
            let rt = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    timeout as libc::c_int,
                )
            };
            if rt >= 0 {
                break rt as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error(format!("epoll_wait failed: {}", err));
            break 0;
        };

        // Expired timers are collected on timeout and on readiness
        // alike; there is no separate timer thread.
        let callbacks = self.timers.expired_callbacks();
        if !callbacks.is_empty() {
            self.scheduler.schedule_batch(
                callbacks
                    .into_iter()
                    .map(|cb| Task::callback(move || cb())),
            );
        }

        for i in 0..ready {
            let ev = events[i];
            let fd = ev.u64 as RawFd;
            if fd == self.wake_read.as_raw_fd() {
                self.drain_wake_pipe();
                continue;
            }

            let Some(ctx) = self.lookup(fd) else {
                continue;
            };
            let mut state = ctx.state.lock();

            let mut bits = ev.events;
            // Error or hang-up wakes both directions so no waiter is
            // stuck on a dead descriptor.
            if bits & (EPOLLERR | EPOLLHUP) != 0 {
                bits |= EPOLLIN | EPOLLOUT;
            }
            let mut fired = Event::NONE;
            if bits & EPOLLIN != 0 {
                fired = fired.union(Event::READ);
            }
            if bits & EPOLLOUT != 0 {
                fired = fired.union(Event::WRITE);
            }
            let fired = fired.intersection(state.events);
            if fired.is_empty() {
                continue;
            }

            let left = state.events.remove(fired);
            if self.rearm(ctx.fd, left).is_err() {
                continue;
            }
            if fired.contains(Event::READ) {
                state.trigger(ctx.fd, Event::READ);
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
            if fired.contains(Event::WRITE) {
                state.trigger(ctx.fd, Event::WRITE);
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
        }
        false
    }

    /// A new earliest deadline: interrupt the wait so it is recomputed.
    fn on_timer_inserted_at_front(&self) {
        self.tickle();
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        // The hook path is unreachable once the last strong reference
        // is gone, so wake the workers directly before joining them.
        self.scheduler.request_stop();
        for _ in 0..self.scheduler.thread_ids().len() {
            self.tickle();
        }
        self.stop();
    }
}

fn epoll_ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
    let mut ev = libc::epoll_event {
        events,
        u64: fd as u64,
    };
    let rt = unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) };
    if rt != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
