//! Fibers: stackful, cooperatively-scheduled units of execution.
//!
//! A fiber owns a dedicated stack and a saved machine context, and is
//! driven through an explicit state machine:
//!
//! ```text
//!              resume                yield_ready
//!   Init ───────────────▶ Exec ─────────────────▶ Ready ──┐
//!     ▲                  │  ▲                             │ resume
//!     │ reset            │  └─────────────────────────────┘
//!     │                  │ yield_hold (parked by the dispatcher)
//!   Term / Except ◀──────┴──────▶ Hold ── resume ──▶ Exec
//! ```
//!
//! Suspension happens only at explicit yield points; there is no
//! preemption. The machine-context primitive is the `generator` crate:
//! each fiber is backed by a scoped generator with its own stack, and
//! yielding from arbitrary call depth returns control to whoever
//! resumed the fiber. Because the primitive tracks its resumer, the
//! same `resume` serves worker threads and the caller-thread
//! scheduling fiber.
//!
//! Every OS thread has an implicit root fiber (id 0) representing the
//! thread's native stack; it cannot be resumed, reset, or yielded
//! from.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use generator::{Gn, Generator};

use crate::config;
use crate::log;
use crate::sync::Mutex;

/// Fiber execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FiberState {
    /// Constructed or reset; the body has not started.
    Init = 0,
    /// Yielded with "still runnable, re-enqueue me".
    Ready = 1,
    /// Currently executing on some thread.
    Exec = 2,
    /// Parked; waiting on an external event, owned by whoever will
    /// resume it (an event registration, a timer, a queue entry).
    Hold = 3,
    /// Body ran to completion.
    Term = 4,
    /// Body panicked; the panic was contained and logged.
    Except = 5,
}

impl FiberState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Exec,
            3 => FiberState::Hold,
            4 => FiberState::Term,
            5 => FiberState::Except,
            _ => unreachable!("invalid fiber state {}", v),
        }
    }

    /// States in which the fiber's stack may be torn down.
    fn is_terminal(self) -> bool {
        matches!(self, FiberState::Init | FiberState::Term | FiberState::Except)
    }
}

/// The saved execution context: a scoped generator with its own stack.
type FiberContext = Generator<'static, (), ()>;

/// Global fiber id counter. Id 0 is reserved for root fibers.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Number of live fibers (root fibers included).
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Stack of fibers this thread is currently executing, innermost
    /// last. Pushed on resume, popped when the resume call returns.
    static ACTIVE: RefCell<Vec<Arc<Fiber>>> = const { RefCell::new(Vec::new()) };

    /// This thread's implicit root fiber, created on first use.
    static ROOT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// A stackful, cooperatively-scheduled unit of execution.
pub struct Fiber {
    id: u64,
    stack_size: usize,
    state: AtomicU8,
    /// `None` only for root fibers, which run on the thread's native
    /// stack.
    gen: Mutex<Option<FiberContext>>,
    /// Back-reference for handing out owning handles from `&self`
    /// (the current-fiber stack holds strong handles).
    weak_self: Weak<Fiber>,
}

// A fiber's generator is only ever driven by one thread at a time: the
// state machine admits a single resumer and the gen mutex serializes
// them. That makes migrating a suspended fiber between worker threads
// sound even though the raw generator is not Sync.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber that will run `body` when first resumed.
    ///
    /// `stack_size == 0` selects the configured default stack size
    /// (see [`crate::config::default_stack_size`]), read here at
    /// construction time so hot updates apply to new fibers.
    pub fn new<F>(body: F, stack_size: usize) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = if stack_size == 0 {
            config::default_stack_size()
        } else {
            stack_size
        };
        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        log::debug(format!("fiber {}: created, stack {} bytes", id, stack_size));
        Arc::new_cyclic(|weak| Self {
            id,
            stack_size,
            state: AtomicU8::new(FiberState::Init as u8),
            gen: Mutex::new(Some(Self::make_context(Box::new(body), stack_size))),
            weak_self: weak.clone(),
        })
    }

    /// The implicit fiber representing a thread's native stack.
    fn root() -> Arc<Self> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|weak| Self {
            id: 0,
            stack_size: 0,
            state: AtomicU8::new(FiberState::Exec as u8),
            gen: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    fn make_context(body: Box<dyn FnOnce() + Send>, stack_size: usize) -> FiberContext {
        Gn::<()>::new_opt(stack_size, move || Self::trampoline(body))
    }

    /// Entry point of every fiber body. Runs the body with panic
    /// containment and records the terminal state; control then falls
    /// back to the resumer through the generator epilogue, never past
    /// it.
    fn trampoline(body: Box<dyn FnOnce() + Send>) {
        let result = panic::catch_unwind(AssertUnwindSafe(body));
        // Taken only after the body has finished: an Arc held here
        // across the body's suspensions would keep the fiber alive
        // through its own stack.
        let cur = Fiber::current();
        match result {
            Ok(()) => cur.set_state(FiberState::Term),
            Err(payload) if payload.downcast_ref::<generator::Error>().is_some() => {
                // The backing generator is being torn down; its unwind
                // must pass through untouched.
                drop(cur);
                panic::resume_unwind(payload);
            }
            Err(payload) => {
                log::error(format!(
                    "fiber {} panicked: {}",
                    cur.id,
                    panic_message(payload.as_ref())
                ));
                cur.set_state(FiberState::Except);
            }
        }
    }

    /// Monotonically increasing fiber id; 0 for a thread's root fiber.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current execution state.
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Stack capacity in bytes (0 for a root fiber).
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Replace the body of a finished fiber and rewind it to `Init`,
    /// keeping the fiber handle, id, and stack budget (object-pool
    /// reuse for callback dispatch).
    ///
    /// Fatal if the fiber is anywhere between its first resume and
    /// completion.
    pub fn reset<F>(&self, body: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.state();
        assert!(
            state.is_terminal(),
            "fiber {}: reset while state is {:?}",
            self.id,
            state
        );
        let mut gen = self.gen.lock();
        assert!(gen.is_some(), "the root fiber cannot be reset");
        *gen = Some(Self::make_context(Box::new(body), self.stack_size));
        self.set_state(FiberState::Init);
    }

    /// Switch execution into this fiber. Returns when the fiber yields
    /// or finishes; inspect [`state`](Self::state) afterwards to see
    /// which.
    ///
    /// Fatal if the fiber is already executing or has finished.
    pub fn resume(&self) {
        let state = self.state();
        assert!(
            matches!(state, FiberState::Init | FiberState::Ready | FiberState::Hold),
            "fiber {}: resume while state is {:?}",
            self.id,
            state
        );
        let this = self
            .weak_self
            .upgrade()
            .expect("fiber resumed during teardown");
        self.set_state(FiberState::Exec);
        ACTIVE.with(|stack| stack.borrow_mut().push(this));
        {
            let mut gen = self.gen.lock();
            let gen = gen.as_mut().expect("the root fiber cannot be resumed");
            let _ = gen.resume();
        }
        ACTIVE.with(|stack| {
            stack.borrow_mut().pop();
        });
    }

    /// The fiber currently executing on this thread; the thread's root
    /// fiber (created on first use) when none is.
    pub fn current() -> Arc<Fiber> {
        if let Some(fiber) = ACTIVE.with(|stack| stack.borrow().last().cloned()) {
            return fiber;
        }
        ROOT.with(|root| {
            root.borrow_mut()
                .get_or_insert_with(Fiber::root)
                .clone()
        })
    }

    /// Id of the fiber currently executing on this thread, without
    /// materializing a root fiber. 0 on a thread running no fiber.
    pub fn current_id() -> u64 {
        ACTIVE
            .try_with(|stack| stack.borrow().last().map(|f| f.id))
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    /// Suspend the current fiber, marking it `Ready`: the dispatcher
    /// re-enqueues it behind existing work.
    pub fn yield_ready() {
        let cur = Self::current();
        assert!(cur.id != 0, "cannot yield from a thread's root fiber");
        cur.set_state(FiberState::Ready);
        drop(cur);
        generator::yield_with(());
    }

    /// Suspend the current fiber to park it: it will only run again
    /// when something holding its handle resumes or schedules it.
    ///
    /// The state stays `Exec` until the dispatcher observes the
    /// completed switch and marks the fiber `Hold`; that ordering is
    /// what makes it safe for another thread to resume the fiber the
    /// moment it sees `Hold`.
    pub fn yield_hold() {
        let cur = Self::current();
        assert!(cur.id != 0, "cannot yield from a thread's root fiber");
        drop(cur);
        generator::yield_with(());
    }

    /// Number of live fibers across the process, root fibers included.
    pub fn total() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.id == 0 {
            return;
        }
        let state = self.state();
        log::debug(format!("fiber {}: dropped in state {:?}", self.id, state));
        if !state.is_terminal() {
            log::error(format!(
                "fiber {}: dropped while its stack is live, state {:?}",
                self.id, state
            ));
            // The process is in a fatal path; leaking the context is
            // safer than unwinding a live stack from a foreign thread.
            if let Some(gen) = self.gen.get_mut().take() {
                std::mem::forget(gen);
            }
            if !std::thread::panicking() {
                panic!(
                    "fiber {}: dropped while its stack is live, state {:?}",
                    self.id, state
                );
            }
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
