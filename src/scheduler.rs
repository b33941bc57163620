//! N:M fiber scheduler.
//!
//! Maps ready fibers and plain callbacks onto a fixed pool of OS
//! worker threads, optionally repurposing the creating ("caller")
//! thread as one of the workers. Work items carry an optional thread
//! affinity; the queue is a single mutex-protected FIFO scanned per
//! worker, so ordering is FIFO per affinity but unspecified across
//! threads.
//!
//! When a worker finds nothing runnable it resumes a per-thread idle
//! fiber. What that fiber does each cycle is pluggable through
//! [`SchedulerHooks`] (the reactor installs itself there to block in
//! `epoll_wait` instead of sleeping), and the scheduler wakes blocked
//! idlers through the same hooks (`tickle`) whenever the queue goes
//! non-empty.
//!
//! ```text
//!  schedule() ──▶ [ queue ] ──▶ worker 0: resume ─ yield ─▶ requeue/park
//!                    │     └──▶ worker 1: ...
//!                    └ tickle (wake a blocked idler)
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::fiber::{Fiber, FiberState};
use crate::log;
use crate::sync::{Mutex, RwLock, Semaphore};

/// Pluggable idle-time behavior for a scheduler.
///
/// The scheduler dispatches through this interface instead of assuming
/// a concrete idle implementation; the reactor ([`crate::io::IoManager`])
/// installs itself here to make workers block in the readiness wait.
pub trait SchedulerHooks: Send + Sync {
    /// Wake one worker blocked in idle so it re-checks the queue.
    fn tickle(&self);

    /// Whether the dispatch loops may exit.
    fn stopping(&self) -> bool;

    /// One cycle of idle-time work, run inside a worker's idle fiber.
    /// Returns true when idling should end (the dispatch loop then
    /// exits). The idle fiber yields between cycles on its own.
    fn idle(&self) -> bool;

    /// A newly inserted timer became the earliest deadline.
    fn on_timer_inserted_at_front(&self) {}
}

/// A unit of schedulable work.
pub enum Task {
    /// A fiber continuation to resume.
    Fiber(Arc<Fiber>),
    /// A plain callback, run inside a pooled callback fiber.
    Callback(Box<dyn FnOnce() + Send>),
}

impl Task {
    /// Wrap a callback.
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Callback(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Fiber(fiber) => f.debug_tuple("Fiber").field(&fiber.id()).finish(),
            Task::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// A queued task plus its optional thread affinity (`None` = any
/// worker).
struct WorkItem {
    task: Task,
    thread: Option<ThreadId>,
}

/// State guarded by the scheduler's one mutex.
struct SchedState {
    queue: VecDeque<WorkItem>,
    handles: Vec<JoinHandle<()>>,
    thread_ids: Vec<ThreadId>,
}

thread_local! {
    /// The scheduler whose dispatch loop owns this thread.
    static CURRENT_SCHEDULER: RefCell<Weak<Scheduler>> = const { RefCell::new(Weak::new()) };

    /// This thread's scheduling fiber: the context the dispatch loop
    /// runs on, which suspended fibers yield back into.
    static SCHEDULER_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// An N:M scheduler over a fixed pool of worker threads.
pub struct Scheduler {
    name: String,
    /// Worker OS threads spawned by `start` (the caller thread, when
    /// used, is not counted here).
    thread_count: usize,
    /// Creating thread's id when it participates as a worker.
    root_thread: Option<ThreadId>,
    /// Dispatch-loop fiber for the caller thread, resumed by `stop`.
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    state: Mutex<SchedState>,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    started: AtomicBool,
    stop_requested: AtomicBool,
    hooks: RwLock<Option<Weak<dyn SchedulerHooks>>>,
    /// Back-reference to whatever owns this scheduler (the reactor),
    /// for `IoManager::current`-style downcasts.
    owner: RwLock<Option<Weak<dyn Any + Send + Sync>>>,
    /// Back-reference for handing out owning handles from `&self`
    /// (worker threads and the TLS current-scheduler slot).
    weak_self: Weak<Scheduler>,
}

impl Scheduler {
    /// Create a scheduler with `threads` worker threads.
    ///
    /// With `use_caller`, the constructing thread is enlisted as one
    /// of the workers: `threads` is reduced by one and a root fiber is
    /// created whose body is the dispatch loop; it runs when `stop`
    /// drains remaining work. At most one use-caller scheduler may be
    /// created per thread.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Self> {
        assert!(threads > 0, "scheduler needs at least one thread");
        let name = if name.is_empty() { "weft" } else { name }.to_string();

        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let mut thread_count = threads;
            let mut root_thread = None;
            let mut root_fiber = None;
            let mut thread_ids = Vec::new();

            if use_caller {
                assert!(
                    Scheduler::current().is_none(),
                    "thread already hosts a use-caller scheduler"
                );
                // Materialize this thread's root fiber before any
                // dispatching happens on it.
                let _ = Fiber::current();
                thread_count -= 1;

                let w = weak.clone();
                root_fiber = Some(Fiber::new(
                    move || {
                        if let Some(sched) = w.upgrade() {
                            sched.run();
                        }
                    },
                    0,
                ));
                root_thread = Some(thread::current().id());
                thread_ids.push(thread::current().id());
                CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = weak.clone());
            }

            Scheduler {
                name,
                thread_count,
                root_thread,
                root_fiber: Mutex::new(root_fiber),
                state: Mutex::new(SchedState {
                    queue: VecDeque::new(),
                    handles: Vec::new(),
                    thread_ids,
                }),
                active_count: AtomicUsize::new(0),
                idle_count: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                hooks: RwLock::new(None),
                owner: RwLock::new(None),
                weak_self: weak.clone(),
            }
        })
    }

    /// The scheduler driving the current thread, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHEDULER.with(|c| c.borrow().upgrade())
    }

    /// The current thread's scheduling fiber (the dispatch-loop
    /// context), if this thread belongs to a scheduler.
    pub fn main_fiber() -> Option<Arc<Fiber>> {
        SCHEDULER_FIBER.with(|f| f.borrow().clone())
    }

    /// Scheduler name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ids of every thread participating in dispatch (the caller
    /// thread first, when used). Useful for pinning work with
    /// [`schedule`](Self::schedule).
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.state.lock().thread_ids.clone()
    }

    /// Number of workers currently resumed into a task.
    pub fn active_threads(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Number of workers currently inside their idle fiber.
    pub fn idle_threads(&self) -> usize {
        self.idle_count.load(Ordering::SeqCst)
    }

    /// Whether any worker is idling (used to gate wake-up writes).
    pub fn has_idle_threads(&self) -> bool {
        self.idle_count.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn set_hooks(&self, hooks: Weak<dyn SchedulerHooks>) {
        *self.hooks.write() = Some(hooks);
    }

    pub(crate) fn set_owner(&self, owner: Weak<dyn Any + Send + Sync>) {
        *self.owner.write() = Some(owner);
    }

    pub(crate) fn owner(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.owner.read().as_ref()?.upgrade()
    }

    fn upgrade_hooks(&self) -> Option<Arc<dyn SchedulerHooks>> {
        self.hooks.read().as_ref()?.upgrade()
    }

    fn tickle_hooks(&self) {
        match self.upgrade_hooks() {
            Some(h) => h.tickle(),
            None => log::trace(format!("{}: tickle", self.name)),
        }
    }

    /// Append a work item; `thread` pins it to one worker. Wakes an
    /// idle worker when the queue transitions from empty.
    pub fn schedule(&self, task: Task, thread: Option<ThreadId>) {
        let need_tickle = {
            let mut state = self.state.lock();
            let was_empty = state.queue.is_empty();
            state.queue.push_back(WorkItem { task, thread });
            was_empty
        };
        if need_tickle {
            self.tickle_hooks();
        }
    }

    /// Append a batch of items under one lock acquisition, with a
    /// single wake-up decision for the whole batch.
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let need_tickle = {
            let mut state = self.state.lock();
            let was_empty = state.queue.is_empty();
            for task in tasks {
                state.queue.push_back(WorkItem { task, thread: None });
            }
            was_empty && !state.queue.is_empty()
        };
        if need_tickle {
            self.tickle_hooks();
        }
    }

    /// Schedule a plain callback with no affinity.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::callback(f), None);
    }

    /// Spin up the worker threads. Returns once every worker has
    /// started; no-op if already started.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self
            .weak_self
            .upgrade()
            .expect("scheduler started during teardown");
        let startup = Arc::new(Semaphore::new(0));
        {
            let mut state = self.state.lock();
            debug_assert!(state.handles.is_empty());
            for i in 0..self.thread_count {
                let sched = this.clone();
                let startup = startup.clone();
                let handle = thread::Builder::new()
                    .name(format!("{}-worker-{}", self.name, i))
                    .spawn(move || {
                        startup.notify();
                        sched.run();
                    })
                    .expect("failed to spawn scheduler worker thread");
                state.thread_ids.push(handle.thread().id());
                state.handles.push(handle);
            }
        }
        for _ in 0..self.thread_count {
            startup.wait();
        }
        log::info(format!(
            "{}: started {} worker threads",
            self.name, self.thread_count
        ));
    }

    /// Request shutdown, drain remaining work, and join the workers.
    ///
    /// Wakes every worker, resumes the caller-thread root fiber (if
    /// any) so the creating thread participates in draining the
    /// queue, then joins the worker threads. For a use-caller
    /// scheduler this must run on the creating thread (asserted).
    pub fn stop(&self) {
        let root_state = self.root_fiber.lock().as_ref().map(|f| f.state());
        if let Some(state) = root_state {
            if self.thread_count == 0
                && matches!(state, FiberState::Term | FiberState::Init)
            {
                self.stop_requested.store(true, Ordering::SeqCst);
                if self.stopping() {
                    log::info(format!("{}: stopped", self.name));
                    return;
                }
            }
        }

        if self.root_thread.is_some() {
            assert!(
                self.is_current(),
                "{}: stop() must run on the thread that created this use-caller scheduler",
                self.name
            );
        }

        self.stop_requested.store(true, Ordering::SeqCst);
        for _ in 0..self.thread_count {
            self.tickle_hooks();
        }

        let root = self.root_fiber.lock().clone();
        if let Some(root) = root {
            self.tickle_hooks();
            if !self.stopping() {
                root.resume();
            }
        }

        let handles = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.handles)
        };
        let me = thread::current().id();
        for handle in handles {
            // A drop-initiated stop can land on a worker; that worker
            // cannot join itself and simply detaches.
            if handle.thread().id() == me {
                continue;
            }
            let _ = handle.join();
        }
        log::info(format!("{}: stopped", self.name));
    }

    /// Set the stop flag without draining or joining; the full
    /// protocol is [`stop`](Self::stop). Used when the hooks object is
    /// mid-teardown and must wake workers itself.
    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Whether the scheduler has fully wound down: stop requested, the
    /// queue drained, and no fiber mid-execution (consults the
    /// installed hooks, which may add conditions of their own).
    pub fn stopping(&self) -> bool {
        match self.upgrade_hooks() {
            Some(h) => h.stopping(),
            None => self.base_stopping(),
        }
    }

    /// The scheduler-only stopping condition, ignoring any hooks.
    pub(crate) fn base_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
            && self.active_count.load(Ordering::SeqCst) == 0
            && self.state.lock().queue.is_empty()
    }

    /// Move the calling fiber's future execution onto this scheduler
    /// (optionally a specific worker thread) by rescheduling it and
    /// parking; returns running on the target.
    pub fn switch_to(&self, thread: Option<ThreadId>) {
        assert!(
            Scheduler::current().is_some(),
            "switch_to called outside any scheduler"
        );
        if self.is_current()
            && (thread.is_none() || thread == Some(thread::current().id()))
        {
            return;
        }
        let fiber = Fiber::current();
        assert!(fiber.id() != 0, "cannot reschedule a thread's root fiber");
        self.schedule(Task::Fiber(fiber), thread);
        Fiber::yield_hold();
    }

    /// Human-readable status: thread ids, active/idle counts, stop
    /// flag.
    pub fn dump(&self) -> String {
        let state = self.state.lock();
        let ids: Vec<String> = state
            .thread_ids
            .iter()
            .map(|id| format!("{:?}", id))
            .collect();
        format!(
            "[scheduler name={} threads={} active={} idle={} stopping={} workers=[{}]]",
            self.name,
            self.thread_count,
            self.active_count.load(Ordering::SeqCst),
            self.idle_count.load(Ordering::SeqCst),
            self.stop_requested.load(Ordering::SeqCst),
            ids.join(", ")
        )
    }

    fn is_current(&self) -> bool {
        CURRENT_SCHEDULER.with(|c| {
            c.borrow()
                .upgrade()
                .is_some_and(|s| std::ptr::eq(Arc::as_ptr(&s), self))
        })
    }

    fn set_current(&self) {
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = self.weak_self.clone());
    }

    /// The per-thread dispatch loop.
    fn run(self: Arc<Self>) {
        log::debug(format!("{}: dispatch loop starting", self.name));
        self.set_current();
        SCHEDULER_FIBER.with(|f| *f.borrow_mut() = Some(Fiber::current()));

        let me = self.clone();
        let idle_fiber = Fiber::new(move || me.idle_main(), 0);
        let mut cb_fiber: Option<Arc<Fiber>> = None;
        let my_id = thread::current().id();

        loop {
            let mut tickle_me = false;
            let mut task = None;
            {
                let mut state = self.state.lock();
                let mut i = 0;
                while i < state.queue.len() {
                    let item = &state.queue[i];
                    // Pinned to another worker: leave it, but make
                    // sure somebody over there wakes up.
                    if item.thread.is_some() && item.thread != Some(my_id) {
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                    // A fiber still mid-execution elsewhere (it was
                    // scheduled before it finished switching out) is
                    // not resumable yet.
                    if let Task::Fiber(f) = &item.task {
                        if f.state() == FiberState::Exec {
                            i += 1;
                            continue;
                        }
                    }
                    let item = state.queue.remove(i).expect("scan index in bounds");
                    self.active_count.fetch_add(1, Ordering::SeqCst);
                    task = Some(item.task);
                    break;
                }
            }
            if tickle_me {
                self.tickle_hooks();
            }

            match task {
                Some(Task::Fiber(fiber)) => {
                    if matches!(fiber.state(), FiberState::Term | FiberState::Except) {
                        // Stale entry for a fiber that finished since
                        // it was queued (e.g. a spurious wake-up after
                        // cancellation).
                        self.active_count.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    fiber.resume();
                    self.active_count.fetch_sub(1, Ordering::SeqCst);
                    match fiber.state() {
                        FiberState::Ready => self.schedule(Task::Fiber(fiber), None),
                        FiberState::Term | FiberState::Except => {}
                        _ => fiber.set_state(FiberState::Hold),
                    }
                }
                Some(Task::Callback(cb)) => {
                    let fiber = match cb_fiber.take() {
                        Some(f) => {
                            f.reset(cb);
                            f
                        }
                        None => Fiber::new(cb, 0),
                    };
                    fiber.resume();
                    self.active_count.fetch_sub(1, Ordering::SeqCst);
                    match fiber.state() {
                        FiberState::Ready => self.schedule(Task::Fiber(fiber), None),
                        // Finished: keep the fiber for the next
                        // callback (object-pool reuse via reset).
                        FiberState::Term | FiberState::Except => cb_fiber = Some(fiber),
                        // Parked itself (e.g. registered an event and
                        // held); ownership moved to whatever will
                        // resume it.
                        _ => fiber.set_state(FiberState::Hold),
                    }
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        log::debug(format!("{}: idle fiber terminated", self.name));
                        break;
                    }
                    self.idle_count.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_count.fetch_sub(1, Ordering::SeqCst);
                    if !matches!(
                        idle_fiber.state(),
                        FiberState::Term | FiberState::Except
                    ) {
                        idle_fiber.set_state(FiberState::Hold);
                    }
                }
            }
        }
        log::debug(format!("{}: dispatch loop exiting", self.name));
    }

    /// Body of the per-thread idle fiber: run idle cycles (the hooks'
    /// or the built-in fallback) until stopping, yielding back to the
    /// dispatch loop between cycles.
    fn idle_main(&self) {
        let hooks = self.hooks.read().clone();
        loop {
            let stop = match hooks.as_ref().and_then(Weak::upgrade) {
                Some(h) => h.idle(),
                None => {
                    if self.base_stopping() {
                        true
                    } else {
                        // No reactor installed: nothing to block on.
                        // Sleep briefly instead of spinning through
                        // resume/yield.
                        thread::sleep(Duration::from_millis(1));
                        false
                    }
                }
            };
            if stop {
                break;
            }
            Fiber::yield_hold();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst)
            && !self.stop_requested.load(Ordering::SeqCst)
            && !thread::panicking()
        {
            panic!("{}: dropped without stop()", self.name);
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.dump())
    }
}

/// RAII guard that hops the calling fiber onto `target` and back to
/// its original scheduler on drop.
pub struct SchedulerSwitcher {
    caller: Option<Arc<Scheduler>>,
}

impl SchedulerSwitcher {
    /// Reschedule the calling fiber onto `target`; the constructor
    /// returns running there.
    pub fn new(target: &Scheduler) -> Self {
        let caller = Scheduler::current();
        target.switch_to(None);
        Self { caller }
    }
}

impl Drop for SchedulerSwitcher {
    fn drop(&mut self) {
        if let Some(caller) = self.caller.take() {
            caller.switch_to(None);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Mutex as PlMutex;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_single_worker_runs_callbacks_in_order() {
        let sched = Scheduler::new(1, false, "test-order");
        let order = Arc::new(PlMutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            sched.spawn(move || order.lock().push(i));
        }
        sched.start();
        sched.stop();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_many_tasks_all_run_once() {
        let sched = Scheduler::new(4, false, "test-many");
        sched.start();
        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..100 {
            let count = count.clone();
            sched.spawn(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_use_caller_drains_on_stop() {
        let sched = Scheduler::new(1, false, "");
        drop(sched); // not started: drop without stop is fine

        let sched = Scheduler::new(1, true, "test-caller");
        let order = Arc::new(PlMutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            sched.spawn(move || order.lock().push(i));
        }
        sched.start();
        // No separate workers: everything runs here, inside stop().
        assert!(order.lock().is_empty());
        sched.stop();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_current_scheduler_visible_from_task() {
        let sched = Scheduler::new(1, false, "test-current");
        sched.start();
        let seen = Arc::new(PlMutex::new(None));
        let seen2 = seen.clone();
        sched.spawn(move || {
            *seen2.lock() = Scheduler::current().map(|s| s.name().to_string());
        });
        sched.stop();
        assert_eq!(seen.lock().as_deref(), Some("test-current"));
    }

    #[test]
    fn test_scheduled_fiber_runs() {
        let sched = Scheduler::new(1, false, "test-fiber");
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        let fiber = Fiber::new(
            move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            },
            64 * 1024,
        );
        sched.schedule(Task::Fiber(fiber.clone()), None);
        sched.start();
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_yield_ready_reenqueues_behind_existing_work() {
        let sched = Scheduler::new(1, false, "test-yield");
        let order = Arc::new(PlMutex::new(Vec::new()));

        let order_a = order.clone();
        sched.spawn(move || {
            order_a.lock().push("a1");
            Fiber::yield_ready();
            order_a.lock().push("a2");
        });
        let order_b = order.clone();
        sched.spawn(move || order_b.lock().push("b"));

        sched.start();
        sched.stop();
        assert_eq!(*order.lock(), vec!["a1", "b", "a2"]);
    }

    #[test]
    fn test_stop_twice_is_safe() {
        let sched = Scheduler::new(2, false, "test-stop2");
        sched.start();
        sched.spawn(|| {});
        sched.stop();
        sched.stop();
    }

    #[test]
    fn test_dump_mentions_name_and_workers() {
        let sched = Scheduler::new(2, false, "test-dump");
        sched.start();
        let dump = sched.dump();
        assert!(dump.contains("name=test-dump"));
        assert!(dump.contains("threads=2"));
        sched.stop();
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let sched = Scheduler::new(1, false, "test-panic");
        sched.start();
        let after = Arc::new(AtomicU32::new(0));
        sched.spawn(|| panic!("intentional test panic"));
        let after2 = after.clone();
        sched.spawn(move || {
            after2.fetch_add(1, Ordering::SeqCst);
        });
        sched.stop();
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "dropped without stop")]
    fn test_drop_started_without_stop_is_fatal() {
        let sched = Scheduler::new(1, false, "test-drop");
        sched.start();
        // Join the worker without marking the scheduler stopped, so
        // the drop below is the last reference going away mid-flight.
        sched.stop_requested.store(true, Ordering::SeqCst);
        let handles = std::mem::take(&mut sched.state.lock().handles);
        for h in handles {
            let _ = h.join();
        }
        sched.stop_requested.store(false, Ordering::SeqCst);
        drop(sched);
    }
}
