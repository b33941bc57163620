//! # Weft
//!
//! A cooperative, stackful fiber runtime: an N:M scheduler mapping
//! fibers onto a fixed pool of OS threads, with an epoll-backed
//! reactor that lets blocking-style I/O code run atop non-blocking
//! descriptors and timers.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        IoManager                          │
//! │   epoll + wake pipe + per-fd continuations + timer set    │
//! │     (provides the scheduler's idle behavior via hooks)    │
//! ├──────────────────────────┬────────────────────────────────┤
//! │        Scheduler         │          TimerManager          │
//! │  worker pool + affinity  │   deadline-ordered callbacks   │
//! │   FIFO + idle fibers     │    bounding the epoll wait     │
//! ├──────────────────────────┴────────────────────────────────┤
//! │                          Fiber                            │
//! │      per-fiber stack + state machine + explicit yield     │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Fibers are strictly cooperative: within one thread only explicit
//! yield and resume points switch execution, never preemption. A fiber
//! that registers descriptor interest with no callback is itself
//! captured as the continuation, parks with
//! [`Fiber::yield_hold`](fiber::Fiber::yield_hold), and is resumed by
//! a worker when the reactor sees the descriptor become ready:
//!
//! ```rust,ignore
//! use weft::{Event, Fiber, IoManager};
//!
//! let io = IoManager::new(2, false, "app")?;
//! io.spawn(move || {
//!     io2.add_event(fd, Event::READ).unwrap();
//!     Fiber::yield_hold();                  // parked ...
//!     // ... resumed: fd is readable (or the wait was cancelled)
//! });
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod fiber;
pub mod io;
pub mod log;
pub mod scheduler;
pub mod sync;
pub mod timer;

pub use config::RuntimeConfig;
pub use fiber::{Fiber, FiberState};
pub use io::{Event, EventError, IoManager};
pub use scheduler::{Scheduler, SchedulerHooks, SchedulerSwitcher, Task};
pub use timer::{Timer, TimerManager};
