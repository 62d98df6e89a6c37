//! Cooperative stackful-fiber task scheduler
//!
//! This crate provides a user-mode cooperative scheduler including:
//! - Stackful tasks (fibers) multiplexed over one or more attached OS threads
//! - A strictly FIFO run queue per scheduler, shared by all attached threads
//! - Task-level synchronization primitives (Semaphore, WaitGroup)
//! - A process-wide timer service backing `sleep`
//!
//! Tasks are strictly non-preemptive: a running task keeps its thread until
//! it calls [`yield_now`], suspends, or returns. Across threads, tasks run
//! in parallel; a task suspended on thread A may resume on thread B, so
//! task code must not cache thread-local state across suspension points.
//!
//! The fiber mechanism itself is pluggable: schedulers are constructed over
//! a [`FiberRuntime`], with [`UcontextRuntime`] as the default on unix.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use strand::{run, spawn, sleep, UcontextRuntime};
//! use strand::sync::WaitGroup;
//!
//! static WG: WaitGroup = WaitGroup::new();
//!
//! run(Arc::new(UcontextRuntime::new()), 4, |_scheduler| {
//!     WG.add(2);
//!     for i in 0..2 {
//!         spawn(move || {
//!             sleep(Duration::from_millis(10 * i));
//!             WG.add(-1);
//!         });
//!     }
//!     WG.wait();
//! });
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod fiber;
pub mod scheduler;
pub mod sync;

pub use fiber::{Fiber, FiberRuntime};
#[cfg(unix)]
pub use fiber::UcontextRuntime;
pub use scheduler::{
    current_task, run, sleep, spawn, suspend_self, suspend_with_unlock, yield_now, AttachError,
    Scheduler, TaskHandle, TaskId, DEFAULT_STACK_SIZE,
};
