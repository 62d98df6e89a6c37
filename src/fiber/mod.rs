//! Stackful fiber abstraction
//!
//! The scheduler does not create or switch execution contexts itself; it
//! delegates to a [`FiberRuntime`] injected at construction. The runtime
//! deals in opaque [`Fiber`] handles and guarantees exactly one contract:
//! [`FiberRuntime::switch`] is a symmetric control transfer that returns on
//! the `from` fiber when something later switches back to it.

#[cfg(unix)]
mod ucontext;

#[cfg(unix)]
pub use ucontext::UcontextRuntime;

use std::ffi::c_void;

/// Entry point of a newly created fiber.
///
/// The closure is invoked on the fiber's own stack the first time the fiber
/// is switched to. It must never return: the scheduler's trampolines always
/// end in a final switch away from the fiber.
pub type FiberEntry = Box<dyn FnOnce() + Send + 'static>;

/// Opaque handle to one execution context owned by a [`FiberRuntime`].
///
/// Handles are plain tokens: copying one does not duplicate the underlying
/// context, and releasing a fiber invalidates every copy of its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fiber(*mut c_void);

impl Fiber {
    /// Wrap a raw runtime-private pointer. Intended for `FiberRuntime`
    /// implementations only.
    pub fn from_ptr(ptr: *mut c_void) -> Self {
        Fiber(ptr)
    }

    /// The raw runtime-private pointer this handle wraps.
    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }
}

// A Fiber is only ever dereferenced by its owning runtime, and the scheduler
// guarantees a fiber is executed by at most one thread at a time (the
// run-lock hand-off). The handle itself is just a token.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

/// User-mode execution contexts with private stacks, switchable
/// cooperatively.
///
/// All five operations come from the host platform (or from
/// [`UcontextRuntime`], the default). Implementations must uphold the
/// symmetric-switch contract: `switch(from, to)` saves the caller's context
/// into `from`, resumes `to`, and returns only when another fiber switches
/// back to `from`, possibly from a different OS thread.
pub trait FiberRuntime: Send + Sync {
    /// Convert the calling OS thread into a fiber context so it can
    /// participate in switches. The returned fiber represents the thread's
    /// current execution and owns no separate stack.
    fn adopt_current_thread(&self) -> Fiber;

    /// Reverse [`adopt_current_thread`](Self::adopt_current_thread).
    ///
    /// # Safety
    ///
    /// `fiber` must have been returned by `adopt_current_thread` on this
    /// same thread, and must not be switched to afterwards.
    unsafe fn release_current_thread(&self, fiber: Fiber);

    /// Allocate a fresh stack of `stack_size` bytes and return a fiber
    /// whose first switch-in runs `entry` on it. `stack_size` must be
    /// non-zero; allocation failure is fatal.
    fn create_fiber(&self, entry: FiberEntry, stack_size: usize) -> Fiber;

    /// Deallocate a fiber's stack and record.
    ///
    /// # Safety
    ///
    /// Must be called from a different fiber than the one being freed, and
    /// no copy of the handle may be used afterwards.
    unsafe fn release_fiber(&self, fiber: Fiber);

    /// Save the current execution context into `from`, resume `to`.
    /// Returns on `from` when something switches back to it.
    ///
    /// # Safety
    ///
    /// `from` must be the fiber currently executing on this thread and `to`
    /// must be a live fiber that no other thread is executing.
    unsafe fn switch(&self, from: Fiber, to: Fiber);
}
