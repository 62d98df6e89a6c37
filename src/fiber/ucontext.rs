//! Default fiber runtime built on the POSIX ucontext API
//!
//! Stacks are allocated on the heap with 16-byte alignment. The entry
//! closure is stored in the fiber record and taken at first switch-in; the
//! record pointer reaches the makecontext trampoline split across two
//! integer arguments, since makecontext only forwards ints portably.

use super::{Fiber, FiberEntry, FiberRuntime};
use std::alloc::{alloc, dealloc, Layout};
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::mem;
use std::ptr;

/// Smallest stack we will hand to makecontext. Below this, signal delivery
/// and the trampoline prologue alone can overflow.
const MIN_STACK_SIZE: usize = 16 * 1024;

struct StackAlloc {
    ptr: *mut u8,
    layout: Layout,
}

impl Drop for StackAlloc {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

struct FiberRecord {
    ctx: UnsafeCell<libc::ucontext_t>,
    /// None for fibers adopted from a thread.
    stack: Option<StackAlloc>,
    /// Taken by the trampoline at first switch-in; still present if the
    /// fiber is released without ever running.
    entry: UnsafeCell<Option<FiberEntry>>,
}

fn zeroed_context() -> UnsafeCell<libc::ucontext_t> {
    UnsafeCell::new(unsafe { mem::zeroed() })
}

extern "C" fn fiber_trampoline(lo: usize, hi: usize) {
    // Widened so the shift is in range on 32-bit targets, where hi is 0.
    let addr = ((hi as u128) << 32) | lo as u128;
    let record = addr as usize as *mut FiberRecord;
    let entry = unsafe { (*(*record).entry.get()).take().expect("fiber entered twice") };
    entry();
    unreachable!("fiber entry returned instead of switching away");
}

/// [`FiberRuntime`] implementation over `getcontext` / `makecontext` /
/// `swapcontext`.
///
/// This is the default runtime on unix hosts. It is stateless; a single
/// instance can serve any number of schedulers.
#[derive(Debug, Default)]
pub struct UcontextRuntime;

impl UcontextRuntime {
    /// Create the runtime.
    pub fn new() -> Self {
        UcontextRuntime
    }
}

impl FiberRuntime for UcontextRuntime {
    fn adopt_current_thread(&self) -> Fiber {
        let record = Box::new(FiberRecord {
            ctx: zeroed_context(),
            stack: None,
            entry: UnsafeCell::new(None),
        });
        Fiber::from_ptr(Box::into_raw(record) as *mut c_void)
    }

    unsafe fn release_current_thread(&self, fiber: Fiber) {
        drop(Box::from_raw(fiber.as_ptr() as *mut FiberRecord));
    }

    fn create_fiber(&self, entry: FiberEntry, stack_size: usize) -> Fiber {
        assert!(stack_size > 0, "fiber stack size must be non-zero");
        let stack_size = stack_size.max(MIN_STACK_SIZE);

        let layout = Layout::from_size_align(stack_size, 16).expect("invalid stack layout");
        let stack_ptr = unsafe { alloc(layout) };
        assert!(!stack_ptr.is_null(), "failed to allocate fiber stack");

        let record = Box::into_raw(Box::new(FiberRecord {
            ctx: zeroed_context(),
            stack: Some(StackAlloc {
                ptr: stack_ptr,
                layout,
            }),
            entry: UnsafeCell::new(Some(entry)),
        }));

        unsafe {
            let ctx = (*record).ctx.get();
            if libc::getcontext(ctx) != 0 {
                panic!("getcontext failed");
            }
            (*ctx).uc_stack.ss_sp = stack_ptr as *mut c_void;
            (*ctx).uc_stack.ss_size = stack_size;
            (*ctx).uc_stack.ss_flags = 0;
            (*ctx).uc_link = ptr::null_mut();

            // Split across two arguments through u128 so the shift stays in
            // range whatever the pointer width.
            let addr = record as usize as u128;
            libc::makecontext(
                ctx,
                mem::transmute::<extern "C" fn(usize, usize), extern "C" fn()>(fiber_trampoline),
                2,
                (addr & 0xffff_ffff) as usize,
                (addr >> 32) as usize,
            );
        }

        Fiber::from_ptr(record as *mut c_void)
    }

    unsafe fn release_fiber(&self, fiber: Fiber) {
        drop(Box::from_raw(fiber.as_ptr() as *mut FiberRecord));
    }

    unsafe fn switch(&self, from: Fiber, to: Fiber) {
        let from = from.as_ptr() as *mut FiberRecord;
        let to = to.as_ptr() as *mut FiberRecord;
        if libc::swapcontext((*from).ctx.get(), (*to).ctx.get()) != 0 {
            panic!("swapcontext failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_switch_round_trip() {
        let runtime = UcontextRuntime::new();
        let main = runtime.adopt_current_thread();

        let steps = Arc::new(AtomicUsize::new(0));
        let fiber_steps = steps.clone();

        // The child fiber bumps the counter and immediately switches back;
        // it is still suspended inside its entry when we release it.
        let rt = UcontextRuntime::new();
        let fiber = runtime.create_fiber(
            Box::new(move || {
                fiber_steps.store(1, Ordering::SeqCst);
                // Switch back to the adopting thread; never resumed.
                unsafe { rt.switch(child_slot_value(), main) };
                unreachable!();
            }),
            64 * 1024,
        );
        set_child_slot(fiber);

        assert_eq!(steps.load(Ordering::SeqCst), 0);
        unsafe { runtime.switch(main, fiber) };
        assert_eq!(steps.load(Ordering::SeqCst), 1);

        unsafe { runtime.release_fiber(fiber) };
        unsafe { runtime.release_current_thread(main) };
    }

    // The entry closure needs its own fiber handle to switch away from, but
    // the handle only exists after create_fiber returns. Stash it in a
    // thread-local slot; the closure reads it at first switch-in, which is
    // strictly after the slot is set.
    thread_local! {
        static CHILD: std::cell::Cell<Option<Fiber>> = const { std::cell::Cell::new(None) };
    }

    fn set_child_slot(fiber: Fiber) {
        CHILD.with(|c| c.set(Some(fiber)));
    }

    fn child_slot_value() -> Fiber {
        CHILD.with(|c| c.get()).expect("child fiber slot not set")
    }

    #[test]
    fn test_unrun_fiber_release_drops_entry() {
        let runtime = UcontextRuntime::new();
        let dropped = Arc::new(AtomicUsize::new(0));

        struct Probe(Arc<AtomicUsize>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let probe = Probe(dropped.clone());
        let fiber = runtime.create_fiber(
            Box::new(move || {
                let _keep = &probe;
                unreachable!();
            }),
            64 * 1024,
        );

        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        unsafe { runtime.release_fiber(fiber) };
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "stack size must be non-zero")]
    fn test_zero_stack_size_rejected() {
        let runtime = UcontextRuntime::new();
        let _ = runtime.create_fiber(Box::new(|| {}), 0);
    }
}
