//! Scheduler core: attach/detach, the per-thread scheduling loop, and the
//! cooperative control surface
//!
//! One scheduler is shared by any number of attached OS threads. Each
//! attached thread owns a `SchedulerThread`: its scheduler-loop fiber, the
//! initial-task placeholder standing in for the thread itself, and the task
//! currently running on it. Tasks suspend by switching to the attached
//! thread's scheduler fiber; they may be resumed later by any attached
//! thread, so nothing thread-specific is ever stored in a task.

use crate::fiber::{Fiber, FiberRuntime};
use crate::scheduler::task::{Task, TaskHandle, TaskList, UnlockHook};
use crate::scheduler::timer;
use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use thiserror::Error;

/// Stack size used when `spawn` is given a stack size of zero.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Stack for a thread's scheduler-loop fiber. The loop only pops queues,
/// switches, and runs small unlock hooks.
const SCHEDULER_STACK_SIZE: usize = 128 * 1024;

/// Errors from [`Scheduler::attach_current_thread`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttachError {
    /// The calling thread is already attached to a scheduler.
    #[error("thread is already attached to a scheduler")]
    AlreadyAttached,
}

/// Run queue and completed queue, guarded together by one mutex.
#[derive(Default)]
struct Queues {
    runnable: TaskList,
    completed: TaskList,
}

/// Shared state for one scheduler instance.
///
/// Create with [`Scheduler::new`], attach worker threads with
/// [`attach_current_thread`](Scheduler::attach_current_thread), and feed it
/// work with [`spawn`](Scheduler::spawn). Dropping a scheduler while
/// threads are still attached is a fatal error.
pub struct Scheduler {
    runtime: Arc<dyn FiberRuntime>,
    queues: Mutex<Queues>,
    runnable_cond: Condvar,
    active_threads: AtomicU32,
}

/// Per-attached-thread scheduling state. Never shared across threads; the
/// thread-local below holds the only pointer to it.
struct SchedulerThread {
    scheduler: Arc<Scheduler>,
    /// The fiber running `scheduler_loop` for this thread.
    sched_fiber: Fiber,
    /// Placeholder task representing the thread itself.
    initial: Arc<Task>,
    /// Task currently running (or last run) on this thread.
    current: RefCell<Arc<Task>>,
    /// Set by the completion trampoline just before its final switch.
    last_task_finished: Cell<bool>,
}

thread_local! {
    static CURRENT_THREAD: Cell<*mut SchedulerThread> = const { Cell::new(ptr::null_mut()) };
}

fn current_thread_ptr() -> *mut SchedulerThread {
    CURRENT_THREAD.with(|c| c.get())
}

fn require_thread() -> *mut SchedulerThread {
    let ptr = current_thread_ptr();
    assert!(
        !ptr.is_null(),
        "current thread is not attached to a scheduler"
    );
    ptr
}

pub(crate) fn current_arc() -> Arc<Task> {
    let st = unsafe { &*require_thread() };
    let current = st.current.borrow();
    Arc::clone(&current)
}

impl Scheduler {
    /// Create a scheduler backed by the given fiber runtime. Also makes
    /// sure the process-wide timer service is running.
    pub fn new(runtime: Arc<dyn FiberRuntime>) -> Arc<Self> {
        timer::ensure_started();
        Arc::new(Scheduler {
            runtime,
            queues: Mutex::new(Queues::default()),
            runnable_cond: Condvar::new(),
            active_threads: AtomicU32::new(0),
        })
    }

    /// Number of threads currently attached.
    pub fn active_threads(&self) -> u32 {
        self.active_threads.load(Ordering::SeqCst)
    }

    /// Turn the calling thread into a scheduler worker.
    ///
    /// The thread's current execution becomes the initial-task placeholder:
    /// the caller's own code continues and may `spawn` and `yield_now`.
    /// Note that suspending the initial task may resume it on a different
    /// attached thread, after which this thread can no longer satisfy the
    /// detach precondition; a thread that intends to detach itself should
    /// keep its own suspensions to `yield_now` and run blocking work in
    /// spawned tasks. Fails if the thread is already attached.
    pub fn attach_current_thread(self: &Arc<Self>) -> Result<(), AttachError> {
        if !current_thread_ptr().is_null() {
            return Err(AttachError::AlreadyAttached);
        }

        let thread_fiber = self.runtime.adopt_current_thread();
        let sched_fiber = self
            .runtime
            .create_fiber(Box::new(scheduler_loop), SCHEDULER_STACK_SIZE);
        let initial = Task::initial(thread_fiber, Arc::downgrade(self));

        // The thread is, in effect, dispatching its initial task right now:
        // hold the hand-off lock the way the scheduling loop does for every
        // dispatch. The loop releases it when the initial task first
        // switches out.
        mem::forget(initial.run_lock().lock());

        let st = Box::new(SchedulerThread {
            scheduler: Arc::clone(self),
            sched_fiber,
            initial: Arc::clone(&initial),
            current: RefCell::new(initial),
            last_task_finished: Cell::new(false),
        });
        CURRENT_THREAD.with(|c| c.set(Box::into_raw(st)));

        self.active_threads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Reverse [`attach_current_thread`](Self::attach_current_thread).
    ///
    /// Precondition: the thread is not mid-task, i.e. the currently running
    /// task must be this thread's initial placeholder. Decrements the
    /// active-thread count; on reaching zero, releases every scheduler
    /// thread waiting for work.
    pub fn detach_current_thread(&self) {
        let st_ptr = self.checked_thread();
        self.release_active_thread();
        self.teardown_thread(st_ptr);
    }

    /// Give up this thread's claim on the scheduler but keep running tasks
    /// until every other attached thread has done the same, then detach.
    ///
    /// This is how a driver thread drains the system: its own work done, it
    /// becomes a pure worker until the whole scheduler quiesces. Same
    /// precondition as [`detach_current_thread`](Self::detach_current_thread).
    pub fn wait_for_other_threads_and_detach(&self) {
        let st_ptr = self.checked_thread();
        self.release_active_thread();

        // Enter this thread's scheduling loop; it switches back to the
        // initial fiber once the active count reaches zero.
        {
            let st = unsafe { &*st_ptr };
            unsafe { self.runtime.switch(st.initial.fiber(), st.sched_fiber) };
        }

        self.teardown_thread(st_ptr);
    }

    fn checked_thread(&self) -> *mut SchedulerThread {
        let st_ptr = require_thread();
        let st = unsafe { &*st_ptr };
        assert!(
            ptr::eq(Arc::as_ptr(&st.scheduler), self),
            "thread is attached to a different scheduler"
        );
        assert!(
            Arc::ptr_eq(&*st.current.borrow(), &st.initial),
            "cannot detach while a task is running on this thread"
        );
        st_ptr
    }

    /// Decrement `active_threads` under the queue mutex so the zero
    /// transition cannot slip between a loop's empty-queue check and its
    /// condvar wait.
    fn release_active_thread(&self) {
        let _queues = self.queues.lock();
        if self.active_threads.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.runnable_cond.notify_all();
        }
    }

    fn teardown_thread(&self, st_ptr: *mut SchedulerThread) {
        CURRENT_THREAD.with(|c| c.set(ptr::null_mut()));
        let st = unsafe { Box::from_raw(st_ptr) };
        unsafe {
            self.runtime.release_fiber(st.sched_fiber);
            self.runtime.release_current_thread(st.initial.fiber());
        }
    }

    /// Create a task running `entry` with the default 1 MiB stack and
    /// enqueue it. The new task does not preempt the caller; it runs when a
    /// scheduler thread next pops the run queue.
    pub fn spawn<F>(self: &Arc<Self>, entry: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_with_stack(entry, 0)
    }

    /// [`spawn`](Self::spawn) with an explicit stack size in bytes; zero
    /// selects the default.
    pub fn spawn_with_stack<F>(self: &Arc<Self>, entry: F, stack_size: usize) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };

        let task = Arc::new(Task::new(Arc::downgrade(self)));
        let fiber = {
            let task = Arc::clone(&task);
            self.runtime.create_fiber(
                Box::new(move || {
                    entry();
                    finish_current_task(task);
                }),
                stack_size,
            )
        };
        task.set_fiber(fiber);
        task.mark_ready();
        self.enqueue(Arc::clone(&task));

        TaskHandle(task)
    }

    /// Push a task onto the run queue and notify one waiting thread.
    pub(crate) fn enqueue(&self, task: Arc<Task>) {
        let mut queues = self.queues.lock();
        queues.runnable.push(task);
        drop(queues);
        self.runnable_cond.notify_one();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        assert_eq!(
            self.active_threads.load(Ordering::SeqCst),
            0,
            "scheduler destroyed while threads are attached"
        );

        // Tasks still queued never ran (or were abandoned at quiesce);
        // their stacks go back to the runtime.
        let queues = self.queues.get_mut();
        while let Some(task) = queues.runnable.pop() {
            unsafe { self.runtime.release_fiber(task.fiber()) };
        }
        while let Some(task) = queues.completed.pop() {
            unsafe { self.runtime.release_fiber(task.fiber()) };
        }
    }
}

/// The scheduling loop. Runs on each attached thread's dedicated scheduler
/// fiber; every suspension in the system switches here.
fn scheduler_loop() {
    let st = unsafe { &*require_thread() };
    let scheduler = &st.scheduler;

    loop {
        // Control is on the scheduler fiber because a task running on this
        // thread switched out (the first time through, the initial task).
        // Settle that task's hand-off before picking new work.
        if st.last_task_finished.replace(false) {
            // The finishing task left the queue mutex locked, so no other
            // thread can drain the completed queue, and free the stack the
            // task was still switching off of, before this point.
            let mut completed =
                unsafe { mem::take(&mut (*scheduler.queues.data_ptr()).completed) };
            unsafe { scheduler.queues.force_unlock() };
            while let Some(done) = completed.pop() {
                unsafe { scheduler.runtime.release_fiber(done.fiber()) };
            }
        } else {
            // Copy the hook out before releasing the hand-off lock; the
            // moment the lock drops another thread may dispatch the task,
            // and its record is off limits.
            let parked = {
                let current = st.current.borrow();
                Arc::clone(&current)
            };
            let hook = parked.take_unlock_hook();
            unsafe { parked.run_lock().force_unlock() };
            if let Some(hook) = hook {
                hook();
            }
        }

        let task = {
            let mut queues = scheduler.queues.lock();
            loop {
                if scheduler.active_threads.load(Ordering::SeqCst) == 0 {
                    break None;
                }
                if let Some(task) = queues.runnable.pop() {
                    break Some(task);
                }
                scheduler.runnable_cond.wait(&mut queues);
            }
        };
        let Some(task) = task else { break };

        // Hand-off lock first: if the task was woken before it finished
        // switching out on another thread, this blocks until that thread
        // has released it, i.e. until the task's context is safely saved.
        mem::forget(task.run_lock().lock());
        task.mark_running();
        *st.current.borrow_mut() = Arc::clone(&task);

        unsafe { scheduler.runtime.switch(st.sched_fiber, task.fiber()) };
    }

    // Quiesced: hand the thread back to its initial context, which is
    // parked inside wait_for_other_threads_and_detach.
    unsafe {
        scheduler
            .runtime
            .switch(st.sched_fiber, st.initial.fiber())
    };
    unreachable!("scheduler loop resumed after quiescing");
}

/// Completion trampoline tail: called on the task's own fiber after its
/// entry function returns. Never returns.
fn finish_current_task(task: Arc<Task>) -> ! {
    task.mark_completed();
    let task_fiber = task.fiber();

    let st = unsafe { &*require_thread() };
    let scheduler: *const Scheduler = Arc::as_ptr(&st.scheduler);
    let sched_fiber = st.sched_fiber;

    unsafe {
        let mut queues = (*scheduler).queues.lock();
        queues.completed.push(task);
        st.last_task_finished.set(true);
        // Keep the queue mutex locked across the final switch; the
        // scheduler fiber drains and unlocks. The task record must not be
        // touched past the push; another thread could free it immediately.
        mem::forget(queues);
        (*scheduler).runtime.switch(task_fiber, sched_fiber);
    }
    unreachable!("completed task was resumed");
}

/// Switch from the current task to this thread's scheduler fiber. Returns
/// when the task is next dispatched, possibly on a different thread.
fn switch_to_scheduler(task: &Arc<Task>) {
    let (runtime, task_fiber, sched_fiber) = {
        let st = unsafe { &*require_thread() };
        (Arc::clone(&st.scheduler.runtime), task.fiber(), st.sched_fiber)
    };
    unsafe { runtime.switch(task_fiber, sched_fiber) };
    // Resumed. The thread-local state captured above belongs to whichever
    // thread parked us and must not be reused here.
}

/// The task currently running on this thread. Fatal if the thread is not
/// attached to a scheduler.
pub fn current_task() -> TaskHandle {
    TaskHandle(current_arc())
}

/// Create a task on the current thread's scheduler. Fatal if the thread is
/// not attached; use [`Scheduler::spawn`] to spawn from outside.
pub fn spawn<F>(entry: F) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    let scheduler = {
        let st = unsafe { &*require_thread() };
        Arc::clone(&st.scheduler)
    };
    scheduler.spawn(entry)
}

/// Re-enqueue the current task and suspend it. The task resumes once every
/// task ahead of it in the run queue has had a turn.
pub fn yield_now() {
    let task = current_arc();
    task.wake();
    switch_to_scheduler(&task);
}

/// Park the current task without re-enqueueing it. Blocks until a
/// corresponding [`TaskHandle::wake`] is issued.
pub fn suspend_self() {
    let task = current_arc();
    task.transition_to_parked();
    switch_to_scheduler(&task);
}

/// Park the current task; once it is safely parked (its context saved and
/// no thread able to observe it running) the scheduler invokes `unlock`.
///
/// This is the atomic "register on a wait list, then release the list's
/// lock" primitive. A primitive that unlocked before suspending would race:
/// a releaser could wake the still-running task and enqueue it a second
/// time. Callers lock their wait-list mutex, register, `mem::forget` the
/// guard, and pass a hook that force-unlocks the mutex.
pub fn suspend_with_unlock<F>(unlock: F)
where
    F: FnOnce() + Send + 'static,
{
    let task = current_arc();
    task.set_unlock_hook(Box::new(unlock) as UnlockHook);
    task.transition_to_parked();
    switch_to_scheduler(&task);
}

/// Create a scheduler, run `entry` as its first task, and schedule with
/// `nthreads` total threads (the calling thread plus `nthreads - 1`
/// workers) until `entry` returns and the system quiesces.
///
/// `entry` runs as an ordinary task: it may yield, sleep, and block on
/// primitives, and may resume on any of the attached threads. Its
/// completion is what lets the scheduler quiesce; tasks it spawned that
/// are still pending when it returns are dropped unrun, so block on a
/// [`WaitGroup`](crate::sync::WaitGroup) inside `entry` to drain them.
/// `nthreads == 0` uses the number of CPU cores.
pub fn run<F>(runtime: Arc<dyn FiberRuntime>, nthreads: usize, entry: F)
where
    F: FnOnce(&Arc<Scheduler>) + Send + 'static,
{
    let nthreads = if nthreads == 0 {
        num_cpus::get()
    } else {
        nthreads
    };

    let scheduler = Scheduler::new(runtime);
    scheduler
        .attach_current_thread()
        .expect("driver thread already attached to a scheduler");

    let workers: Vec<_> = (1..nthreads)
        .map(|i| {
            let scheduler = Arc::clone(&scheduler);
            thread::Builder::new()
                .name(format!("strand-worker-{i}"))
                .spawn(move || {
                    scheduler
                        .attach_current_thread()
                        .expect("worker thread already attached to a scheduler");
                    scheduler.wait_for_other_threads_and_detach();
                })
                .expect("failed to spawn scheduler worker thread")
        })
        .collect();

    // The entry task holds one slot in the active count, so every thread
    // keeps scheduling until it has returned, exactly like a driver thread
    // that never suspends.
    scheduler.active_threads.fetch_add(1, Ordering::SeqCst);
    {
        let entry_scheduler = Arc::clone(&scheduler);
        scheduler.spawn(move || {
            entry(&entry_scheduler);
            entry_scheduler.release_active_thread();
        });
    }

    scheduler.wait_for_other_threads_and_detach();
    for worker in workers {
        worker.join().expect("scheduler worker thread panicked");
    }
}
