//! Task records and the FIFO lists that own them
//!
//! A task is an `Arc`-shared record; the scheduler owns every live task
//! through its queues, user code holds non-owning [`TaskHandle`]s, and the
//! entry closure travels inside the task's fiber. Per-thread scheduling
//! state never lives in the task, so a task may resume on a different
//! thread than the one it last ran on.

use crate::fiber::Fiber;
use crate::scheduler::scheduler::Scheduler;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Unique identifier for a task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    pub(crate) fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric ID value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Scheduling state of a task.
///
/// A task is in exactly one of {run queue, completed queue, parked,
/// running} at any instant; the state word tracks which, and every
/// transition is checked so a double wake or a wake of a completed task
/// fails loudly instead of corrupting a queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum TaskState {
    /// Created but not yet enqueued.
    Created = 0,
    /// On its scheduler's run queue.
    Ready = 1,
    /// Executing on some thread.
    Running = 2,
    /// Suspended with no queue membership; awaits a wake.
    Parked = 3,
    /// Entry function returned; terminal.
    Completed = 4,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Created,
            1 => TaskState::Ready,
            2 => TaskState::Running,
            3 => TaskState::Parked,
            4 => TaskState::Completed,
            _ => unreachable!("invalid task state {raw}"),
        }
    }
}

pub(crate) type UnlockHook = Box<dyn FnOnce() + Send + 'static>;

/// One logical unit of cooperative work: a fiber plus scheduling state.
pub(crate) struct Task {
    id: TaskId,
    /// Non-owning back-reference; the scheduler owns its tasks, not the
    /// other way around.
    scheduler: Weak<Scheduler>,
    /// Set exactly once, between task creation and first enqueue.
    fiber: OnceCell<Fiber>,
    state: AtomicU8,
    /// Hand-off lock: held by the dispatching thread from before switch-in
    /// until after switch-out, so a thread that pops a freshly woken task
    /// cannot switch into a context that is still being saved elsewhere.
    run_lock: Mutex<()>,
    /// Invoked by the scheduler fiber once the task is safely parked.
    unlock_hook: Mutex<Option<UnlockHook>>,
}

impl Task {
    pub(crate) fn new(scheduler: Weak<Scheduler>) -> Self {
        Task {
            id: TaskId::next(),
            scheduler,
            fiber: OnceCell::new(),
            state: AtomicU8::new(TaskState::Created as u8),
            run_lock: Mutex::new(()),
            unlock_hook: Mutex::new(None),
        }
    }

    /// The placeholder representing an attached thread itself, before and
    /// between real tasks. Born running on its adopted fiber.
    pub(crate) fn initial(fiber: Fiber, scheduler: Weak<Scheduler>) -> Arc<Self> {
        let task = Task::new(scheduler);
        task.fiber.set(fiber).expect("fiber already set");
        task.state.store(TaskState::Running as u8, Ordering::SeqCst);
        Arc::new(task)
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn fiber(&self) -> Fiber {
        *self.fiber.get().expect("task has no fiber")
    }

    pub(crate) fn set_fiber(&self, fiber: Fiber) {
        let set = self.fiber.set(fiber);
        assert!(set.is_ok(), "fiber already set");
    }

    pub(crate) fn run_lock(&self) -> &Mutex<()> {
        &self.run_lock
    }

    pub(crate) fn set_unlock_hook(&self, hook: UnlockHook) {
        let mut slot = self.unlock_hook.lock();
        debug_assert!(slot.is_none(), "unlock hook already pending");
        *slot = Some(hook);
    }

    pub(crate) fn take_unlock_hook(&self) -> Option<UnlockHook> {
        self.unlock_hook.lock().take()
    }

    /// Created -> Ready, performed by spawn just before the first enqueue.
    pub(crate) fn mark_ready(&self) {
        let previous = self.state.compare_exchange(
            TaskState::Created as u8,
            TaskState::Ready as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        assert!(previous.is_ok(), "task {:?} enqueued twice at spawn", self.id);
    }

    /// Ready -> Running, performed by the scheduling loop after a pop.
    pub(crate) fn mark_running(&self) {
        let previous = self.state.compare_exchange(
            TaskState::Ready as u8,
            TaskState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        assert!(
            previous.is_ok(),
            "task {:?} dispatched in unexpected state {:?}",
            self.id,
            previous.map_err(TaskState::from_u8)
        );
    }

    /// Running -> Completed, performed by the completion trampoline.
    pub(crate) fn mark_completed(&self) {
        let previous = self.state.compare_exchange(
            TaskState::Running as u8,
            TaskState::Completed as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        assert!(
            previous.is_ok(),
            "task {:?} was woken but completed without suspending",
            self.id
        );
    }

    /// Running -> Parked. A concurrent wake may already have moved the task
    /// to Ready; that is the legal wake-before-park case and the state is
    /// left alone.
    pub(crate) fn transition_to_parked(&self) {
        let _ = self.state.compare_exchange(
            TaskState::Running as u8,
            TaskState::Parked as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Make the task runnable: enqueue it on its scheduler and notify one
    /// waiting scheduler thread. Exactly one wake must be issued per
    /// suspension; anything else is a checked fatal error.
    pub(crate) fn wake(self: &Arc<Self>) {
        let mut state = self.state.load(Ordering::SeqCst);
        loop {
            match TaskState::from_u8(state) {
                TaskState::Running | TaskState::Parked => {
                    match self.state.compare_exchange(
                        state,
                        TaskState::Ready as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => break,
                        Err(actual) => state = actual,
                    }
                }
                TaskState::Ready => panic!("task {:?} woken while already queued", self.id),
                TaskState::Completed => panic!("task {:?} woken after completion", self.id),
                TaskState::Created => panic!("task {:?} woken before being spawned", self.id),
            }
        }

        let scheduler = self
            .scheduler
            .upgrade()
            .expect("task outlived its scheduler");
        scheduler.enqueue(Arc::clone(self));
    }
}

/// Non-owning reference to a spawned task.
///
/// Valid for [`wake`](TaskHandle::wake) until the task's entry function
/// returns; waking a completed task is a fatal error.
#[derive(Clone)]
pub struct TaskHandle(pub(crate) Arc<Task>);

impl TaskHandle {
    /// The task's unique identifier.
    pub fn id(&self) -> TaskId {
        self.0.id()
    }

    /// Wake the task: unblocks its pending suspension, enqueueing the task
    /// on its scheduler's run queue. May be called from any thread,
    /// attached or not.
    pub fn wake(&self) {
        self.0.wake();
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TaskHandle").field(&self.0.id()).finish()
    }
}

/// FIFO list of tasks. A task is in at most one list at any instant.
#[derive(Default)]
pub(crate) struct TaskList {
    tasks: VecDeque<Arc<Task>>,
}

impl TaskList {
    pub(crate) const fn new() -> Self {
        TaskList {
            tasks: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, task: Arc<Task>) {
        self.tasks.push_back(task);
    }

    pub(crate) fn pop(&mut self) -> Option<Arc<Task>> {
        self.tasks.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_are_unique_and_increasing() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_task_list_fifo_order() {
        let mut list = TaskList::new();
        assert!(list.is_empty());

        let t1 = Arc::new(Task::new(Weak::new()));
        let t2 = Arc::new(Task::new(Weak::new()));
        let t3 = Arc::new(Task::new(Weak::new()));

        list.push(Arc::clone(&t1));
        list.push(Arc::clone(&t2));
        list.push(Arc::clone(&t3));

        assert_eq!(list.pop().unwrap().id(), t1.id());
        assert_eq!(list.pop().unwrap().id(), t2.id());
        assert_eq!(list.pop().unwrap().id(), t3.id());
        assert!(list.pop().is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn test_state_transitions() {
        let task = Task::new(Weak::new());
        task.mark_ready();
        task.mark_running();
        task.transition_to_parked();
        assert_eq!(
            TaskState::from_u8(task.state.load(Ordering::SeqCst)),
            TaskState::Parked
        );
    }

    #[test]
    #[should_panic(expected = "dispatched in unexpected state")]
    fn test_dispatch_without_enqueue_is_fatal() {
        let task = Task::new(Weak::new());
        task.mark_running();
    }
}
