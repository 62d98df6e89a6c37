//! Process-wide timer service
//!
//! One dedicated thread waits on a 4-ary min-heap of pending deadlines and
//! wakes the owning task of each expired timer. Instead of polling, the
//! thread sleeps on a condvar until the earliest deadline (or indefinitely
//! when the heap is empty) and is nudged whenever a new timer becomes the
//! root. The service starts lazily with the first scheduler and runs until
//! process exit.

use crate::scheduler::scheduler::{current_arc, suspend_with_unlock};
use crate::scheduler::task::Task;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::mem;
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

/// One pending timer: an absolute deadline and the task to wake.
struct Timer {
    deadline: Instant,
    task: Arc<Task>,
}

/// Array-backed 4-ary min-heap keyed by deadline. Children of node `i` sit
/// at `4i + 1 ..= 4i + 4`, its parent at `(i - 1) / 4`. Wider nodes keep
/// the heap shallow, which matters because every sleep does one bubble-up
/// under the service lock.
#[derive(Default)]
struct TimerHeap {
    timers: Vec<Timer>,
}

impl TimerHeap {
    const fn new() -> Self {
        TimerHeap { timers: Vec::new() }
    }

    fn peek_deadline(&self) -> Option<Instant> {
        self.timers.first().map(|t| t.deadline)
    }

    /// Insert and restore heap order. Returns true if the new timer became
    /// the root, i.e. the processing thread's current wait is now too long.
    fn push(&mut self, timer: Timer) -> bool {
        self.timers.push(timer);
        self.bubble_up(self.timers.len() - 1) == 0
    }

    /// Remove the earliest timer: move the last element into the root slot
    /// and sift it down.
    fn pop_root(&mut self) -> Timer {
        let last = self.timers.len() - 1;
        self.timers.swap(0, last);
        let timer = self.timers.pop().expect("pop from empty timer heap");
        if !self.timers.is_empty() {
            self.bubble_down(0);
        }
        timer
    }

    fn bubble_up(&mut self, mut index: usize) -> usize {
        while index > 0 {
            let parent = (index - 1) / 4;
            if self.timers[index].deadline >= self.timers[parent].deadline {
                break;
            }
            self.timers.swap(index, parent);
            index = parent;
        }
        index
    }

    fn bubble_down(&mut self, mut index: usize) {
        let len = self.timers.len();
        loop {
            let first_child = index * 4 + 1;
            if first_child >= len {
                break;
            }

            // Minimum of up to four children, examined in two pairs.
            let mut candidate = first_child;
            if first_child + 1 < len
                && self.timers[first_child + 1].deadline < self.timers[candidate].deadline
            {
                candidate = first_child + 1;
            }
            let third_child = first_child + 2;
            if third_child < len {
                let mut sibling = third_child;
                if third_child + 1 < len
                    && self.timers[third_child + 1].deadline < self.timers[sibling].deadline
                {
                    sibling = third_child + 1;
                }
                if self.timers[sibling].deadline < self.timers[candidate].deadline {
                    candidate = sibling;
                }
            }

            if self.timers[candidate].deadline >= self.timers[index].deadline {
                break;
            }
            self.timers.swap(index, candidate);
            index = candidate;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.timers.len()
    }
}

/// Shared state of the timer service.
struct TimerContext {
    lock: Mutex<TimerHeap>,
    cond: Condvar,
}

static TIMERS: Lazy<TimerContext> = Lazy::new(|| TimerContext {
    lock: Mutex::new(TimerHeap::new()),
    cond: Condvar::new(),
});

/// Start the timer-processing thread. Called once per process, from the
/// first scheduler construction.
pub(crate) fn ensure_started() {
    static STARTED: Once = Once::new();
    STARTED.call_once(|| {
        thread::Builder::new()
            .name("strand-timer".to_string())
            .spawn(|| timer_process(&TIMERS))
            .expect("failed to spawn timer thread");
    });
}

/// Timer thread main loop: wake everything expired, then sleep until the
/// next deadline or a notification.
fn timer_process(ctx: &TimerContext) {
    let mut heap = ctx.lock.lock();
    loop {
        let now = Instant::now();
        while let Some(deadline) = heap.peek_deadline() {
            if deadline > now {
                break;
            }
            let timer = heap.pop_root();
            timer.task.wake();
        }

        match heap.peek_deadline() {
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    // Wakes early if a new timer becomes the root.
                    let _ = ctx.cond.wait_for(&mut heap, deadline - now);
                }
            }
            None => ctx.cond.wait(&mut heap),
        }
    }
}

/// Suspend the current task for at least `duration`.
///
/// A zero duration still parks the task and immediately requeues it: the
/// behavior of [`yield_now`](crate::scheduler::yield_now), modulo the trip
/// through the timer thread. Fatal if the calling thread is not attached
/// to a scheduler.
pub fn sleep(duration: Duration) {
    let task = current_arc();
    let deadline = Instant::now() + duration;

    let mut heap = TIMERS.lock.lock();
    if heap.push(Timer { deadline, task }) {
        TIMERS.cond.notify_one();
    }

    // Park first, release the timer lock after: were the lock released
    // here, the timer thread could pop the entry and wake the task before
    // it has switched out.
    mem::forget(heap);
    suspend_with_unlock(|| unsafe { TIMERS.lock.force_unlock() });
}
