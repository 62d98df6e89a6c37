//! Synchronization primitives for task coordination
//!
//! These primitives block at the task level instead of the OS-thread
//! level: a blocked acquire or wait parks the calling task and hands its
//! thread back to the scheduler. All of them are built on the scheduler's
//! suspend-with-unlock contract.

mod semaphore;
mod wait_group;

pub use semaphore::Semaphore;
pub use wait_group::WaitGroup;
