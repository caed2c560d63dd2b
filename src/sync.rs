//! # Synchronization Primitives
//!
//! Mutexes and counting semaphores with bounded FIFO wait-queues. These types
//! only track ownership, counts and queues; the kernel turns their outcomes
//! into task state changes (blocking, waking, priority inheritance).
//!
//! On the target the same module also provides [`critical_section`], the
//! interrupt-masking wrapper used to reach the global kernel instance.

use arrayvec::ArrayVec;

use crate::config::{MAX_MUTEX_QUEUE_SIZE, MAX_SEMAPHORE_QUEUE_SIZE};
use crate::error::KernelError;
use crate::task::TaskIndex;

// ---------------------------------------------------------------------------
// Wait-queue
// ---------------------------------------------------------------------------

/// Bounded FIFO of blocked tasks.
#[derive(Debug, Clone)]
pub struct WaitQueue<const N: usize> {
    tasks: ArrayVec<TaskIndex, N>,
}

impl<const N: usize> WaitQueue<N> {
    pub const fn new() -> Self {
        Self { tasks: ArrayVec::new_const() }
    }

    /// Append `task`. A task never appears twice.
    pub fn push(&mut self, task: TaskIndex) -> Result<(), KernelError> {
        if self.contains(task) {
            return Ok(());
        }
        self.tasks.try_push(task).map_err(|_| KernelError::QueueFull)
    }

    /// Remove and return the head.
    pub fn pop(&mut self) -> Option<TaskIndex> {
        if self.tasks.is_empty() {
            None
        } else {
            Some(self.tasks.remove(0))
        }
    }

    /// Remove `task` wherever it is, keeping the order of the others.
    pub fn remove(&mut self, task: TaskIndex) -> bool {
        match self.tasks.iter().position(|&t| t == task) {
            Some(pos) => {
                self.tasks.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, task: TaskIndex) -> bool {
        self.tasks.contains(&task)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Queued tasks, head first.
    pub fn iter(&self) -> impl Iterator<Item = TaskIndex> + '_ {
        self.tasks.iter().copied()
    }
}

impl<const N: usize> Default for WaitQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// Result of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The requester now owns the mutex.
    Acquired,
    /// The requester was queued behind `owner`.
    Blocked { owner: TaskIndex },
}

/// Binary lock with a FIFO hand-off queue.
///
/// When the owner unlocks with waiters present, ownership passes directly to
/// the head of the queue; the mutex is never observed free in between.
#[derive(Debug, Clone, Default)]
pub struct Mutex {
    owner: Option<TaskIndex>,
    queue: WaitQueue<MAX_MUTEX_QUEUE_SIZE>,
}

impl Mutex {
    pub const fn new() -> Self {
        Self { owner: None, queue: WaitQueue::new() }
    }

    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    pub fn owner(&self) -> Option<TaskIndex> {
        self.owner
    }

    pub fn queue(&self) -> &WaitQueue<MAX_MUTEX_QUEUE_SIZE> {
        &self.queue
    }

    /// Take the mutex or join its queue. Locking a mutex already owned by
    /// the requester succeeds without effect.
    pub fn lock(&mut self, requester: TaskIndex) -> Result<LockOutcome, KernelError> {
        match self.owner {
            None => {
                self.owner = Some(requester);
                Ok(LockOutcome::Acquired)
            }
            Some(owner) if owner == requester => Ok(LockOutcome::Acquired),
            Some(owner) => {
                self.queue.push(requester)?;
                Ok(LockOutcome::Blocked { owner })
            }
        }
    }

    /// Release the mutex held by `task`. Returns the task that now owns it,
    /// if any waiter was queued.
    pub fn unlock(&mut self, task: TaskIndex) -> Result<Option<TaskIndex>, KernelError> {
        if self.owner != Some(task) {
            return Err(KernelError::ProtocolViolation);
        }
        self.owner = self.queue.pop();
        Ok(self.owner)
    }

    /// Drop `task` from the wait-queue.
    pub fn cancel_wait(&mut self, task: TaskIndex) -> bool {
        self.queue.remove(task)
    }
}

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

/// Result of a wait request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A unit was available and has been taken.
    Proceed,
    /// The caller was queued.
    Blocked,
}

/// Counting semaphore with a FIFO wait-queue.
#[derive(Debug, Clone, Default)]
pub struct Semaphore {
    count: u32,
    queue: WaitQueue<MAX_SEMAPHORE_QUEUE_SIZE>,
}

impl Semaphore {
    pub const fn new(count: u32) -> Self {
        Self { count, queue: WaitQueue::new() }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn queue(&self) -> &WaitQueue<MAX_SEMAPHORE_QUEUE_SIZE> {
        &self.queue
    }

    /// Reset the count. Used when the kernel is set up.
    pub fn set_count(&mut self, count: u32) {
        self.count = count;
    }

    pub fn wait(&mut self, task: TaskIndex) -> Result<WaitOutcome, KernelError> {
        if self.count > 0 {
            self.count -= 1;
            return Ok(WaitOutcome::Proceed);
        }
        self.queue.push(task)?;
        Ok(WaitOutcome::Blocked)
    }

    /// Release one unit. When a task is waiting, the unit goes straight to
    /// the head of the queue, which is returned so the caller can wake it.
    pub fn post(&mut self) -> Option<TaskIndex> {
        self.count += 1;
        let woken = self.queue.pop();
        if woken.is_some() {
            // transferred to the waiter
            self.count -= 1;
        }
        woken
    }

    /// Drop `task` from the wait-queue.
    pub fn cancel_wait(&mut self, task: TaskIndex) -> bool {
        self.queue.remove(task)
    }
}

// ---------------------------------------------------------------------------
// Critical sections (target only)
// ---------------------------------------------------------------------------

/// Execute a closure within a critical section (interrupts disabled).
///
/// The kernel's exception handlers already run mutually exclusive at the
/// lowest priority; this is for thread-mode code that touches the global
/// kernel before the scheduler starts.
#[cfg(all(target_arch = "arm", target_os = "none"))]
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(&cortex_m::interrupt::CriticalSection) -> R,
{
    cortex_m::interrupt::free(f)
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_queue_is_fifo_and_rejects_overflow() {
        let mut q = WaitQueue::<3>::new();
        q.push(4).unwrap();
        q.push(1).unwrap();
        q.push(7).unwrap();
        assert_eq!(q.push(2), Err(KernelError::QueueFull));
        assert_eq!(q.pop(), Some(4));
        assert_eq!(q.iter().collect::<Vec<_>>(), vec![1, 7]);
    }

    #[test]
    fn test_queue_remove_keeps_order() {
        let mut q = WaitQueue::<4>::new();
        for t in [3, 5, 8, 9] {
            q.push(t).unwrap();
        }
        assert!(q.remove(5));
        assert!(!q.remove(5));
        assert_eq!(q.iter().collect::<Vec<_>>(), vec![3, 8, 9]);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_queue_never_holds_duplicates() {
        let mut q = WaitQueue::<2>::new();
        q.push(1).unwrap();
        q.push(1).unwrap();
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_mutex_hands_off_in_arrival_order() {
        let mut m = Mutex::new();
        assert_eq!(m.lock(0), Ok(LockOutcome::Acquired));
        assert_eq!(m.lock(2), Ok(LockOutcome::Blocked { owner: 0 }));
        assert_eq!(m.lock(1), Ok(LockOutcome::Blocked { owner: 0 }));
        assert_eq!(m.unlock(0), Ok(Some(2)));
        assert_eq!(m.owner(), Some(2));
        assert_eq!(m.unlock(2), Ok(Some(1)));
        assert_eq!(m.unlock(1), Ok(None));
        assert!(!m.is_locked());
        assert!(m.queue().is_empty());
    }

    #[test]
    fn test_mutex_unlock_by_non_owner_is_rejected() {
        let mut m = Mutex::new();
        assert_eq!(m.unlock(0), Err(KernelError::ProtocolViolation));
        m.lock(0).unwrap();
        assert_eq!(m.unlock(1), Err(KernelError::ProtocolViolation));
        assert_eq!(m.owner(), Some(0));
    }

    #[test]
    fn test_mutex_relock_by_owner_is_noop() {
        let mut m = Mutex::new();
        m.lock(3).unwrap();
        assert_eq!(m.lock(3), Ok(LockOutcome::Acquired));
        assert!(m.queue().is_empty());
    }

    #[test]
    fn test_mutex_queue_overflow() {
        let mut m = Mutex::new();
        m.lock(0).unwrap();
        for t in 1..=MAX_MUTEX_QUEUE_SIZE {
            m.lock(t).unwrap();
        }
        assert_eq!(m.lock(MAX_MUTEX_QUEUE_SIZE + 1), Err(KernelError::QueueFull));
    }

    #[test]
    fn test_semaphore_fast_path() {
        let mut s = Semaphore::new(2);
        assert_eq!(s.wait(0), Ok(WaitOutcome::Proceed));
        assert_eq!(s.wait(1), Ok(WaitOutcome::Proceed));
        assert_eq!(s.wait(2), Ok(WaitOutcome::Blocked));
        assert_eq!(s.count(), 0);
    }

    #[test]
    fn test_semaphore_post_transfers_to_waiter() {
        let mut s = Semaphore::new(0);
        s.wait(5).unwrap();
        s.wait(6).unwrap();
        assert_eq!(s.post(), Some(5));
        assert_eq!(s.count(), 0);
        assert_eq!(s.queue().len(), 1);
        assert_eq!(s.post(), Some(6));
        assert_eq!(s.post(), None);
        assert_eq!(s.count(), 1);
    }

    #[test]
    fn test_semaphore_cancel_wait() {
        let mut s = Semaphore::new(0);
        s.wait(1).unwrap();
        s.wait(2).unwrap();
        assert!(s.cancel_wait(1));
        assert_eq!(s.post(), Some(2));
    }

    /// Lock and unlock traffic from more tasks than the queue can hold
    /// behind one owner, checked against a plain FIFO model.
    #[quickcheck]
    fn test_mutex_matches_fifo_model(bytecode: Vec<u8>) {
        const TASKS: usize = MAX_MUTEX_QUEUE_SIZE + 1;
        let mut m = Mutex::new();
        let mut owner = None;
        let mut waiting: Vec<TaskIndex> = Vec::new();

        for &byte in &bytecode {
            let task = usize::from(byte >> 1) % TASKS;
            if waiting.contains(&task) {
                // blocked tasks issue no requests
                continue;
            }
            if byte & 1 == 0 {
                let outcome = m.lock(task).unwrap();
                match owner {
                    None => {
                        owner = Some(task);
                        assert_eq!(outcome, LockOutcome::Acquired);
                    }
                    Some(o) if o == task => assert_eq!(outcome, LockOutcome::Acquired),
                    Some(o) => {
                        waiting.push(task);
                        assert_eq!(outcome, LockOutcome::Blocked { owner: o });
                    }
                }
            } else if owner == Some(task) {
                owner = if waiting.is_empty() { None } else { Some(waiting.remove(0)) };
                assert_eq!(m.unlock(task), Ok(owner));
            } else {
                assert_eq!(m.unlock(task), Err(KernelError::ProtocolViolation));
            }
            assert_eq!(m.owner(), owner);
            assert_eq!(m.queue().iter().collect::<Vec<_>>(), waiting);
        }
    }
}
