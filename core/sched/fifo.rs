//! FIFO wait queues
//!
//! Fibers blocked on a primitive wait here in the order they arrived.
//! Queues are only mutated with the owning scheduler's lock held, so the
//! inner lock never nests the other way round.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::FiberId;

/// FIFO queue of blocked fibers
#[derive(Debug, Default)]
pub struct WaitQueue {
    /// Queue of fibers
    waiters: Mutex<VecDeque<FiberId>>,
}

impl WaitQueue {
    /// Create a new, empty wait queue
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Add a fiber to the queue (FIFO - add to back)
    pub(crate) fn push(&self, id: FiberId) {
        self.waiters.lock().push_back(id);
    }

    /// Remove and return the longest-waiting fiber
    pub(crate) fn pop(&self) -> Option<FiberId> {
        self.waiters.lock().pop_front()
    }

    /// Remove every fiber, oldest first
    pub(crate) fn drain(&self) -> VecDeque<FiberId> {
        std::mem::take(&mut *self.waiters.lock())
    }

    /// Remove a specific fiber, e.g. one whose wait timed out
    pub(crate) fn remove(&self, id: FiberId) -> bool {
        let mut waiters = self.waiters.lock();
        match waiters.iter().position(|&waiter| waiter == id) {
            Some(index) => {
                waiters.remove(index);
                true
            }
            None => false,
        }
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Get the length of the queue
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = WaitQueue::new();
        assert!(queue.is_empty());
        queue.push(3);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_remove_keeps_order() {
        let queue = WaitQueue::new();
        for id in 1..=4 {
            queue.push(id);
        }
        assert!(queue.remove(2));
        assert!(!queue.remove(2));
        assert_eq!(queue.drain(), VecDeque::from(vec![1, 3, 4]));
        assert!(queue.is_empty());
    }
}
