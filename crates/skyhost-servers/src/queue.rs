//! FIFO of server ids waiting to be started

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct StartQueue {
    ids: Mutex<VecDeque<String>>,
    closed: AtomicBool,
}

impl StartQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a start. Ignored once the queue is closed.
    pub fn push(&self, id: impl Into<String>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.ids.lock().push_back(id.into());
        true
    }

    pub fn pop(&self) -> Option<String> {
        self.ids.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }

    /// Drop pending starts and refuse new ones
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ids.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = StartQueue::new();
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.pop().as_deref(), Some("a"));
        assert_eq!(queue.pop().as_deref(), Some("b"));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_closed_queue_refuses() {
        let queue = StartQueue::new();
        queue.push("a");
        queue.close();
        assert!(queue.is_empty());
        assert!(!queue.push("b"));
        assert!(queue.is_closed());
    }
}
