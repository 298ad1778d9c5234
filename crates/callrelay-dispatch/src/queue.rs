//! Bounded drop-oldest queue shared by the hub and the relay workers

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

/// A bounded FIFO that drops its oldest entry when full
///
/// Producers never block: pushing onto a full queue evicts the oldest
/// entry, so a stalled consumer only ever loses its own backlog.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` entries
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push an entry, evicting the oldest when full
    ///
    /// Returns false if the queue is closed; the entry is discarded.
    pub fn push(&self, item: T) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            items.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next entry; `None` once the queue is closed and drained
    pub async fn pop(&self) -> Option<T> {
        loop {
            if let Some(item) = self.items.lock().pop_front() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Take the next entry without waiting
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Close the queue and wake all waiting consumers
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        // A consumer parked before the store still needs a wakeup.
        self.notify.notify_one();
    }

    /// Whether the queue has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Entries currently queued
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is currently empty
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Entries evicted so far because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let queue = BoundedQueue::new(8);
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let queue = BoundedQueue::new(2);
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
    }

    #[test]
    fn test_closed_queue_refuses_pushes() {
        let queue = BoundedQueue::new(2);
        queue.push(1);
        queue.close();

        assert!(!queue.push(2));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_pop_drains_then_ends_after_close() {
        let queue = BoundedQueue::new(4);
        queue.push("a");
        queue.close();

        assert_eq!(queue.pop().await, Some("a"));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_waiting_pop_wakes_on_push() {
        let queue = Arc::new(BoundedQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::task::yield_now().await;
        queue.push(42);

        assert_eq!(consumer.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_waiting_pop_wakes_on_close() {
        let queue = Arc::new(BoundedQueue::<u8>::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::task::yield_now().await;
        queue.close();

        assert_eq!(consumer.await.unwrap(), None);
    }
}
