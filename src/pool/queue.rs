//! Bounded blocking FIFO holding connections that are ready for lease
//!
//! The semaphore's permit count always equals the number of queued items, so a
//! waiter that wins a permit is guaranteed to find an item under the lock.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Semaphore;

pub(crate) struct ReadyQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Semaphore,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> ReadyQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Semaphore::new(0),
        }
    }

    /// Enqueue an item and wake one waiter. Hands the item back once closed.
    pub(crate) fn push(&self, item: T) -> Result<(), T> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(item);
        }
        inner.items.push_back(item);
        self.available.add_permits(1);
        Ok(())
    }

    /// Dequeue without waiting
    pub(crate) fn try_pop(&self) -> Option<T> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        self.lock().items.pop_front()
    }

    /// Dequeue, waiting up to `timeout` for an item. `None` on timeout or close.
    pub(crate) async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        match tokio::time::timeout(timeout, self.available.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                self.lock().items.pop_front()
            }
            _ => None,
        }
    }

    /// Take every queued item and fail all current and future waiters
    pub(crate) fn close(&self) -> Vec<T> {
        let mut inner = self.lock();
        inner.closed = true;
        self.available.close();
        inner.items.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().items.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        // A panic while holding this lock cannot leave the deque half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let queue = ReadyQueue::new(4);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.push(3).unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[tokio::test]
    async fn test_pop_timeout_expires() {
        let queue: ReadyQueue<u32> = ReadyQueue::new(1);
        let start = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(100)).await, None);
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_waiter_woken_by_push() {
        let queue = Arc::new(ReadyQueue::new(1));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop_timeout(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.push(7u32).unwrap();

        assert_eq!(waiter.await.unwrap(), Some(7));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_close_drains_and_fails_waiters() {
        let queue = ReadyQueue::new(2);
        queue.push("a").unwrap();
        queue.push("b").unwrap();

        let drained = queue.close();
        assert_eq!(drained, vec!["a", "b"]);
        assert_eq!(queue.push("c"), Err("c"));
        assert_eq!(queue.try_pop(), None);
        assert_eq!(queue.pop_timeout(Duration::from_secs(5)).await, None);
    }
}
