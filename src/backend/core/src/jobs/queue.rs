//! Bounded job queue with priority buckets.
//!
//! One FIFO per priority level; `dequeue` drains the highest non-empty level
//! first. Capacity is fixed at construction. Enqueue never waits: a saturated
//! queue hands the item back so the caller can apply backpressure.

use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use tokio::sync::Notify;

use super::job::MAX_PRIORITY;

/// Why an item was refused; the item is handed back.
pub enum EnqueueError<T> {
    /// The queue holds `capacity` items.
    Full(T),
    /// The queue was closed.
    Closed(T),
}

impl<T> EnqueueError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

impl<T> fmt::Debug for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

struct QueueState<T> {
    buckets: BTreeMap<u8, VecDeque<T>>,
    len: usize,
    closed: bool,
}

/// Fixed-capacity FIFO-with-priority buffer shared by the workers of one pool.
pub struct JobQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Notify,
    capacity: usize,
}

impl<T> JobQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                buckets: BTreeMap::new(),
                len: 0,
                closed: false,
            }),
            available: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Add `item` at `priority` (clamped to [`MAX_PRIORITY`]) without waiting.
    pub fn try_enqueue(&self, item: T, priority: u8) -> Result<(), EnqueueError<T>> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(EnqueueError::Closed(item));
            }
            if state.len >= self.capacity {
                return Err(EnqueueError::Full(item));
            }
            state
                .buckets
                .entry(priority.min(MAX_PRIORITY))
                .or_default()
                .push_back(item);
            state.len += 1;
        }
        self.available.notify_one();
        Ok(())
    }

    /// Take the next item without waiting.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut state = self.state.lock();
        let item = {
            let mut bucket = state.buckets.last_entry()?;
            let item = bucket.get_mut().pop_front();
            if bucket.get().is_empty() {
                bucket.remove();
            }
            item
        };
        if item.is_some() {
            state.len -= 1;
        }
        item
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<T> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_dequeue() {
                return Some(item);
            }
            if self.is_closed() {
                // Remaining items may have been enqueued between the two checks.
                return self.try_dequeue();
            }

            notified.await;
        }
    }

    /// Refuse further items and wake every waiting consumer. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.available.notify_waiters();
    }
}

impl<T> fmt::Debug for JobQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("JobQueue")
            .field("len", &state.len)
            .field("capacity", &self.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_priority_then_fifo() {
        let queue = JobQueue::new(10);
        queue.try_enqueue("analytics-1", 1).unwrap();
        queue.try_enqueue("invoice-1", 5).unwrap();
        queue.try_enqueue("notification-1", 3).unwrap();
        queue.try_enqueue("invoice-2", 5).unwrap();
        queue.try_enqueue("analytics-2", 1).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| queue.try_dequeue()).collect();
        assert_eq!(
            order,
            vec!["invoice-1", "invoice-2", "notification-1", "analytics-1", "analytics-2"]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_returns_item() {
        let queue = JobQueue::new(2);
        queue.try_enqueue(1, 0).unwrap();
        queue.try_enqueue(2, 0).unwrap();

        let err = queue.try_enqueue(3, 9).unwrap_err();
        assert!(err.is_full());
        assert_eq!(err.into_inner(), 3);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_priority_is_clamped() {
        let queue = JobQueue::new(4);
        queue.try_enqueue("ten", 10).unwrap();
        queue.try_enqueue("huge", 200).unwrap();
        assert_eq!(queue.try_dequeue(), Some("ten"));
        assert_eq!(queue.try_dequeue(), Some("huge"));
    }

    #[tokio::test]
    async fn test_close_drains_then_reports_closed() {
        let queue = JobQueue::new(4);
        queue.try_enqueue('a', 0).unwrap();
        queue.try_enqueue('b', 0).unwrap();
        queue.close();

        assert!(matches!(queue.try_enqueue('c', 0), Err(EnqueueError::Closed('c'))));
        assert_eq!(queue.dequeue().await, Some('a'));
        assert_eq!(queue.dequeue().await, Some('b'));
        assert_eq!(queue.dequeue().await, None);
    }

    #[test]
    fn test_dequeue_pending_until_enqueue() {
        let queue = JobQueue::new(2);
        let mut dequeue = tokio_test::task::spawn(queue.dequeue());
        tokio_test::assert_pending!(dequeue.poll());

        queue.try_enqueue(7, 0).unwrap();
        assert!(dequeue.is_woken());
        tokio_test::assert_ready_eq!(dequeue.poll(), Some(7));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(JobQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.try_enqueue(42, 0).unwrap();

        let item = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item, Some(42));
    }

    #[tokio::test]
    async fn test_close_wakes_all_waiters() {
        let queue: Arc<JobQueue<u32>> = Arc::new(JobQueue::new(4));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.dequeue().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        for waiter in waiters {
            let result = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(result, None);
        }
    }
}
