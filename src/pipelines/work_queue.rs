// SPDX-License-Identifier: GPL-3.0-only

//! Hand-off queue between the capture and encode threads
//!
//! A mutex-guarded FIFO with a condition variable. Consumers block in
//! [`WorkQueue::pop`] until an item arrives or their [`CancelToken`] fires.
//! The queue is safe for any number of producers and consumers.

use crate::constants::QUEUE_DEPTH_WARNING;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Cooperative cancellation flag shared between a worker and its owner
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

struct QueueInner<T> {
    items: VecDeque<T>,
    /// Set while the depth is above the warning threshold
    backlogged: bool,
}

/// Unbounded FIFO work queue with a cancellable blocking pop
pub struct WorkQueue<T> {
    inner: Mutex<QueueInner<T>>,
    not_empty: Condvar,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                backlogged: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// A panicking producer must not wedge the consumer, so poisoning is ignored
    fn lock(&self) -> MutexGuard<'_, QueueInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item and wake one waiting consumer. Never blocks on capacity.
    ///
    /// Returns the queue depth after the push.
    pub fn push(&self, item: T) -> usize {
        let depth = {
            let mut inner = self.lock();
            inner.items.push_back(item);
            let depth = inner.items.len();
            if depth > QUEUE_DEPTH_WARNING && !inner.backlogged {
                inner.backlogged = true;
                warn!(depth, "Work queue is backing up, consumer is slower than producer");
            }
            depth
        };
        self.not_empty.notify_one();
        depth
    }

    /// Block until an item is available or `cancel` fires.
    ///
    /// The cancel flag is checked with the lock held, so a cancel issued
    /// through [`WorkQueue::wake_all`] can never slip in between the check and
    /// the wait. Returns `None` only when cancelled.
    pub fn pop(&self, cancel: &CancelToken) -> Option<T> {
        let mut inner = self.lock();
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(item) = Self::take_front(&mut inner) {
                return Some(item);
            }
            inner = self
                .not_empty
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Take the head item without blocking
    pub fn try_pop(&self) -> Option<T> {
        Self::take_front(&mut self.lock())
    }

    fn take_front(inner: &mut QueueInner<T>) -> Option<T> {
        let item = inner.items.pop_front()?;
        if inner.backlogged && inner.items.len() <= QUEUE_DEPTH_WARNING / 2 {
            inner.backlogged = false;
            debug!(depth = inner.items.len(), "Work queue backlog cleared");
        }
        Some(item)
    }

    /// Remove and return everything still queued, oldest first
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.lock();
        inner.backlogged = false;
        inner.items.drain(..).collect()
    }

    /// Wake every blocked consumer so it re-checks its cancel token.
    ///
    /// Call after [`CancelToken::cancel`]. Taking the lock first guarantees a
    /// consumer is either already parked (and receives the notification) or
    /// has not yet checked the flag (and will observe it).
    pub fn wake_all(&self) {
        drop(self.lock());
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_fifo_order() {
        let queue = WorkQueue::new();
        let cancel = CancelToken::new();
        for i in 0..5 {
            queue.push(i);
        }
        let popped: Vec<_> = (0..5).filter_map(|_| queue.pop(&cancel)).collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_returns_none_once_cancelled() {
        let queue = WorkQueue::new();
        let cancel = CancelToken::new();
        queue.push(1);
        cancel.cancel();
        // Cancellation wins over pending items
        assert_eq!(queue.pop(&cancel), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_cancel_wakes_blocked_consumer() {
        let queue = Arc::new(WorkQueue::<u32>::new());
        let cancel = CancelToken::new();

        let consumer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let item = queue.pop(&cancel);
                (item, started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        queue.wake_all();

        let (item, waited) = consumer.join().unwrap();
        assert_eq!(item, None);
        assert!(waited < Duration::from_secs(2));
    }

    #[test]
    fn test_drain_empties_queue() {
        let queue = WorkQueue::new();
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.drain(), vec!["a", "b"]);
        assert_eq!(queue.try_pop(), None);
    }
}
