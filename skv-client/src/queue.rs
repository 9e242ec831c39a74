//! # Bounded FIFO
//!
//! Purpose: Fixed-capacity, multi-producer multi-consumer queue backing the
//! idle-connection pool and the cluster's deferred-command queue.
//!
//! ## Design Principles
//! 1. **Fail Fast**: Enqueueing at capacity returns the value with
//!    `QueueFull` instead of blocking the producer.
//! 2. **Single Lock**: One mutex guards the deque; `iterate` holds it for the
//!    whole pass so every queued element is visited at most once per call.
//! 3. **Ownership In, Ownership Out**: Elements move through the queue by
//!    value; a dequeued or discarded element belongs to the caller.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use skv_common::{SkvError, SkvResult};

/// Failure to enqueue, handing the rejected value back to the caller.
#[derive(Debug)]
pub enum EnqueueError<T> {
    /// The queue is at capacity.
    Full(T),
    /// The queue has been destroyed.
    Closed(T),
}

impl<T> EnqueueError<T> {
    /// Recovers the value that could not be enqueued.
    pub fn into_inner(self) -> T {
        match self {
            EnqueueError::Full(value) | EnqueueError::Closed(value) => value,
        }
    }

    /// Maps the failure onto the shared error taxonomy.
    pub fn error(&self) -> SkvError {
        match self {
            EnqueueError::Full(_) => SkvError::QueueFull,
            EnqueueError::Closed(_) => SkvError::QueueClosed,
        }
    }
}

/// Per-element decision returned by an [`BoundedQueue::iterate`] closure.
///
/// The closure owns the element; returning `Some(element)` re-enqueues it,
/// returning `None` discards (or keeps) it.
#[derive(Debug)]
pub enum Visit<T> {
    /// Keep iterating.
    Continue(Option<T>),
    /// Stop iterating after handling this element.
    Stop(Option<T>),
}

struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Concurrency-safe bounded FIFO.
pub struct BoundedQueue<T> {
    inner: Mutex<QueueInner<T>>,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        BoundedQueue {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Non-blocking enqueue; fails with the value at capacity or after
    /// `destroy`.
    pub fn enqueue(&self, value: T) -> Result<(), EnqueueError<T>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(EnqueueError::Closed(value));
        }
        if inner.items.len() >= self.capacity {
            return Err(EnqueueError::Full(value));
        }
        inner.items.push_back(value);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Non-blocking dequeue; `Ok(None)` when empty.
    pub fn dequeue(&self) -> SkvResult<Option<T>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SkvError::QueueClosed);
        }
        Ok(inner.items.pop_front())
    }

    /// Blocking dequeue, waiting up to `timeout` for an element.
    ///
    /// Returns `Ok(None)` when the timeout elapses with the queue still
    /// empty, so loops can interleave shutdown checks with waits.
    pub fn dequeue_timeout(&self, timeout: Duration) -> SkvResult<Option<T>> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(SkvError::QueueClosed);
            }
            if let Some(value) = inner.items.pop_front() {
                return Ok(Some(value));
            }
            if self.not_empty.wait_for(&mut inner, timeout).timed_out() {
                if inner.closed {
                    return Err(SkvError::QueueClosed);
                }
                return Ok(inner.items.pop_front());
            }
        }
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// True when no elements are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every currently-queued element exactly once, in FIFO order.
    ///
    /// Each element is popped and handed to `f` by value; the closure decides
    /// whether it goes back on the queue. The lock is held for the whole
    /// pass, so concurrent iterators never see the same element twice.
    pub fn iterate<F>(&self, mut f: F) -> SkvResult<()>
    where
        F: FnMut(T) -> Visit<T>,
    {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SkvError::QueueClosed);
        }
        let mut reinserted = false;
        for _ in 0..inner.items.len() {
            let item = match inner.items.pop_front() {
                Some(item) => item,
                None => break,
            };
            match f(item) {
                Visit::Continue(Some(keep)) => {
                    inner.items.push_back(keep);
                    reinserted = true;
                }
                Visit::Continue(None) => {}
                Visit::Stop(Some(keep)) => {
                    inner.items.push_back(keep);
                    reinserted = true;
                    break;
                }
                Visit::Stop(None) => break,
            }
        }
        if reinserted {
            self.not_empty.notify_one();
        }
        Ok(())
    }

    /// Closes the queue and drains any remaining elements to the caller.
    ///
    /// All subsequent operations fail with `QueueClosed`.
    pub fn destroy(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let drained = inner.items.drain(..).collect();
        self.not_empty.notify_all();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn enqueue_fails_at_capacity() {
        let queue = BoundedQueue::new(2);
        queue.enqueue(1).unwrap();
        queue.enqueue(2).unwrap();
        match queue.enqueue(3) {
            Err(EnqueueError::Full(3)) => {}
            other => panic!("expected Full(3), got {other:?}"),
        }
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn fifo_order_and_empty_after_drain() {
        let queue = BoundedQueue::new(4);
        for v in [1, 2, 3, 4] {
            queue.enqueue(v).unwrap();
        }
        for expected in [1, 2, 3, 4] {
            assert_eq!(queue.dequeue().unwrap(), Some(expected));
        }
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue().unwrap(), None);
    }

    #[test]
    fn operations_fail_after_destroy() {
        let queue = BoundedQueue::new(2);
        queue.enqueue(7).unwrap();
        assert_eq!(queue.destroy(), vec![7]);

        assert!(matches!(queue.enqueue(8), Err(EnqueueError::Closed(8))));
        assert_eq!(queue.dequeue(), Err(SkvError::QueueClosed));
        assert_eq!(queue.iterate(|v| Visit::Continue(Some(v))), Err(SkvError::QueueClosed));
    }

    #[test]
    fn iterate_visits_each_element_once() {
        let queue = BoundedQueue::new(8);
        for v in 0..5 {
            queue.enqueue(v).unwrap();
        }
        let mut seen = Vec::new();
        queue
            .iterate(|v| {
                seen.push(v);
                Visit::Continue(Some(v))
            })
            .unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn iterate_discards_and_stops() {
        let queue = BoundedQueue::new(8);
        for v in 0..5 {
            queue.enqueue(v).unwrap();
        }
        // Discard evens, stop (and take) at the first odd past 2.
        let mut taken = None;
        queue
            .iterate(|v| {
                if v % 2 == 0 {
                    Visit::Continue(None)
                } else if v < 3 {
                    Visit::Continue(Some(v))
                } else {
                    taken = Some(v);
                    Visit::Stop(None)
                }
            })
            .unwrap();
        assert_eq!(taken, Some(3));
        // Remaining: 4 (unvisited stays) and 1 (reinserted).
        let mut rest = Vec::new();
        while let Some(v) = queue.dequeue().unwrap() {
            rest.push(v);
        }
        rest.sort_unstable();
        assert_eq!(rest, vec![1, 4]);
    }

    #[test]
    fn dequeue_timeout_wakes_on_enqueue() {
        let queue = Arc::new(BoundedQueue::new(1));
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.enqueue(42).unwrap();
        });
        let value = queue.dequeue_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(value, Some(42));
        handle.join().unwrap();
    }

    #[test]
    fn concurrent_enqueue_respects_capacity() {
        let queue = Arc::new(BoundedQueue::new(64));
        let mut handles = Vec::new();
        for v in 0..65 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || queue.enqueue(v).is_ok()));
        }
        let succeeded = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(succeeded, 64);
        assert_eq!(queue.len(), 64);

        for _ in 0..64 {
            assert!(queue.dequeue().unwrap().is_some());
        }
        assert!(queue.is_empty());
    }
}
