use std::{
    collections::VecDeque,
    time::Instant,
};

use parking_lot::{
    Condvar,
    Mutex,
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("Queue full")]
pub struct QueueFull;

/// Bounded multi-producer queue drained by blocking consumers.
///
/// `try_push` never blocks: when the queue is at capacity the item is
/// rejected and the caller disposes of it (drop-newest admission control).
/// `pop` parks the consumer until an item arrives or the queue is closed;
/// closing wakes every parked consumer so threads can observe shutdown.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    nonempty: Condvar,
    capacity: usize,
}

struct Inner<T> {
    buffer: VecDeque<T>,
    closed: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buffer: VecDeque::new(),
                closed: false,
            }),
            nonempty: Condvar::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buffer.is_empty()
    }

    pub fn try_push(&self, item: T) -> Result<(), QueueFull> {
        let mut inner = self.inner.lock();
        if inner.closed || inner.buffer.len() >= self.capacity {
            return Err(QueueFull);
        }
        inner.buffer.push_back(item);
        self.nonempty.notify_one();
        Ok(())
    }

    /// Blocks until an item is available. Returns `None` once the queue is
    /// closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.buffer.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            self.nonempty.wait(&mut inner);
        }
    }

    /// Blocks until an item is available or `deadline` passes. Returns
    /// `None` on timeout or once the queue is closed and drained.
    pub fn pop_until(&self, deadline: Instant) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.buffer.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            if self.nonempty.wait_until(&mut inner, deadline).timed_out() {
                return inner.buffer.pop_front();
            }
        }
    }

    /// Closes the queue. Items already buffered can still be popped;
    /// blocked consumers holding an empty queue are woken up.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.nonempty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::{
            Duration,
            Instant,
        },
    };

    use super::{
        BoundedQueue,
        QueueFull,
    };

    #[test]
    fn test_fifo() {
        let queue = BoundedQueue::new(2);
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        assert_eq!(queue.try_push(3), Err(QueueFull));
        assert_eq!(queue.pop(), Some(1));
        queue.try_push(4).unwrap();
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(4));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_close_unblocks_consumer() {
        let queue = Arc::new(BoundedQueue::<u32>::new(4));
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.pop())
        };
        // Give the consumer a moment to park.
        std::thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_close_drains_buffered_items() {
        let queue = BoundedQueue::new(4);
        queue.try_push("a").unwrap();
        queue.close();
        assert_eq!(queue.try_push("b"), Err(QueueFull));
        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_pop_until_times_out() {
        let queue = BoundedQueue::<u32>::new(4);
        let started = Instant::now();
        let deadline = started + Duration::from_millis(50);
        assert_eq!(queue.pop_until(deadline), None);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_pop_until_returns_item() {
        let queue = Arc::new(BoundedQueue::new(4));
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue.try_push(7).unwrap();
            })
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(queue.pop_until(deadline), Some(7));
        producer.join().unwrap();
    }
}
