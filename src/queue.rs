//! Bounded and unbounded FIFO queues with shutdown.

use std::{error::Error, fmt, sync::Arc};

use crossbeam_channel::{select, Receiver, Sender, TryRecvError};

use crate::{
    sync::Mutex,
    task::{self, Interrupted, Never},
};

/// Error returned by blocking [`Queue`] operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The queue has been shut down.
    Shutdown,
    /// The calling task was interrupted while waiting.
    Interrupted(Interrupted),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Shutdown => f.write_str("queue has been shut down"),
            QueueError::Interrupted(i) => i.fmt(f),
        }
    }
}

impl Error for QueueError {}

impl From<Interrupted> for QueueError {
    fn from(i: Interrupted) -> Self {
        QueueError::Interrupted(i)
    }
}

struct Inner<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: Option<usize>,
    shutdown_trigger: Mutex<Option<Sender<Never>>>,
    shutdown: Receiver<Never>,
}

/// A multi-producer, multi-consumer FIFO queue.
///
/// [`Queue::offer`] and [`Queue::take`] block the calling task until they can proceed, the queue is
/// shut down, or the task is interrupted. Bounded queues are how concurrent producers are held back
/// by slower consumers.
pub struct Queue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Queue<T> {
    /// Creates a queue holding up to `capacity` values. A capacity of 0 is treated as 1.
    pub fn bounded(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self::with_channel(tx, rx, Some(capacity))
    }

    /// Creates a queue that never makes `offer` wait.
    pub fn unbounded() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self::with_channel(tx, rx, None)
    }

    fn with_channel(tx: Sender<T>, rx: Receiver<T>, capacity: Option<usize>) -> Self {
        let (trigger, shutdown) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(Inner {
                tx,
                rx,
                capacity,
                shutdown_trigger: Mutex::new(Some(trigger)),
                shutdown,
            }),
        }
    }

    /// Returns the capacity, or `None` for unbounded queues.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// The number of values currently buffered.
    pub fn len(&self) -> usize {
        self.inner.rx.len()
    }

    /// Returns `true` if no value is buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.rx.is_empty()
    }

    /// Adds `value` to the back of the queue, blocking while the queue is full.
    pub fn offer(&self, value: T) -> Result<(), QueueError> {
        if self.is_shutdown() {
            return Err(QueueError::Shutdown);
        }
        let signal = task::signal();
        select! {
            send(self.inner.tx, value) -> res => res.map_err(|_| QueueError::Shutdown),
            recv(self.inner.shutdown) -> _ => Err(QueueError::Shutdown),
            recv(signal) -> _ => Err(task::interruption().into()),
        }
    }

    /// Offers every value in turn, stopping at the first error.
    pub fn offer_all<I: IntoIterator<Item = T>>(&self, values: I) -> Result<(), QueueError> {
        for value in values {
            self.offer(value)?;
        }
        Ok(())
    }

    /// Removes the value at the front of the queue, blocking while the queue is empty.
    pub fn take(&self) -> Result<T, QueueError> {
        if self.is_shutdown() {
            return Err(QueueError::Shutdown);
        }
        let signal = task::signal();
        select! {
            recv(self.inner.rx) -> res => res.map_err(|_| QueueError::Shutdown),
            recv(self.inner.shutdown) -> _ => Err(QueueError::Shutdown),
            recv(signal) -> _ => Err(task::interruption().into()),
        }
    }

    /// Removes the value at the front of the queue, if there is one.
    pub fn poll(&self) -> Option<T> {
        if self.is_shutdown() {
            return None;
        }
        self.inner.rx.try_recv().ok()
    }

    /// Removes all values currently in the queue.
    pub fn take_all(&self) -> Vec<T> {
        std::iter::from_fn(|| self.poll()).collect()
    }

    /// Shuts the queue down, waking up all blocked callers.
    ///
    /// Values still in the queue are discarded. Shutting down twice does nothing.
    pub fn shutdown(&self) {
        if self.inner.shutdown_trigger.lock().take().is_some() {
            log::trace!("queue shut down");
            // Free buffered values now rather than when the last handle goes away.
            while self.inner.rx.try_recv().is_ok() {}
        }
    }

    /// Returns `true` once [`Queue::shutdown`] has been called.
    pub fn is_shutdown(&self) -> bool {
        matches!(self.inner.shutdown.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Blocks until the queue is shut down.
    pub fn await_shutdown(&self) -> Result<(), Interrupted> {
        let signal = task::signal();
        select! {
            recv(self.inner.shutdown) -> _ => Ok(()),
            recv(signal) -> _ => Err(task::interruption()),
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::task::spawn;

    #[test]
    fn fifo_order() {
        let queue = Queue::unbounded();
        queue.offer_all([1, 2, 3]).unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.take(), Ok(1));
        assert_eq!(queue.take_all(), vec![2, 3]);
        assert!(queue.is_empty());
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let queue = Queue::bounded(0);
        assert_eq!(queue.capacity(), Some(1));
        queue.offer(()).unwrap();
    }

    #[test]
    fn shutdown_wakes_blocked_taker() {
        let queue = Queue::<i32>::bounded(1);
        let remote = queue.clone();
        let taker = thread::spawn(move || remote.take());
        thread::sleep(Duration::from_millis(10));
        queue.shutdown();
        queue.shutdown();
        assert_eq!(taker.join().unwrap(), Err(QueueError::Shutdown));
        assert!(queue.is_shutdown());
        assert_eq!(queue.offer(1), Err(QueueError::Shutdown));
    }

    #[test]
    fn shutdown_wakes_blocked_offerer() {
        let queue = Queue::bounded(1);
        queue.offer(1).unwrap();
        let remote = queue.clone();
        let offerer = thread::spawn(move || remote.offer(2));
        thread::sleep(Duration::from_millis(10));
        queue.shutdown();
        assert_eq!(offerer.join().unwrap(), Err(QueueError::Shutdown));
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn interrupt_wakes_blocked_taker() {
        let queue = Queue::<i32>::unbounded();
        let remote = queue.clone();
        let task = spawn::<QueueError, i32, _>("test", move || {
            remote.take().map_err(crate::Cause::fail)
        });
        thread::sleep(Duration::from_millis(10));
        task.interrupt();
        let cause = task.join().unwrap_err();
        assert!(matches!(
            cause.failures()[0],
            QueueError::Interrupted(Interrupted { .. })
        ));
    }

    #[test]
    fn bounded_queue_applies_backpressure() {
        let queue = Queue::bounded(2);
        let remote = queue.clone();
        let producer = thread::spawn(move || {
            for n in 0..5 {
                remote.offer(n).unwrap();
            }
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 2);
        let taken: Vec<_> = (0..5).map(|_| queue.take().unwrap()).collect();
        producer.join().unwrap();
        assert_eq!(taken, vec![0, 1, 2, 3, 4]);
    }
}
