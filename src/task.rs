//! Owned, interruptible task threads.
//!
//! Every [`Task`] is an OS thread with an *interrupt signal*: a channel that disconnects when the
//! task is interrupted. Code running on the task checks the signal at every point where it may
//! block (queue operations, clock sleeps, pull invocations) by selecting on it alongside the
//! operation itself. Threads that were not spawned as tasks get a signal that never fires.

use std::{
    cell::RefCell,
    error::Error,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::{
    drop::defer,
    scope::{FinalizerKey, Scope},
    sync::Mutex,
    Cause, Defect, Exit,
};

/// Message type of signal channels. Nothing is ever sent; they only disconnect.
pub(crate) enum Never {}

/// Identifies a task, or a plain thread acting as one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Error returned by blocking operations when the calling task has been interrupted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interrupted {
    pub by: TaskId,
}

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interrupted by task {}", self.by)
    }
}

impl Error for Interrupted {}

impl<E> From<Interrupted> for Cause<E> {
    fn from(i: Interrupted) -> Self {
        Cause::Interrupt(i.by)
    }
}

struct Signal {
    id: TaskId,
    trigger: Mutex<Option<Sender<Never>>>,
    receiver: Receiver<Never>,
    interruptor: Mutex<Option<TaskId>>,
}

impl Signal {
    fn new(id: TaskId) -> Arc<Self> {
        let (trigger, receiver) = crossbeam_channel::bounded(0);
        Arc::new(Self {
            id,
            trigger: Mutex::new(Some(trigger)),
            receiver,
            interruptor: Mutex::new(None),
        })
    }

    fn fire(&self, by: TaskId) {
        let mut trigger = self.trigger.lock();
        if let Some(trigger) = trigger.take() {
            *self.interruptor.lock() = Some(by);
            drop(trigger);
        }
    }

    fn interrupted(&self) -> Option<TaskId> {
        match self.receiver.try_recv() {
            Err(TryRecvError::Disconnected) => Some(self.interruptor.lock().unwrap_or(self.id)),
            _ => None,
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Signal>>> = RefCell::new(None);
    static THREAD_ID: TaskId = TaskId::next();
}

/// Returns the id of the calling task.
pub fn current_id() -> TaskId {
    CURRENT
        .with(|current| current.borrow().as_ref().map(|s| s.id))
        .unwrap_or_else(|| THREAD_ID.with(|id| *id))
}

/// Returns the interrupt signal of the calling task.
///
/// The returned receiver disconnects once the task is interrupted.
pub(crate) fn signal() -> Receiver<Never> {
    CURRENT.with(|current| match &*current.borrow() {
        Some(s) => s.receiver.clone(),
        None => crossbeam_channel::never(),
    })
}

/// If the calling task has been interrupted, returns the id of the task that interrupted it.
pub fn interrupted() -> Option<TaskId> {
    CURRENT.with(|current| current.borrow().as_ref().and_then(|s| s.interrupted()))
}

/// Returns an error if the calling task has been interrupted.
pub fn check() -> Result<(), Interrupted> {
    match interrupted() {
        Some(by) => Err(Interrupted { by }),
        None => Ok(()),
    }
}

/// Builds the [`Interrupted`] error for a signal that was observed to fire.
pub(crate) fn interruption() -> Interrupted {
    Interrupted {
        by: interrupted().unwrap_or_else(current_id),
    }
}

struct Inner<E, T> {
    signal: Arc<Signal>,
    result: Mutex<Option<Exit<E, T>>>,
    done: Receiver<Never>,
    handle: Mutex<Option<JoinHandle<()>>>,
    registration: Mutex<Option<(Scope, FinalizerKey)>>,
}

/// A handle to a running or finished task.
///
/// Handles are cheap to clone. Any number of threads may [`wait`][Task::wait] for the same task.
pub struct Task<E, T> {
    inner: Arc<Inner<E, T>>,
}

impl<E, T> Clone for Task<E, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Spawns `f` on a new task thread called `{name}-{id}`.
///
/// Panics escaping `f` become a [`Cause::Die`] exit. If the thread cannot be spawned, the returned
/// task is already finished with a defect.
pub(crate) fn spawn<E, T, F>(name: &str, f: F) -> Task<E, T>
where
    E: Send + 'static,
    T: Send + 'static,
    F: FnOnce() -> Exit<E, T> + Send + 'static,
{
    let id = TaskId::next();
    let (done_tx, done_rx) = crossbeam_channel::bounded::<Never>(0);
    let inner = Arc::new(Inner {
        signal: Signal::new(id),
        result: Mutex::new(None),
        done: done_rx,
        handle: Mutex::new(None),
        registration: Mutex::new(None),
    });

    let remote = inner.clone();
    let spawned = thread::Builder::new()
        .name(format!("{name}-{}", id.0))
        .spawn(move || {
            let _done = done_tx;
            log::trace!("task {id} starting");
            let _guard = defer(move || log::trace!("task {id} exiting"));

            CURRENT.with(|current| *current.borrow_mut() = Some(remote.signal.clone()));
            let exit = match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(exit) => exit,
                Err(payload) => Err(Cause::Die(Defect::from_panic(payload))),
            };
            *remote.result.lock() = Some(exit);
        });

    match spawned {
        Ok(handle) => *inner.handle.lock() = Some(handle),
        Err(e) => {
            log::error!("failed to spawn task {id}: {e}");
            *inner.result.lock() = Some(Err(Cause::die(format!("failed to spawn task: {e}"))));
        }
    }

    Task { inner }
}

impl<E, T> Task<E, T> {
    /// The id of the task, also part of its thread name.
    pub fn id(&self) -> TaskId {
        self.inner.signal.id
    }

    /// Requests the task to stop at its next suspension point.
    ///
    /// Interrupting a task more than once, or after it has finished, does nothing.
    pub fn interrupt(&self) {
        if !self.is_finished() {
            log::trace!("interrupting task {}", self.id());
        }
        self.inner.signal.fire(current_id());
    }

    /// Returns `true` once the task has exited.
    pub fn is_finished(&self) -> bool {
        matches!(self.inner.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Blocks until the task has exited.
    ///
    /// This does not observe the caller's own interrupt signal: waiting for a task is how cleanup
    /// code makes sure that nothing outlives its scope.
    pub fn wait(&self) {
        let _ = self.inner.done.recv();
        if let Some(handle) = self.inner.handle.lock().take() {
            // The body runs under `catch_unwind`, so this only fails if logging panicked.
            let _ = handle.join();
        }
        if let Some((scope, key)) = self.inner.registration.lock().take() {
            scope.remove_finalizer(key);
        }
    }

    /// Interrupts the task and waits for it to exit.
    pub fn interrupt_and_wait(&self) {
        self.interrupt();
        self.wait();
    }
}

impl<E: Send + 'static, T: Send + 'static> Task<E, T> {
    /// Makes `scope` interrupt and wait for this task when it closes.
    ///
    /// The registration is dropped again once the task has been waited for.
    pub(crate) fn register(&self, scope: &Scope) {
        let task = self.clone();
        if let Some(key) = scope.add_finalizer(move || task.interrupt_and_wait()) {
            *self.inner.registration.lock() = Some((scope.clone(), key));
            if self.is_finished() && self.inner.handle.lock().is_none() {
                // Already waited for while we were registering.
                if let Some((scope, key)) = self.inner.registration.lock().take() {
                    scope.remove_finalizer(key);
                }
            }
        }
    }
}

impl<E: Clone, T: Clone> Task<E, T> {
    /// Waits for the task and returns its exit.
    pub fn join(&self) -> Exit<E, T> {
        self.wait();
        match &*self.inner.result.lock() {
            Some(exit) => exit.clone(),
            None => Err(Cause::Empty),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test::silent_panic;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn task_handle_is_send_sync() {
        assert_send_sync::<Task<String, Vec<u8>>>();
    }

    #[test]
    fn join_returns_exit() {
        let task = spawn::<&str, _, _>("test", || Ok(40 + 2));
        assert_eq!(task.join(), Ok(42));
        assert_eq!(task.join(), Ok(42));
        assert!(task.is_finished());

        let task = spawn::<&str, (), _>("test", || Err(Cause::fail("nope")));
        assert_eq!(task.join(), Err(Cause::fail("nope")));
    }

    #[test]
    fn panic_becomes_defect() {
        let task = spawn::<(), (), _>("test", || {
            silent_panic("task panic".into());
            Ok(())
        });
        let cause = task.join().unwrap_err();
        assert_eq!(cause.defects()[0].message(), "task panic");
    }

    #[test]
    fn interrupt_wakes_blocked_task() {
        let task = spawn::<(), TaskId, _>("test", || {
            let _ = signal().recv();
            Err(check().unwrap_err().into())
        });
        std::thread::sleep(Duration::from_millis(10));
        assert!(!task.is_finished());

        task.interrupt();
        let cause = task.join().unwrap_err();
        assert_eq!(cause, Cause::Interrupt(current_id()));
    }

    #[test]
    fn plain_threads_are_never_interrupted() {
        assert_eq!(interrupted(), None);
        assert!(check().is_ok());
        assert_eq!(current_id(), current_id());
        assert!(signal().try_recv().is_err());
    }

    #[test]
    fn many_waiters() {
        let task = spawn::<(), (), _>("test", || {
            std::thread::sleep(Duration::from_millis(20));
            Ok(())
        });
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let task = task.clone();
                std::thread::spawn(move || task.wait())
            })
            .collect();
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert!(task.is_finished());
    }

    #[test]
    fn closing_scope_interrupts_registered_task() {
        let scope = Scope::new();
        let task = spawn::<(), (), _>("test", || {
            let _ = signal().recv();
            Ok(())
        });
        task.register(&scope);
        scope.close();
        assert!(task.is_finished());
    }
}
