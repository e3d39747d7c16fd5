//! Finalizer registries with exactly-once cleanup.

use std::{
    collections::BTreeMap,
    panic::{self, resume_unwind, AssertUnwindSafe},
    sync::{Arc, Weak},
    thread,
};

use crate::sync::Mutex;

type Finalizer = Box<dyn FnOnce() + Send>;

/// Identifies a finalizer registered with a [`Scope`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct FinalizerKey(u64);

enum State {
    Open {
        next: u64,
        finalizers: BTreeMap<u64, Finalizer>,
    },
    Closed,
}

struct Inner {
    state: Mutex<State>,
    /// The parent scope and our key in it, if this is a child scope.
    parent: Mutex<Option<(Weak<Inner>, FinalizerKey)>>,
}

/// A set of finalizers that run exactly once, in reverse order of registration, when the scope is
/// closed.
///
/// Every task and queue created while running a stream is tied to a scope. Closing the scope
/// interrupts and waits for those tasks, so nothing outlives the stream that created it.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// Creates an open scope without finalizers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Open {
                    next: 0,
                    finalizers: BTreeMap::new(),
                }),
                parent: Mutex::new(None),
            }),
        }
    }

    /// Registers `finalizer` to run when the scope closes.
    ///
    /// If the scope is already closed, `finalizer` runs immediately and `None` is returned.
    pub fn add_finalizer<F>(&self, finalizer: F) -> Option<FinalizerKey>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Open { next, finalizers } => {
                let key = *next;
                *next += 1;
                finalizers.insert(key, Box::new(finalizer));
                Some(FinalizerKey(key))
            }
            State::Closed => {
                drop(state);
                finalizer();
                None
            }
        }
    }

    /// Removes a finalizer without running it.
    ///
    /// Returns `false` if the finalizer has already run or been removed.
    pub fn remove_finalizer(&self, key: FinalizerKey) -> bool {
        let removed = match &mut *self.inner.state.lock() {
            State::Open { finalizers, .. } => finalizers.remove(&key.0),
            State::Closed => None,
        };
        // Dropped outside the lock: it may own the last handle to a child scope.
        removed.is_some()
    }

    /// Creates a scope that is closed when `self` closes, or earlier.
    ///
    /// `self` keeps the child alive until one of them is closed, so dropping every handle to the
    /// child does not lose its finalizers.
    pub fn child(&self) -> Scope {
        let child = Scope::new();
        let remote = child.clone();
        let key = self.add_finalizer(move || remote.close());
        // Without a key, the parent was already closed and has closed the child as well.
        if let Some(key) = key {
            *child.inner.parent.lock() = Some((Arc::downgrade(&self.inner), key));
        }
        child
    }

    #[cfg(test)]
    pub(crate) fn finalizer_count(&self) -> usize {
        match &*self.inner.state.lock() {
            State::Open { finalizers, .. } => finalizers.len(),
            State::Closed => 0,
        }
    }

    /// Returns `true` once [`Scope::close`] has started.
    pub fn is_closed(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Closed)
    }

    /// Runs all registered finalizers, newest first.
    ///
    /// Closing an already closed scope does nothing. If a finalizer panics, the remaining ones
    /// still run, and the first panic is resumed afterwards.
    pub fn close(&self) {
        let finalizers = match std::mem::replace(&mut *self.inner.state.lock(), State::Closed) {
            State::Open { finalizers, .. } => finalizers,
            State::Closed => return,
        };

        if let Some((parent, key)) = self.inner.parent.lock().take() {
            if let Some(parent) = parent.upgrade() {
                Scope { inner: parent }.remove_finalizer(key);
            }
        }

        log::trace!("closing scope with {} finalizer(s)", finalizers.len());
        let mut first_panic = None;
        for (_, finalizer) in finalizers.into_iter().rev() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(finalizer)) {
                first_panic.get_or_insert(payload);
            }
        }
        if let Some(payload) = first_panic {
            if !thread::panicking() {
                resume_unwind(payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::catch_unwind;

    use super::*;
    use crate::test::silent_panic;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Finalizer) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let remote = log.clone();
        let make = move |n: u32| -> Finalizer {
            let log = remote.clone();
            Box::new(move || log.lock().push(n))
        };
        (log, make)
    }

    #[test]
    fn finalizers_run_in_reverse_once() {
        let (log, make) = recorder();
        let scope = Scope::new();
        scope.add_finalizer(make(1));
        scope.add_finalizer(make(2));
        scope.add_finalizer(make(3));
        scope.close();
        scope.close();
        assert_eq!(*log.lock(), vec![3, 2, 1]);
        assert!(scope.is_closed());
    }

    #[test]
    fn removed_finalizer_does_not_run() {
        let (log, make) = recorder();
        let scope = Scope::new();
        let key = scope.add_finalizer(make(1)).unwrap();
        scope.add_finalizer(make(2));
        assert!(scope.remove_finalizer(key));
        assert!(!scope.remove_finalizer(key));
        scope.close();
        assert_eq!(*log.lock(), vec![2]);
    }

    #[test]
    fn closed_scope_runs_finalizer_immediately() {
        let (log, make) = recorder();
        let scope = Scope::new();
        scope.close();
        assert!(scope.add_finalizer(make(7)).is_none());
        assert_eq!(*log.lock(), vec![7]);
    }

    #[test]
    fn child_closes_with_parent() {
        let (log, make) = recorder();
        let parent = Scope::new();
        parent.add_finalizer(make(1));
        let child = parent.child();
        child.add_finalizer(make(2));
        parent.add_finalizer(make(3));
        parent.close();
        assert!(child.is_closed());
        assert_eq!(*log.lock(), vec![3, 2, 1]);
    }

    #[test]
    fn child_closed_early_detaches() {
        let (log, make) = recorder();
        let parent = Scope::new();
        let child = parent.child();
        child.add_finalizer(make(1));
        child.close();
        parent.close();
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn dropped_child_is_closed_by_parent() {
        let (log, make) = recorder();
        let parent = Scope::new();
        parent.child().add_finalizer(make(1));
        let child = parent.child();
        child.child().add_finalizer(make(2));
        drop(child);
        parent.close();
        assert_eq!(*log.lock(), vec![2, 1]);
    }

    #[test]
    fn panicking_finalizer_does_not_skip_others() {
        let (log, make) = recorder();
        let scope = Scope::new();
        scope.add_finalizer(make(1));
        scope.add_finalizer(|| silent_panic("finalizer panic".into()));
        scope.add_finalizer(make(3));
        catch_unwind(AssertUnwindSafe(|| scope.close())).unwrap_err();
        assert_eq!(*log.lock(), vec![3, 1]);
    }
}
