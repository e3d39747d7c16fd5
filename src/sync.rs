//! Locks that ignore poisoning.
//!
//! Every piece of user code that runs inside a stream (mapping functions, finalizers, pulls) is
//! already guarded by `catch_unwind`, and the panic is reported as a [`Cause::Die`]. A poisoned
//! lock would turn that single defect into a cascade of unrelated panics in every other task that
//! touches the same queue registry or scope, hiding the original cause. The wrappers here simply
//! hand out the guard regardless.
//!
//! [`Cause::Die`]: crate::Cause::Die

use std::{
    ops::{Deref, DerefMut},
    sync,
};

#[derive(Default)]
pub(crate) struct Mutex<T: ?Sized> {
    inner: sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub(crate) const fn new(t: T) -> Mutex<T> {
        Self {
            inner: sync::Mutex::new(t),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };

        MutexGuard { inner: guard }
    }
}

pub(crate) struct MutexGuard<'a, T: ?Sized + 'a> {
    inner: sync::MutexGuard<'a, T>,
}

impl<'a, T: ?Sized + 'a> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, T: ?Sized + 'a> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

#[derive(Default)]
pub(crate) struct Condvar {
    inner: sync::Condvar,
}

impl Condvar {
    /// Blocks while `condition` returns `true`.
    pub(crate) fn wait_while<'a, T, F>(
        &self,
        guard: MutexGuard<'a, T>,
        condition: F,
    ) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        let guard = match self.inner.wait_while(guard.inner, condition) {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };
        MutexGuard { inner: guard }
    }

    pub(crate) fn notify_all(&self) {
        self.inner.notify_all();
    }
}
