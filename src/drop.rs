//! Drop guards used to tie cleanup to lexical scope.

use crate::scope::Scope;

/// Runs its closure when dropped.
#[must_use = "the closure runs as soon as the guard is dropped"]
pub(crate) struct Defer<F: FnOnce()> {
    cb: Option<F>,
}

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(cb) = self.cb.take() {
            cb();
        }
    }
}

/// Returns a guard that runs `cb` when dropped, including during unwinding.
pub(crate) fn defer<F: FnOnce()>(cb: F) -> Defer<F> {
    Defer { cb: Some(cb) }
}

/// Returns a guard that closes `scope` when dropped.
pub(crate) fn close_on_drop(scope: Scope) -> Defer<impl FnOnce()> {
    defer(move || scope.close())
}
