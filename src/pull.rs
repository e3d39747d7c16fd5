//! The pull protocol every stream compiles to.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
};

use crate::{task, Cause, Chunk, Defect};

/// The outcome of one pull: a non-empty chunk, the end of the stream (`Err(None)`), or a failure.
pub type PullResult<E, A> = Result<Chunk<A>, Option<Cause<E>>>;

type Step<E, A> = Box<dyn FnMut() -> PullResult<E, A> + Send>;

/// A running stream, producing one chunk per [`Pull::invoke`].
///
/// Pulls are fused: once a pull has ended or failed, every further invocation reports the end of
/// the stream without running the underlying step again. Steps may return empty chunks; those are
/// skipped, so callers never observe one.
pub struct Pull<E, A> {
    step: Step<E, A>,
    done: bool,
}

impl<E, A> fmt::Debug for Pull<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pull").field("done", &self.done).finish()
    }
}

impl<E: 'static, A: 'static> Pull<E, A> {
    /// Creates a pull that runs `step` for every chunk.
    ///
    /// `step` is not called again once it has returned an error.
    pub fn new<F>(step: F) -> Self
    where
        F: FnMut() -> PullResult<E, A> + Send + 'static,
    {
        Self {
            step: Box::new(step),
            done: false,
        }
    }

    /// A pull that ends immediately.
    pub fn end() -> Self {
        Self::new(|| Err(None))
    }

    /// A pull that fails with `cause` on its first invocation.
    pub fn fail(cause: Cause<E>) -> Self
    where
        E: Send,
    {
        let mut cause = Some(cause);
        Self::new(move || Err(cause.take()))
    }

    /// A pull that emits `chunk` once, then ends.
    pub fn once(chunk: Chunk<A>) -> Self
    where
        A: Send + Sync,
    {
        let mut chunk = Some(chunk);
        Self::new(move || chunk.take().ok_or(None))
    }
}

impl<E, A> Pull<E, A> {
    /// Pulls the next non-empty chunk.
    ///
    /// Panics raised by the step are caught and reported as [`Cause::Die`]. If the calling task has
    /// been interrupted, the pull fails with [`Cause::Interrupt`] instead of running the step.
    pub fn invoke(&mut self) -> PullResult<E, A> {
        loop {
            if self.done {
                return Err(None);
            }
            if let Err(interrupted) = task::check() {
                self.done = true;
                return Err(Some(interrupted.into()));
            }
            match panic::catch_unwind(AssertUnwindSafe(|| (self.step)())) {
                Ok(Ok(chunk)) if chunk.is_empty() => continue,
                Ok(Ok(chunk)) => return Ok(chunk),
                Ok(Err(done)) => {
                    self.done = true;
                    return Err(done);
                }
                Err(payload) => {
                    self.done = true;
                    return Err(Some(Cause::Die(Defect::from_panic(payload))));
                }
            }
        }
    }

    /// Returns `true` once the pull has ended or failed.
    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Pulls single elements out of a chunk pull, keeping the rest of the chunk for later.
pub(crate) struct Elements<E, A> {
    pull: Pull<E, A>,
    buffer: Chunk<A>,
}

impl<E, A: Clone> Elements<E, A> {
    pub(crate) fn new(pull: Pull<E, A>) -> Self {
        Self {
            pull,
            buffer: Chunk::empty(),
        }
    }

    /// Returns the next element, or `Err(None)` at the end of the stream.
    pub(crate) fn next(&mut self) -> Result<A, Option<Cause<E>>> {
        if self.buffer.is_empty() {
            self.buffer = self.pull.invoke()?;
        }
        let (head, rest) = self.buffer.split_at(1);
        self.buffer = rest;
        head.head().cloned().ok_or(None)
    }
}
