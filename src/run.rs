//! Terminal operations: running a stream to completion.

use crate::{
    queue::{Queue, QueueError},
    stream::{Data, Stream},
    Cause, Chunk, Exit, Runtime, Take,
};

impl<E: Data, A: Data> Stream<(), E, A> {
    /// Folds elements into a state while `cont` holds, returning the full exit.
    ///
    /// The stream is acquired in a fresh root scope, which is closed before this returns. Stopping
    /// early (because `cont` no longer holds) interrupts everything the stream still runs.
    pub fn run_fold_while_exit<S, P, F>(
        &self,
        rt: &Runtime,
        init: S,
        mut cont: P,
        mut f: F,
    ) -> Exit<E, S>
    where
        P: FnMut(&S) -> bool,
        F: FnMut(S, A) -> S,
    {
        rt.scoped(|ctx| {
            let mut pull = self.acquire(ctx);
            let mut state = init;
            while cont(&state) {
                let chunk = match pull.invoke() {
                    Ok(chunk) => chunk,
                    Err(None) => break,
                    Err(Some(cause)) => return Err(cause),
                };
                for value in &chunk {
                    if !cont(&state) {
                        break;
                    }
                    state = f(state, value.clone());
                }
            }
            Ok(state)
        })
    }

    /// Like [`Stream::run_fold_while_exit`], raising defects and interruptions as panics.
    pub fn run_fold_while<S, P, F>(&self, rt: &Runtime, init: S, cont: P, f: F) -> Result<S, E>
    where
        P: FnMut(&S) -> bool,
        F: FnMut(S, A) -> S,
    {
        self.run_fold_while_exit(rt, init, cont, f).map_err(Cause::squash)
    }

    /// Folds every element into a state, starting from `init`.
    pub fn run_fold_exit<S, F: FnMut(S, A) -> S>(&self, rt: &Runtime, init: S, f: F) -> Exit<E, S> {
        self.run_fold_while_exit(rt, init, |_| true, f)
    }

    /// Like [`Stream::run_fold_exit`], raising defects and interruptions as panics.
    pub fn run_fold<S, F: FnMut(S, A) -> S>(&self, rt: &Runtime, init: S, f: F) -> Result<S, E> {
        self.run_fold_exit(rt, init, f).map_err(Cause::squash)
    }

    /// Runs the stream, calling `f` with every chunk.
    pub fn run_for_each_chunk_exit<F>(&self, rt: &Runtime, mut f: F) -> Exit<E, ()>
    where
        F: FnMut(&Chunk<A>),
    {
        rt.scoped(|ctx| {
            let mut pull = self.acquire(ctx);
            loop {
                match pull.invoke() {
                    Ok(chunk) => f(&chunk),
                    Err(None) => return Ok(()),
                    Err(Some(cause)) => return Err(cause),
                }
            }
        })
    }

    /// Like [`Stream::run_for_each_chunk_exit`], raising defects and interruptions as panics.
    pub fn run_for_each_chunk<F: FnMut(&Chunk<A>)>(&self, rt: &Runtime, f: F) -> Result<(), E> {
        self.run_for_each_chunk_exit(rt, f).map_err(Cause::squash)
    }

    /// Calls `f` with every element.
    pub fn run_for_each_exit<F: FnMut(A)>(&self, rt: &Runtime, mut f: F) -> Exit<E, ()> {
        self.run_for_each_chunk_exit(rt, |chunk| chunk.iter().cloned().for_each(&mut f))
    }

    /// Like [`Stream::run_for_each_exit`], raising defects and interruptions as panics.
    pub fn run_for_each<F: FnMut(A)>(&self, rt: &Runtime, f: F) -> Result<(), E> {
        self.run_for_each_exit(rt, f).map_err(Cause::squash)
    }

    /// Collects every element into a `Vec`.
    pub fn run_collect_exit(&self, rt: &Runtime) -> Exit<E, Vec<A>> {
        let mut out = Vec::new();
        self.run_for_each_chunk_exit(rt, |chunk| out.extend(chunk.iter().cloned()))?;
        Ok(out)
    }

    /// Runs the stream and collects all elements.
    ///
    /// # Panics
    ///
    /// Panics if the stream dies with a defect or is interrupted. Use
    /// [`Stream::run_collect_exit`] to observe those as a [`Cause`].
    pub fn run_collect(&self, rt: &Runtime) -> Result<Vec<A>, E> {
        self.run_collect_exit(rt).map_err(Cause::squash)
    }

    /// Runs the stream for its effects, discarding the elements.
    pub fn run_drain_exit(&self, rt: &Runtime) -> Exit<E, ()> {
        self.run_for_each_chunk_exit(rt, |_| {})
    }

    /// Like [`Stream::run_drain_exit`], raising defects and interruptions as panics.
    pub fn run_drain(&self, rt: &Runtime) -> Result<(), E> {
        self.run_drain_exit(rt).map_err(Cause::squash)
    }

    /// Counts the elements.
    pub fn run_count_exit(&self, rt: &Runtime) -> Exit<E, usize> {
        let mut count = 0;
        self.run_for_each_chunk_exit(rt, |chunk| count += chunk.len())?;
        Ok(count)
    }

    /// Like [`Stream::run_count_exit`], raising defects and interruptions as panics.
    pub fn run_count(&self, rt: &Runtime) -> Result<usize, E> {
        self.run_count_exit(rt).map_err(Cause::squash)
    }

    /// Returns the first element, interrupting the rest of the stream.
    pub fn run_head_exit(&self, rt: &Runtime) -> Exit<E, Option<A>> {
        rt.scoped(|ctx| match self.acquire(ctx).invoke() {
            Ok(chunk) => Ok(chunk.head().cloned()),
            Err(None) => Ok(None),
            Err(Some(cause)) => Err(cause),
        })
    }

    /// Like [`Stream::run_head_exit`], raising defects and interruptions as panics.
    pub fn run_head(&self, rt: &Runtime) -> Result<Option<A>, E> {
        self.run_head_exit(rt).map_err(Cause::squash)
    }

    /// Runs the stream to its end and returns the last element.
    pub fn run_last_exit(&self, rt: &Runtime) -> Exit<E, Option<A>> {
        let mut last = None;
        self.run_for_each_chunk_exit(rt, |chunk| {
            if let Some(value) = chunk.last() {
                last = Some(value.clone());
            }
        })?;
        Ok(last)
    }

    /// Like [`Stream::run_last_exit`], raising defects and interruptions as panics.
    pub fn run_last(&self, rt: &Runtime) -> Result<Option<A>, E> {
        self.run_last_exit(rt).map_err(Cause::squash)
    }

    /// Offers every chunk to `queue`, followed by the end or failure of the stream.
    ///
    /// A failure is both delivered through the queue and returned. If the consumer shuts the
    /// queue down, the stream is stopped and this returns successfully.
    pub fn run_into_queue_exit(&self, rt: &Runtime, queue: &Queue<Take<E, A>>) -> Exit<E, ()> {
        rt.scoped(|ctx| {
            let mut pull = self.acquire(ctx);
            loop {
                let result = pull.invoke();
                let failure = match &result {
                    Err(Some(cause)) => Some(cause.clone()),
                    _ => None,
                };
                let done = result.is_err();
                match queue.offer(Take::from_pull(result)) {
                    Ok(()) => {}
                    Err(QueueError::Shutdown) => return Ok(()),
                    Err(QueueError::Interrupted(i)) => return Err(i.into()),
                }
                match failure {
                    Some(cause) => return Err(cause),
                    None if done => return Ok(()),
                    None => {}
                }
            }
        })
    }

    /// Like [`Stream::run_into_queue_exit`], raising defects and interruptions as panics.
    pub fn run_into_queue(&self, rt: &Runtime, queue: &Queue<Take<E, A>>) -> Result<(), E> {
        self.run_into_queue_exit(rt, queue).map_err(Cause::squash)
    }
}
