//! The [`Stream`] type and its constructors.

use std::{
    fmt,
    ops::Range,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use crate::{
    pull::Pull,
    queue::{Queue, QueueError},
    runtime::Context,
    scope::Scope,
    task, Cause, Chunk, Defect, Take,
};

/// Largest chunk emitted by constructors that produce chunks themselves.
pub(crate) const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Values that can flow through a stream: elements, errors and states shared between tasks.
pub trait Data: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Data for T {}

/// Environments a stream can be run in.
pub trait Env: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Env for T {}

type Acquire<R, E, A> = dyn Fn(&Context<R>) -> Pull<E, A> + Send + Sync;

/// A description of a possibly infinite sequence of values of type `A`, which needs an
/// environment `R` to run and may fail with an error of type `E`.
///
/// Streams are inert and can be run any number of times. Running one *acquires* it: everything it
/// needs (tasks, queues, resources) is set up in the [`Scope`] of the [`Context`], and a [`Pull`]
/// is returned that yields the stream's chunks. Terminal operations like
/// [`Stream::run_collect`] do all of that for you.
pub struct Stream<R, E, A> {
    acquire: Arc<Acquire<R, E, A>>,
}

impl<R, E, A> Clone for Stream<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            acquire: self.acquire.clone(),
        }
    }
}

impl<R, E, A> fmt::Debug for Stream<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").finish_non_exhaustive()
    }
}

impl<R: Env, E: Data, A: Data> Stream<R, E, A> {
    /// Creates a stream from its acquisition function.
    pub fn from_pull<F>(acquire: F) -> Self
    where
        F: Fn(&Context<R>) -> Pull<E, A> + Send + Sync + 'static,
    {
        Self {
            acquire: Arc::new(acquire),
        }
    }

    /// Acquires the stream in `ctx`.
    ///
    /// A panic during acquisition yields a pull that fails with the defect.
    pub fn acquire(&self, ctx: &Context<R>) -> Pull<E, A> {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.acquire)(ctx))) {
            Ok(pull) => pull,
            Err(payload) => Pull::fail(Cause::Die(Defect::from_panic(payload))),
        }
    }

    /// Acquires the stream in a child scope of `ctx`.
    ///
    /// Closing the returned scope releases everything the stream holds without touching the rest
    /// of `ctx`.
    pub(crate) fn acquire_scoped(&self, ctx: &Context<R>) -> (Pull<E, A>, Scope) {
        let child = ctx.child();
        (self.acquire(&child), child.scope().clone())
    }

    /// A stream that ends right away.
    pub fn empty() -> Self {
        Self::from_pull(|_| Pull::end())
    }

    /// Emits `value` and ends.
    pub fn succeed(value: A) -> Self {
        Self::from_chunk(Chunk::single(value))
    }

    /// Emits `chunk` as a single chunk.
    pub fn from_chunk(chunk: Chunk<A>) -> Self {
        Self::from_pull(move |_| Pull::once(chunk.clone()))
    }

    /// Emits each of `chunks` as it is, skipping empty ones.
    pub fn from_chunks<I: IntoIterator<Item = Chunk<A>>>(chunks: I) -> Self {
        let chunks: Arc<[Chunk<A>]> = chunks.into_iter().collect();
        Self::from_pull(move |_| {
            let chunks = chunks.clone();
            let mut next = 0;
            Pull::new(move || {
                let chunk = chunks.get(next).cloned().ok_or(None)?;
                next += 1;
                Ok(chunk)
            })
        })
    }

    /// Emits `values` as one chunk.
    pub fn from_iter<I: IntoIterator<Item = A>>(values: I) -> Self {
        Self::from_chunk(values.into_iter().collect())
    }

    /// Emits `init`, `f(init)`, `f(f(init))`, and so on.
    pub fn iterate<F>(init: A, f: F) -> Self
    where
        F: Fn(&A) -> A + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::from_pull(move |_| {
            let f = f.clone();
            let mut next = init.clone();
            Pull::new(move || {
                let following = f(&next);
                Ok(Chunk::single(std::mem::replace(&mut next, following)))
            })
        })
    }

    /// Emits values produced by `f` from a state, until `f` returns `None`.
    pub fn unfold<S, F>(init: S, f: F) -> Self
    where
        S: Data,
        F: Fn(S) -> Option<(A, S)> + Send + Sync + 'static,
    {
        Self::unfold_chunk(init, move |s| {
            f(s).map(|(value, s)| (Chunk::single(value), s))
        })
    }

    /// Emits chunks produced by `f` from a state, until `f` returns `None`.
    pub fn unfold_chunk<S, F>(init: S, f: F) -> Self
    where
        S: Data,
        F: Fn(S) -> Option<(Chunk<A>, S)> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::from_pull(move |_| {
            let f = f.clone();
            let mut state = Some(init.clone());
            Pull::new(move || {
                let (chunk, next) = state.take().and_then(|s| f(s)).ok_or(None)?;
                state = Some(next);
                Ok(chunk)
            })
        })
    }

    /// Emits `value` forever.
    pub fn repeat_value(value: A) -> Self {
        Self::repeat_with(move || value.clone())
    }

    /// Emits the results of calling `f`, forever.
    pub fn repeat_with<F: Fn() -> A + Send + Sync + 'static>(f: F) -> Self {
        let f = Arc::new(f);
        Self::from_pull(move |_| {
            let f = f.clone();
            Pull::new(move || Ok(Chunk::single(f())))
        })
    }

    /// A stream that fails with `error` without emitting anything.
    pub fn fail(error: E) -> Self {
        Self::fail_cause(Cause::fail(error))
    }

    /// A stream that fails with `cause`.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_pull(move |_| Pull::fail(cause.clone()))
    }

    /// A stream that dies with a defect carrying `message`.
    pub fn die<M: Into<String>>(message: M) -> Self {
        Self::fail_cause(Cause::die(message))
    }

    /// A stream that never produces anything and only ends by interruption.
    pub fn never() -> Self {
        Self::from_pull(|_| {
            Pull::new(|| {
                let _ = task::signal().recv();
                Err(Some(task::interruption().into()))
            })
        })
    }

    /// Defers creating the stream until it is acquired.
    pub fn suspend<F: Fn() -> Stream<R, E, A> + Send + Sync + 'static>(f: F) -> Self {
        Self::from_pull(move |ctx| f().acquire(ctx))
    }

    /// Emits values taken from `queue`, ending when the queue is shut down.
    pub fn from_queue(queue: Queue<A>) -> Self {
        Self::from_pull(move |_| {
            let queue = queue.clone();
            Pull::new(move || {
                let first = queue_take(&queue)?;
                let rest = std::iter::from_fn(|| queue.poll()).take(DEFAULT_CHUNK_SIZE - 1);
                Ok(std::iter::once(first).chain(rest).collect())
            })
        })
    }

    /// Emits chunks taken from `queue`, ending when the queue is shut down.
    pub fn from_chunk_queue(queue: Queue<Chunk<A>>) -> Self {
        Self::from_pull(move |_| {
            let queue = queue.clone();
            Pull::new(move || queue_take(&queue))
        })
    }

    /// Replays the pull results sent through `queue`.
    ///
    /// The queue is shut down when the consuming scope closes, which tells the producer on the
    /// other side that this consumer is gone.
    pub fn from_take_queue(queue: Queue<Take<E, A>>) -> Self {
        Self::from_pull(move |ctx| {
            let remote = queue.clone();
            ctx.scope().add_finalizer(move || remote.shutdown());
            let queue = queue.clone();
            Pull::new(move || queue_take(&queue)?.into_pull())
        })
    }

    /// Emits a value computed from the environment.
    pub fn environment_with<F: Fn(&R) -> A + Send + Sync + 'static>(f: F) -> Self {
        Self::from_pull(move |ctx| Pull::once(Chunk::single(f(ctx.env()))))
    }

    /// Emits a resource acquired from the environment, and releases it when the stream's scope
    /// closes.
    pub fn acquire_release<Acq, Rel>(acquire: Acq, release: Rel) -> Self
    where
        Acq: Fn(&R) -> Result<A, E> + Send + Sync + 'static,
        Rel: Fn(A) + Send + Sync + 'static,
    {
        let release = Arc::new(release);
        Self::from_pull(move |ctx| match acquire(ctx.env()) {
            Ok(resource) => {
                let release = release.clone();
                let held = resource.clone();
                ctx.scope().add_finalizer(move || release(held));
                Pull::once(Chunk::single(resource))
            }
            Err(e) => Pull::fail(Cause::fail(e)),
        })
    }

    /// An empty stream that runs `f` when its scope closes.
    pub fn finalizer<F: Fn() + Send + Sync + 'static>(f: F) -> Self {
        let f = Arc::new(f);
        Self::from_pull(move |ctx| {
            let f = f.clone();
            ctx.scope().add_finalizer(move || f());
            Pull::end()
        })
    }

    /// Supplies the environment, producing a stream that runs in any environment.
    pub fn provide<R0: Env>(&self, env: R) -> Stream<R0, E, A> {
        let env = Arc::new(env);
        let this = self.clone();
        Stream::from_pull(move |ctx: &Context<R0>| this.acquire(&ctx.with_env(env.clone())))
    }
}

impl<R: Env, E: Data> Stream<R, E, Arc<R>> {
    /// Emits the environment the stream runs in.
    pub fn environment() -> Self {
        Self::from_pull(|ctx| Pull::once(Chunk::single(ctx.env().clone())))
    }
}

impl<R: Env, E: Data> Stream<R, E, i64> {
    /// Emits the integers in `range`, lower bound included, upper bound excluded.
    pub fn range(range: Range<i64>) -> Self {
        Self::unfold_chunk(range, |mut range: Range<i64>| {
            let chunk: Chunk<i64> = range.by_ref().take(DEFAULT_CHUNK_SIZE).collect();
            (!chunk.is_empty()).then_some((chunk, range))
        })
    }
}

/// Takes from a queue, mapping shutdown to the end of the stream.
fn queue_take<E, T>(queue: &Queue<T>) -> Result<T, Option<Cause<E>>> {
    queue.take().map_err(|e| match e {
        QueueError::Shutdown => None,
        QueueError::Interrupted(i) => Some(i.into()),
    })
}
