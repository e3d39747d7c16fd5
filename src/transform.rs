//! Sequential combinators.
//!
//! Everything here runs on the consumer's thread, except [`Stream::buffer`], which decouples
//! producer and consumer with a task.

use std::sync::Arc;

use crate::{
    pull::{Elements, Pull},
    queue::Queue,
    runtime::Context,
    scope::Scope,
    stream::{Data, Env, Stream},
    task, Cause, Chunk, Take,
};

/// A pull acquired in its own scope, so that it can be released as soon as it is no longer needed.
pub(crate) struct Scoped<E, A> {
    pull: Pull<E, A>,
    scope: Scope,
}

impl<E, A> Scoped<E, A> {
    pub(crate) fn acquire<R: Env>(stream: &Stream<R, E, A>, ctx: &Context<R>) -> Self
    where
        E: Data,
        A: Data,
    {
        let (pull, scope) = stream.acquire_scoped(ctx);
        Self { pull, scope }
    }

    /// Pulls the next chunk, releasing the scope once the pull has ended or failed.
    pub(crate) fn invoke(&mut self) -> Result<Chunk<A>, Option<Cause<E>>> {
        let result = self.pull.invoke();
        if result.is_err() {
            self.scope.close();
        }
        result
    }

    pub(crate) fn close(&self) {
        self.scope.close();
    }
}

impl<R: Env, E: Data, A: Data> Stream<R, E, A> {
    /// Builds a stream by transforming the pull of this one.
    pub(crate) fn via<E2: Data, B: Data, F>(&self, f: F) -> Stream<R, E2, B>
    where
        F: Fn(Pull<E, A>, &Context<R>) -> Pull<E2, B> + Send + Sync + 'static,
    {
        let this = self.clone();
        Stream::from_pull(move |ctx| f(this.acquire(ctx), ctx))
    }

    /// Applies `f` to every element.
    pub fn map<B: Data, F: Fn(A) -> B + Send + Sync + 'static>(&self, f: F) -> Stream<R, E, B> {
        let f = Arc::new(f);
        self.via(move |mut pull, _| {
            let f = f.clone();
            Pull::new(move || pull.invoke().map(|chunk| chunk.map(|a| f(a.clone()))))
        })
    }

    /// Applies `f` to every chunk. Chunks `f` empties are skipped.
    pub fn map_chunks<B, F>(&self, f: F) -> Stream<R, E, B>
    where
        B: Data,
        F: Fn(Chunk<A>) -> Chunk<B> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.via(move |mut pull, _| {
            let f = f.clone();
            Pull::new(move || pull.invoke().map(|chunk| f(chunk)))
        })
    }

    /// Maps elements while threading a state through the stream.
    pub fn map_accum<S, B, F>(&self, init: S, f: F) -> Stream<R, E, B>
    where
        S: Data,
        B: Data,
        F: Fn(S, A) -> (S, B) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.via(move |mut pull, _| {
            let f = f.clone();
            let mut state = Some(init.clone());
            Pull::new(move || {
                let chunk = pull.invoke()?;
                let mut out = Vec::with_capacity(chunk.len());
                for a in &chunk {
                    let (next, b) = f(state.take().ok_or(None)?, a.clone());
                    state = Some(next);
                    out.push(b);
                }
                Ok(Chunk::from_vec(out))
            })
        })
    }

    /// Emits `init`, followed by every intermediate state of a fold.
    pub fn scan<S, F>(&self, init: S, f: F) -> Stream<R, E, S>
    where
        S: Data,
        F: Fn(S, A) -> S + Send + Sync + 'static,
    {
        Stream::succeed(init.clone()).concat(&self.map_accum(init, move |s, a| {
            let next = f(s, a);
            (next.clone(), next)
        }))
    }

    /// Keeps the elements `pred` returns `true` for.
    pub fn filter<P: Fn(&A) -> bool + Send + Sync + 'static>(&self, pred: P) -> Self {
        let pred = Arc::new(pred);
        self.via(move |mut pull, _| {
            let pred = pred.clone();
            // Chunks that are filtered out entirely come back empty and are skipped by `invoke`.
            Pull::new(move || pull.invoke().map(|chunk| chunk.filter(|a| pred(a))))
        })
    }

    /// Applies `f` to every element, keeping the `Some` results.
    pub fn filter_map<B, F>(&self, f: F) -> Stream<R, E, B>
    where
        B: Data,
        F: Fn(A) -> Option<B> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.via(move |mut pull, _| {
            let f = f.clone();
            Pull::new(move || pull.invoke().map(|chunk| chunk.filter_map(|a| f(a.clone()))))
        })
    }

    /// Emits the first `n` elements.
    ///
    /// Upstream is released as soon as the last element has been pulled.
    pub fn take(&self, n: usize) -> Self {
        let this = self.clone();
        Stream::from_pull(move |ctx| {
            if n == 0 {
                return Pull::end();
            }
            let mut upstream = Scoped::acquire(&this, ctx);
            let mut remaining = n;
            Pull::new(move || {
                if remaining == 0 {
                    return Err(None);
                }
                let chunk = upstream.invoke()?.take(remaining);
                remaining -= chunk.len();
                if remaining == 0 {
                    upstream.close();
                }
                Ok(chunk)
            })
        })
    }

    /// Emits elements while `pred` holds.
    pub fn take_while<P: Fn(&A) -> bool + Send + Sync + 'static>(&self, pred: P) -> Self {
        self.take_prefix(move |chunk| chunk.iter().position(|a| !pred(a)))
    }

    /// Emits elements up to and including the first one for which `pred` holds.
    pub fn take_until<P: Fn(&A) -> bool + Send + Sync + 'static>(&self, pred: P) -> Self {
        self.take_prefix(move |chunk| chunk.iter().position(|a| pred(a)).map(|i| i + 1))
    }

    /// Emits chunks until `cut` returns the length of a final prefix.
    fn take_prefix<F>(&self, cut: F) -> Self
    where
        F: Fn(&Chunk<A>) -> Option<usize> + Send + Sync + 'static,
    {
        let this = self.clone();
        let cut = Arc::new(cut);
        Stream::from_pull(move |ctx| {
            let cut = cut.clone();
            let mut upstream = Scoped::acquire(&this, ctx);
            let mut done = false;
            Pull::new(move || {
                if done {
                    return Err(None);
                }
                let chunk = upstream.invoke()?;
                match cut(&chunk) {
                    Some(len) => {
                        done = true;
                        upstream.close();
                        // An empty prefix is skipped, and the next invocation ends the stream.
                        Ok(chunk.take(len))
                    }
                    None => Ok(chunk),
                }
            })
        })
    }

    /// Skips the first `n` elements.
    pub fn drop(&self, n: usize) -> Self {
        self.via(move |mut pull, _| {
            let mut remaining = n;
            Pull::new(move || {
                let chunk = pull.invoke()?;
                let skip = remaining.min(chunk.len());
                remaining -= skip;
                Ok(chunk.drop(skip))
            })
        })
    }

    /// Skips elements while `pred` holds.
    pub fn drop_while<P: Fn(&A) -> bool + Send + Sync + 'static>(&self, pred: P) -> Self {
        let pred = Arc::new(pred);
        self.via(move |mut pull, _| {
            let pred = pred.clone();
            let mut dropping = true;
            Pull::new(move || {
                let chunk = pull.invoke()?;
                if !dropping {
                    return Ok(chunk);
                }
                match chunk.iter().position(|a| !pred(a)) {
                    Some(i) => {
                        dropping = false;
                        Ok(chunk.drop(i))
                    }
                    None => Ok(Chunk::empty()),
                }
            })
        })
    }

    /// Emits all elements of `self`, then all elements of `that`.
    ///
    /// `that` is only acquired once `self` has ended, and `self` is released at that point.
    pub fn concat(&self, that: &Stream<R, E, A>) -> Self {
        let streams = [self.clone(), that.clone()];
        Stream::from_pull(move |ctx| {
            let streams = streams.clone();
            let ctx = ctx.clone();
            let mut next = 0;
            let mut current: Option<Scoped<E, A>> = None;
            Pull::new(move || loop {
                if current.is_none() {
                    let stream = streams.get(next).ok_or(None)?;
                    next += 1;
                    current = Some(Scoped::acquire(stream, &ctx));
                }
                let Some(pull) = &mut current else {
                    return Err(None);
                };
                match pull.invoke() {
                    Err(None) => current = None,
                    result => return result,
                }
            })
        })
    }

    /// Runs the stream produced by `f` for every element, one after another.
    pub fn flat_map<B, F>(&self, f: F) -> Stream<R, E, B>
    where
        B: Data,
        F: Fn(A) -> Stream<R, E, B> + Send + Sync + 'static,
    {
        let this = self.clone();
        let f = Arc::new(f);
        Stream::from_pull(move |ctx| {
            let f = f.clone();
            let ctx = ctx.clone();
            let mut outer = Elements::new(this.acquire(&ctx));
            let mut inner: Option<Scoped<E, B>> = None;
            Pull::new(move || loop {
                if inner.is_none() {
                    inner = Some(Scoped::acquire(&f(outer.next()?), &ctx));
                }
                let Some(pull) = &mut inner else {
                    return Err(None);
                };
                match pull.invoke() {
                    Err(None) => inner = None,
                    result => return result,
                }
            })
        })
    }

    /// Emits every chunk as a single element.
    pub fn chunks(&self) -> Stream<R, E, Chunk<A>> {
        self.map_chunks(|chunk| Chunk::single(chunk))
    }

    /// Calls `f` with every element as it passes by.
    pub fn tap<F: Fn(&A) + Send + Sync + 'static>(&self, f: F) -> Self {
        let f = Arc::new(f);
        self.via(move |mut pull, _| {
            let f = f.clone();
            Pull::new(move || {
                let chunk = pull.invoke()?;
                chunk.iter().for_each(|a| f(a));
                Ok(chunk)
            })
        })
    }

    /// Maps the typed failure of the stream. Defects and interruptions pass through.
    pub fn map_error<E2, F>(&self, f: F) -> Stream<R, E2, A>
    where
        E2: Data,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.map_error_cause(move |cause| cause.map(|e| f(e)))
    }

    /// Maps the whole cause the stream fails with.
    pub fn map_error_cause<E2, F>(&self, f: F) -> Stream<R, E2, A>
    where
        E2: Data,
        F: Fn(Cause<E>) -> Cause<E2> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.via(move |mut pull, _| {
            let f = f.clone();
            Pull::new(move || pull.invoke().map_err(|e| e.map(|cause| f(cause))))
        })
    }

    /// Switches to the stream returned by `f` if this one fails with a typed error.
    ///
    /// Defects and interruptions are not caught.
    pub fn catch_all<E2, F>(&self, f: F) -> Stream<R, E2, A>
    where
        E2: Data,
        F: Fn(E) -> Stream<R, E2, A> + Send + Sync + 'static,
    {
        self.catch_all_cause(move |cause| match cause.failure_or_cause() {
            Ok(e) => f(e),
            Err(cause) => Stream::fail_cause(cause.strip_failures()),
        })
    }

    /// Switches to the stream returned by `f` if this one fails for any reason.
    pub fn catch_all_cause<E2, F>(&self, f: F) -> Stream<R, E2, A>
    where
        E2: Data,
        F: Fn(Cause<E>) -> Stream<R, E2, A> + Send + Sync + 'static,
    {
        let this = self.clone();
        let f = Arc::new(f);
        Stream::from_pull(move |ctx| {
            let f = f.clone();
            let ctx = ctx.clone();
            let mut first = Some(Scoped::acquire(&this, &ctx));
            let mut fallback: Option<Pull<E2, A>> = None;
            Pull::new(move || {
                if let Some(pull) = &mut fallback {
                    return pull.invoke();
                }
                let Some(pull) = &mut first else {
                    return Err(None);
                };
                match pull.invoke() {
                    Ok(chunk) => Ok(chunk),
                    Err(None) => Err(None),
                    Err(Some(cause)) => {
                        first = None;
                        fallback.insert(f(cause).acquire(&ctx)).invoke()
                    }
                }
            })
        })
    }

    /// Switches to `that` if this stream fails with a typed error.
    pub fn or_else<E2: Data>(&self, that: &Stream<R, E2, A>) -> Stream<R, E2, A> {
        let that = that.clone();
        self.catch_all(move |_| that.clone())
    }

    /// Runs `f` once the stream has ended, failed or been interrupted.
    pub fn ensuring<F: Fn() + Send + Sync + 'static>(&self, f: F) -> Self {
        let this = self.clone();
        let f = Arc::new(f);
        Stream::from_pull(move |ctx| {
            let child = ctx.child();
            let f = f.clone();
            child.scope().add_finalizer(move || f());
            let mut upstream = Scoped {
                pull: this.acquire(&child),
                scope: child.scope().clone(),
            };
            Pull::new(move || upstream.invoke())
        })
    }

    /// Repeats the stream forever, acquiring it again every time it ends.
    pub fn forever(&self) -> Self {
        let this = self.clone();
        Stream::from_pull(move |ctx| {
            let this = this.clone();
            let ctx = ctx.clone();
            let mut current = Scoped::acquire(&this, &ctx);
            Pull::new(move || loop {
                match current.invoke() {
                    Err(None) => {
                        task::check().map_err(|i| Some(i.into()))?;
                        current = Scoped::acquire(&this, &ctx);
                    }
                    result => return result,
                }
            })
        })
    }

    /// Emits chunks of exactly `n` elements, except for the last one.
    pub fn rechunk(&self, n: usize) -> Self {
        let n = n.max(1);
        self.via(move |mut pull, _| {
            let mut buffer = Chunk::empty();
            let mut ended = false;
            Pull::new(move || {
                while buffer.len() < n && !ended {
                    match pull.invoke() {
                        Ok(chunk) => buffer = buffer.concat(&chunk),
                        Err(None) => ended = true,
                        Err(Some(cause)) => return Err(Some(cause)),
                    }
                }
                if buffer.is_empty() {
                    return Err(None);
                }
                let (out, rest) = buffer.split_at(n);
                buffer = rest;
                Ok(out)
            })
        })
    }

    /// Groups elements into chunks of `n`. The last group may be smaller.
    pub fn grouped(&self, n: usize) -> Stream<R, E, Chunk<A>> {
        self.rechunk(n).chunks()
    }

    /// Emits `separator` between every two elements.
    pub fn intersperse(&self, separator: A) -> Self {
        self.via(move |mut pull, _| {
            let separator = separator.clone();
            let mut first = true;
            Pull::new(move || {
                let chunk = pull.invoke()?;
                let mut out = Vec::with_capacity(chunk.len() * 2);
                for a in &chunk {
                    if !first {
                        out.push(separator.clone());
                    }
                    first = false;
                    out.push(a.clone());
                }
                Ok(Chunk::from_vec(out))
            })
        })
    }

    /// Runs the stream in a separate task, which may run up to `capacity` chunks ahead of the
    /// consumer.
    pub fn buffer(&self, capacity: usize) -> Self {
        let this = self.clone();
        Stream::from_pull(move |ctx| {
            let queue = Queue::bounded(capacity);
            let producer = queue.clone();
            let mut pull = this.acquire(ctx);
            ctx.fork::<E, (), _>(move || {
                loop {
                    let take = Take::from_pull(pull.invoke());
                    let done = take.is_done();
                    if producer.offer(take).is_err() || done {
                        return Ok(());
                    }
                }
            });
            Stream::from_take_queue(queue).acquire(ctx)
        })
    }
}

impl<R: Env, E: Data, A: Data + PartialEq> Stream<R, E, A> {
    /// Drops elements equal to the one before them.
    pub fn changes(&self) -> Self {
        self.via(|mut pull, _| {
            let mut last: Option<A> = None;
            Pull::new(move || {
                let chunk = pull.invoke()?;
                let mut out = Vec::new();
                for a in &chunk {
                    if last.as_ref() != Some(a) {
                        out.push(a.clone());
                        last = Some(a.clone());
                    }
                }
                Ok(Chunk::from_vec(out))
            })
        })
    }
}

impl<R: Env, E: Data, A: Data> Stream<R, E, Stream<R, E, A>> {
    /// Runs the emitted streams one after another.
    pub fn flatten(&self) -> Stream<R, E, A> {
        self.flat_map(|stream| stream)
    }
}

impl<R: Env, E: Data, A: Data> Stream<R, E, Chunk<A>> {
    /// Emits the elements of every emitted chunk.
    pub fn flatten_chunks(&self) -> Stream<R, E, A> {
        self.via(|mut pull, _| {
            Pull::new(move || {
                let chunks = pull.invoke()?;
                Ok(chunks.iter().fold(Chunk::empty(), |acc, c| acc.concat(c)))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::{
        sync::Mutex,
        test::{rt, TestStream},
    };

    fn chunked(chunks: &[&[i32]]) -> TestStream<i32> {
        TestStream::from_chunks(chunks.iter().map(|c| Chunk::from_vec(c.to_vec())))
    }

    #[test]
    fn map_and_filter() {
        let stream = TestStream::range(0..10).map(|n| n * 3).filter(|n| n % 2 == 0);
        assert_eq!(stream.run_collect(&rt()), Ok(vec![0, 6, 12, 18, 24]));

        let stream = chunked(&[&[1, 3], &[5], &[6]]).filter(|n| n % 2 == 0);
        assert_eq!(stream.run_collect(&rt()), Ok(vec![6]));

        let stream = chunked(&[&[1, 2, 3]]).filter_map(|n| (n != 2).then(|| n.to_string()));
        assert_eq!(stream.run_collect(&rt()), Ok(vec!["1".to_string(), "3".to_string()]));
    }

    #[test]
    fn map_accum_and_scan() {
        let stream = chunked(&[&[1, 2], &[3]]).map_accum(0, |sum, n| (sum + n, sum + n));
        assert_eq!(stream.run_collect(&rt()), Ok(vec![1, 3, 6]));
        // Each run starts from the initial state.
        assert_eq!(stream.run_collect(&rt()), Ok(vec![1, 3, 6]));

        let stream = chunked(&[&[1, 2, 3]]).scan(0, |sum, n| sum + n);
        assert_eq!(stream.run_collect(&rt()), Ok(vec![0, 1, 3, 6]));
    }

    #[test]
    fn take_releases_upstream() {
        let released = Arc::new(AtomicUsize::new(0));
        let remote = released.clone();
        let stream = TestStream::iterate(0, |n| n + 1)
            .ensuring(move || {
                remote.fetch_add(1, Ordering::SeqCst);
            })
            .take(3)
            .tap({
                let released = released.clone();
                move |n| {
                    if *n == 2 {
                        assert_eq!(released.load(Ordering::SeqCst), 1);
                    }
                }
            });
        assert_eq!(stream.run_collect(&rt()), Ok(vec![0, 1, 2]));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(TestStream::range(0..10).take(0).run_collect(&rt()), Ok(vec![]));
    }

    #[test]
    fn take_while_and_until() {
        let stream = chunked(&[&[1, 2], &[3, 4, 1]]);
        assert_eq!(stream.take_while(|n| *n < 3).run_collect(&rt()), Ok(vec![1, 2]));
        assert_eq!(stream.take_until(|n| *n == 3).run_collect(&rt()), Ok(vec![1, 2, 3]));
        assert_eq!(stream.take_while(|n| *n > 5).run_collect(&rt()), Ok(vec![]));
        assert_eq!(
            TestStream::iterate(1, |n| n + 1).take_while(|n| *n <= 4).run_collect(&rt()),
            Ok(vec![1, 2, 3, 4])
        );
    }

    #[test]
    fn drop_and_drop_while() {
        let stream = chunked(&[&[1, 2], &[3, 4], &[1]]);
        assert_eq!(stream.drop(3).run_collect(&rt()), Ok(vec![4, 1]));
        assert_eq!(stream.drop_while(|n| *n < 3).run_collect(&rt()), Ok(vec![3, 4, 1]));
        assert_eq!(stream.drop(10).run_collect(&rt()), Ok(vec![]));
    }

    #[test]
    fn concat_acquires_lazily() {
        let acquired = Arc::new(AtomicUsize::new(0));
        let remote = acquired.clone();
        let second = TestStream::suspend(move || {
            remote.fetch_add(1, Ordering::SeqCst);
            TestStream::from_iter([3])
        });
        let stream = TestStream::from_iter([1, 2]).concat(&second);
        assert_eq!(stream.take(2).run_collect(&rt()), Ok(vec![1, 2]));
        assert_eq!(acquired.load(Ordering::SeqCst), 0);
        assert_eq!(stream.run_collect(&rt()), Ok(vec![1, 2, 3]));
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn flat_map_is_sequential() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let remote = log.clone();
        let stream = TestStream::from_iter([1, 2, 3]).flat_map(move |n| {
            let log = remote.clone();
            TestStream::from_iter([n * 10, n * 10 + 1]).ensuring(move || log.lock().push(n))
        });
        assert_eq!(stream.run_collect(&rt()), Ok(vec![10, 11, 20, 21, 30, 31]));
        assert_eq!(*log.lock(), vec![1, 2, 3]);

        let nested = TestStream::from_iter([TestStream::from_iter([1]), TestStream::range(2..4)]);
        assert_eq!(nested.flatten().run_collect(&rt()), Ok(vec![1, 2, 3]));
    }

    #[test]
    fn chunks_roundtrip() {
        let stream = chunked(&[&[1, 2], &[3]]);
        let chunks = stream.chunks().run_collect(&rt()).unwrap();
        assert_eq!(chunks, vec![Chunk::from_vec(vec![1, 2]), Chunk::from_vec(vec![3])]);
        assert_eq!(stream.chunks().flatten_chunks().run_collect(&rt()), Ok(vec![1, 2, 3]));
    }

    #[test]
    fn error_mapping_and_recovery() {
        let failing = TestStream::from_iter([1]).concat(&TestStream::fail("bad".into()));

        let mapped = failing.map_error(|e| e.len());
        assert_eq!(mapped.run_collect(&rt()), Err(3));

        let recovered = failing.catch_all(|e| TestStream::from_iter([e.len() as i32]));
        assert_eq!(recovered.run_collect(&rt()), Ok(vec![1, 3]));

        let recovered = failing.or_else(&TestStream::from_iter([9]));
        assert_eq!(recovered.run_collect(&rt()), Ok(vec![1, 9]));

        // Defects are not typed failures.
        let died = TestStream::<i32>::die("boom").catch_all(|_| TestStream::from_iter([0]));
        let cause = died.run_collect_exit(&rt()).unwrap_err();
        assert_eq!(cause.defects()[0].message(), "boom");

        let recovered = TestStream::<i32>::die("boom").catch_all_cause(|cause| {
            TestStream::from_iter([cause.defects().len() as i32])
        });
        assert_eq!(recovered.run_collect(&rt()), Ok(vec![1]));
    }

    #[test]
    fn ensuring_runs_on_failure() {
        let ran = Arc::new(AtomicUsize::new(0));
        let remote = ran.clone();
        let stream = TestStream::<i32>::fail("e".into()).ensuring(move || {
            remote.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(stream.run_collect(&rt()), Err("e".to_string()));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn forever_reacquires() {
        let stream = TestStream::from_iter([1, 2]).forever().take(5);
        assert_eq!(stream.run_collect(&rt()), Ok(vec![1, 2, 1, 2, 1]));
    }

    #[test]
    fn rechunk_and_grouped() {
        let stream = chunked(&[&[1], &[2, 3, 4], &[5]]);
        let chunks = stream.rechunk(2).chunks().run_collect(&rt()).unwrap();
        assert_eq!(
            chunks.iter().map(Chunk::to_vec).collect::<Vec<_>>(),
            vec![vec![1, 2], vec![3, 4], vec![5]]
        );
        assert_eq!(stream.grouped(3).run_count(&rt()), Ok(2));
    }

    #[test]
    fn intersperse_and_changes() {
        let stream = chunked(&[&[1, 2], &[3]]).intersperse(0);
        assert_eq!(stream.run_collect(&rt()), Ok(vec![1, 0, 2, 0, 3]));

        let stream = chunked(&[&[1, 1, 2], &[2, 3, 1]]).changes();
        assert_eq!(stream.run_collect(&rt()), Ok(vec![1, 2, 3, 1]));
    }

    #[test]
    fn buffer_preserves_order_and_failures() {
        let stream = TestStream::range(0..1000).rechunk(7).buffer(2);
        assert_eq!(stream.run_collect(&rt()), Ok((0..1000).collect()));

        let failing = TestStream::from_iter([1]).concat(&TestStream::fail("e".into())).buffer(4);
        assert_eq!(failing.run_collect(&rt()), Err("e".to_string()));
    }

    #[test]
    fn buffer_producer_is_interrupted_when_consumer_stops() {
        let stream = TestStream::iterate(0, |n| n + 1).buffer(1).take(3);
        assert_eq!(stream.run_collect(&rt()), Ok(vec![0, 1, 2]));
    }
}
