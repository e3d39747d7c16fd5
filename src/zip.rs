//! Pairwise combinators.
//!
//! Each side of a pairwise combinator is driven by its own task, which invokes the side's pull on
//! request and sends back the result. This lets both sides be pulled concurrently, and lets
//! [`Stream::zip_latest`] race them against each other. The combination logic itself is a state
//! machine stepped on the consumer's thread, see [`Stream::combine_chunks`].

use std::{cmp::Ordering, sync::Arc};

use crossbeam_channel::{select, Receiver, RecvError, Sender};

use crate::{
    pull::{Pull, PullResult},
    runtime::Context,
    stream::{Data, Env, Stream},
    task, Cause, Chunk,
};

/// One side of a pairwise combinator, as seen by its step function.
pub struct Side<E, A> {
    requests: Sender<()>,
    replies: Receiver<PullResult<E, A>>,
    pending: bool,
    done: bool,
    leftover: Chunk<A>,
}

impl<E: Data, A: Data> Side<E, A> {
    /// Acquires `stream` in `ctx` and forks the task driving its pull.
    pub(crate) fn spawn<R: Env>(stream: &Stream<R, E, A>, ctx: &Context<R>) -> Self {
        let mut pull = stream.acquire(ctx);
        let (requests, inbox) = crossbeam_channel::unbounded::<()>();
        let (outbox, replies) = crossbeam_channel::bounded(1);
        ctx.fork::<E, (), _>(move || {
            let signal = task::signal();
            loop {
                select! {
                    recv(inbox) -> msg => {
                        if msg.is_err() {
                            return Ok(());
                        }
                    }
                    recv(signal) -> _ => return Err(task::interruption().into()),
                }
                let result = pull.invoke();
                let done = result.is_err();
                if outbox.send(result).is_err() || done {
                    return Ok(());
                }
            }
        });
        Self {
            requests,
            replies,
            pending: false,
            done: false,
            leftover: Chunk::empty(),
        }
    }

    /// Asks the driver for the next chunk, unless a request is already in flight.
    fn request(&mut self) {
        if !self.pending && !self.done {
            // The driver only goes away after replying with the end of the pull.
            let _ = self.requests.send(());
            self.pending = true;
        }
    }

    fn received(&mut self, reply: Result<PullResult<E, A>, RecvError>) -> PullResult<E, A> {
        self.pending = false;
        let result = reply
            .unwrap_or_else(|_| Err(Some(Cause::die("pull driver exited without replying"))));
        if result.is_err() {
            self.done = true;
        }
        result
    }

    /// Returns a buffered chunk, or `None` after sending a request for one.
    fn ready(&mut self) -> Option<Option<Chunk<A>>> {
        if !self.leftover.is_empty() {
            return Some(Some(std::mem::take(&mut self.leftover)));
        }
        if self.done && !self.pending {
            return Some(None);
        }
        self.request();
        None
    }

    /// Pulls the next chunk of this side. Chunks put back with [`Side::unread`] come first.
    pub fn pull(&mut self) -> PullResult<E, A> {
        if !self.leftover.is_empty() {
            return Ok(std::mem::take(&mut self.leftover));
        }
        if self.done && !self.pending {
            return Err(None);
        }
        self.request();
        let replies = self.replies.clone();
        let signal = task::signal();
        select! {
            recv(replies) -> reply => self.received(reply),
            recv(signal) -> _ => Err(Some(task::interruption().into())),
        }
    }

    /// Pulls a single element.
    pub fn pull_element(&mut self) -> Result<A, Option<Cause<E>>> {
        let chunk = self.pull()?;
        let (head, rest) = chunk.split_at(1);
        self.leftover = rest;
        head.head().cloned().ok_or(None)
    }

    /// Puts `chunk` back, so that the next pull returns it first.
    pub fn unread(&mut self, chunk: Chunk<A>) {
        self.leftover = chunk.concat(&self.leftover);
    }

    /// Returns `true` once the side has ended or failed and nothing is left to read.
    pub fn is_done(&self) -> bool {
        self.done && !self.pending && self.leftover.is_empty()
    }

    /// Pulls the next chunk unless `timer` fires first, in which case `None` is returned and the
    /// request stays in flight.
    pub(crate) fn pull_until(&mut self, timer: &Receiver<()>) -> Option<PullResult<E, A>> {
        if !self.leftover.is_empty() || (self.done && !self.pending) {
            return Some(self.pull());
        }
        self.request();
        let replies = self.replies.clone();
        let signal = task::signal();
        select! {
            recv(replies) -> reply => Some(self.received(reply)),
            recv(timer) -> _ => None,
            recv(signal) -> _ => Some(Err(Some(task::interruption().into()))),
        }
    }
}

enum Reply<E, A, B> {
    Left(PullResult<E, A>),
    Right(PullResult<E, B>),
}

/// Waits for whichever side with a request in flight replies first.
fn next_reply<E: Data, A: Data, B: Data>(
    left: &mut Side<E, A>,
    right: &mut Side<E, B>,
) -> Result<Reply<E, A, B>, Option<Cause<E>>> {
    let lr = if left.pending { left.replies.clone() } else { crossbeam_channel::never() };
    let rr = if right.pending { right.replies.clone() } else { crossbeam_channel::never() };
    let signal = task::signal();
    select! {
        recv(lr) -> reply => Ok(Reply::Left(left.received(reply))),
        recv(rr) -> reply => Ok(Reply::Right(right.received(reply))),
        recv(signal) -> _ => Err(Some(task::interruption().into())),
    }
}

/// Pulls a chunk from both sides concurrently.
///
/// A failure on either side is returned as soon as it arrives. An ended side is reported as
/// `None`, or, with `stop_on_end`, ends the whole pull right away.
fn pull_both<E: Data, A: Data, B: Data>(
    left: &mut Side<E, A>,
    right: &mut Side<E, B>,
    stop_on_end: bool,
) -> Result<(Option<Chunk<A>>, Option<Chunk<B>>), Option<Cause<E>>> {
    let mut a = left.ready();
    if stop_on_end && matches!(a, Some(None)) {
        return Err(None);
    }
    let mut b = right.ready();
    if stop_on_end && matches!(b, Some(None)) {
        return Err(None);
    }
    loop {
        match (a, b) {
            (Some(a), Some(b)) => return Ok((a, b)),
            (pa, pb) => {
                a = pa;
                b = pb;
            }
        }
        match next_reply(left, right)? {
            Reply::Left(result) => a = Some(settle(result, stop_on_end)?),
            Reply::Right(result) => b = Some(settle(result, stop_on_end)?),
        }
    }
}

fn settle<E, A>(
    result: PullResult<E, A>,
    stop_on_end: bool,
) -> Result<Option<Chunk<A>>, Option<Cause<E>>> {
    match result {
        Ok(chunk) => Ok(Some(chunk)),
        Err(None) if stop_on_end => Err(None),
        Err(None) => Ok(None),
        Err(Some(cause)) => Err(Some(cause)),
    }
}

enum Raced<A, B> {
    Left(Chunk<A>),
    Right(Chunk<B>),
}

/// Returns the next chunk of whichever side produces one first. Ends once both sides have ended.
fn race<E: Data, A: Data, B: Data>(
    left: &mut Side<E, A>,
    right: &mut Side<E, B>,
) -> Result<Raced<A, B>, Option<Cause<E>>> {
    loop {
        if !left.leftover.is_empty() {
            return Ok(Raced::Left(std::mem::take(&mut left.leftover)));
        }
        if !right.leftover.is_empty() {
            return Ok(Raced::Right(std::mem::take(&mut right.leftover)));
        }
        if left.is_done() && right.is_done() {
            return Err(None);
        }
        left.request();
        right.request();
        match next_reply(left, right)? {
            Reply::Left(Ok(chunk)) => return Ok(Raced::Left(chunk)),
            Reply::Right(Ok(chunk)) => return Ok(Raced::Right(chunk)),
            Reply::Left(Err(None)) | Reply::Right(Err(None)) => continue,
            Reply::Left(Err(Some(cause))) | Reply::Right(Err(Some(cause))) => {
                return Err(Some(cause))
            }
        }
    }
}

/// Buffering state of [`Stream::zip_with`].
#[derive(Clone)]
enum ZipState<A, B> {
    PullBoth,
    /// Right elements are buffered, waiting for the left side.
    PullLeft(Chunk<B>),
    /// Left elements are buffered, waiting for the right side.
    PullRight(Chunk<A>),
}

fn zip_chunks<A: Clone, B: Clone, C>(
    a: &Chunk<A>,
    b: &Chunk<B>,
    f: &impl Fn(A, B) -> C,
) -> (Chunk<C>, ZipState<A, B>) {
    let n = a.len().min(b.len());
    let out = a.zip_with(b, |x, y| f(x.clone(), y.clone()));
    let state = if a.len() > n {
        ZipState::PullRight(a.drop(n))
    } else if b.len() > n {
        ZipState::PullLeft(b.drop(n))
    } else {
        ZipState::PullBoth
    };
    (out, state)
}

/// Buffering state of the `zip_all` family. Once a side has ended, the other one is drained.
#[derive(Clone)]
enum AllState<A, B> {
    PullBoth,
    PullLeft(Chunk<B>),
    PullRight(Chunk<A>),
    DrainLeft,
    DrainRight,
}

fn step_all<E: Data, A: Data, B: Data, C>(
    state: AllState<A, B>,
    left: &mut Side<E, A>,
    right: &mut Side<E, B>,
    on_left: &dyn Fn(&A) -> C,
    on_right: &dyn Fn(&B) -> C,
    merge: &dyn Fn(Chunk<A>, Chunk<B>) -> (Chunk<C>, AllState<A, B>),
) -> Result<(Chunk<C>, AllState<A, B>), Option<Cause<E>>> {
    match state {
        AllState::PullBoth => match pull_both(left, right, false)? {
            (Some(a), Some(b)) => Ok(merge(a, b)),
            (Some(a), None) => Ok((a.map(on_left), AllState::DrainLeft)),
            (None, Some(b)) => Ok((b.map(on_right), AllState::DrainRight)),
            (None, None) => Err(None),
        },
        AllState::PullLeft(b) => match left.pull() {
            Ok(a) => Ok(merge(a, b)),
            Err(None) => Ok((b.map(on_right), AllState::DrainRight)),
            Err(e) => Err(e),
        },
        AllState::PullRight(a) => match right.pull() {
            Ok(b) => Ok(merge(a, b)),
            Err(None) => Ok((a.map(on_left), AllState::DrainLeft)),
            Err(e) => Err(e),
        },
        AllState::DrainLeft => Ok((left.pull()?.map(on_left), AllState::DrainLeft)),
        AllState::DrainRight => Ok((right.pull()?.map(on_right), AllState::DrainRight)),
    }
}

#[derive(Clone)]
enum Latest<A, B> {
    Start,
    Running(A, B),
}

impl<R: Env, E: Data, A: Data> Stream<R, E, A> {
    /// Combines this stream with `that` by repeatedly running `step`.
    ///
    /// `step` receives the current state and both sides, pulls from them as it sees fit, and
    /// returns a chunk to emit along with the next state, or `Err(None)` to end the stream. Both
    /// sides are released before a failure or the end is reported.
    pub fn combine_chunks<B, C, S, F>(
        &self,
        that: &Stream<R, E, B>,
        init: S,
        step: F,
    ) -> Stream<R, E, C>
    where
        B: Data,
        C: Data,
        S: Data,
        F: Fn(S, &mut Side<E, A>, &mut Side<E, B>) -> Result<(Chunk<C>, S), Option<Cause<E>>>
            + Send
            + Sync
            + 'static,
    {
        let (this, that) = (self.clone(), that.clone());
        let step = Arc::new(step);
        Stream::from_pull(move |ctx| {
            let step = step.clone();
            let child = ctx.child();
            let scope = child.scope().clone();
            let mut left = Side::spawn(&this, &child);
            let mut right = Side::spawn(&that, &child);
            let mut state = Some(init.clone());
            Pull::new(move || {
                let result = state
                    .take()
                    .ok_or(None)
                    .and_then(|s| step(s, &mut left, &mut right));
                match result {
                    Ok((chunk, next)) => {
                        state = Some(next);
                        Ok(chunk)
                    }
                    Err(e) => {
                        scope.close();
                        Err(e)
                    }
                }
            })
        })
    }

    /// Like [`Stream::combine_chunks`], emitting one element per step.
    pub fn combine<B, C, S, F>(&self, that: &Stream<R, E, B>, init: S, step: F) -> Stream<R, E, C>
    where
        B: Data,
        C: Data,
        S: Data,
        F: Fn(S, &mut Side<E, A>, &mut Side<E, B>) -> Result<(C, S), Option<Cause<E>>>
            + Send
            + Sync
            + 'static,
    {
        self.combine_chunks(that, init, move |s, left, right| {
            step(s, left, right).map(|(c, s)| (Chunk::single(c), s))
        })
    }

    /// Pairs up elements of both streams with `f`, ending as soon as either stream ends.
    pub fn zip_with<B, C, F>(&self, that: &Stream<R, E, B>, f: F) -> Stream<R, E, C>
    where
        B: Data,
        C: Data,
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        self.combine_chunks(that, ZipState::PullBoth, move |state, left, right| {
            let (a, b) = match state {
                ZipState::PullBoth => match pull_both(left, right, true)? {
                    (Some(a), Some(b)) => (a, b),
                    _ => return Err(None),
                },
                ZipState::PullLeft(b) => (left.pull()?, b),
                ZipState::PullRight(a) => (a, right.pull()?),
            };
            Ok(zip_chunks(&a, &b, &f))
        })
    }

    /// Pairs up the elements of both streams, ending with the shorter one.
    pub fn zip<B: Data>(&self, that: &Stream<R, E, B>) -> Stream<R, E, (A, B)> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Zips, keeping only the elements of `self`.
    pub fn zip_left<B: Data>(&self, that: &Stream<R, E, B>) -> Self {
        self.zip_with(that, |a, _| a)
    }

    /// Zips, keeping only the elements of `that`.
    pub fn zip_right<B: Data>(&self, that: &Stream<R, E, B>) -> Stream<R, E, B> {
        self.zip_with(that, |_, b| b)
    }

    /// Pairs up elements of both streams until both have ended. Elements without a partner are
    /// passed to `on_left` or `on_right`.
    pub fn zip_all_with<B, C, L, Rt, Both>(
        &self,
        that: &Stream<R, E, B>,
        on_left: L,
        on_right: Rt,
        on_both: Both,
    ) -> Stream<R, E, C>
    where
        B: Data,
        C: Data,
        L: Fn(A) -> C + Send + Sync + 'static,
        Rt: Fn(B) -> C + Send + Sync + 'static,
        Both: Fn(A, B) -> C + Send + Sync + 'static,
    {
        self.combine_chunks(that, AllState::PullBoth, move |state, left, right| {
            step_all(
                state,
                left,
                right,
                &|a: &A| on_left(a.clone()),
                &|b: &B| on_right(b.clone()),
                &|a: Chunk<A>, b: Chunk<B>| {
                    let (out, state) = zip_chunks(&a, &b, &on_both);
                    let state = match state {
                        ZipState::PullBoth => AllState::PullBoth,
                        ZipState::PullLeft(b) => AllState::PullLeft(b),
                        ZipState::PullRight(a) => AllState::PullRight(a),
                    };
                    (out, state)
                },
            )
        })
    }

    /// Zips until both streams have ended, filling in the defaults for the shorter one.
    pub fn zip_all<B: Data>(
        &self,
        that: &Stream<R, E, B>,
        default_left: A,
        default_right: B,
    ) -> Stream<R, E, (A, B)> {
        self.zip_all_with(
            that,
            move |a| (a, default_right.clone()),
            move |b| (default_left.clone(), b),
            |a, b| (a, b),
        )
    }

    /// Like [`Stream::zip_all`], keeping only the left elements.
    pub fn zip_all_left<B: Data>(&self, that: &Stream<R, E, B>, default_left: A) -> Self {
        self.zip_all_with(that, |a| a, move |_| default_left.clone(), |a, _| a)
    }

    /// Like [`Stream::zip_all`], keeping only the right elements.
    pub fn zip_all_right<B>(&self, that: &Stream<R, E, B>, default_right: B) -> Stream<R, E, B>
    where
        B: Data,
    {
        self.zip_all_with(that, move |_| default_right.clone(), |b| b, |_, b| b)
    }

    /// Combines every element of either stream with the latest element of the other.
    ///
    /// Nothing is emitted until both streams have produced a chunk. Both streams are raced, and
    /// only the last element of a chunk becomes the side's latest value.
    pub fn zip_latest_with<B, C, F>(&self, that: &Stream<R, E, B>, f: F) -> Stream<R, E, C>
    where
        B: Data,
        C: Data,
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        self.combine_chunks(that, Latest::Start, move |state, left, right| match state {
            Latest::Start => {
                let (a, b) = match pull_both(left, right, true)? {
                    (Some(a), Some(b)) => (a, b),
                    _ => return Err(None),
                };
                let la = a.last().cloned().ok_or(None)?;
                let lb = b.last().cloned().ok_or(None)?;
                let out = if b.len() > 1 {
                    b.map(|b| f(la.clone(), b.clone()))
                } else {
                    a.map(|a| f(a.clone(), lb.clone()))
                };
                Ok((out, Latest::Running(la, lb)))
            }
            Latest::Running(la, lb) => match race(left, right)? {
                Raced::Left(a) => {
                    let out = a.map(|a| f(a.clone(), lb.clone()));
                    let la = a.last().cloned().unwrap_or(la);
                    Ok((out, Latest::Running(la, lb)))
                }
                Raced::Right(b) => {
                    let out = b.map(|b| f(la.clone(), b.clone()));
                    let lb = b.last().cloned().unwrap_or(lb);
                    Ok((out, Latest::Running(la, lb)))
                }
            },
        })
    }

    /// Pairs every new element of either stream with the latest element of the other one.
    ///
    /// Nothing is emitted until both streams have produced an element. Within a chunk, only the
    /// last element counts as the latest one.
    pub fn zip_latest<B: Data>(&self, that: &Stream<R, E, B>) -> Stream<R, E, (A, B)> {
        self.zip_latest_with(that, |a, b| (a, b))
    }

    /// Alternates between elements of both streams. Once one ends, the rest of the other follows.
    pub fn interleave(&self, that: &Stream<R, E, A>) -> Self {
        self.combine(that, true, |left_turn, left, right| {
            let (first, second) = if left_turn { (left, right) } else { (right, left) };
            match first.pull_element() {
                Ok(a) => Ok((a, !left_turn)),
                Err(None) => second.pull_element().map(|a| (a, left_turn)),
                Err(e) => Err(e),
            }
        })
    }

    /// Pairs every element with the one after it.
    pub fn zip_with_next(&self) -> Stream<R, E, (A, Option<A>)> {
        self.via(|mut pull, _| {
            let mut prev: Option<A> = None;
            let mut ended = false;
            Pull::new(move || {
                if ended {
                    return Err(None);
                }
                match pull.invoke() {
                    Ok(chunk) => {
                        let mut out = Vec::with_capacity(chunk.len());
                        for a in &chunk {
                            if let Some(p) = prev.replace(a.clone()) {
                                out.push((p, Some(a.clone())));
                            }
                        }
                        Ok(Chunk::from_vec(out))
                    }
                    Err(None) => {
                        ended = true;
                        prev.take().map(|p| Chunk::single((p, None))).ok_or(None)
                    }
                    Err(e) => Err(e),
                }
            })
        })
    }

    /// Pairs every element with the one before it.
    pub fn zip_with_previous(&self) -> Stream<R, E, (Option<A>, A)> {
        self.map_accum(None, |prev, a: A| (Some(a.clone()), (prev, a)))
    }

    /// Pairs every element with its neighbors.
    pub fn zip_with_previous_and_next(&self) -> Stream<R, E, (Option<A>, A, Option<A>)> {
        self.zip_with_previous()
            .zip_with_next()
            .map(|((prev, a), next)| (prev, a, next.map(|(_, n)| n)))
    }

    /// Pairs every element with its index, starting at 0.
    pub fn zip_with_index(&self) -> Stream<R, E, (A, u64)> {
        self.map_accum(0, |i, a| (i + 1, (a, i)))
    }
}

fn merge_sorted<K: Ord + Clone, A: Clone, B: Clone, C>(
    left: Chunk<(K, A)>,
    right: Chunk<(K, B)>,
    on_left: &dyn Fn(&(K, A)) -> (K, C),
    on_right: &dyn Fn(&(K, B)) -> (K, C),
    on_both: &dyn Fn(&K, &A, &B) -> (K, C),
) -> (Chunk<(K, C)>, AllState<(K, A), (K, B)>) {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::with_capacity(left.len() + right.len());
    while let (Some(l), Some(r)) = (left.get(i), right.get(j)) {
        match l.0.cmp(&r.0) {
            Ordering::Less => {
                out.push(on_left(l));
                i += 1;
            }
            Ordering::Greater => {
                out.push(on_right(r));
                j += 1;
            }
            Ordering::Equal => {
                out.push(on_both(&l.0, &l.1, &r.1));
                i += 1;
                j += 1;
            }
        }
    }
    let state = if i < left.len() {
        AllState::PullRight(left.drop(i))
    } else if j < right.len() {
        AllState::PullLeft(right.drop(j))
    } else {
        AllState::PullBoth
    };
    (Chunk::from_vec(out), state)
}

impl<R: Env, E: Data, K: Data + Ord, A: Data> Stream<R, E, (K, A)> {
    /// Merge-joins two streams sorted by key.
    ///
    /// Both streams must be sorted by key without duplicates; otherwise the output order is
    /// unspecified. Keys present on one side only are passed to `on_left` or `on_right`.
    pub fn zip_all_sorted_by_key_with<B, C, L, Rt, Both>(
        &self,
        that: &Stream<R, E, (K, B)>,
        on_left: L,
        on_right: Rt,
        on_both: Both,
    ) -> Stream<R, E, (K, C)>
    where
        B: Data,
        C: Data,
        L: Fn(A) -> C + Send + Sync + 'static,
        Rt: Fn(B) -> C + Send + Sync + 'static,
        Both: Fn(A, B) -> C + Send + Sync + 'static,
    {
        self.combine_chunks(that, AllState::PullBoth, move |state, left, right| {
            let on_left = |(k, a): &(K, A)| (k.clone(), on_left(a.clone()));
            let on_right = |(k, b): &(K, B)| (k.clone(), on_right(b.clone()));
            step_all(
                state,
                left,
                right,
                &on_left,
                &on_right,
                &|a: Chunk<(K, A)>, b: Chunk<(K, B)>| {
                    merge_sorted(a, b, &on_left, &on_right, &|k: &K, a: &A, b: &B| {
                        (k.clone(), on_both(a.clone(), b.clone()))
                    })
                },
            )
        })
    }

    /// Joins two streams sorted by key, pairing up values with the same key.
    ///
    /// A key missing on one side gets that side's default.
    pub fn zip_all_sorted_by_key<B: Data>(
        &self,
        that: &Stream<R, E, (K, B)>,
        default_left: A,
        default_right: B,
    ) -> Stream<R, E, (K, (A, B))> {
        self.zip_all_sorted_by_key_with(
            that,
            move |a| (a, default_right.clone()),
            move |b| (default_left.clone(), b),
            |a, b| (a, b),
        )
    }

    /// Like [`Stream::zip_all_sorted_by_key`], keeping only the left values.
    pub fn zip_all_sorted_by_key_left<B: Data>(
        &self,
        that: &Stream<R, E, (K, B)>,
        default_left: A,
    ) -> Stream<R, E, (K, A)> {
        self.zip_all_sorted_by_key_with(that, |a| a, move |_| default_left.clone(), |a, _| a)
    }

    /// Like [`Stream::zip_all_sorted_by_key`], keeping only the right values.
    pub fn zip_all_sorted_by_key_right<B: Data>(
        &self,
        that: &Stream<R, E, (K, B)>,
        default_right: B,
    ) -> Stream<R, E, (K, B)> {
        self.zip_all_sorted_by_key_with(that, move |_| default_right.clone(), |b| b, |_, b| b)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        queue::Queue,
        test::{rt, TestStream},
        Take,
    };

    #[test]
    fn zip_does_not_pull_past_the_shorter_side() {
        let left = TestStream::from_chunks([
            Chunk::from_vec(vec![1, 2]),
            Chunk::from_vec(vec![3, 4]),
            Chunk::from_vec(vec![5]),
        ])
        .concat(&TestStream::fail("boom".into()));
        let right =
            TestStream::from_chunks([Chunk::from_vec(vec!['a', 'b']), Chunk::from_vec(vec!['c'])]);
        assert_eq!(
            left.zip(&right).run_collect(&rt()),
            Ok(vec![(1, 'a'), (2, 'b'), (3, 'c')])
        );
    }

    #[test]
    fn zip_length_is_the_shorter_one() {
        let zipped = TestStream::range(0..5).zip(&TestStream::from_iter(["a", "b"]));
        assert_eq!(zipped.run_collect(&rt()), Ok(vec![(0, "a"), (1, "b")]));
        let left = TestStream::range(0..5).zip_left(&TestStream::from_iter(["a", "b"]));
        assert_eq!(left.run_collect(&rt()), Ok(vec![0, 1]));
        let right = TestStream::range(0..5).zip_right(&TestStream::from_iter(["a", "b"]));
        assert_eq!(right.run_collect(&rt()), Ok(vec!["a", "b"]));
    }

    #[test]
    fn zip_propagates_failure_after_releasing_both_sides() {
        let released = Arc::new(AtomicUsize::new(0));
        let remote = released.clone();
        let left = TestStream::range(0..3).ensuring(move || {
            remote.fetch_add(1, Ordering::SeqCst);
        });
        let right = TestStream::from_iter([10]).concat(&TestStream::fail("boom".into()));
        let observed = released.clone();
        let stream = left
            .zip(&right)
            .map(|_| 0)
            .catch_all(move |e| {
                TestStream::from_iter([observed.load(Ordering::SeqCst) as i64, e.len() as i64])
            });
        assert_eq!(stream.run_collect(&rt()), Ok(vec![0, 1, 4]));
    }

    #[test]
    fn zip_releases_the_longer_side_when_it_ends() {
        let released = Arc::new(AtomicUsize::new(0));
        let remote = released.clone();
        let left = TestStream::range(0..3).ensuring(move || {
            remote.fetch_add(1, Ordering::SeqCst);
        });
        let zipped = left.zip(&TestStream::from_iter([10]));
        assert_eq!(zipped.run_collect(&rt()), Ok(vec![(0, 10)]));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zip_all_pads_the_shorter_side() {
        let left = TestStream::from_iter([1, 2, 3]);
        let right = TestStream::from_iter(["a"]);
        assert_eq!(
            left.zip_all(&right, 0, "z").run_collect(&rt()),
            Ok(vec![(1, "a"), (2, "z"), (3, "z")])
        );
        assert_eq!(
            right.zip_all(&left, "z", 0).run_collect(&rt()),
            Ok(vec![("a", 1), ("z", 2), ("z", 3)])
        );
        assert_eq!(left.zip_all_left(&right, 9).run_collect(&rt()), Ok(vec![1, 2, 3]));
        assert_eq!(
            left.zip_all_right(&right, "z").run_collect(&rt()),
            Ok(vec!["a", "z", "z"])
        );
    }

    #[test]
    fn zip_all_with_uneven_chunks() {
        let left =
            TestStream::from_chunks([Chunk::from_vec(vec![1]), Chunk::from_vec(vec![2, 3, 4])]);
        let right =
            TestStream::from_chunks([Chunk::from_vec(vec![10, 20]), Chunk::from_vec(vec![30])]);
        let summed = left.zip_all_with(&right, |a| a, |b| b, |a, b| a + b);
        assert_eq!(summed.run_collect(&rt()), Ok(vec![11, 22, 33, 4]));
    }

    #[test]
    fn zip_latest_combines_with_latest_values() {
        let left = Queue::unbounded();
        let right = Queue::unbounded();
        let out = Queue::unbounded();
        let stream =
            TestStream::from_queue(left.clone()).zip_latest(&TestStream::from_queue(right.clone()));
        let rt = rt();
        let runner = rt.clone();
        let sink = out.clone();
        let task = rt.fork(move || stream.run_into_queue_exit(&runner, &sink));

        let next = || match out.take().unwrap() {
            Take::Chunk(chunk) => chunk.to_vec(),
            other => panic!("unexpected {other:?}"),
        };
        left.offer(1).unwrap();
        right.offer('a').unwrap();
        assert_eq!(next(), vec![(1, 'a')]);
        left.offer(2).unwrap();
        assert_eq!(next(), vec![(2, 'a')]);
        right.offer('b').unwrap();
        assert_eq!(next(), vec![(2, 'b')]);

        left.shutdown();
        right.offer('c').unwrap();
        assert_eq!(next(), vec![(2, 'c')]);
        right.shutdown();
        assert_eq!(out.take().unwrap(), Take::End);
        assert_eq!(task.join(), Ok(()));
    }

    #[test]
    fn zip_latest_first_emission() {
        let left = TestStream::from_chunk(Chunk::from_vec(vec![1, 2]));
        let right = TestStream::from_chunk(Chunk::from_vec(vec!['a']));
        assert_eq!(
            left.zip_latest(&right).run_collect(&rt()),
            Ok(vec![(1, 'a'), (2, 'a')])
        );
        let right = TestStream::from_chunk(Chunk::from_vec(vec!['a', 'b']));
        assert_eq!(
            left.zip_latest(&right).run_collect(&rt()),
            Ok(vec![(2, 'a'), (2, 'b')])
        );
        let empty = TestStream::<char>::empty();
        assert_eq!(left.zip_latest(&empty).run_collect(&rt()), Ok(vec![]));
    }

    #[test]
    fn windows() {
        let stream =
            TestStream::from_chunks([Chunk::from_vec(vec![1, 2]), Chunk::from_vec(vec![3])]);
        assert_eq!(
            stream.zip_with_next().run_collect(&rt()),
            Ok(vec![(1, Some(2)), (2, Some(3)), (3, None)])
        );
        assert_eq!(
            stream.zip_with_previous().run_collect(&rt()),
            Ok(vec![(None, 1), (Some(1), 2), (Some(2), 3)])
        );
        assert_eq!(
            stream.zip_with_previous_and_next().run_collect(&rt()),
            Ok(vec![(None, 1, Some(2)), (Some(1), 2, Some(3)), (Some(2), 3, None)])
        );
        assert_eq!(
            stream.zip_with_index().run_collect(&rt()),
            Ok(vec![(1, 0), (2, 1), (3, 2)])
        );
        assert_eq!(TestStream::<i32>::empty().zip_with_next().run_collect(&rt()), Ok(vec![]));
    }

    #[test]
    fn sorted_merge_join() {
        let left = TestStream::from_chunks([
            Chunk::from_vec(vec![(1, "a")]),
            Chunk::from_vec(vec![(3, "c"), (4, "d")]),
        ]);
        let right = TestStream::from_chunks([
            Chunk::from_vec(vec![(1, "x"), (2, "y")]),
            Chunk::from_vec(vec![(4, "z"), (6, "w")]),
        ]);
        assert_eq!(
            left.zip_all_sorted_by_key(&right, "", "").run_collect(&rt()),
            Ok(vec![
                (1, ("a", "x")),
                (2, ("", "y")),
                (3, ("c", "")),
                (4, ("d", "z")),
                (6, ("", "w")),
            ])
        );
        assert_eq!(
            left.zip_all_sorted_by_key_left(&right, "-").run_collect(&rt()),
            Ok(vec![(1, "a"), (2, "-"), (3, "c"), (4, "d"), (6, "-")])
        );
        assert_eq!(
            left.zip_all_sorted_by_key_right(&right, "-").run_collect(&rt()),
            Ok(vec![(1, "x"), (2, "y"), (3, "-"), (4, "z"), (6, "w")])
        );
    }

    #[test]
    fn interleave_alternates() {
        let stream = TestStream::from_iter([1, 2, 3]).interleave(&TestStream::from_iter([10, 20]));
        assert_eq!(stream.run_collect(&rt()), Ok(vec![1, 10, 2, 20, 3]));
        let stream = TestStream::from_iter([1]).interleave(&TestStream::from_iter([10, 20, 30]));
        assert_eq!(stream.run_collect(&rt()), Ok(vec![1, 10, 20, 30]));
    }

    #[test]
    fn custom_combine() {
        // Emits the larger head of both sides, pulling one element from each at a time.
        let left = TestStream::from_iter([1, 5, 3]);
        let right = TestStream::from_iter([4, 2, 6]);
        let max = left.combine(&right, (), |(), l, r| {
            let a = l.pull_element()?;
            let b = r.pull_element()?;
            Ok((a.max(b), ()))
        });
        assert_eq!(max.run_collect(&rt()), Ok(vec![4, 5, 6]));
    }
}
