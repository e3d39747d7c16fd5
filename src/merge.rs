//! The concurrent merge engine and the operators built on it.
//!
//! A coordinator task pulls the stream of producers and starts each producer on its own task, at
//! most `n` at a time. Producers offer their chunks to one bounded signal queue, which is the only
//! source of backpressure: a producer that runs ahead of the consumer blocks on `offer`. The
//! consumer turns the signals back into a pull and decides when the merge is over.

use std::{collections::VecDeque, sync::Arc};

use crossbeam_channel::{select, Receiver, Sender};

use crate::{
    drop::{close_on_drop, defer},
    pull::{Elements, Pull},
    queue::{Queue, QueueError},
    runtime::Context,
    stream::{Data, Env, Stream},
    sync::Mutex,
    task::{self, Interrupted, Task},
    Cause, Chunk,
};

/// Decides when a merge of two streams ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HaltStrategy {
    /// End as soon as the left stream ends.
    Left,
    /// End as soon as the right stream ends.
    Right,
    /// End once both streams have ended.
    #[default]
    Both,
    /// End as soon as either stream ends.
    Either,
}

impl HaltStrategy {
    /// Whether the end of producer `index` ends the whole merge.
    fn halts_on(self, index: usize) -> bool {
        match self {
            HaltStrategy::Left => index == 0,
            HaltStrategy::Right => index == 1,
            HaltStrategy::Both => false,
            HaltStrategy::Either => true,
        }
    }
}

enum Signal<A> {
    Emit(Chunk<A>),
    /// Producer `n` has ended.
    Done(usize),
    /// A producer failed. The cause itself is delivered out of band, so that it survives the
    /// producer being interrupted before it could enqueue this signal.
    Failed,
    /// The stream of producers has ended, and so has every producer.
    AllDone,
}

#[derive(Clone, Copy)]
struct Config {
    concurrency: usize,
    buffer: Option<usize>,
    switch: bool,
    halt: HaltStrategy,
}

/// Producers that are still running. Shared between the coordinator, which starts and retires
/// them, and the producers themselves, which interrupt each other on failure.
struct Running<E> {
    tasks: VecDeque<(usize, Task<E, ()>)>,
    /// Set by the first failing producer. No producer is started after that.
    failed: bool,
}

impl<E> Running<E> {
    /// Marks the merge as failed and interrupts every producer except `index`.
    fn fail(&mut self, index: usize) {
        self.failed = true;
        let mut interrupted = 0;
        for (_, task) in self.tasks.iter().filter(|(i, _)| *i != index) {
            task.interrupt();
            interrupted += 1;
        }
        log::debug!("merge failed, interrupted {interrupted} producer(s)");
    }
}

/// State the coordinator keeps about the producers it has started.
struct Producers<E> {
    running: Arc<Mutex<Running<E>>>,
    finished_tx: Sender<usize>,
    finished: Receiver<usize>,
}

impl<E> Producers<E> {
    fn new() -> Self {
        let (finished_tx, finished) = crossbeam_channel::unbounded();
        Self {
            running: Arc::new(Mutex::new(Running {
                tasks: VecDeque::new(),
                failed: false,
            })),
            finished_tx,
            finished,
        }
    }

    fn len(&self) -> usize {
        self.running.lock().tasks.len()
    }

    fn has_failed(&self) -> bool {
        self.running.lock().failed
    }

    /// Records a started producer. Returns `false`, after interrupting it, if a sibling has failed
    /// in the meantime.
    fn push(&self, index: usize, task: Task<E, ()>) -> bool {
        let mut running = self.running.lock();
        if running.failed {
            task.interrupt();
            return false;
        }
        running.tasks.push_back((index, task));
        true
    }

    /// Interrupts the producer that was started first.
    fn interrupt_oldest(&self) {
        if let Some((index, oldest)) = self.running.lock().tasks.front() {
            log::debug!("switching away from producer {index}");
            oldest.interrupt();
        }
    }

    fn retire(&mut self, index: usize) {
        let task = {
            let mut running = self.running.lock();
            let pos = running.tasks.iter().position(|(i, _)| *i == index);
            pos.and_then(|pos| running.tasks.remove(pos))
        };
        if let Some((_, task)) = task {
            // Drops the task's registration with the engine scope.
            task.wait();
        }
    }

    fn reap(&mut self) {
        while let Ok(index) = self.finished.try_recv() {
            self.retire(index);
        }
    }

    /// Blocks until one more producer has finished.
    fn await_one(&mut self) -> Result<(), Interrupted> {
        let finished = self.finished.clone();
        let signal = task::signal();
        select! {
            recv(finished) -> index => {
                if let Ok(index) = index {
                    self.retire(index);
                }
                Ok(())
            }
            recv(signal) -> _ => Err(task::interruption()),
        }
    }
}

/// Where a producer delivers what it pulls.
struct Outlet<E, A> {
    signals: Queue<Signal<A>>,
    failures: Sender<Cause<E>>,
    running: Arc<Mutex<Running<E>>>,
}

/// Runs a producer's pull until it ends, fails, or nobody listens anymore.
///
/// A failing producer interrupts its siblings before it reports the failure, since reporting
/// waits for room in the signal queue.
fn produce<E, A>(mut pull: Pull<E, A>, index: usize, outlet: &Outlet<E, A>) {
    loop {
        let signal = match pull.invoke() {
            Ok(chunk) => Signal::Emit(chunk),
            Err(None) => Signal::Done(index),
            Err(Some(cause)) if cause.is_interrupted_only() && task::interrupted().is_some() => {
                return
            }
            Err(Some(cause)) => {
                let _ = outlet.failures.send(cause);
                outlet.running.lock().fail(index);
                Signal::Failed
            }
        };
        let last = !matches!(signal, Signal::Emit(_));
        if outlet.signals.offer(signal).is_err() || last {
            return;
        }
    }
}

/// Starts the coordinator in `engine` and returns the queue it delivers signals on.
fn start<R: Env, E: Data, A: Data>(
    engine: &Context<R>,
    producers: &Stream<R, E, Stream<R, E, A>>,
    config: Config,
    failures: Sender<Cause<E>>,
) -> Queue<Signal<A>> {
    let buffer = config.buffer.unwrap_or_else(|| engine.runtime().buffer_size());
    let signals = Queue::bounded(buffer);
    let out = signals.clone();
    let ctx = engine.clone();
    let mut outer = Elements::new(producers.acquire(engine));
    engine.fork::<E, (), _>(move || {
        let mut started = Producers::new();
        let mut next_index = 0;
        let outcome = loop {
            let stream = match outer.next() {
                Ok(stream) => stream,
                Err(None) => break None,
                Err(Some(cause)) => break Some(cause),
            };
            started.reap();
            while started.len() >= config.concurrency {
                if config.switch {
                    started.interrupt_oldest();
                }
                started.await_one()?;
            }
            if started.has_failed() {
                return Ok(());
            }

            let index = next_index;
            next_index += 1;
            // Acquired before the task is forked, so that the engine scope interrupts and awaits
            // the producer before it releases the stream.
            let (pull, scope) = stream.acquire_scoped(&ctx);
            let outlet = Outlet {
                signals: out.clone(),
                failures: failures.clone(),
                running: started.running.clone(),
            };
            let finished = started.finished_tx.clone();
            let task = ctx.fork::<E, (), _>(move || {
                let _finished = defer(move || {
                    let _ = finished.send(index);
                });
                let _release = close_on_drop(scope);
                produce(pull, index, &outlet);
                Ok(())
            });
            if !started.push(index, task) {
                return Ok(());
            }
        };

        match outcome {
            None => {
                while started.len() > 0 {
                    started.await_one()?;
                }
                let _ = out.offer(Signal::AllDone);
            }
            Some(cause) if cause.is_interrupted_only() && task::interrupted().is_some() => {}
            Some(cause) => {
                let _ = failures.send(cause);
                started.running.lock().fail(usize::MAX);
                let _ = out.offer(Signal::Failed);
            }
        }
        Ok(())
    });
    signals
}

/// Merges the streams emitted by `producers`, running up to `config.concurrency` at once.
fn merged<R: Env, E: Data, A: Data>(
    producers: &Stream<R, E, Stream<R, E, A>>,
    config: Config,
) -> Stream<R, E, A> {
    let producers = producers.clone();
    Stream::from_pull(move |ctx| {
        let engine = ctx.child();
        let scope = engine.scope().clone();
        let (failures_tx, failures) = crossbeam_channel::unbounded();
        let signals = start(&engine, &producers, config, failures_tx);
        Pull::new(move || loop {
            let signal = signals.take().map_err(|e| match e {
                QueueError::Shutdown => None,
                QueueError::Interrupted(i) => Some(i.into()),
            })?;
            match signal {
                Signal::Emit(chunk) => return Ok(chunk),
                Signal::Done(index) if config.halt.halts_on(index) => {
                    log::debug!("producer {index} ended, halting merge ({:?})", config.halt);
                    scope.close();
                    return Err(None);
                }
                Signal::Done(_) => {}
                Signal::AllDone => {
                    scope.close();
                    return Err(None);
                }
                Signal::Failed => {
                    // Every producer has exited once the scope is closed, so all failures are in.
                    scope.close();
                    let cause = failures.try_iter().fold(Cause::Empty, Cause::parallel);
                    return Err(Some(cause));
                }
            }
        })
    })
}

impl<R: Env, E: Data, A: Data> Stream<R, E, Stream<R, E, A>> {
    /// Runs up to `n` of the emitted streams concurrently, merging their output.
    ///
    /// Streams beyond the first `n` wait for a running one to finish, in the order they were
    /// emitted. Each stream's own order is preserved.
    pub fn flatten_par(&self, n: usize, buffer: usize) -> Stream<R, E, A> {
        merged(
            self,
            Config {
                concurrency: n.max(1),
                buffer: Some(buffer),
                switch: false,
                halt: HaltStrategy::Both,
            },
        )
    }
}

impl<R: Env, E: Data, A: Data> Stream<R, E, A> {
    /// Maps every element to a stream and runs up to `n` of them concurrently.
    pub fn flat_map_par<B, F>(&self, n: usize, buffer: usize, f: F) -> Stream<R, E, B>
    where
        B: Data,
        F: Fn(A) -> Stream<R, E, B> + Send + Sync + 'static,
    {
        self.map(f).flatten_par(n, buffer)
    }

    /// Like [`Stream::flat_map_par`], but once `n` streams are running, the oldest one is
    /// interrupted to make room for the next.
    pub fn flat_map_par_switch<B, F>(&self, n: usize, buffer: usize, f: F) -> Stream<R, E, B>
    where
        B: Data,
        F: Fn(A) -> Stream<R, E, B> + Send + Sync + 'static,
    {
        merged(
            &self.map(f),
            Config {
                concurrency: n.max(1),
                buffer: Some(buffer),
                switch: true,
                halt: HaltStrategy::Both,
            },
        )
    }

    /// Runs up to `n` of `streams` concurrently and merges their output.
    pub fn merge_all<I>(streams: I, n: usize, buffer: usize) -> Self
    where
        I: IntoIterator<Item = Stream<R, E, A>>,
    {
        Stream::from_iter(streams).flatten_par(n, buffer)
    }

    /// Runs all of `streams` at once and merges their output.
    pub fn merge_all_unbounded<I>(streams: I, buffer: usize) -> Self
    where
        I: IntoIterator<Item = Stream<R, E, A>>,
    {
        Self::merge_all(streams, usize::MAX, buffer)
    }

    /// Runs both streams concurrently, ending once both have ended.
    pub fn merge(&self, that: &Stream<R, E, A>) -> Self {
        self.merge_halt(that, HaltStrategy::Both)
    }

    /// Runs both streams concurrently, ending according to `strategy`.
    ///
    /// A failure of either stream interrupts the other one. If both fail, both causes are kept.
    pub fn merge_halt(&self, that: &Stream<R, E, A>, strategy: HaltStrategy) -> Self {
        merged(
            &Stream::from_iter([self.clone(), that.clone()]),
            Config {
                concurrency: 2,
                buffer: None,
                switch: false,
                halt: strategy,
            },
        )
    }

    /// Merges both streams, ending as soon as `self` ends.
    pub fn merge_halt_left(&self, that: &Stream<R, E, A>) -> Self {
        self.merge_halt(that, HaltStrategy::Left)
    }

    /// Merges both streams, ending as soon as `that` ends.
    pub fn merge_halt_right(&self, that: &Stream<R, E, A>) -> Self {
        self.merge_halt(that, HaltStrategy::Right)
    }

    /// Merges both streams, ending as soon as either of them ends.
    pub fn merge_halt_either(&self, that: &Stream<R, E, A>) -> Self {
        self.merge_halt(that, HaltStrategy::Either)
    }

    /// Merges streams of different element types into one.
    pub fn merge_either<B: Data>(&self, that: &Stream<R, E, B>) -> Stream<R, E, Result<A, B>> {
        self.merge_with(that, Ok, Err)
    }

    /// Maps both streams into a common type and merges them.
    pub fn merge_with<B, C, F, G>(
        &self,
        that: &Stream<R, E, B>,
        left: F,
        right: G,
    ) -> Stream<R, E, C>
    where
        B: Data,
        C: Data,
        F: Fn(A) -> C + Send + Sync + 'static,
        G: Fn(B) -> C + Send + Sync + 'static,
    {
        self.map(left).merge(&that.map(right))
    }
}
