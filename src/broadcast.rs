//! Fan-out: one producer task feeding any number of consumer queues.

use std::{
    collections::BTreeMap,
    marker::PhantomData,
    sync::{Arc, Weak},
};

use crate::{
    pull::Pull,
    queue::{Queue, QueueError},
    runtime::Context,
    stream::{Data, Env, Stream},
    sync::Mutex,
    task, Chunk, Exit, Take,
};

type Decide<A> = Arc<dyn Fn(&A) -> Vec<usize> + Send + Sync>;

struct Subscribers<E, A> {
    queues: BTreeMap<usize, Queue<Take<E, A>>>,
    next_id: usize,
    /// What the producer ended with. Late subscribers get only this.
    last: Option<Take<E, A>>,
}

struct Shared<E, A> {
    subscribers: Mutex<Subscribers<E, A>>,
    maximum_lag: usize,
    /// Starts the producer on the first subscription, for lazily started distributions.
    launch: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl<E: Data, A: Data> Shared<E, A> {
    fn new(maximum_lag: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Subscribers {
                queues: BTreeMap::new(),
                next_id: 0,
                last: None,
            }),
            maximum_lag,
            launch: Mutex::new(None),
        })
    }

    fn subscribe(&self) -> (usize, Queue<Take<E, A>>) {
        let queue = Queue::bounded(self.maximum_lag);
        let id = {
            let mut subscribers = self.subscribers.lock();
            let id = subscribers.next_id;
            subscribers.next_id += 1;
            match &subscribers.last {
                // The queue is fresh and holds at least one value, so this does not block.
                Some(last) => {
                    let _ = queue.offer(last.clone());
                }
                None => {
                    subscribers.queues.insert(id, queue.clone());
                }
            }
            id
        };
        log::trace!("subscriber {id} joined");
        let launch = self.launch.lock().take();
        if let Some(launch) = launch {
            launch();
        }
        (id, queue)
    }

    fn shutdown_all(&self) {
        for queue in self.subscribers.lock().queues.values() {
            queue.shutdown();
        }
    }

    fn targets(&self) -> Vec<(usize, Queue<Take<E, A>>)> {
        let subscribers = self.subscribers.lock();
        subscribers.queues.iter().map(|(id, q)| (*id, q.clone())).collect()
    }
}

/// Splits `chunk` by the subscribers `decide` picks for each element, keeping element order.
fn partition<A: Clone>(chunk: &Chunk<A>, decide: &Decide<A>) -> BTreeMap<usize, Chunk<A>> {
    let mut parts: BTreeMap<usize, Vec<A>> = BTreeMap::new();
    for a in chunk {
        let mut targets = decide(a);
        targets.sort_unstable();
        targets.dedup();
        for id in targets {
            parts.entry(id).or_default().push(a.clone());
        }
    }
    parts.into_iter().map(|(id, values)| (id, Chunk::from_vec(values))).collect()
}

/// The producer loop. Offers every chunk to its subscribers one after another, so it never runs
/// more than `maximum_lag` chunks ahead of the slowest one.
fn distribute<E: Data, A: Data>(
    mut pull: Pull<E, A>,
    shared: &Shared<E, A>,
    decide: Option<&Decide<A>>,
    dynamic: bool,
) -> Exit<E, ()> {
    loop {
        let chunk = match pull.invoke() {
            Ok(chunk) => chunk,
            Err(Some(cause)) if cause.is_interrupted_only() && task::interrupted().is_some() => {
                return Err(cause);
            }
            Err(done) => {
                let last = Take::from_pull(Err(done));
                let queues = {
                    let mut subscribers = shared.subscribers.lock();
                    subscribers.last = Some(last.clone());
                    std::mem::take(&mut subscribers.queues)
                };
                for queue in queues.values() {
                    if let Err(QueueError::Interrupted(i)) = queue.offer(last.clone()) {
                        return Err(i.into());
                    }
                }
                return Ok(());
            }
        };

        let mut parts = decide.map(|decide| partition(&chunk, decide));
        for (id, queue) in shared.targets() {
            let part = match &mut parts {
                None => chunk.clone(),
                Some(parts) => match parts.remove(&id) {
                    Some(part) => part,
                    None => continue,
                },
            };
            match queue.offer(Take::Chunk(part)) {
                Ok(()) => {}
                Err(QueueError::Shutdown) => {
                    log::debug!("subscriber {id} left");
                    shared.subscribers.lock().queues.remove(&id);
                }
                Err(QueueError::Interrupted(i)) => return Err(i.into()),
            }
        }

        if !dynamic && shared.subscribers.lock().queues.is_empty() {
            log::debug!("all subscribers left, stopping distribution");
            return Ok(());
        }
    }
}

/// Acquires `stream` in `ctx` and starts the producer task there.
///
/// When the scope of `ctx` closes, the producer is stopped and every subscriber queue is shut down.
fn spawn_producer<R: Env, E: Data, A: Data>(
    ctx: &Context<R>,
    stream: &Stream<R, E, A>,
    shared: Arc<Shared<E, A>>,
    decide: Option<Decide<A>>,
    dynamic: bool,
) {
    let remote = shared.clone();
    ctx.scope().add_finalizer(move || remote.shutdown_all());
    let pull = stream.acquire(ctx);
    ctx.fork::<E, (), _>(move || distribute(pull, &shared, decide.as_ref(), dynamic));
}

/// A running distribution that consumers can join at any time.
///
/// Returned by [`Stream::distributed_with_dynamic`]. The producer starts with the first
/// subscription. Elements emitted while nobody is subscribed are dropped.
pub struct Distributor<R, E, A> {
    shared: Arc<Shared<E, A>>,
    _env: PhantomData<fn() -> R>,
}

impl<R, E, A> Clone for Distributor<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _env: PhantomData,
        }
    }
}

impl<R: Env, E: Data, A: Data> Distributor<R, E, A> {
    /// Registers a new consumer and returns its id and queue.
    ///
    /// Shutting the queue down unsubscribes. If the producer has already finished, the queue only
    /// receives its final [`Take`].
    pub fn subscribe_queue(&self) -> (usize, Queue<Take<E, A>>) {
        self.shared.subscribe()
    }

    /// Registers a new consumer and returns its id and the stream of what it receives.
    ///
    /// The subscription ends when the returned stream's scope closes.
    pub fn subscribe(&self) -> (usize, Stream<R, E, A>) {
        let (id, queue) = self.subscribe_queue();
        (id, Stream::from_take_queue(queue))
    }
}

impl<R: Env, E: Data, A: Data> Stream<R, E, A> {
    fn distribute_to(
        &self,
        ctx: &Context<R>,
        n: usize,
        maximum_lag: usize,
        decide: Option<Decide<A>>,
    ) -> Vec<Queue<Take<E, A>>> {
        let shared = Shared::new(maximum_lag);
        let queues = (0..n).map(|_| shared.subscribe().1).collect();
        spawn_producer(ctx, self, shared, decide, false);
        queues
    }

    fn distribute_dynamic(
        &self,
        ctx: &Context<R>,
        maximum_lag: usize,
        decide: Option<Decide<A>>,
    ) -> Distributor<R, E, A> {
        let shared = Shared::new(maximum_lag);
        let weak: Weak<Shared<E, A>> = Arc::downgrade(&shared);
        let (ctx, this) = (ctx.clone(), self.clone());
        *shared.launch.lock() = Some(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                spawn_producer(&ctx, &this, shared, decide, true);
            }
        }));
        Distributor {
            shared,
            _env: PhantomData,
        }
    }

    /// Runs this stream in `ctx`, sending each element to the queues whose indices `decide`
    /// returns for it. Indices outside `0..n` are ignored.
    ///
    /// Each queue holds up to `maximum_lag` chunks. The producer waits for every queue in turn,
    /// so a slow consumer holds back the others. A consumer unsubscribes by shutting its queue
    /// down; the producer stops once all of them have.
    pub fn distributed_with<F>(
        &self,
        ctx: &Context<R>,
        n: usize,
        maximum_lag: usize,
        decide: F,
    ) -> Vec<Queue<Take<E, A>>>
    where
        F: Fn(&A) -> Vec<usize> + Send + Sync + 'static,
    {
        self.distribute_to(ctx, n, maximum_lag, Some(Arc::new(decide)))
    }

    /// Like [`Stream::distributed_with`], but consumers subscribe through the returned
    /// [`Distributor`]. Subscriber ids count up from 0.
    pub fn distributed_with_dynamic<F>(
        &self,
        ctx: &Context<R>,
        maximum_lag: usize,
        decide: F,
    ) -> Distributor<R, E, A>
    where
        F: Fn(&A) -> Vec<usize> + Send + Sync + 'static,
    {
        self.distribute_dynamic(ctx, maximum_lag, Some(Arc::new(decide)))
    }

    /// Sends every chunk to each of `n` queues.
    pub fn broadcasted_queues(
        &self,
        ctx: &Context<R>,
        n: usize,
        maximum_lag: usize,
    ) -> Vec<Queue<Take<E, A>>> {
        self.distribute_to(ctx, n, maximum_lag, None)
    }

    /// Splits this stream into `n` streams that each see every element.
    ///
    /// The producer runs in `ctx` and stays at most `maximum_lag` chunks ahead of the slowest
    /// consumer that is still running.
    pub fn broadcast(
        &self,
        ctx: &Context<R>,
        n: usize,
        maximum_lag: usize,
    ) -> Vec<Stream<R, E, A>> {
        self.broadcasted_queues(ctx, n, maximum_lag)
            .into_iter()
            .map(Stream::from_take_queue)
            .collect()
    }

    /// Returns a stream that subscribes to this one, running in `ctx`, every time it is run.
    pub fn broadcast_dynamic(&self, ctx: &Context<R>, maximum_lag: usize) -> Stream<R, E, A> {
        let distributor = self.distribute_dynamic(ctx, maximum_lag, None);
        Stream::from_pull(move |ctx| distributor.subscribe().1.acquire(ctx))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{
        test::{rt, TestStream},
        Cause,
    };

    fn singles(range: std::ops::Range<i64>) -> TestStream<i64> {
        TestStream::from_chunks(range.map(Chunk::single))
    }

    #[test]
    fn every_consumer_sees_everything() {
        let rt = rt();
        rt.scoped(|ctx| {
            let consumers = singles(0..50).broadcast(ctx, 3, 2);
            let tasks: Vec<_> = consumers
                .into_iter()
                .map(|stream| {
                    let runner = rt.clone();
                    rt.fork(move || stream.run_collect_exit(&runner))
                })
                .collect();
            for task in tasks {
                assert_eq!(task.join(), Ok((0..50).collect::<Vec<_>>()));
            }
        });
    }

    #[test]
    fn leaving_early_does_not_stall_others() {
        let rt = rt();
        rt.scoped(|ctx| {
            let mut consumers = singles(0..100).broadcast(ctx, 2, 1).into_iter();
            let (quitter, stayer) = (consumers.next().unwrap(), consumers.next().unwrap());
            let runner = rt.clone();
            let quitter = rt.fork(move || quitter.take(3).run_collect_exit(&runner));
            let runner = rt.clone();
            let stayer = rt.fork(move || stayer.run_collect_exit(&runner));
            assert_eq!(quitter.join(), Ok(vec![0, 1, 2]));
            assert_eq!(stayer.join(), Ok((0..100).collect::<Vec<_>>()));
        });
    }

    #[test]
    fn producer_stays_within_maximum_lag() {
        let rt = rt();
        rt.scoped(|ctx| {
            let pulled = Arc::new(AtomicUsize::new(0));
            let remote = pulled.clone();
            let source = TestStream::iterate(0, |n| n + 1).tap(move |_| {
                remote.fetch_add(1, Ordering::SeqCst);
            });
            let lag = 2;
            let queues = source.broadcasted_queues(ctx, 2, lag);
            for consumed in 1..=5 {
                assert!(matches!(queues[0].take(), Ok(Take::Chunk(_))));
                assert!(matches!(queues[1].take(), Ok(Take::Chunk(_))));
                thread::sleep(Duration::from_millis(10));
                // One more chunk may be pulled and waiting for room.
                assert!(pulled.load(Ordering::SeqCst) <= consumed + lag + 1);
            }
        });
    }

    #[test]
    fn subscribing_while_running() {
        let rt = rt();
        rt.scoped(|ctx| {
            let source = Queue::unbounded();
            let distributor = TestStream::from_queue(source.clone())
                .distributed_with_dynamic(ctx, 4, |_| vec![0, 1]);
            let (_, first) = distributor.subscribe_queue();
            source.offer(1).unwrap();
            assert_eq!(first.take(), Ok(Take::Chunk(Chunk::single(1))));

            let (id, second) = distributor.subscribe_queue();
            assert_eq!(id, 1);
            source.offer(2).unwrap();
            assert_eq!(first.take(), Ok(Take::Chunk(Chunk::single(2))));
            assert_eq!(second.take(), Ok(Take::Chunk(Chunk::single(2))));

            source.shutdown();
            assert_eq!(first.take(), Ok(Take::End));
            assert_eq!(second.take(), Ok(Take::End));
        });
    }

    #[test]
    fn failures_reach_every_consumer() {
        let rt = rt();
        rt.scoped(|ctx| {
            let source = TestStream::from_iter([1]).concat(&TestStream::fail("boom".into()));
            for queue in source.broadcasted_queues(ctx, 2, 4) {
                let out = TestStream::from_take_queue(queue).run_collect_exit(&rt);
                assert_eq!(out, Err(Cause::fail("boom".to_string())));
            }
        });
    }

    #[test]
    fn distributed_with_routes_by_decision() {
        let rt = rt();
        rt.scoped(|ctx| {
            let queues =
                TestStream::range(0..10).distributed_with(ctx, 2, 4, |n| vec![(n % 2) as usize]);
            let collected: Vec<_> = queues
                .into_iter()
                .map(|q| TestStream::from_take_queue(q).run_collect(&rt).unwrap())
                .collect();
            assert_eq!(collected, vec![vec![0, 2, 4, 6, 8], vec![1, 3, 5, 7, 9]]);
        });
    }

    #[test]
    fn dynamic_subscribers() {
        let rt = rt();
        rt.scoped(|ctx| {
            let distributor =
                TestStream::from_iter([1, 2, 3]).distributed_with_dynamic(ctx, 4, |_| vec![0]);
            let (id, first) = distributor.subscribe();
            assert_eq!(id, 0);
            assert_eq!(first.run_collect(&rt), Ok(vec![1, 2, 3]));

            let (id, late) = distributor.subscribe();
            assert_eq!(id, 1);
            assert_eq!(late.run_collect(&rt), Ok(vec![]));
        });
    }

    #[test]
    fn broadcast_dynamic_starts_with_first_run() {
        let rt = rt();
        rt.scoped(|ctx| {
            let stream = TestStream::range(0..5).broadcast_dynamic(ctx, 4);
            assert_eq!(stream.run_collect(&rt), Ok(vec![0, 1, 2, 3, 4]));
        });
    }

    #[test]
    fn closing_the_scope_ends_consumers() {
        let rt = rt();
        let consumers = rt.scoped(|ctx| TestStream::<i32>::never().broadcast(ctx, 1, 1));
        assert_eq!(consumers[0].run_collect(&rt), Ok(vec![]));
    }
}
