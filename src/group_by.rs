//! Splitting a stream into one sub-stream per key.

use std::{
    collections::{hash_map::Entry, HashMap},
    hash::Hash,
    sync::Arc,
};

use crate::{
    pull::Pull,
    queue::{Queue, QueueError},
    stream::{Data, Env, Stream},
    task, Chunk, Exit, Take,
};

type Admit<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

type GroupQueue<E, V> = Queue<Take<E, V>>;

/// A stream partitioned by key, waiting to be [evaluated][GroupBy::evaluate].
///
/// Created by [`Stream::group_by_key`] and [`Stream::group_by`].
pub struct GroupBy<R, E, K, V> {
    grouped: Stream<R, E, (K, V)>,
    buffer: usize,
    admit: Admit<K>,
    first: Option<usize>,
}

impl<R, E, K, V> Clone for GroupBy<R, E, K, V> {
    fn clone(&self) -> Self {
        Self {
            grouped: self.grouped.clone(),
            buffer: self.buffer,
            admit: self.admit.clone(),
            first: self.first,
        }
    }
}

impl<R: Env, E: Data, K: Data + Eq + Hash, V: Data> GroupBy<R, E, K, V> {
    /// Only processes the first `n` keys that show up. Elements of any later key are dropped.
    pub fn first(&self, n: usize) -> Self {
        Self {
            first: Some(self.first.map_or(n, |m| m.min(n))),
            ..self.clone()
        }
    }

    /// Only processes keys matching `pred`. Elements of other keys are dropped.
    pub fn filter<P: Fn(&K) -> bool + Send + Sync + 'static>(&self, pred: P) -> Self {
        let admit = self.admit.clone();
        Self {
            admit: Arc::new(move |k: &K| admit(k) && pred(k)),
            ..self.clone()
        }
    }

    /// Runs `f` on the sub-stream of every key and merges the results.
    ///
    /// All groups run concurrently. Upstream is read by a single router that hands each element
    /// to its key without ever waiting for that key's consumer, so a slow group only holds back
    /// its own elements. Each group runs up to `buffer` chunks ahead of its consumer; elements
    /// beyond that are staged for the group. A group whose stream stops early (e.g. through
    /// [`Stream::take`]) has its remaining elements dropped.
    pub fn evaluate<B, F>(&self, f: F) -> Stream<R, E, B>
    where
        B: Data,
        F: Fn(K, Stream<R, E, V>) -> Stream<R, E, B> + Send + Sync + 'static,
    {
        let this = self.clone();
        let f = Arc::new(f);
        Stream::from_pull(move |ctx| {
            let groups = Queue::unbounded();
            let producer = groups.clone();
            let pull = this.grouped.acquire(ctx);
            let (buffer, admit, first) = (this.buffer, this.admit.clone(), this.first);
            ctx.fork::<E, (), _>(move || route(pull, &producer, &admit, first));

            let f = f.clone();
            Stream::from_take_queue(groups)
                .map(move |(key, staged): (K, GroupQueue<E, V>)| {
                    f(key, Stream::from_take_queue(staged).buffer(buffer))
                })
                .flatten_par(usize::MAX, buffer)
                .acquire(ctx)
        })
    }
}

/// Sends every element to its key's staging queue, announcing each new key on `groups`.
///
/// Staging queues are unbounded, so routing never waits for a group.
fn route<E: Data, K: Data + Eq + Hash, V: Data>(
    mut pull: Pull<E, (K, V)>,
    groups: &Queue<Take<E, (K, GroupQueue<E, V>)>>,
    admit: &Admit<K>,
    first: Option<usize>,
) -> Exit<E, ()> {
    // `None` marks keys that are not processed, or whose consumer is gone.
    let mut queues: HashMap<K, Option<GroupQueue<E, V>>> = HashMap::new();
    let mut admitted = 0;
    let done = loop {
        let chunk = match pull.invoke() {
            Ok(chunk) => chunk,
            Err(done) => break done,
        };
        for (key, value) in &chunk {
            let slot = match queues.entry(key.clone()) {
                Entry::Occupied(slot) => slot.into_mut(),
                Entry::Vacant(slot) => {
                    let open = admit(key) && first.map_or(true, |n| admitted < n);
                    let queue = open.then(Queue::unbounded);
                    if let Some(queue) = &queue {
                        admitted += 1;
                        log::trace!("new group #{admitted}");
                        let announce = Take::Chunk(Chunk::single((key.clone(), queue.clone())));
                        match groups.offer(announce) {
                            Ok(()) => {}
                            Err(QueueError::Shutdown) => return Ok(()),
                            Err(QueueError::Interrupted(i)) => return Err(i.into()),
                        }
                    }
                    slot.insert(queue)
                }
            };
            let Some(queue) = slot.clone() else {
                continue;
            };
            match queue.offer(Take::Chunk(Chunk::single(value.clone()))) {
                Ok(()) => {}
                Err(QueueError::Shutdown) => *slot = None,
                Err(QueueError::Interrupted(i)) => return Err(i.into()),
            }
        }
    };

    if let Some(cause) = &done {
        if cause.is_interrupted_only() && task::interrupted().is_some() {
            return Ok(());
        }
    }
    for queue in queues.values().flatten() {
        let _ = queue.offer(Take::End);
    }
    // A failure goes to the stream of groups only, so it is reported once.
    let _ = groups.offer(Take::from_pull(Err(done)));
    Ok(())
}

impl<R: Env, E: Data, A: Data> Stream<R, E, A> {
    /// Groups elements by the key `key` computes for them.
    ///
    /// ```
    /// use strand::{Runtime, Stream};
    ///
    /// let words: Stream<(), String, &str> = Stream::from_iter(["hello", "world", "hi", "holla"]);
    /// let firsts = words
    ///     .group_by_key(|w| w.chars().next(), 16)
    ///     .evaluate(|key, group| group.take(2).map(move |w| (key, w)));
    ///
    /// let mut out = firsts.run_collect(&Runtime::new()).unwrap();
    /// out.sort();
    /// assert_eq!(out, [(Some('h'), "hello"), (Some('h'), "hi"), (Some('w'), "world")]);
    /// ```
    pub fn group_by_key<K, F>(&self, key: F, buffer: usize) -> GroupBy<R, E, K, A>
    where
        K: Data + Eq + Hash,
        F: Fn(&A) -> K + Send + Sync + 'static,
    {
        self.group_by(move |a| (key(&a), a), buffer)
    }

    /// Splits every element into a key and a value, and groups the values by key.
    pub fn group_by<K, V, F>(&self, f: F, buffer: usize) -> GroupBy<R, E, K, V>
    where
        K: Data + Eq + Hash,
        V: Data,
        F: Fn(A) -> (K, V) + Send + Sync + 'static,
    {
        GroupBy {
            grouped: self.map(f),
            buffer,
            admit: Arc::new(|_: &K| true),
            first: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use super::*;
    use crate::{
        sync::Mutex,
        test::{rt, TestStream},
    };

    fn words() -> TestStream<&'static str> {
        TestStream::from_iter(["hello", "world", "hi", "holla"])
    }

    fn by_key<K: Ord, V>(pairs: Vec<(K, V)>) -> BTreeMap<K, Vec<V>> {
        let mut out = BTreeMap::new();
        for (k, v) in pairs {
            out.entry(k).or_insert_with(Vec::new).push(v);
        }
        out
    }

    #[test]
    fn first_two_words_per_letter() {
        let out = words()
            .group_by_key(|w| w.chars().next().unwrap_or_default(), 16)
            .evaluate(|key, group| group.take(2).map(move |w| (key, w)))
            .run_collect(&rt())
            .unwrap();
        let groups = by_key(out);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&'h'], vec!["hello", "hi"]);
        assert_eq!(groups[&'w'], vec!["world"]);
    }

    #[test]
    fn first_limits_the_number_of_groups() {
        let out = words()
            .group_by_key(|w| w.chars().next().unwrap_or_default(), 16)
            .first(1)
            .evaluate(|_, group| group)
            .run_collect(&rt())
            .unwrap();
        assert_eq!(out, vec!["hello", "hi", "holla"]);
    }

    #[test]
    fn filter_drops_keys() {
        let out = words()
            .group_by_key(|w| w.chars().next().unwrap_or_default(), 16)
            .filter(|k| *k != 'h')
            .evaluate(|_, group| group)
            .run_collect(&rt())
            .unwrap();
        assert_eq!(out, vec!["world"]);
    }

    #[test]
    fn group_by_splits_keys_and_values() {
        let out = TestStream::range(0..20)
            .group_by(|n| (n % 3, n * 10), 2)
            .evaluate(|key, group| group.map(move |v| (key, v)))
            .run_collect(&rt())
            .unwrap();
        let groups = by_key(out);
        for key in 0..3 {
            let expected: Vec<_> = (0..20).filter(|n| n % 3 == key).map(|n| n * 10).collect();
            assert_eq!(groups[&key], expected);
        }
    }

    #[test]
    fn a_stalled_group_does_not_hold_back_other_keys() {
        let (seen_b_tx, seen_b) = crossbeam_channel::bounded(1);
        let waited = Arc::new(Mutex::new(None));
        let record = waited.clone();
        let mut out = TestStream::from_iter(["a1", "a2", "a3", "a4", "a5", "b1"])
            .group_by_key(|w| w.chars().next().unwrap_or_default(), 1)
            .evaluate(move |key, group| {
                let (seen_b_tx, seen_b) = (seen_b_tx.clone(), seen_b.clone());
                let record = record.clone();
                group.tap(move |_| {
                    if key == 'b' {
                        let _ = seen_b_tx.try_send(());
                        return;
                    }
                    let mut record = record.lock();
                    if record.is_none() {
                        *record = Some(seen_b.recv_timeout(Duration::from_secs(5)).is_ok());
                    }
                })
            })
            .run_collect(&rt())
            .unwrap();

        assert_eq!(*waited.lock(), Some(true));
        out.sort();
        assert_eq!(out, vec!["a1", "a2", "a3", "a4", "a5", "b1"]);
    }

    #[test]
    fn upstream_failure_is_reported_once() {
        let failing = words().concat(&TestStream::fail("boom".into()));
        let result = failing
            .group_by_key(|w| w.len(), 16)
            .evaluate(|_, group| group)
            .run_collect_exit(&rt());
        assert_eq!(result, Err(crate::Cause::fail("boom".to_string())));
    }
}
