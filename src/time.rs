//! Time-based combinators, driven by the runtime's [`Clock`][crate::Clock].

use std::{sync::Arc, time::Duration};

use crate::{
    pull::{Elements, Pull},
    schedule::{Decision, Schedule},
    stream::{Data, Env, Stream},
    task,
    transform::Scoped,
    zip::Side,
    Cause, Chunk,
};

type OnValue<A, B> = Arc<dyn Fn(A) -> B + Send + Sync>;

impl<R: Env, E: Data, A: Data> Stream<R, E, A> {
    /// Delays every element according to `schedule`. When the schedule is done, it starts over.
    pub fn schedule(&self, schedule: &Schedule) -> Self {
        self.scheduled(schedule, Arc::new(|a| a), None)
    }

    /// Like [`Stream::schedule`], mapping elements with `on_element`. Whenever the schedule is
    /// done, `on_done` is applied to the element that finished it and emitted right after it.
    pub fn schedule_with<B, F, G>(
        &self,
        schedule: &Schedule,
        on_element: F,
        on_done: G,
    ) -> Stream<R, E, B>
    where
        B: Data,
        F: Fn(A) -> B + Send + Sync + 'static,
        G: Fn(A) -> B + Send + Sync + 'static,
    {
        self.scheduled(schedule, Arc::new(on_element), Some(Arc::new(on_done)))
    }

    fn scheduled<B: Data>(
        &self,
        schedule: &Schedule,
        on_element: OnValue<A, B>,
        on_done: Option<OnValue<A, B>>,
    ) -> Stream<R, E, B> {
        let schedule = schedule.clone();
        self.via(move |pull, ctx| {
            let clock = ctx.clock().clone();
            let mut driver = schedule.driver();
            let mut elements = Elements::new(pull);
            let (on_element, on_done) = (on_element.clone(), on_done.clone());
            Pull::new(move || {
                let a = elements.next()?;
                match driver.next(clock.now()) {
                    Decision::Continue(delay) => {
                        clock.sleep(delay).map_err(|i| Some(i.into()))?;
                        Ok(Chunk::single(on_element(a)))
                    }
                    Decision::Done => {
                        driver.reset();
                        let mut out = vec![on_element(a.clone())];
                        if let Some(on_done) = &on_done {
                            out.push(on_done(a));
                        }
                        Ok(Chunk::from_vec(out))
                    }
                }
            })
        })
    }

    /// Runs the stream again each time it ends, as long as `schedule` continues, waiting for the
    /// schedule's delay in between.
    pub fn repeat(&self, schedule: &Schedule) -> Self {
        let (this, schedule) = (self.clone(), schedule.clone());
        Stream::from_pull(move |ctx| {
            let this = this.clone();
            let ctx = ctx.clone();
            let clock = ctx.clock().clone();
            let mut driver = schedule.driver();
            let mut current = Scoped::acquire(&this, &ctx);
            Pull::new(move || loop {
                match current.invoke() {
                    Err(None) => match driver.next(clock.now()) {
                        Decision::Continue(delay) => {
                            task::check().map_err(|i| Some(i.into()))?;
                            clock.sleep(delay).map_err(|i| Some(i.into()))?;
                            current = Scoped::acquire(&this, &ctx);
                        }
                        Decision::Done => return Err(None),
                    },
                    result => return result,
                }
            })
        })
    }

    /// Ends the stream if a single pull takes longer than `duration`.
    pub fn timeout(&self, duration: Duration) -> Self {
        self.timeout_to(duration, &Stream::empty())
    }

    /// Fails with the error returned by `error` if a single pull takes longer than `duration`.
    pub fn timeout_fail<F>(&self, error: F, duration: Duration) -> Self
    where
        F: Fn() -> E + Send + Sync + 'static,
    {
        self.timeout_fail_cause(move || Cause::fail(error()), duration)
    }

    /// Fails with the cause returned by `cause` if a single pull takes longer than `duration`.
    pub fn timeout_fail_cause<F>(&self, cause: F, duration: Duration) -> Self
    where
        F: Fn() -> Cause<E> + Send + Sync + 'static,
    {
        self.timeout_to(duration, &Stream::suspend(move || Stream::fail_cause(cause())))
    }

    /// Switches to `that` if a single pull takes longer than `duration`.
    ///
    /// Each pull is raced against a timer task; the loser is interrupted. Once switched, no
    /// timeout applies to `that`. A duration of [`Duration::MAX`] disables the timeout.
    pub fn timeout_to(&self, duration: Duration, that: &Stream<R, E, A>) -> Self {
        if duration == Duration::MAX {
            return self.clone();
        }
        let (this, that) = (self.clone(), that.clone());
        Stream::from_pull(move |ctx| {
            let child = ctx.child();
            let upstream_scope = child.scope().clone();
            let mut upstream = Side::spawn(&this, &child);
            let ctx = ctx.clone();
            let that = that.clone();
            let mut fallback: Option<Pull<E, A>> = None;
            Pull::new(move || {
                if let Some(pull) = &mut fallback {
                    return pull.invoke();
                }
                let (elapsed_tx, elapsed) = crossbeam_channel::bounded(1);
                let clock = ctx.clock().clone();
                let timer = ctx.fork::<(), (), _>(move || {
                    clock.sleep(duration)?;
                    let _ = elapsed_tx.send(());
                    Ok(())
                });
                let result = upstream.pull_until(&elapsed);
                timer.interrupt_and_wait();
                match result {
                    Some(result) => {
                        if result.is_err() {
                            upstream_scope.close();
                        }
                        result
                    }
                    None => {
                        log::debug!("pull timed out after {duration:?}, switching streams");
                        upstream_scope.close();
                        fallback.insert(that.acquire(&ctx)).invoke()
                    }
                }
            })
        })
    }
}

impl<R: Env, E: Data> Stream<R, E, u64> {
    /// Emits the number of each recurrence of `schedule`, after waiting for its delay.
    pub fn from_schedule(schedule: &Schedule) -> Self {
        let schedule = schedule.clone();
        Self::from_pull(move |ctx| {
            let clock = ctx.clock().clone();
            let mut driver = schedule.driver();
            let mut n = 0;
            Pull::new(move || match driver.next(clock.now()) {
                Decision::Continue(delay) => {
                    clock.sleep(delay).map_err(|i| Some(i.into()))?;
                    n += 1;
                    Ok(Chunk::single(n - 1))
                }
                Decision::Done => Err(None),
            })
        })
    }
}

impl<R: Env, E: Data> Stream<R, E, ()> {
    /// Emits right away, then once every `interval`.
    pub fn tick(interval: Duration) -> Self {
        Self::succeed(()).repeat(&Schedule::spaced(interval))
    }
}
