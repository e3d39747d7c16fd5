//! Recurrence policies.

use std::{fmt, sync::Arc, time::Duration};

/// What a [`Schedule`] decides at each step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Recur after the given delay.
    Continue(Duration),
    Done,
}

type Step = Box<dyn FnMut(Duration) -> Decision + Send>;

/// A restartable recurrence policy.
///
/// A `Schedule` is only a description; [`Schedule::driver`] creates the stateful [`Driver`] that
/// is stepped with the current time.
#[derive(Clone)]
pub struct Schedule {
    make: Arc<dyn Fn() -> Step + Send + Sync>,
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule").finish_non_exhaustive()
    }
}

impl Schedule {
    fn from_step<F, S>(make: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: FnMut(Duration) -> Decision + Send + 'static,
    {
        Self {
            make: Arc::new(move || Box::new(make()) as Step),
        }
    }

    /// Recurs forever, waiting `interval` between steps.
    pub fn spaced(interval: Duration) -> Self {
        Self::from_step(move || move |_| Decision::Continue(interval))
    }

    /// Recurs forever at multiples of `interval`, measured from the first step.
    ///
    /// A step that comes in late waits only for the next window instead of a full interval.
    pub fn fixed(interval: Duration) -> Self {
        Self::from_step(move || {
            let mut start = None;
            move |now: Duration| {
                let start = *start.get_or_insert(now);
                if interval.is_zero() {
                    return Decision::Continue(Duration::ZERO);
                }
                let elapsed = now.saturating_sub(start).as_nanos();
                let windows = elapsed / interval.as_nanos() + 1;
                let next = start.as_nanos() + windows * interval.as_nanos();
                let delay = next - now.as_nanos();
                Decision::Continue(Duration::from_nanos(delay.min(u64::MAX as u128) as u64))
            }
        })
    }

    /// Recurs `times` times without delay, then stops.
    pub fn recurs(times: usize) -> Self {
        Self::from_step(move || {
            let mut count = 0;
            move |_| {
                if count < times {
                    count += 1;
                    Decision::Continue(Duration::ZERO)
                } else {
                    Decision::Done
                }
            }
        })
    }

    /// Recurs a single time without delay.
    pub fn once() -> Self {
        Self::recurs(1)
    }

    /// Recurs forever without delay.
    pub fn forever() -> Self {
        Self::from_step(|| |_| Decision::Continue(Duration::ZERO))
    }

    /// Recurs forever, waiting `base * factor^n` before the n-th step.
    pub fn exponential(base: Duration, factor: f64) -> Self {
        Self::from_step(move || {
            let mut n = 0;
            move |_| {
                let delay = base.mul_f64(factor.powi(n));
                n = n.saturating_add(1);
                Decision::Continue(delay)
            }
        })
    }

    /// Recurs while both schedules do, waiting for the longer of both delays.
    pub fn intersect(&self, that: &Schedule) -> Self {
        let (a, b) = (self.clone(), that.clone());
        Self::from_step(move || {
            let (mut a, mut b) = (a.driver(), b.driver());
            move |now| match (a.next(now), b.next(now)) {
                (Decision::Continue(x), Decision::Continue(y)) => Decision::Continue(x.max(y)),
                _ => Decision::Done,
            }
        })
    }

    /// Recurs while either schedule does, waiting for the shorter of the delays.
    pub fn union(&self, that: &Schedule) -> Self {
        let (a, b) = (self.clone(), that.clone());
        Self::from_step(move || {
            let (mut a, mut b) = (a.driver(), b.driver());
            move |now| match (a.next(now), b.next(now)) {
                (Decision::Continue(x), Decision::Continue(y)) => Decision::Continue(x.min(y)),
                (Decision::Continue(x), Decision::Done)
                | (Decision::Done, Decision::Continue(x)) => {
                    Decision::Continue(x)
                }
                (Decision::Done, Decision::Done) => Decision::Done,
            }
        })
    }

    /// Stops after at most `n` recurrences.
    pub fn take(&self, n: usize) -> Self {
        self.intersect(&Schedule::recurs(n))
    }

    /// Starts a fresh run of the schedule.
    pub fn driver(&self) -> Driver {
        Driver {
            step: (self.make)(),
            schedule: self.clone(),
        }
    }
}

/// The running state of a [`Schedule`].
pub struct Driver {
    schedule: Schedule,
    step: Step,
}

impl Driver {
    /// Advances the schedule, given the current time.
    pub fn next(&mut self, now: Duration) -> Decision {
        (self.step)(now)
    }

    /// Starts over from the schedule's initial state.
    pub fn reset(&mut self) {
        self.step = (self.schedule.make)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    fn steps(schedule: &Schedule, at: &[u64]) -> Vec<Decision> {
        let mut driver = schedule.driver();
        at.iter().map(|ms| driver.next(MS * (*ms as u32))).collect()
    }

    #[test]
    fn fixed_aligns_to_windows() {
        let decisions = steps(&Schedule::fixed(MS * 100), &[0, 100, 250, 300]);
        assert_eq!(
            decisions,
            vec![
                Decision::Continue(MS * 100),
                Decision::Continue(MS * 100),
                Decision::Continue(MS * 50),
                Decision::Continue(MS * 100),
            ]
        );
    }

    #[test]
    fn recurs_then_done_and_reset() {
        let schedule = Schedule::recurs(2);
        let mut driver = schedule.driver();
        assert_eq!(driver.next(Duration::ZERO), Decision::Continue(Duration::ZERO));
        assert_eq!(driver.next(Duration::ZERO), Decision::Continue(Duration::ZERO));
        assert_eq!(driver.next(Duration::ZERO), Decision::Done);
        driver.reset();
        assert_eq!(driver.next(Duration::ZERO), Decision::Continue(Duration::ZERO));
    }

    #[test]
    fn exponential_backoff() {
        let decisions = steps(&Schedule::exponential(MS * 10, 2.0), &[0, 0, 0]);
        assert_eq!(
            decisions,
            vec![
                Decision::Continue(MS * 10),
                Decision::Continue(MS * 20),
                Decision::Continue(MS * 40),
            ]
        );
    }

    #[test]
    fn intersect_and_union() {
        let spaced = Schedule::spaced(MS * 5);
        let both = spaced.intersect(&Schedule::recurs(1));
        assert_eq!(
            steps(&both, &[0, 0]),
            vec![Decision::Continue(MS * 5), Decision::Done]
        );

        let either = Schedule::once().union(&Schedule::spaced(MS * 5));
        assert_eq!(
            steps(&either, &[0, 0]),
            vec![Decision::Continue(Duration::ZERO), Decision::Continue(MS * 5)]
        );

        assert_eq!(
            steps(&Schedule::forever().take(1), &[0, 0]),
            vec![Decision::Continue(Duration::ZERO), Decision::Done]
        );
    }
}
