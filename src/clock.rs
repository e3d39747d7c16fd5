//! Time sources.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::{select, Receiver, Sender};

use crate::{
    sync::{Condvar, Mutex},
    task::{self, Interrupted, Never},
};

/// A source of time that tasks can sleep on.
///
/// Implementations must make [`Clock::sleep`] return early with [`Interrupted`] when the calling
/// task is interrupted.
pub trait Clock: Send + Sync + 'static {
    /// Time elapsed since the clock's epoch.
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration) -> Result<(), Interrupted>;
}

/// The monotonic system clock.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    /// Creates a clock whose epoch is now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        task::check()?;
        if duration.is_zero() {
            return Ok(());
        }
        let timer = match Instant::now().checked_add(duration) {
            Some(deadline) => crossbeam_channel::at(deadline),
            None => crossbeam_channel::never(),
        };
        let signal = task::signal();
        select! {
            recv(timer) -> _ => Ok(()),
            recv(signal) -> _ => Err(task::interruption()),
        }
    }
}

struct Sleeper {
    id: u64,
    deadline: Duration,
    /// Dropped to wake the sleeper.
    _wake: Sender<Never>,
}

#[derive(Default)]
struct TestState {
    now: Duration,
    next_id: u64,
    sleepers: Vec<Sleeper>,
}

/// A virtual clock that only moves when told to.
///
/// Sleeping tasks stay blocked until [`TestClock::adjust`] moves the time past their deadline.
/// Since the sleeping side runs on other threads, tests should call
/// [`TestClock::wait_for_sleepers`] before adjusting, so that the sleep they mean to end has
/// actually started.
#[derive(Clone, Default)]
pub struct TestClock {
    state: Arc<(Mutex<TestState>, Condvar)>,
}

impl TestClock {
    /// Creates a clock standing at time zero, with no sleepers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward by `delta`, waking every sleeper whose deadline has passed.
    pub fn adjust(&self, delta: Duration) {
        let mut state = self.state.0.lock();
        let now = state.now.saturating_add(delta);
        Self::advance(&mut state, now);
    }

    /// Sets the clock to `now`. The clock never moves backwards.
    pub fn set_time(&self, now: Duration) {
        let mut state = self.state.0.lock();
        let now = now.max(state.now);
        Self::advance(&mut state, now);
    }

    fn advance(state: &mut TestState, now: Duration) {
        state.now = now;
        let before = state.sleepers.len();
        state.sleepers.retain(|s| s.deadline > now);
        log::trace!(
            "test clock at {now:?}, woke {} sleeper(s)",
            before - state.sleepers.len()
        );
    }

    /// Number of tasks currently sleeping on this clock.
    pub fn sleepers(&self) -> usize {
        self.state.0.lock().sleepers.len()
    }

    /// Blocks until at least `n` tasks are sleeping on this clock.
    pub fn wait_for_sleepers(&self, n: usize) {
        let (lock, condvar) = &*self.state;
        drop(condvar.wait_while(lock.lock(), |state| state.sleepers.len() < n));
    }

    fn register(&self, duration: Duration) -> (u64, Receiver<Never>) {
        let (lock, condvar) = &*self.state;
        let mut state = lock.lock();
        let (wake, woken) = crossbeam_channel::bounded(0);
        let id = state.next_id;
        state.next_id += 1;
        let deadline = state.now.saturating_add(duration);
        state.sleepers.push(Sleeper {
            id,
            deadline,
            _wake: wake,
        });
        condvar.notify_all();
        (id, woken)
    }

    fn deregister(&self, id: u64) {
        self.state.0.lock().sleepers.retain(|s| s.id != id);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Duration {
        self.state.0.lock().now
    }

    fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        task::check()?;
        if duration.is_zero() {
            return Ok(());
        }
        let (id, woken) = self.register(duration);
        let signal = task::signal();
        select! {
            recv(woken) -> _ => Ok(()),
            recv(signal) -> _ => {
                self.deregister(id);
                Err(task::interruption())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::spawn;

    #[test]
    fn system_clock_sleeps() {
        let clock = SystemClock::new();
        let before = clock.now();
        clock.sleep(Duration::from_millis(5)).unwrap();
        assert!(clock.now() - before >= Duration::from_millis(5));
        clock.sleep(Duration::ZERO).unwrap();
    }

    #[test]
    fn system_clock_sleep_is_interruptible() {
        let task = spawn::<(), (), _>("test", || {
            SystemClock::new().sleep(Duration::MAX)?;
            Ok(())
        });
        task.interrupt();
        assert!(task.join().unwrap_err().is_interrupted_only());
    }

    #[test]
    fn test_clock_wakes_on_adjust() {
        let clock = TestClock::new();
        let remote = clock.clone();
        let task = spawn::<(), Duration, _>("test", move || {
            remote.sleep(Duration::from_secs(10))?;
            Ok(remote.now())
        });

        clock.wait_for_sleepers(1);
        clock.adjust(Duration::from_secs(5));
        assert_eq!(clock.sleepers(), 1);
        assert!(!task.is_finished());

        clock.adjust(Duration::from_secs(5));
        assert_eq!(task.join(), Ok(Duration::from_secs(10)));
        assert_eq!(clock.sleepers(), 0);
    }

    #[test]
    fn interrupted_sleeper_deregisters() {
        let clock = TestClock::new();
        let remote = clock.clone();
        let task = spawn::<(), (), _>("test", move || {
            remote.sleep(Duration::from_secs(1))?;
            Ok(())
        });
        clock.wait_for_sleepers(1);
        task.interrupt_and_wait();
        assert_eq!(clock.sleepers(), 0);
    }

    #[test]
    fn set_time_never_goes_backwards() {
        let clock = TestClock::new();
        clock.set_time(Duration::from_secs(3));
        clock.set_time(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::from_secs(3));
    }
}
