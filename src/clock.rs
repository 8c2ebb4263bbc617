//! Injectable time source for polling loops.
//!
//! Every wait in the pipeline goes through a [`Clock`] so that tests can
//! simulate the passage of time deterministically instead of incurring real
//! wall-clock delays. `SystemTime` (not `Instant`) is used throughout because
//! the freshness checks compare against file modification times.

use std::time::{Duration, SystemTime};

/// Time source + sleeper used by all polling loops.
pub trait Clock {
    /// Current time.
    fn now(&self) -> SystemTime;

    /// Block for the given duration.
    fn sleep(&self, duration: Duration);
}

/// Real wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
pub use manual::ManualClock;

#[cfg(test)]
mod manual {
    use super::*;
    use std::sync::Mutex;

    type ScheduledAction = (SystemTime, Box<dyn FnOnce() + Send>);

    struct ManualState {
        now: SystemTime,
        sleeps: Vec<Duration>,
        scheduled: Vec<ScheduledAction>,
    }

    /// Test clock: `sleep` advances virtual time instantly and records the
    /// requested duration. Actions can be scheduled to fire when virtual time
    /// crosses a threshold (e.g. "the build log appears 2 s after trigger").
    pub struct ManualClock {
        state: Mutex<ManualState>,
    }

    impl ManualClock {
        pub fn starting_at(now: SystemTime) -> Self {
            Self {
                state: Mutex::new(ManualState {
                    now,
                    sleeps: Vec::new(),
                    scheduled: Vec::new(),
                }),
            }
        }

        /// Run `action` once virtual time reaches `at`.
        pub fn schedule(&self, at: SystemTime, action: impl FnOnce() + Send + 'static) {
            self.state
                .lock()
                .unwrap()
                .scheduled
                .push((at, Box::new(action)));
        }

        /// All sleep durations requested so far, in order.
        pub fn sleeps(&self) -> Vec<Duration> {
            self.state.lock().unwrap().sleeps.clone()
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> SystemTime {
            self.state.lock().unwrap().now
        }

        fn sleep(&self, duration: Duration) {
            let due = {
                let mut state = self.state.lock().unwrap();
                state.sleeps.push(duration);
                state.now += duration;
                let now = state.now;
                let mut due = Vec::new();
                let mut i = 0;
                while i < state.scheduled.len() {
                    if state.scheduled[i].0 <= now {
                        due.push(state.scheduled.swap_remove(i).1);
                    } else {
                        i += 1;
                    }
                }
                due
            };
            // Fire outside the lock: actions may call back into the clock.
            for action in due {
                action();
            }
        }
    }
}
