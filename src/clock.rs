use chrono::{Local, NaiveDateTime};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Source of wall-clock and monotonic time.
///
/// Deadlines are measured on the monotonic clock. The wall clock is only
/// used to query the schedule and to notice administrative time changes.
pub trait Clock {
    /// Local wall-clock time.
    fn now(&self) -> NaiveDateTime;
    /// Time elapsed since the clock was created. Never goes backwards.
    fn monotonic(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug)]
struct ManualState {
    wall: NaiveDateTime,
    mono: Duration,
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn starting_at(wall: NaiveDateTime) -> Self {
        ManualClock {
            state: Arc::new(Mutex::new(ManualState {
                wall,
                mono: Duration::ZERO,
            })),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ManualState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Move both clocks forward.
    pub fn advance(&self, by: Duration) {
        self.with_state(|s| {
            s.mono += by;
            s.wall += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        });
    }

    /// Change the wall clock only, like an operator resetting the system time.
    pub fn set_wall(&self, wall: NaiveDateTime) {
        self.with_state(|s| s.wall = wall);
    }

    /// Shift the wall clock by a signed amount of seconds.
    pub fn jump_wall(&self, secs: i64) {
        self.with_state(|s| s.wall += chrono::Duration::seconds(secs));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        let start = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|d| d.and_hms_opt(10, 0, 0))
            .unwrap_or_default();
        ManualClock::starting_at(start)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        self.with_state(|s| s.wall)
    }

    fn monotonic(&self) -> Duration {
        self.with_state(|s| s.mono)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

impl<C: Clock + ?Sized> Clock for Box<C> {
    fn now(&self) -> NaiveDateTime {
        (**self).now()
    }

    fn monotonic(&self) -> Duration {
        (**self).monotonic()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// Milliseconds between two wall-clock samples (negative if `to` is earlier).
pub fn millis_between(from: NaiveDateTime, to: NaiveDateTime) -> i64 {
    (to - from).num_milliseconds()
}
