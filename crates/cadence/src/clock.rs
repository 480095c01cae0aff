//! Time sources for the wheel driver.
//!
//! The driver never calls `Instant::now` or `thread::sleep` directly. It asks a
//! [`Clock`] for the elapsed time and parks on it between ticks, which lets
//! tests advance time by hand with [`ManualClock`].

use std::time::{Duration, Instant};

use crate::sync::{Condvar, Mutex, Parker};

/// Monotonic time source with a parking capability.
pub trait Clock: Send + Sync + 'static {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;

    /// Blocks the calling thread until [`Clock::now`] reaches `deadline`.
    /// Spurious early returns are allowed; callers re-check the time.
    fn park_until(&self, deadline: Duration);

    /// Wakes a thread blocked in [`Clock::park_until`].
    fn unpark(&self);
}

/// Wall-clock backed time source.
pub struct SystemClock {
    origin: Instant,
    parker: Parker,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            parker: Parker::new(),
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
        self.origin.elapsed()
    }

    fn park_until(&self, deadline: Duration) {
        let remaining = deadline.saturating_sub(self.now());
        if !remaining.is_zero() {
            self.parker.park_timeout(remaining);
        }
    }

    fn unpark(&self) {
        self.parker.unpark();
    }
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    unparked: bool,
}

/// Clock that only moves when told to.
///
/// `park_until` blocks until the time is advanced past the deadline or the
/// clock is unparked.
#[derive(Default)]
pub struct ManualClock {
    state: Mutex<ManualState>,
    cvar: Condvar,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves time forward and wakes any parked driver.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        state.now += by;
        drop(state);
        self.cvar.notify_all();
    }

    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.state.lock().now
    }

    fn park_until(&self, deadline: Duration) {
        let mut state = self.state.lock();
        while state.now < deadline && !state.unparked {
            self.cvar.wait(&mut state);
        }
        state.unparked = false;
    }

    fn unpark(&self) {
        self.state.lock().unparked = true;
        self.cvar.notify_all();
    }
}
