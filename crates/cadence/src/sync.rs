//! Synchronization primitives shared by the wheel, the pool, and the clocks.
//!
//! Locks come from `parking_lot`: they do not poison, so a callback that
//! panics while a handle operation is in flight cannot wedge the scheduler.

use std::time::Duration;

pub use parking_lot::{Condvar, Mutex};
pub use std::sync::{Arc, Weak};

/// One-permit parking spot.
///
/// `unpark` stores a permit that the next `park_timeout` consumes, so a wakeup
/// delivered before the sleeper arrives is never lost.
#[derive(Default)]
pub struct Parker {
    permit: Mutex<bool>,
    cvar: Condvar,
}

impl Parker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until unparked or until `timeout` elapses.
    pub fn park_timeout(&self, timeout: Duration) {
        let mut permit = self.permit.lock();
        if !*permit {
            self.cvar.wait_for(&mut permit, timeout);
        }
        *permit = false;
    }

    pub fn unpark(&self) {
        *self.permit.lock() = true;
        self.cvar.notify_all();
    }
}
