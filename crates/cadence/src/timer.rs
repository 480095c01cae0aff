//! Timer callbacks, handles, and the pluggable timer service seam.

use std::fmt;
use std::time::Duration;

use crate::error::{Outcome, SchedulerError};
use crate::sync::Arc;

/// Identity of a scheduled timer, unique within the wheel that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Body of a timer.
///
/// `run_timer` receives the timer's own handle so it can reschedule itself
/// with [`TimerRef::debounce`].
pub trait TimerFunction: Send + Sync + 'static {
    fn run_timer(&self, timer: &TimerRef) -> Outcome;

    /// Called once when a pending timer is cancelled.
    fn did_cancel(&self) {}
}

impl<F> TimerFunction for F
where
    F: Fn(&TimerRef) -> Outcome + Send + Sync + 'static,
{
    fn run_timer(&self, timer: &TimerRef) -> Outcome {
        self(timer)
    }
}

/// Object-safe capability behind a [`TimerRef`].
pub trait TimerHandle: Send + Sync {
    fn id(&self) -> TimerId;

    /// Pending, or running with a reschedule requested.
    fn is_scheduled(&self) -> bool;

    /// Returns `true` when this call prevented a pending run.
    fn cancel(&self) -> bool;

    /// Moves the deadline to `delay` from now. Returns `false` when the timer
    /// was cancelled or its owner has stopped.
    fn debounce(&self, delay: Duration) -> bool;
}

/// Caller-held handle to a timer. Clones refer to the same timer.
#[derive(Clone)]
pub struct TimerRef {
    handle: Arc<dyn TimerHandle>,
}

impl TimerRef {
    pub fn new(handle: Arc<dyn TimerHandle>) -> Self {
        Self { handle }
    }

    pub fn id(&self) -> TimerId {
        self.handle.id()
    }

    pub fn is_scheduled(&self) -> bool {
        self.handle.is_scheduled()
    }

    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    pub fn debounce(&self, delay: Duration) -> bool {
        self.handle.debounce(delay)
    }

    pub fn debounce_millis(&self, millis: u64) -> bool {
        self.debounce(Duration::from_millis(millis))
    }
}

impl PartialEq for TimerRef {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for TimerRef {}

impl fmt::Debug for TimerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerRef")
            .field("id", &self.id())
            .field("scheduled", &self.is_scheduled())
            .finish()
    }
}

/// Deadline tracking engine the composed scheduler delegates to.
pub trait TimerService: Send + Sync + 'static {
    fn start(&self) -> Result<(), SchedulerError>;

    fn stop(&self);

    /// Creates an unscheduled timer, armed later with [`TimerRef::debounce`].
    fn timer(&self, function: Arc<dyn TimerFunction>) -> Result<TimerRef, SchedulerError>;

    fn set_timer(
        &self,
        delay: Duration,
        function: Arc<dyn TimerFunction>,
    ) -> Result<TimerRef, SchedulerError>;
}
