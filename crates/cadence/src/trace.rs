//! Introspection hooks.
//!
//! Every observable step of the wheel and the pool is reported as a
//! [`TraceEvent`] to a single optional [`TraceHook`]. Hooks are for telemetry
//! only: a panicking hook is caught and logged, and scheduling proceeds.

use std::fmt;

use crate::error::Fault;
use crate::pool::TaskRef;
use crate::sync::Arc;
use crate::timer::TimerRef;

/// Observer invoked for every [`TraceEvent`].
pub type TraceHook = Arc<dyn Fn(&TraceEvent<'_>) + Send + Sync>;

/// A single scheduling step, borrowed from the component that emits it.
#[derive(Debug)]
pub enum TraceEvent<'a> {
    WillStart,
    DidStart,
    WillStop,
    DidStop,
    /// A wheel finished processing the given tick.
    DidTick(u64),
    WillScheduleTimer(&'a TimerRef),
    DidCancelTimer(&'a TimerRef),
    WillRunTimer(&'a TimerRef),
    DidRunTimer(&'a TimerRef),
    DidAbortTimer(&'a TimerRef, &'a Fault),
    WillScheduleTask(&'a TaskRef),
    DidCancelTask(&'a TaskRef),
    WillRunTask(&'a TaskRef),
    DidRunTask(&'a TaskRef),
    DidAbortTask(&'a TaskRef, &'a Fault),
}

impl TraceEvent<'_> {
    /// Short stable name, handy for counters and log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WillStart => "will_start",
            Self::DidStart => "did_start",
            Self::WillStop => "will_stop",
            Self::DidStop => "did_stop",
            Self::DidTick(_) => "did_tick",
            Self::WillScheduleTimer(_) => "will_schedule_timer",
            Self::DidCancelTimer(_) => "did_cancel_timer",
            Self::WillRunTimer(_) => "will_run_timer",
            Self::DidRunTimer(_) => "did_run_timer",
            Self::DidAbortTimer(..) => "did_abort_timer",
            Self::WillScheduleTask(_) => "will_schedule_task",
            Self::DidCancelTask(_) => "did_cancel_task",
            Self::WillRunTask(_) => "will_run_task",
            Self::DidRunTask(_) => "did_run_task",
            Self::DidAbortTask(..) => "did_abort_task",
        }
    }
}

impl fmt::Display for TraceEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DidTick(tick) => write!(f, "{}({tick})", self.name()),
            Self::WillScheduleTimer(timer)
            | Self::DidCancelTimer(timer)
            | Self::WillRunTimer(timer)
            | Self::DidRunTimer(timer) => write!(f, "{}({})", self.name(), timer.id()),
            Self::DidAbortTimer(timer, fault) => {
                write!(f, "{}({}: {fault})", self.name(), timer.id())
            }
            Self::WillScheduleTask(task)
            | Self::DidCancelTask(task)
            | Self::WillRunTask(task)
            | Self::DidRunTask(task) => write!(f, "{}({})", self.name(), task.id()),
            Self::DidAbortTask(task, fault) => {
                write!(f, "{}({}: {fault})", self.name(), task.id())
            }
            _ => f.write_str(self.name()),
        }
    }
}

/// Delivers `event` to `hook`, isolating the caller from hook panics.
pub(crate) fn emit(hook: Option<&TraceHook>, event: TraceEvent<'_>) {
    log::trace!("{event}");
    if let Some(hook) = hook {
        let delivered =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(&event)));
        if delivered.is_err() {
            log::error!("trace hook panicked while handling {}", event.name());
        }
    }
}
