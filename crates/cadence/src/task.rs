//! Task bodies run by the worker pool.

use std::fmt;

use crate::error::Outcome;
use crate::pool::TaskRef;
use crate::sync::Mutex;

/// Identity of a bound task, unique within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Body of a pool task.
///
/// `run_task` receives the task's own handle; calling [`TaskRef::schedule`] on
/// it requests exactly one more run after the current one returns.
pub trait Task: Send + Sync + 'static {
    fn run_task(&self, task: &TaskRef) -> Outcome;

    /// Called each time the task is placed on the queue.
    fn will_schedule(&self) {}

    /// Called once per successful [`TaskRef::cancel`].
    fn did_cancel(&self) {}
}

impl<F> Task for F
where
    F: Fn(&TaskRef) -> Outcome + Send + Sync + 'static,
{
    fn run_task(&self, task: &TaskRef) -> Outcome {
        self(task)
    }
}

/// Adapts a one-shot closure to [`Task`]; later runs do nothing.
pub(crate) struct OnceTask {
    body: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl OnceTask {
    pub(crate) fn new(body: impl FnOnce() + Send + 'static) -> Self {
        Self {
            body: Mutex::new(Some(Box::new(body))),
        }
    }
}

impl Task for OnceTask {
    fn run_task(&self, _task: &TaskRef) -> Outcome {
        let body = self.body.lock().take();
        if let Some(body) = body {
            body();
        }
        Ok(())
    }
}
