//! Error types for configuration, lifecycle, and callback failures.

use std::any::Any;
use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// Boxed error a timer or task body may return.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result of running a timer or task body once.
pub type Outcome = Result<(), BoxError>;

/// Rejected configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("tick_millis must be positive")]
    ZeroTickMillis,
    #[error("tick_count must be positive")]
    ZeroTickCount,
    #[error("parallelism must be positive")]
    ZeroParallelism,
}

/// Errors surfaced by scheduler lifecycle and scheduling operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("scheduler has been stopped")]
    Stopped,
    #[error("timer service can only be replaced before start")]
    AlreadyStarted,
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Cause of an aborted timer or task run.
#[derive(Error, Debug)]
pub enum Fault {
    #[error("callback failed: {0}")]
    Failed(#[source] BoxError),
    #[error("callback panicked: {0}")]
    Panicked(String),
}

impl Fault {
    /// Builds a fault from a payload captured by `catch_unwind`.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Panicked(panic_message(payload.as_ref()))
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs a user notification hook such as `did_cancel`. A panic is logged and
/// swallowed so the caller's state transition still completes.
pub(crate) fn shield<F>(hook: &str, body: F)
where
    F: FnOnce(),
{
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body)) {
        log::error!("{hook} hook panicked: {}", panic_message(payload.as_ref()));
    }
}

/// Runs `body`, folding both `Err` returns and panics into a [`Fault`].
pub(crate) fn guard<F>(body: F) -> Result<(), Fault>
where
    F: FnOnce() -> Outcome,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(body)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Fault::Failed(err)),
        Err(payload) => Err(Fault::from_panic(payload)),
    }
}
