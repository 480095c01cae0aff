//! # cadence
//!
//! Deadline tracking and deferred execution for multi-threaded services: a
//! hashed timer wheel that fires callbacks at tick granularity, a fixed-size
//! worker pool, and a scheduler composing the two so timer callbacks never
//! run on the wheel's driver thread.
//!
//! ## Module Overview
//! - [`wheel`]     – Hashed timer wheel with a dedicated driver thread.
//! - [`pool`]      – Fixed-size worker pool with cancellable tasks.
//! - [`scheduler`] – Timer service and worker pool behind one facade.
//! - [`timer`]     – Timer callbacks, handles, and the timer service seam.
//! - [`task`]      – Task bodies run by the pool.
//! - [`clock`]     – Injectable time sources.
//! - [`config`]    – Construction-time sizing and validation.
//! - [`trace`]     – Introspection hooks.
//!
//! ```no_run
//! use std::time::Duration;
//! use cadence::{Outcome, Scheduler, SchedulerConfig, TimerRef};
//!
//! let config = SchedulerConfig::builder().tick_millis(10).parallelism(2).build()?;
//! let scheduler = Scheduler::new(config)?;
//! scheduler.start()?;
//! scheduler.set_timer(Duration::from_millis(50), |_: &TimerRef| -> Outcome {
//!     println!("fired");
//!     Ok(())
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod pool;
pub mod scheduler;
pub(crate) mod sync;
pub mod task;
pub mod timer;
pub mod trace;
pub mod wheel;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    PoolConfig, SchedulerConfig, SchedulerConfigBuilder, WheelConfig, DEFAULT_TICK_COUNT,
    DEFAULT_TICK_MILLIS,
};
pub use error::{BoxError, ConfigError, Fault, Outcome, SchedulerError};
pub use pool::{TaskRef, WorkerPool, WorkerPoolBuilder};
pub use scheduler::{Schedule, Scheduler, SchedulerBuilder};
pub use task::{Task, TaskId};
pub use timer::{TimerFunction, TimerHandle, TimerId, TimerRef, TimerService};
pub use trace::{TraceEvent, TraceHook};
pub use wheel::{TimerWheel, TimerWheelBuilder};
#[cfg(test)]
mod tests;
