//! Deadline tracking on a timer service, execution on the worker pool.
//!
//! When a composed timer fires, the timer service's driver only queues the
//! timer's pool task; the user callback always runs on a worker. The handle
//! returned to callers covers both halves, so cancelling it before the
//! callback starts withdraws whichever half is still pending.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::{shield, ConfigError, Outcome, SchedulerError};
use crate::pool::{TaskRef, WorkerPool};
use crate::sync::{Arc, Mutex, Weak};
use crate::task::Task;
use crate::timer::{TimerFunction, TimerHandle, TimerId, TimerRef, TimerService};
use crate::trace::TraceHook;
use crate::wheel::TimerWheel;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Minimal scheduling capability handed to collaborators.
pub trait Schedule: Send + Sync {
    /// Runs `function` on a worker once `delay` has elapsed.
    fn schedule(
        &self,
        delay: Duration,
        function: Arc<dyn TimerFunction>,
    ) -> Result<TimerRef, SchedulerError>;

    /// Runs `task` on a worker as soon as one is free.
    fn submit(&self, task: Arc<dyn Task>) -> Result<TaskRef, SchedulerError>;
}

/// Timer-service callback that forwards each firing to the pool.
///
/// Every firing reuses the same bound task, so a firing that lands while the
/// callback still runs becomes a rerun request instead of a second,
/// concurrent run.
struct Dispatch {
    function: Arc<dyn TimerFunction>,
    task: TaskRef,
    /// Timer-service handle of the firing waiting for its pool run.
    fired: Mutex<Option<TimerRef>>,
}

impl Dispatch {
    fn new(function: Arc<dyn TimerFunction>, pool: &WorkerPool) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            function,
            task: pool.bind_task(Fire {
                dispatch: me.clone(),
            }),
            fired: Mutex::new(None),
        })
    }

    /// Withdraws a queued run. A run already in progress is unaffected.
    fn withdraw_pending(&self) -> bool {
        if self.task.cancel() {
            self.fired.lock().take();
            true
        } else {
            false
        }
    }
}

impl TimerFunction for Dispatch {
    fn run_timer(&self, timer: &TimerRef) -> Outcome {
        *self.fired.lock() = Some(timer.clone());
        if self.task.schedule() {
            Ok(())
        } else {
            self.fired.lock().take();
            Err(SchedulerError::Stopped.into())
        }
    }

    fn did_cancel(&self) {
        self.function.did_cancel();
    }
}

/// Pool task running the user callback for the latest firing.
struct Fire {
    dispatch: Weak<Dispatch>,
}

impl Task for Fire {
    fn run_task(&self, _task: &TaskRef) -> Outcome {
        let Some(dispatch) = self.dispatch.upgrade() else {
            return Ok(());
        };
        let Some(timer) = dispatch.fired.lock().take() else {
            return Ok(());
        };
        let handle = TimerRef::new(Arc::new(ComposedTimer {
            dispatch: Arc::clone(&dispatch),
            timer,
        }));
        dispatch.function.run_timer(&handle)
    }
}

/// Handle spanning the timer-service entry and its pool task.
struct ComposedTimer {
    dispatch: Arc<Dispatch>,
    timer: TimerRef,
}

impl TimerHandle for ComposedTimer {
    fn id(&self) -> TimerId {
        self.timer.id()
    }

    fn is_scheduled(&self) -> bool {
        self.timer.is_scheduled() || self.dispatch.task.is_scheduled()
    }

    fn cancel(&self) -> bool {
        // A successful timer-service cancel reports `did_cancel` through `Dispatch`.
        let timer_cancelled = self.timer.cancel();
        let task_cancelled = self.dispatch.withdraw_pending();
        if task_cancelled && !timer_cancelled {
            shield("did_cancel", || self.dispatch.function.did_cancel());
        }
        timer_cancelled || task_cancelled
    }

    fn debounce(&self, delay: Duration) -> bool {
        self.dispatch.withdraw_pending();
        self.timer.debounce(delay)
    }
}

/// Builder for a [`Scheduler`] with a custom clock or trace hook.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    clock: Option<Arc<dyn Clock>>,
    trace: Option<TraceHook>,
}

impl SchedulerBuilder {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            clock: None,
            trace: None,
        }
    }

    /// Clock for the default timer wheel.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Hook shared by the default wheel and the pool.
    pub fn with_trace_hook(mut self, hook: TraceHook) -> Self {
        self.trace = Some(hook);
        self
    }

    pub fn build(self) -> Result<Scheduler, ConfigError> {
        self.config.validate()?;

        let mut wheel = TimerWheel::builder(self.config.wheel.clone());
        if let Some(clock) = self.clock {
            wheel = wheel.with_clock(clock);
        }
        let mut pool = WorkerPool::builder(self.config.pool.clone());
        if let Some(hook) = self.trace {
            wheel = wheel.with_trace_hook(Arc::clone(&hook));
            pool = pool.with_trace_hook(hook);
        }

        Ok(Scheduler {
            config: self.config,
            timers: Mutex::new(Arc::new(wheel.build()?)),
            pool: pool.build()?,
            status: AtomicU8::new(IDLE),
        })
    }
}

/// Timer service plus worker pool behind one facade.
pub struct Scheduler {
    config: SchedulerConfig,
    timers: Mutex<Arc<dyn TimerService>>,
    pool: WorkerPool,
    status: AtomicU8,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Replaces the timer engine. Only allowed before [`Scheduler::start`].
    pub fn set_timer_service(&self, service: Arc<dyn TimerService>) -> Result<(), SchedulerError> {
        let mut timers = self.timers.lock();
        if self.status.load(Ordering::Acquire) != IDLE {
            return Err(SchedulerError::AlreadyStarted);
        }
        *timers = service;
        Ok(())
    }

    fn timer_service(&self) -> Arc<dyn TimerService> {
        Arc::clone(&*self.timers.lock())
    }

    pub fn start(&self) -> Result<(), SchedulerError> {
        let timers = self.timers.lock();
        match self
            .status
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(RUNNING) => return Ok(()),
            Err(_) => return Err(SchedulerError::Stopped),
        }
        let service = Arc::clone(&*timers);
        drop(timers);

        log::debug!(
            "starting scheduler ({} workers)",
            self.pool.parallelism()
        );
        self.pool.start()?;
        service.start()
    }

    /// Stops the timer service first so no new work reaches the pool.
    pub fn stop(&self) {
        if self.status.swap(STOPPED, Ordering::AcqRel) == STOPPED {
            return;
        }
        self.timer_service().stop();
        self.pool.stop();
        log::debug!("scheduler stopped");
    }

    /// Runs `function` on a worker once `delay` has elapsed.
    pub fn set_timer(
        &self,
        delay: Duration,
        function: impl TimerFunction,
    ) -> Result<TimerRef, SchedulerError> {
        Schedule::schedule(self, delay, Arc::new(function))
    }

    /// Composed timer that waits for [`TimerRef::debounce`].
    pub fn timer(&self, function: impl TimerFunction) -> Result<TimerRef, SchedulerError> {
        let dispatch = Dispatch::new(Arc::new(function), &self.pool);
        let timer = self.timer_service().timer(Arc::clone(&dispatch) as Arc<dyn TimerFunction>)?;
        Ok(TimerRef::new(Arc::new(ComposedTimer { dispatch, timer })))
    }

    pub fn bind_task(&self, task: impl Task) -> TaskRef {
        self.pool.bind_task(task)
    }

    pub fn submit(&self, task: impl Task) -> Result<TaskRef, SchedulerError> {
        self.pool.submit(task)
    }

    pub fn execute(&self, body: impl FnOnce() + Send + 'static) -> Result<(), SchedulerError> {
        self.pool.execute(body)
    }
}

impl Schedule for Scheduler {
    fn schedule(
        &self,
        delay: Duration,
        function: Arc<dyn TimerFunction>,
    ) -> Result<TimerRef, SchedulerError> {
        let dispatch = Dispatch::new(function, &self.pool);
        let timer = self
            .timer_service()
            .set_timer(delay, Arc::clone(&dispatch) as Arc<dyn TimerFunction>)?;
        Ok(TimerRef::new(Arc::new(ComposedTimer { dispatch, timer })))
    }

    fn submit(&self, task: Arc<dyn Task>) -> Result<TaskRef, SchedulerError> {
        let task = self.pool.bind_arc(task);
        if task.schedule() {
            Ok(task)
        } else {
            Err(SchedulerError::Stopped)
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish()
    }
}
