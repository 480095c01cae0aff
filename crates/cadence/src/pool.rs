//! Fixed-size worker pool.
//!
//! Pending tasks sit in a lock-free queue. A task's state carries a ticket
//! that is bumped every time it is enqueued; a queue item whose ticket no
//! longer matches was cancelled (or superseded) and is discarded when popped,
//! so a task is never pending twice and never runs on two workers at once.

use std::fmt;
use std::sync::atomic::{fence, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_queue::SegQueue;

use crate::config::PoolConfig;
use crate::error::{guard, shield, ConfigError, SchedulerError};
use crate::sync::{Arc, Condvar, Mutex, Weak};
use crate::task::{OnceTask, Task, TaskId};
use crate::trace::{emit, TraceEvent, TraceHook};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unscheduled,
    Scheduled,
    Running { reschedule: bool },
}

struct TaskState {
    phase: Phase,
    ticket: u64,
}

struct TaskEntry {
    id: TaskId,
    task: Arc<dyn Task>,
    pool: Weak<PoolShared>,
    state: Mutex<TaskState>,
}

/// Caller-held handle to a bound task. Clones refer to the same task.
#[derive(Clone)]
pub struct TaskRef {
    entry: Arc<TaskEntry>,
}

impl TaskRef {
    pub fn id(&self) -> TaskId {
        self.entry.id
    }

    /// Pending in the queue, or running with another run requested.
    pub fn is_scheduled(&self) -> bool {
        match self.entry.state.lock().phase {
            Phase::Scheduled => true,
            Phase::Running { reschedule } => reschedule,
            Phase::Unscheduled => false,
        }
    }

    /// Queues the task, or requests a rerun when called while it runs.
    /// Returns `false` only when the pool has stopped.
    pub fn schedule(&self) -> bool {
        match self.entry.pool.upgrade() {
            Some(pool) => pool.schedule(&self.entry),
            None => false,
        }
    }

    /// Withdraws a pending run. Has no effect on a run in progress.
    pub fn cancel(&self) -> bool {
        match self.entry.pool.upgrade() {
            Some(pool) => pool.cancel(&self.entry),
            None => false,
        }
    }
}

impl PartialEq for TaskRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl Eq for TaskRef {}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.entry.id)
            .field("phase", &self.entry.state.lock().phase)
            .finish()
    }
}

struct Queued {
    ticket: u64,
    entry: Arc<TaskEntry>,
}

struct PoolShared {
    config: PoolConfig,
    queue: SegQueue<Queued>,
    status: AtomicU8,
    idle: AtomicUsize,
    sleep: Mutex<()>,
    wake: Condvar,
    next_id: AtomicU64,
    trace: Option<TraceHook>,
}

impl PoolShared {
    fn is_running(&self) -> bool {
        self.status.load(Ordering::Acquire) == RUNNING
    }

    fn is_stopped(&self) -> bool {
        self.status.load(Ordering::Acquire) == STOPPED
    }

    fn bind(self: &Arc<Self>, task: Arc<dyn Task>) -> TaskRef {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        TaskRef {
            entry: Arc::new(TaskEntry {
                id,
                task,
                pool: Arc::downgrade(self),
                state: Mutex::new(TaskState {
                    phase: Phase::Unscheduled,
                    ticket: 0,
                }),
            }),
        }
    }

    fn schedule(&self, entry: &Arc<TaskEntry>) -> bool {
        if self.is_stopped() {
            return false;
        }
        let ticket = {
            let mut state = entry.state.lock();
            match state.phase {
                Phase::Unscheduled => {
                    state.phase = Phase::Scheduled;
                    state.ticket += 1;
                    state.ticket
                }
                Phase::Scheduled => return true,
                Phase::Running { .. } => {
                    state.phase = Phase::Running { reschedule: true };
                    return true;
                }
            }
        };
        self.enqueue(entry, ticket)
    }

    /// Pushes a task already marked Scheduled under `ticket`. Returns `false`
    /// when the pool stopped concurrently; the push is then undone.
    fn enqueue(&self, entry: &Arc<TaskEntry>, ticket: u64) -> bool {
        shield("will_schedule", || entry.task.will_schedule());
        emit(
            self.trace.as_ref(),
            TraceEvent::WillScheduleTask(&TaskRef {
                entry: Arc::clone(entry),
            }),
        );
        self.queue.push(Queued {
            ticket,
            entry: Arc::clone(entry),
        });
        self.wake_one();
        if self.is_stopped() {
            // `stop` may already have drained the queue.
            self.clear_pending();
            return false;
        }
        true
    }

    fn cancel(&self, entry: &Arc<TaskEntry>) -> bool {
        let cancelled = {
            let mut state = entry.state.lock();
            if state.phase == Phase::Scheduled {
                state.phase = Phase::Unscheduled;
                true
            } else {
                false
            }
        };
        if cancelled {
            shield("did_cancel", || entry.task.did_cancel());
            emit(
                self.trace.as_ref(),
                TraceEvent::DidCancelTask(&TaskRef {
                    entry: Arc::clone(entry),
                }),
            );
        }
        cancelled
    }

    /// Pairs with the fence in `wait_for_work`: either the sleeper sees the
    /// pushed item or the producer sees the sleeper.
    fn wake_one(&self) {
        fence(Ordering::SeqCst);
        if self.idle.load(Ordering::SeqCst) > 0 {
            let _sleep = self.sleep.lock();
            self.wake.notify_one();
        }
    }

    fn wait_for_work(&self) {
        let mut sleep = self.sleep.lock();
        self.idle.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if self.queue.is_empty() && self.is_running() {
            self.wake.wait(&mut sleep);
        }
        self.idle.fetch_sub(1, Ordering::SeqCst);
    }

    fn run(&self, item: Queued) {
        let Queued { ticket, entry } = item;
        {
            let mut state = entry.state.lock();
            if state.phase != Phase::Scheduled || state.ticket != ticket {
                return;
            }
            state.phase = Phase::Running { reschedule: false };
        }

        let task = TaskRef {
            entry: Arc::clone(&entry),
        };
        emit(self.trace.as_ref(), TraceEvent::WillRunTask(&task));
        match guard(|| entry.task.run_task(&task)) {
            Ok(()) => emit(self.trace.as_ref(), TraceEvent::DidRunTask(&task)),
            Err(fault) => {
                log::warn!("{} aborted: {fault}", entry.id);
                emit(self.trace.as_ref(), TraceEvent::DidAbortTask(&task, &fault));
            }
        }

        let requeue = {
            let mut state = entry.state.lock();
            let again = state.phase == Phase::Running { reschedule: true } && !self.is_stopped();
            if again {
                state.phase = Phase::Scheduled;
                state.ticket += 1;
                Some(state.ticket)
            } else {
                state.phase = Phase::Unscheduled;
                None
            }
        };
        if let Some(ticket) = requeue {
            self.enqueue(&entry, ticket);
        }
    }

    fn work(self: Arc<Self>, index: usize) {
        log::debug!("{}: worker {index} started", self.config.name);
        while self.is_running() {
            match self.queue.pop() {
                Some(item) => self.run(item),
                None => self.wait_for_work(),
            }
        }
        log::debug!("{}: worker {index} exited", self.config.name);
    }

    /// Discards queued work after the workers have exited.
    fn clear_pending(&self) {
        let mut dropped = 0usize;
        while let Some(Queued { ticket, entry }) = self.queue.pop() {
            let mut state = entry.state.lock();
            if state.phase == Phase::Scheduled && state.ticket == ticket {
                state.phase = Phase::Unscheduled;
                dropped += 1;
            }
        }
        if dropped > 0 {
            log::debug!("{}: dropping {dropped} pending task(s)", self.config.name);
        }
    }
}

/// Builder for a [`WorkerPool`] with a trace hook.
pub struct WorkerPoolBuilder {
    config: PoolConfig,
    trace: Option<TraceHook>,
}

impl WorkerPoolBuilder {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            trace: None,
        }
    }

    pub fn with_trace_hook(mut self, hook: TraceHook) -> Self {
        self.trace = Some(hook);
        self
    }

    pub fn build(self) -> Result<WorkerPool, ConfigError> {
        self.config.validate()?;
        Ok(WorkerPool {
            shared: Arc::new(PoolShared {
                config: self.config,
                queue: SegQueue::new(),
                status: AtomicU8::new(IDLE),
                idle: AtomicUsize::new(0),
                sleep: Mutex::new(()),
                wake: Condvar::new(),
                next_id: AtomicU64::new(0),
                trace: self.trace,
            }),
            workers: Mutex::new(Vec::new()),
        })
    }
}

/// Fixed set of worker threads running bound tasks.
///
/// Tasks scheduled before [`start`] wait in the queue until workers exist.
///
/// [`start`]: WorkerPool::start
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn builder(config: PoolConfig) -> WorkerPoolBuilder {
        WorkerPoolBuilder::new(config)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn parallelism(&self) -> usize {
        self.shared.config.parallelism
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Spawns the workers. Starting a running pool is a no-op.
    pub fn start(&self) -> Result<(), SchedulerError> {
        match self
            .shared
            .status
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(RUNNING) => return Ok(()),
            Err(_) => return Err(SchedulerError::Stopped),
        }

        emit(self.shared.trace.as_ref(), TraceEvent::WillStart);
        let mut workers = self.workers.lock();
        for index in 0..self.shared.config.parallelism {
            let shared = Arc::clone(&self.shared);
            let name = format!("{}-worker-{index}", self.shared.config.name);
            match thread::Builder::new()
                .name(name.clone())
                .spawn(move || shared.work(index))
            {
                Ok(handle) => workers.push(handle),
                Err(source) => {
                    drop(workers);
                    self.stop();
                    return Err(SchedulerError::Spawn { name, source });
                }
            }
        }
        drop(workers);
        emit(self.shared.trace.as_ref(), TraceEvent::DidStart);
        Ok(())
    }

    /// Lets running tasks finish, joins the workers, and drops queued tasks.
    /// A worker that calls `stop` is not joined.
    pub fn stop(&self) {
        if self.shared.status.swap(STOPPED, Ordering::SeqCst) == STOPPED {
            return;
        }
        emit(self.shared.trace.as_ref(), TraceEvent::WillStop);
        {
            let _sleep = self.shared.sleep.lock();
            self.shared.wake.notify_all();
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::error!("{}: worker thread panicked", self.shared.config.name);
            }
        }
        fence(Ordering::SeqCst);
        self.shared.clear_pending();
        emit(self.shared.trace.as_ref(), TraceEvent::DidStop);
    }

    /// Wraps `task` without scheduling it.
    pub fn bind_task(&self, task: impl Task) -> TaskRef {
        self.shared.bind(Arc::new(task))
    }

    pub fn bind_arc(&self, task: Arc<dyn Task>) -> TaskRef {
        self.shared.bind(task)
    }

    /// Binds and schedules `task`.
    pub fn submit(&self, task: impl Task) -> Result<TaskRef, SchedulerError> {
        let task = self.bind_task(task);
        if task.schedule() {
            Ok(task)
        } else {
            Err(SchedulerError::Stopped)
        }
    }

    /// Runs `body` once on a worker.
    pub fn execute(&self, body: impl FnOnce() + Send + 'static) -> Result<(), SchedulerError> {
        self.submit(OnceTask::new(body)).map(|_| ())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.config.name)
            .field("parallelism", &self.shared.config.parallelism)
            .field("queued", &self.shared.queue.len())
            .finish()
    }
}
