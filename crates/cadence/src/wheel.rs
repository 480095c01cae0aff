//! Hashed timer wheel driven by a dedicated thread.
//!
//! The wheel has `tick_count` buckets. A timer due at absolute tick `t` lives
//! in bucket `t % tick_count`, grouped under revolution `t / tick_count`, so a
//! bucket can hold timers for many revolutions at once and the driver only
//! touches the group that is due.
//!
//! Lock order is entry, then bucket. The driver never holds a bucket lock
//! while it locks an entry or runs a callback: it detaches the due revolution
//! in one step and fires it with no bucket locked.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::WheelConfig;
use crate::error::{guard, shield, ConfigError, SchedulerError};
use crate::sync::{Arc, Mutex, Weak};
use crate::timer::{TimerFunction, TimerHandle, TimerId, TimerRef, TimerService};
use crate::trace::{emit, TraceEvent, TraceHook};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unscheduled,
    /// Waiting in `bucket[deadline % tick_count]` at index `slot` of its
    /// revolution. Stays in this phase after the driver detaches the
    /// revolution and until the driver picks the entry up.
    Scheduled { deadline: u64, slot: usize },
    Running,
    Cancelled,
}

struct EntryState {
    phase: Phase,
    /// Delay requested while the entry could not be relocated directly.
    reschedule: Option<Duration>,
    /// Set when a pending reschedule was cancelled mid-run.
    cancelled: bool,
}

struct TimerEntry {
    id: TimerId,
    function: Arc<dyn TimerFunction>,
    wheel: Weak<WheelShared>,
    me: Weak<TimerEntry>,
    state: Mutex<EntryState>,
}

fn timer_ref(entry: &Arc<TimerEntry>) -> TimerRef {
    TimerRef::new(Arc::clone(entry) as Arc<dyn TimerHandle>)
}

impl TimerHandle for TimerEntry {
    fn id(&self) -> TimerId {
        self.id
    }

    fn is_scheduled(&self) -> bool {
        let state = self.state.lock();
        match state.phase {
            Phase::Scheduled { .. } => true,
            Phase::Running => state.reschedule.is_some(),
            Phase::Unscheduled | Phase::Cancelled => false,
        }
    }

    fn cancel(&self) -> bool {
        let Some(wheel) = self.wheel.upgrade() else {
            return false;
        };
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        wheel.cancel(&me)
    }

    fn debounce(&self, delay: Duration) -> bool {
        let Some(wheel) = self.wheel.upgrade() else {
            return false;
        };
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        wheel.debounce(&me, delay)
    }
}

struct Slot {
    seq: u64,
    entry: Arc<TimerEntry>,
}

/// Entries of one bucket that share a revolution. Freed slots are recycled.
#[derive(Default)]
struct Revolution {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    live: usize,
}

impl Revolution {
    fn insert(&mut self, slot: Slot) -> usize {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    fn remove(&mut self, index: usize, entry: &Arc<TimerEntry>) -> bool {
        match self.slots.get(index) {
            Some(Some(slot)) if Arc::ptr_eq(&slot.entry, entry) => {}
            _ => return false,
        }
        self.slots[index] = None;
        self.free.push(index);
        self.live -= 1;
        true
    }

    /// Entries in insertion order.
    fn into_entries(self) -> Vec<Arc<TimerEntry>> {
        let mut due: Vec<Slot> = self.slots.into_iter().flatten().collect();
        due.sort_unstable_by_key(|slot| slot.seq);
        due.into_iter().map(|slot| slot.entry).collect()
    }
}

#[derive(Default)]
struct Bucket {
    revolutions: HashMap<u64, Revolution>,
    /// Last tick drained from this bucket; 0 before the first pass.
    drained: u64,
    seq: u64,
}

impl Bucket {
    /// Returns `None` when `deadline` has already been drained from this bucket.
    fn insert(&mut self, deadline: u64, revolution: u64, entry: &Arc<TimerEntry>) -> Option<usize> {
        if deadline <= self.drained {
            return None;
        }
        self.seq += 1;
        let slot = Slot {
            seq: self.seq,
            entry: Arc::clone(entry),
        };
        Some(self.revolutions.entry(revolution).or_default().insert(slot))
    }

    fn remove(&mut self, revolution: u64, index: usize, entry: &Arc<TimerEntry>) -> bool {
        let Some(group) = self.revolutions.get_mut(&revolution) else {
            return false;
        };
        let removed = group.remove(index, entry);
        if removed && group.live == 0 {
            self.revolutions.remove(&revolution);
        }
        removed
    }

    fn drain(&mut self, tick: u64, revolution: u64) -> Option<Revolution> {
        self.drained = tick;
        self.revolutions.remove(&revolution)
    }
}

struct WheelShared {
    config: WheelConfig,
    buckets: Box<[Mutex<Bucket>]>,
    tick: AtomicU64,
    status: AtomicU8,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    trace: Option<TraceHook>,
}

impl WheelShared {
    fn tick_count(&self) -> u64 {
        self.config.tick_count as u64
    }

    fn is_running(&self) -> bool {
        self.status.load(Ordering::Acquire) == RUNNING
    }

    fn is_stopped(&self) -> bool {
        self.status.load(Ordering::Acquire) == STOPPED
    }

    fn delay_ticks(&self, delay: Duration) -> u64 {
        let ticks = delay.as_millis().div_ceil(u128::from(self.config.tick_millis));
        u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
    }

    fn new_entry(self: &Arc<Self>, function: Arc<dyn TimerFunction>) -> Arc<TimerEntry> {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        Arc::new_cyclic(|me| TimerEntry {
            id,
            function,
            wheel: Arc::downgrade(self),
            me: me.clone(),
            state: Mutex::new(EntryState {
                phase: Phase::Unscheduled,
                reschedule: None,
                cancelled: false,
            }),
        })
    }

    /// Places `entry` `delay` after the current tick. The caller holds the
    /// entry lock and stores the returned phase.
    fn insert(&self, entry: &Arc<TimerEntry>, delay: Duration) -> Phase {
        let ticks = self.delay_ticks(delay);
        let tick_count = self.tick_count();
        loop {
            let deadline = self.tick.load(Ordering::Acquire).saturating_add(ticks);
            let index = (deadline % tick_count) as usize;
            let mut bucket = self.buckets[index].lock();
            if let Some(slot) = bucket.insert(deadline, deadline / tick_count, entry) {
                return Phase::Scheduled { deadline, slot };
            }
            // The driver passed this bucket between reading the tick and
            // taking the lock; the retry reads the advanced tick.
        }
    }

    /// Inserts `entry` and records its phase. If the wheel stopped meanwhile
    /// the insert may have missed the final sweep, so it is undone and the
    /// entry left Unscheduled.
    fn arm(&self, entry: &Arc<TimerEntry>, state: &mut EntryState, delay: Duration) -> bool {
        state.phase = self.insert(entry, delay);
        if !self.is_stopped() {
            return true;
        }
        if let Phase::Scheduled { deadline, slot } = state.phase {
            self.unlink(entry, deadline, slot);
        }
        state.phase = Phase::Unscheduled;
        state.reschedule = None;
        false
    }

    fn unlink(&self, entry: &Arc<TimerEntry>, deadline: u64, slot: usize) -> bool {
        let tick_count = self.tick_count();
        let index = (deadline % tick_count) as usize;
        self.buckets[index]
            .lock()
            .remove(deadline / tick_count, slot, entry)
    }

    fn schedule(&self, entry: &Arc<TimerEntry>, delay: Duration) -> Result<(), SchedulerError> {
        if self.is_stopped() {
            return Err(SchedulerError::Stopped);
        }
        if !self.arm(entry, &mut entry.state.lock(), delay) {
            return Err(SchedulerError::Stopped);
        }
        emit(
            self.trace.as_ref(),
            TraceEvent::WillScheduleTimer(&timer_ref(entry)),
        );
        Ok(())
    }

    fn cancel(&self, entry: &Arc<TimerEntry>) -> bool {
        let mut state = entry.state.lock();
        let cancelled = match state.phase {
            Phase::Scheduled { deadline, slot } => {
                if self.unlink(entry, deadline, slot) {
                    state.phase = Phase::Cancelled;
                    state.reschedule = None;
                    true
                } else {
                    // Detached by the driver: that run goes ahead, only a
                    // reschedule requested since can still be withdrawn.
                    Self::withdraw_reschedule(&mut state)
                }
            }
            Phase::Running => Self::withdraw_reschedule(&mut state),
            Phase::Unscheduled | Phase::Cancelled => false,
        };
        drop(state);

        if cancelled {
            shield("did_cancel", || entry.function.did_cancel());
            emit(self.trace.as_ref(), TraceEvent::DidCancelTimer(&timer_ref(entry)));
        }
        cancelled
    }

    fn withdraw_reschedule(state: &mut EntryState) -> bool {
        if state.reschedule.take().is_some() {
            state.cancelled = true;
            true
        } else {
            false
        }
    }

    fn debounce(&self, entry: &Arc<TimerEntry>, delay: Duration) -> bool {
        if self.is_stopped() {
            return false;
        }
        let mut state = entry.state.lock();
        let inserted = match state.phase {
            Phase::Cancelled => return false,
            Phase::Scheduled { deadline, slot } => {
                if self.unlink(entry, deadline, slot) {
                    if !self.arm(entry, &mut state, delay) {
                        return false;
                    }
                    true
                } else {
                    state.reschedule = Some(delay);
                    state.cancelled = false;
                    false
                }
            }
            Phase::Running => {
                state.reschedule = Some(delay);
                state.cancelled = false;
                false
            }
            Phase::Unscheduled => {
                if !self.arm(entry, &mut state, delay) {
                    return false;
                }
                true
            }
        };
        drop(state);

        if inserted {
            emit(self.trace.as_ref(), TraceEvent::WillScheduleTimer(&timer_ref(entry)));
        }
        true
    }

    fn process_tick(&self, tick: u64) {
        self.tick.store(tick, Ordering::Release);
        let tick_count = self.tick_count();
        let index = (tick % tick_count) as usize;
        let detached = self.buckets[index].lock().drain(tick, tick / tick_count);
        if let Some(revolution) = detached {
            let entries = revolution.into_entries();
            log::trace!("tick {tick}: firing {} timer(s)", entries.len());
            for entry in entries {
                self.fire(tick, &entry);
            }
        }
        emit(self.trace.as_ref(), TraceEvent::DidTick(tick));
    }

    fn fire(&self, tick: u64, entry: &Arc<TimerEntry>) {
        {
            let mut state = entry.state.lock();
            match state.phase {
                Phase::Scheduled { deadline, .. } if deadline == tick => {
                    state.phase = Phase::Running;
                }
                phase => {
                    log::trace!("skipping {} in phase {phase:?} at tick {tick}", entry.id);
                    return;
                }
            }
        }

        let timer = timer_ref(entry);
        emit(self.trace.as_ref(), TraceEvent::WillRunTimer(&timer));
        match guard(|| entry.function.run_timer(&timer)) {
            Ok(()) => emit(self.trace.as_ref(), TraceEvent::DidRunTimer(&timer)),
            Err(fault) => {
                log::warn!("{} aborted at tick {tick}: {fault}", entry.id);
                emit(self.trace.as_ref(), TraceEvent::DidAbortTimer(&timer, &fault));
            }
        }

        let rescheduled = {
            let mut state = entry.state.lock();
            if std::mem::take(&mut state.cancelled) {
                state.reschedule = None;
                state.phase = Phase::Cancelled;
                false
            } else if let Some(delay) = state.reschedule.take() {
                if self.is_stopped() {
                    state.phase = Phase::Unscheduled;
                    false
                } else {
                    state.phase = self.insert(entry, delay);
                    true
                }
            } else {
                state.phase = Phase::Unscheduled;
                false
            }
        };
        if rescheduled {
            emit(self.trace.as_ref(), TraceEvent::WillScheduleTimer(&timer));
        }
    }

    /// Detaches every pending entry after the driver has exited.
    fn clear_pending(&self) {
        let mut pending = Vec::new();
        for bucket in self.buckets.iter() {
            let revolutions = std::mem::take(&mut bucket.lock().revolutions);
            pending.extend(revolutions.into_values().flat_map(Revolution::into_entries));
        }
        if !pending.is_empty() {
            log::debug!("{}: dropping {} pending timer(s)", self.config.name, pending.len());
        }
        for entry in pending {
            let mut state = entry.state.lock();
            if matches!(state.phase, Phase::Scheduled { .. }) {
                state.phase = Phase::Unscheduled;
                state.reschedule = None;
            }
        }
    }

    /// Tick `k` is processed once the clock reaches `origin + k * tick_millis`.
    fn drive(self: Arc<Self>, origin: Duration) {
        let tick_millis = self.config.tick_millis;
        log::debug!(
            "{}: driver started ({}ms x {} buckets)",
            self.config.name,
            tick_millis,
            self.config.tick_count
        );
        while self.is_running() {
            let next = self.tick.load(Ordering::Acquire) + 1;
            let boundary = origin + Duration::from_millis(tick_millis.saturating_mul(next));
            if self.clock.now() < boundary {
                self.clock.park_until(boundary);
                continue;
            }
            self.process_tick(next);
        }
        self.clear_pending();
        log::debug!(
            "{}: driver exited at tick {}",
            self.config.name,
            self.tick.load(Ordering::Acquire)
        );
    }
}

/// Builder for a [`TimerWheel`] with a custom clock or trace hook.
pub struct TimerWheelBuilder {
    config: WheelConfig,
    clock: Option<Arc<dyn Clock>>,
    trace: Option<TraceHook>,
}

impl TimerWheelBuilder {
    pub fn new(config: WheelConfig) -> Self {
        Self {
            config,
            clock: None,
            trace: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_trace_hook(mut self, hook: TraceHook) -> Self {
        self.trace = Some(hook);
        self
    }

    pub fn build(self) -> Result<TimerWheel, ConfigError> {
        self.config.validate()?;
        let buckets = (0..self.config.tick_count)
            .map(|_| Mutex::new(Bucket::default()))
            .collect();
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        Ok(TimerWheel {
            shared: Arc::new(WheelShared {
                config: self.config,
                buckets,
                tick: AtomicU64::new(0),
                status: AtomicU8::new(IDLE),
                next_id: AtomicU64::new(0),
                clock,
                trace: self.trace,
            }),
            driver: Mutex::new(None),
        })
    }
}

/// Hashed timer wheel with one driver thread.
///
/// Callbacks run on the driver thread. Timers may be set before [`start`];
/// they count ticks from the moment the driver starts.
///
/// [`start`]: TimerWheel::start
pub struct TimerWheel {
    shared: Arc<WheelShared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TimerWheel {
    /// Wheel with the system clock and no trace hook.
    pub fn new(config: WheelConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn builder(config: WheelConfig) -> TimerWheelBuilder {
        TimerWheelBuilder::new(config)
    }

    pub fn config(&self) -> &WheelConfig {
        &self.shared.config
    }

    /// Ticks processed since start; the first tick is 1.
    pub fn current_tick(&self) -> u64 {
        self.shared.tick.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Spawns the driver thread. Starting a running wheel is a no-op.
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
        let shared = Arc::clone(&self.shared);
        let origin = self.shared.clock.now();
        let spawned = thread::Builder::new()
            .name(self.shared.config.name.clone())
            .spawn(move || shared.drive(origin));
        match spawned {
            Ok(handle) => *self.driver.lock() = Some(handle),
            Err(source) => {
                self.shared.status.store(IDLE, Ordering::Release);
                return Err(SchedulerError::Spawn {
                    name: self.shared.config.name.clone(),
                    source,
                });
            }
        }
        emit(self.shared.trace.as_ref(), TraceEvent::DidStart);
        Ok(())
    }

    /// Halts the driver after the tick in progress and joins it, unless called
    /// from a timer callback. Pending timers become unscheduled.
    pub fn stop(&self) {
        if self.shared.status.swap(STOPPED, Ordering::SeqCst) == STOPPED {
            return;
        }
        emit(self.shared.trace.as_ref(), TraceEvent::WillStop);
        self.shared.clock.unpark();
        match self.driver.lock().take() {
            Some(handle) if handle.thread().id() != thread::current().id() => {
                if handle.join().is_err() {
                    log::error!("{}: driver thread panicked", self.shared.config.name);
                }
            }
            Some(_) => {}
            None => self.shared.clear_pending(),
        }
        emit(self.shared.trace.as_ref(), TraceEvent::DidStop);
    }

    /// Unscheduled timer, armed later with [`TimerRef::debounce`].
    pub fn timer(&self, function: impl TimerFunction) -> Result<TimerRef, SchedulerError> {
        TimerService::timer(self, Arc::new(function))
    }

    pub fn set_timer(
        &self,
        delay: Duration,
        function: impl TimerFunction,
    ) -> Result<TimerRef, SchedulerError> {
        TimerService::set_timer(self, delay, Arc::new(function))
    }
}

impl TimerService for TimerWheel {
    fn start(&self) -> Result<(), SchedulerError> {
        TimerWheel::start(self)
    }

    fn stop(&self) {
        TimerWheel::stop(self)
    }

    fn timer(&self, function: Arc<dyn TimerFunction>) -> Result<TimerRef, SchedulerError> {
        if self.shared.is_stopped() {
            return Err(SchedulerError::Stopped);
        }
        Ok(TimerRef::new(self.shared.new_entry(function)))
    }

    fn set_timer(
        &self,
        delay: Duration,
        function: Arc<dyn TimerFunction>,
    ) -> Result<TimerRef, SchedulerError> {
        let entry = self.shared.new_entry(function);
        self.shared.schedule(&entry, delay)?;
        Ok(TimerRef::new(entry))
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerWheel")
            .field("name", &self.shared.config.name)
            .field("tick_millis", &self.shared.config.tick_millis)
            .field("tick_count", &self.shared.config.tick_count)
            .field("current_tick", &self.current_tick())
            .finish()
    }
}
