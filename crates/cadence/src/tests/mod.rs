//! Shared harness for the crate's behavioural tests.
//!
//! Wheels under test run on a [`ManualClock`]; a [`Recorder`] installed as the
//! trace hook records every event and lets a test block until the driver has
//! finished a given tick.

mod wheel;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::clock::ManualClock;
use crate::config::WheelConfig;
use crate::sync::{Arc, Condvar, Mutex};
use crate::timer::TimerId;
use crate::trace::{TraceEvent, TraceHook};
use crate::wheel::TimerWheel;

const PATIENCE: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RecorderState {
    events: Vec<String>,
    tick: u64,
    fired: HashMap<TimerId, Vec<u64>>,
}

/// Trace hook that remembers what it saw.
#[derive(Default)]
pub(crate) struct Recorder {
    state: Mutex<RecorderState>,
    cvar: Condvar,
}

impl Recorder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn hook(self: &Arc<Self>) -> TraceHook {
        let recorder = Arc::clone(self);
        Arc::new(move |event: &TraceEvent<'_>| recorder.record(event))
    }

    fn record(&self, event: &TraceEvent<'_>) {
        let mut state = self.state.lock();
        match event {
            TraceEvent::DidTick(tick) => state.tick = *tick,
            TraceEvent::WillRunTimer(timer) => {
                let tick = state.tick + 1;
                state.fired.entry(timer.id()).or_default().push(tick);
            }
            _ => {}
        }
        state.events.push(event.to_string());
        drop(state);
        self.cvar.notify_all();
    }

    /// Last tick reported by a driver.
    pub(crate) fn tick(&self) -> u64 {
        self.state.lock().tick
    }

    /// Blocks until the driver reports `tick` as processed.
    pub(crate) fn wait_for_tick(&self, tick: u64) {
        let deadline = Instant::now() + PATIENCE;
        let mut state = self.state.lock();
        while state.tick < tick {
            if self.cvar.wait_until(&mut state, deadline).timed_out() {
                panic!("tick {tick} not reached, stuck at {}", state.tick);
            }
        }
    }

    /// Blocks until `count` events named `name` have been seen.
    pub(crate) fn wait_for(&self, name: &str, count: usize) {
        let deadline = Instant::now() + PATIENCE;
        let mut state = self.state.lock();
        while count_named(&state.events, name) < count {
            if self.cvar.wait_until(&mut state, deadline).timed_out() {
                panic!("waited for {count} x {name}, events: {:?}", state.events);
            }
        }
    }

    /// Ticks at which the timer started running.
    pub(crate) fn fired(&self, id: TimerId) -> Vec<u64> {
        self.state.lock().fired.get(&id).cloned().unwrap_or_default()
    }

    pub(crate) fn count(&self, name: &str) -> usize {
        count_named(&self.state.lock().events, name)
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }
}

fn count_named(events: &[String], name: &str) -> usize {
    events
        .iter()
        .filter(|event| *event == name || event.starts_with(&format!("{name}(")))
        .count()
}

/// Wheel on a manual clock with a recorder attached; not started.
pub(crate) struct ManualWheel {
    pub(crate) wheel: Arc<TimerWheel>,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) recorder: Arc<Recorder>,
}

impl ManualWheel {
    pub(crate) fn new(tick_millis: u64, tick_count: usize) -> Self {
        let clock = Arc::new(ManualClock::new());
        let recorder = Recorder::new();
        let wheel = TimerWheel::builder(WheelConfig::new(tick_millis, tick_count).unwrap())
            .with_clock(Arc::clone(&clock) as Arc<dyn crate::Clock>)
            .with_trace_hook(recorder.hook())
            .build()
            .unwrap();
        Self {
            wheel: Arc::new(wheel),
            clock,
            recorder,
        }
    }

    /// Advances the clock by `ticks` whole ticks and waits for the driver.
    pub(crate) fn advance(&self, ticks: u64) {
        let target = self.wheel.current_tick() + ticks;
        self.clock
            .advance_millis(self.wheel.config().tick_millis * ticks);
        self.recorder.wait_for_tick(target);
    }
}

/// Polls `condition` until it holds.
pub(crate) fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// True when `condition` stays false for a short while.
pub(crate) fn stays_false(condition: impl Fn() -> bool) -> bool {
    let until = Instant::now() + Duration::from_millis(50);
    while Instant::now() < until {
        if condition() {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}
