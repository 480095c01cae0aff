use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::ManualWheel;
use crate::error::{Outcome, SchedulerError};
use crate::sync::Arc;
use crate::timer::{TimerFunction, TimerRef};

fn noop(_: &TimerRef) -> Outcome {
    Ok(())
}

#[derive(Default)]
struct Counting {
    runs: AtomicUsize,
    cancels: AtomicUsize,
}

impl TimerFunction for Counting {
    fn run_timer(&self, _timer: &TimerRef) -> Outcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn did_cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// Forwards to a shared [`Counting`] so the test keeps a view of it.
struct Shared(Arc<Counting>);

impl TimerFunction for Shared {
    fn run_timer(&self, timer: &TimerRef) -> Outcome {
        self.0.run_timer(timer)
    }

    fn did_cancel(&self) {
        self.0.did_cancel()
    }
}

#[test]
fn delays_map_to_expected_ticks() {
    let h = ManualWheel::new(100, 512);
    let millis = |ms| Duration::from_millis(ms);
    let zero = h.wheel.set_timer(millis(0), noop).unwrap();
    let ninety = h.wheel.set_timer(millis(90), noop).unwrap();
    let hundred = h.wheel.set_timer(millis(100), noop).unwrap();
    let one_ten = h.wheel.set_timer(millis(110), noop).unwrap();
    let full_turn = h.wheel.set_timer(millis(51_200), noop).unwrap();
    let near = h.wheel.set_timer(millis(100), noop).unwrap();
    let far = h.wheel.set_timer(millis(51_300), noop).unwrap();
    h.wheel.start().unwrap();

    h.advance(1);
    for timer in [&zero, &ninety, &hundred, &near] {
        assert_eq!(h.recorder.fired(timer.id()), vec![1], "{timer:?}");
    }
    assert!(h.recorder.fired(far.id()).is_empty());

    h.advance(1);
    assert_eq!(h.recorder.fired(one_ten.id()), vec![2]);

    h.advance(510);
    assert_eq!(h.recorder.fired(full_turn.id()), vec![512]);
    assert!(h.recorder.fired(far.id()).is_empty());

    h.advance(1);
    assert_eq!(h.recorder.fired(far.id()), vec![513]);

    // Another full revolution passes over every bucket again.
    h.advance(512);
    assert_eq!(h.recorder.fired(near.id()), vec![1]);
    assert_eq!(h.recorder.fired(far.id()), vec![513]);
    assert_eq!(h.recorder.fired(full_turn.id()), vec![512]);
    assert_eq!(h.wheel.current_tick(), 1025);
}

#[test]
fn timer_set_while_running_counts_from_current_tick() {
    let h = ManualWheel::new(10, 8);
    h.wheel.start().unwrap();
    h.advance(5);

    let timer = h.wheel.set_timer(Duration::from_millis(25), noop).unwrap();
    h.advance(2);
    assert!(h.recorder.fired(timer.id()).is_empty());
    assert!(timer.is_scheduled());
    h.advance(1);
    assert_eq!(h.recorder.fired(timer.id()), vec![8]);
    assert!(!timer.is_scheduled());
}

#[test]
fn missed_ticks_are_processed_in_order() {
    let h = ManualWheel::new(10, 4);
    let timers: Vec<_> = (1..=6u64)
        .map(|n| h.wheel.set_timer(Duration::from_millis(n * 10), noop).unwrap())
        .collect();
    h.wheel.start().unwrap();
    h.advance(6);

    for (n, timer) in timers.iter().enumerate() {
        assert_eq!(h.recorder.fired(timer.id()), vec![n as u64 + 1]);
    }
    let ticks: Vec<_> = h
        .recorder
        .events()
        .into_iter()
        .filter(|event| event.starts_with("did_tick"))
        .collect();
    assert_eq!(
        ticks,
        ["did_tick(1)", "did_tick(2)", "did_tick(3)", "did_tick(4)", "did_tick(5)", "did_tick(6)"]
    );
}

#[test]
fn cancel_before_fire_prevents_run() {
    let h = ManualWheel::new(100, 16);
    let counting = Arc::new(Counting::default());
    let timer = h
        .wheel
        .set_timer(Duration::from_millis(300), Shared(Arc::clone(&counting)))
        .unwrap();
    h.wheel.start().unwrap();
    h.advance(1);

    assert!(timer.cancel());
    assert!(!timer.cancel());
    assert!(!timer.is_scheduled());
    h.advance(4);

    assert_eq!(counting.runs.load(Ordering::SeqCst), 0);
    assert_eq!(counting.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(h.recorder.count("did_cancel_timer"), 1);
    assert!(h.recorder.fired(timer.id()).is_empty());
}

#[test]
fn cancelled_timer_cannot_be_rearmed() {
    let h = ManualWheel::new(10, 8);
    let timer = h.wheel.set_timer(Duration::from_millis(10), noop).unwrap();
    assert!(timer.cancel());
    assert!(!timer.debounce(Duration::from_millis(10)));
    h.wheel.start().unwrap();
    h.advance(3);
    assert!(h.recorder.fired(timer.id()).is_empty());
}

#[test]
fn debounce_moves_pending_deadline() {
    let h = ManualWheel::new(100, 16);
    let timer = h.wheel.set_timer(Duration::from_millis(200), noop).unwrap();
    h.wheel.start().unwrap();
    h.advance(1);

    assert!(timer.debounce_millis(300));
    assert!(timer.is_scheduled());
    h.advance(2);
    assert!(h.recorder.fired(timer.id()).is_empty());
    h.advance(1);
    assert_eq!(h.recorder.fired(timer.id()), vec![4]);
    assert_eq!(h.recorder.count("did_cancel_timer"), 0);
}

#[test]
fn debounce_after_fire_rearms_same_handle() {
    let h = ManualWheel::new(10, 8);
    let timer = h.wheel.set_timer(Duration::from_millis(10), noop).unwrap();
    h.wheel.start().unwrap();
    h.advance(1);
    assert!(!timer.is_scheduled());

    assert!(timer.debounce_millis(20));
    h.advance(2);
    assert_eq!(h.recorder.fired(timer.id()), vec![1, 3]);
}

#[test]
fn unscheduled_timer_waits_for_debounce() {
    let h = ManualWheel::new(10, 8);
    let timer = h.wheel.timer(noop).unwrap();
    assert!(!timer.is_scheduled());
    h.wheel.start().unwrap();
    h.advance(2);
    assert!(h.recorder.fired(timer.id()).is_empty());

    assert!(timer.debounce_millis(10));
    h.advance(1);
    assert_eq!(h.recorder.fired(timer.id()), vec![3]);
}

#[test]
fn callback_can_reschedule_itself() {
    let h = ManualWheel::new(100, 4);
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let timer = h
        .wheel
        .set_timer(Duration::from_millis(100), move |timer: &TimerRef| -> Outcome {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 < 6 {
                assert!(timer.debounce_millis(100));
                assert!(timer.is_scheduled());
            }
            Ok(())
        })
        .unwrap();
    h.wheel.start().unwrap();
    h.advance(8);

    assert_eq!(runs.load(Ordering::SeqCst), 6);
    assert_eq!(h.recorder.fired(timer.id()), vec![1, 2, 3, 4, 5, 6]);
    assert!(!timer.is_scheduled());
}

#[test]
fn cancel_inside_callback_withdraws_reschedule() {
    let h = ManualWheel::new(10, 8);
    let counting = Arc::new(Counting::default());
    let inner = Arc::clone(&counting);
    let timer = h
        .wheel
        .set_timer(Duration::from_millis(10), move |timer: &TimerRef| -> Outcome {
            inner.run_timer(timer)?;
            assert!(timer.debounce_millis(10));
            assert!(timer.cancel());
            assert!(!timer.is_scheduled());
            Ok(())
        })
        .unwrap();
    h.wheel.start().unwrap();
    h.advance(4);

    assert_eq!(h.recorder.fired(timer.id()), vec![1]);
    assert_eq!(h.recorder.count("did_cancel_timer"), 1);
    assert!(!timer.debounce_millis(10));
}

#[test]
fn failures_are_isolated() {
    let h = ManualWheel::new(10, 8);
    let failing = h
        .wheel
        .set_timer(Duration::from_millis(10), |_: &TimerRef| -> Outcome {
            Err("boom".into())
        })
        .unwrap();
    let panicking = h
        .wheel
        .set_timer(Duration::from_millis(10), |_: &TimerRef| -> Outcome {
            panic!("kaboom")
        })
        .unwrap();
    let healthy = h.wheel.set_timer(Duration::from_millis(10), noop).unwrap();
    let later = h.wheel.set_timer(Duration::from_millis(20), noop).unwrap();
    h.wheel.start().unwrap();
    h.advance(2);

    assert_eq!(h.recorder.fired(healthy.id()), vec![1]);
    assert_eq!(h.recorder.fired(later.id()), vec![2]);
    let aborts: Vec<_> = h
        .recorder
        .events()
        .into_iter()
        .filter(|event| event.starts_with("did_abort_timer"))
        .collect();
    assert_eq!(
        aborts,
        [
            format!("did_abort_timer({}: callback failed: boom)", failing.id()),
            format!("did_abort_timer({}: callback panicked: kaboom)", panicking.id()),
        ]
    );
    assert_eq!(h.recorder.count("did_run_timer"), 2);
}

#[test]
fn same_tick_fires_in_insertion_order() {
    let h = ManualWheel::new(10, 8);
    let order = Arc::new(crate::sync::Mutex::new(Vec::new()));
    for n in 0..5 {
        let order = Arc::clone(&order);
        h.wheel
            .set_timer(Duration::from_millis(30), move |_: &TimerRef| -> Outcome {
                order.lock().push(n);
                Ok(())
            })
            .unwrap();
    }
    h.wheel.start().unwrap();
    h.advance(3);
    assert_eq!(*order.lock(), [0, 1, 2, 3, 4]);
}

#[test]
fn panicking_hook_does_not_stop_driver() {
    let clock = Arc::new(crate::ManualClock::new());
    let wheel = crate::TimerWheel::builder(crate::WheelConfig::new(10, 8).unwrap())
        .with_clock(Arc::clone(&clock) as Arc<dyn crate::Clock>)
        .with_trace_hook(Arc::new(|_: &crate::TraceEvent<'_>| panic!("hook")))
        .build()
        .unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    wheel
        .set_timer(Duration::from_millis(20), move |_: &TimerRef| -> Outcome {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    wheel.start().unwrap();
    clock.advance_millis(20);
    super::wait_until("timer behind panicking hook", || {
        runs.load(Ordering::SeqCst) == 1
    });
    assert_eq!(wheel.current_tick(), 2);
}

#[test]
fn start_is_idempotent_and_stop_is_final() {
    let h = ManualWheel::new(10, 8);
    assert!(!h.wheel.is_running());
    h.wheel.start().unwrap();
    h.wheel.start().unwrap();
    assert!(h.wheel.is_running());
    assert_eq!(h.recorder.count("did_start"), 1);

    let pending = h.wheel.set_timer(Duration::from_millis(50), noop).unwrap();
    h.wheel.stop();
    h.wheel.stop();
    assert!(!h.wheel.is_running());
    assert_eq!(h.recorder.count("will_stop"), 1);
    assert_eq!(h.recorder.count("did_stop"), 1);

    assert!(!pending.is_scheduled());
    assert!(!pending.debounce_millis(10));
    assert!(matches!(
        h.wheel.set_timer(Duration::from_millis(10), noop),
        Err(SchedulerError::Stopped)
    ));
    assert!(matches!(h.wheel.start(), Err(SchedulerError::Stopped)));
    assert!(matches!(h.wheel.timer(noop), Err(SchedulerError::Stopped)));
}

#[test]
fn stop_from_callback_does_not_deadlock() {
    let h = ManualWheel::new(10, 8);
    let wheel = Arc::downgrade(&h.wheel);
    h.wheel
        .set_timer(Duration::from_millis(10), move |_: &TimerRef| -> Outcome {
            if let Some(wheel) = wheel.upgrade() {
                wheel.stop();
            }
            Ok(())
        })
        .unwrap();
    let after = h.wheel.set_timer(Duration::from_millis(30), noop).unwrap();
    h.wheel.start().unwrap();
    h.clock.advance_millis(10);
    h.recorder.wait_for("did_stop", 1);

    assert!(!h.wheel.is_running());
    super::wait_until("pending timers cleared", || !after.is_scheduled());
    h.clock.advance_millis(50);
    assert!(h.recorder.fired(after.id()).is_empty());
}

#[test]
fn failing_callback_keeps_its_reschedule() {
    let h = ManualWheel::new(10, 8);
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let timer = h
        .wheel
        .set_timer(Duration::from_millis(10), move |timer: &TimerRef| -> Outcome {
            let run = counter.fetch_add(1, Ordering::SeqCst);
            if run < 2 {
                assert!(timer.debounce_millis(10));
            }
            match run {
                0 => Err("first run fails".into()),
                1 => panic!("second run panics"),
                _ => Ok(()),
            }
        })
        .unwrap();
    h.wheel.start().unwrap();
    h.advance(5);

    assert_eq!(h.recorder.fired(timer.id()), vec![1, 2, 3]);
    assert_eq!(h.recorder.count("did_abort_timer"), 2);
    assert_eq!(h.recorder.count("did_run_timer"), 1);
    assert!(!timer.is_scheduled());
}

struct LoudCancel;

impl TimerFunction for LoudCancel {
    fn run_timer(&self, _timer: &TimerRef) -> Outcome {
        Ok(())
    }

    fn did_cancel(&self) {
        panic!("did_cancel exploded");
    }
}

#[test]
fn panicking_cancel_hook_still_cancels() {
    let h = ManualWheel::new(10, 8);
    let timer = h.wheel.set_timer(Duration::from_millis(20), LoudCancel).unwrap();
    let other = h.wheel.set_timer(Duration::from_millis(20), noop).unwrap();
    h.wheel.start().unwrap();

    assert!(timer.cancel());
    assert!(!timer.is_scheduled());
    assert!(!timer.cancel());
    assert_eq!(h.recorder.count("did_cancel_timer"), 1);
    h.advance(3);
    assert!(h.recorder.fired(timer.id()).is_empty());
    assert_eq!(h.recorder.fired(other.id()), vec![2]);
}
