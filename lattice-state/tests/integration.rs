//! Integration Tests for Reactive System
//!
//! These tests verify that signals, computeds, and effects work together
//! correctly through a shared runtime.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use lattice_state::config::RuntimeConfig;
use lattice_state::reactive::{Computed, Effect, Runtime, Signal, Tracker};
use lattice_state::ReactiveError;

/// Test that a computed tracks signal dependencies without manual marking.
#[test]
fn computed_tracks_signal_dependency() {
    let rt = Runtime::new();
    let signal = Signal::new(&rt, 10);

    let s = signal.clone();
    let computed = Computed::new(&rt, move |cx| s.get(cx) * 2);

    assert_eq!(computed.get_untracked(), 20);

    signal.set(5).unwrap();
    assert!(computed.is_dirty());
    assert_eq!(computed.get_untracked(), 10);
}

/// Test that an effect reruns on its own when a dependency changes.
#[test]
fn effect_tracks_signal_dependency() {
    let rt = Runtime::new();
    let signal = Signal::new(&rt, 0);
    let observed = Arc::new(AtomicI32::new(-1));

    let (s, observed_clone) = (signal.clone(), observed.clone());
    let _effect = Effect::new(&rt, move |cx| {
        observed_clone.store(s.get(cx), Ordering::SeqCst);
    });
    assert_eq!(observed.load(Ordering::SeqCst), 0);

    signal.set(42).unwrap();
    assert_eq!(observed.load(Ordering::SeqCst), 42);
}

/// Writing the current value again is a no-op.
#[test]
fn setting_equal_value_notifies_nobody() {
    let rt = Runtime::new();
    let signal = Signal::new(&rt, 7);

    let s = signal.clone();
    let effect = Effect::new(&rt, move |cx| {
        s.get(cx);
    });

    signal.set(7).unwrap();
    signal.set(7).unwrap();
    assert_eq!(effect.run_count(), 1);
    assert_eq!(signal.version(), 0);
}

/// Diamond: base feeds a and b, c reads both. One write to base must run
/// c's effect exactly once and never with a mix of old and new values.
#[test]
fn diamond_update_is_glitch_free() {
    let rt = Runtime::new();
    let base = Signal::new(&rt, 1);

    let b1 = base.clone();
    let a = Computed::new(&rt, move |cx| b1.get(cx) + 1);
    let b2 = base.clone();
    let b = Computed::new(&rt, move |cx| b2.get(cx) * 10);

    let computes = Arc::new(AtomicI32::new(0));
    let (a1, b1, computes_clone) = (a.clone(), b.clone(), computes.clone());
    let c = Computed::new(&rt, move |cx| {
        computes_clone.fetch_add(1, Ordering::SeqCst);
        (a1.get(cx), b1.get(cx))
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (c1, seen_clone) = (c.clone(), seen.clone());
    let effect = Effect::new(&rt, move |cx| {
        seen_clone.lock().push(c1.get(cx));
    });

    assert_eq!(computes.load(Ordering::SeqCst), 1);

    base.set(2).unwrap();
    assert_eq!(computes.load(Ordering::SeqCst), 2);
    base.set(3).unwrap();
    assert_eq!(computes.load(Ordering::SeqCst), 3);

    assert_eq!(*seen.lock(), vec![(2, 10), (3, 20), (4, 30)]);
    assert_eq!(effect.run_count(), 3);
}

/// An effect reached through several changed inputs inside one batch runs
/// once, after the batch.
#[test]
fn batch_runs_each_effect_once() {
    let rt = Runtime::new();
    let first = Signal::new(&rt, "Ada".to_string());
    let last = Signal::new(&rt, "Lovelace".to_string());

    let names = Arc::new(Mutex::new(Vec::new()));
    let (f, l, names_clone) = (first.clone(), last.clone(), names.clone());
    let effect = Effect::new(&rt, move |cx| {
        names_clone.lock().push(format!("{} {}", f.get(cx), l.get(cx)));
    });

    rt.batch(|| {
        first.set("Grace".to_string()).unwrap();
        last.set("Hopper".to_string()).unwrap();
        // Nothing has propagated yet.
        assert_eq!(effect.run_count(), 1);
    })
    .unwrap();

    assert_eq!(effect.run_count(), 2);
    assert_eq!(*names.lock(), vec!["Ada Lovelace", "Grace Hopper"]);
}

/// A computed that stops reading a signal is no longer invalidated by it.
#[test]
fn dependencies_follow_the_last_run() {
    let rt = Runtime::new();
    let use_left = Signal::new(&rt, true);
    let left = Signal::new(&rt, 1);
    let right = Signal::new(&rt, 2);
    let runs = Arc::new(AtomicI32::new(0));

    let (u, l, r, runs_clone) = (use_left.clone(), left.clone(), right.clone(), runs.clone());
    let picked = Computed::new(&rt, move |cx| {
        runs_clone.fetch_add(1, Ordering::SeqCst);
        if u.get(cx) {
            l.get(cx)
        } else {
            r.get(cx)
        }
    });

    let p = picked.clone();
    let _effect = Effect::new(&rt, move |cx| {
        p.get(cx);
    });
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(left.subscriber_count(), 1);

    use_left.set(false).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(left.subscriber_count(), 0);
    assert_eq!(right.subscriber_count(), 1);

    left.set(100).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    right.set(3).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(picked.get_untracked(), 3);
}

/// A computed whose value did not change stops propagation.
#[test]
fn unchanged_computed_does_not_rerun_downstream() {
    let rt = Runtime::new();
    let number = Signal::new(&rt, 2);

    let n = number.clone();
    let parity = Computed::new(&rt, move |cx| n.get(cx) % 2);

    let p = parity.clone();
    let effect = Effect::new(&rt, move |cx| {
        p.get(cx);
    });

    number.set(4).unwrap();
    number.set(6).unwrap();
    assert_eq!(effect.run_count(), 1);

    number.set(7).unwrap();
    assert_eq!(effect.run_count(), 2);
}

/// A panic inside a batch still flushes the writes made before it.
#[test]
fn panicking_batch_still_flushes() {
    let rt = Runtime::new();
    let signal = Signal::new(&rt, 0);
    let observed = Arc::new(AtomicI32::new(0));

    let (s, observed_clone) = (signal.clone(), observed.clone());
    let _effect = Effect::new(&rt, move |cx| {
        observed_clone.store(s.get(cx), Ordering::SeqCst);
    });

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        rt.batch(|| {
            signal.set(9).unwrap();
            panic!("batch body failed");
        })
    }));

    assert!(outcome.is_err());
    assert_eq!(observed.load(Ordering::SeqCst), 9);
}

/// A failing computed surfaces at the effect that reads it, which is then
/// disabled while the rest of the flush carries on.
#[test]
fn failure_is_isolated_to_reading_effect() {
    let rt = Runtime::new();
    let signal = Signal::new(&rt, 1);

    let s = signal.clone();
    let checked = Computed::new(&rt, move |cx| {
        let value = s.get(cx);
        assert!(value > 0, "value must be positive");
        value
    });

    let c = checked.clone();
    let fragile = Effect::new(&rt, move |cx| {
        c.get(cx);
    });

    let healthy_runs = Arc::new(AtomicI32::new(0));
    let (s, runs) = (signal.clone(), healthy_runs.clone());
    let healthy = Effect::new(&rt, move |cx| {
        s.get(cx);
        runs.fetch_add(1, Ordering::SeqCst);
    });

    let err = signal.set(-1).unwrap_err();
    assert!(matches!(err, ReactiveError::Evaluation { .. }));
    assert!(fragile.is_disabled());
    assert!(!healthy.is_disabled());
    assert_eq!(healthy_runs.load(Ordering::SeqCst), 2);

    // Fix the input and bring the effect back.
    signal.set(5).unwrap();
    fragile.enable().unwrap();
    assert!(!fragile.is_disabled());
}

/// Effects that keep feeding each other are cut off.
#[test]
fn runaway_effects_hit_flush_limit() {
    let rt = Runtime::with_config(RuntimeConfig { max_flush_rounds: 5 });
    let ping = Signal::new(&rt, 0);
    let pong = Signal::new(&rt, 0);

    let (a, b) = (ping.clone(), pong.clone());
    let _forward = Effect::new(&rt, move |cx| b.set(a.get(cx) + 1));
    let (a, b) = (ping.clone(), pong.clone());
    let _back = Effect::new(&rt, move |cx| a.set(b.get(cx) + 1));

    let result = rt.flush().and_then(|()| ping.set(100));
    assert_eq!(result, Err(ReactiveError::FlushLimit { rounds: 5 }));
}

/// Reads through an untracked tracker subscribe nothing.
#[test]
fn untracked_reads_do_not_subscribe() {
    let rt = Runtime::new();
    let signal = Signal::new(&rt, 1);

    let s = signal.clone();
    let effect = Effect::new(&rt, move |_cx| {
        s.get(&Tracker::untracked());
    });

    signal.set(2).unwrap();
    assert_eq!(effect.run_count(), 1);
    assert_eq!(signal.subscriber_count(), 0);
}

/// Independent runtimes never see each other's nodes.
#[test]
fn runtimes_are_isolated() {
    let first = Runtime::new();
    let second = Runtime::new();

    let _a = Signal::new(&first, 1);
    let _b = Signal::new(&first, 2);
    let _c = Signal::new(&second, 3);

    assert_eq!(first.node_count(), 2);
    assert_eq!(second.node_count(), 1);
}
