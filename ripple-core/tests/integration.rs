//! Integration Tests for the Reactive Engine
//!
//! These tests verify that sources, derived values and subscribers work
//! together correctly through the public API.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use ripple_core::reactive::ReactiveContext;
use ripple_core::{
    batch, is_batching, is_tracking, observe_batches, pause_tracking, untrack, BatchEvent,
    Derived, DerivedOptions, Disposer, Error, Source, SourceOptions, Subscriber,
};

fn counter() -> Rc<Cell<u32>> {
    Rc::new(Cell::new(0))
}

fn bump(count: &Rc<Cell<u32>>) {
    count.set(count.get() + 1);
}

/// Test that every node of a diamond recomputes exactly once per change.
#[test]
fn lazy_diamond_recomputes_each_node_once() {
    let (cb, cc, cd) = (counter(), counter(), counter());
    let a = Source::new(1);

    let (a1, n) = (a.clone(), cb.clone());
    let b = Derived::new(move || {
        bump(&n);
        Ok(a1.get() + 1)
    });
    let (a2, n) = (a.clone(), cc.clone());
    let c = Derived::new(move || {
        bump(&n);
        Ok(a2.get() * 2)
    });
    let (b1, c1, n) = (b.clone(), c.clone(), cd.clone());
    let d = Derived::new(move || {
        bump(&n);
        Ok(b1.get()? + c1.get()?)
    });

    assert_eq!(d.get().unwrap(), 4);
    a.set(2).unwrap();
    assert_eq!(d.get().unwrap(), 7);
    assert_eq!((cb.get(), cc.get(), cd.get()), (2, 2, 2));

    // Same guarantee while a subscriber keeps the diamond watched
    let seen = Rc::new(Cell::new(0));
    let (d1, s) = (d.clone(), seen.clone());
    let subscriber = Subscriber::new(move || {
        s.set(d1.get()?);
        Ok(())
    })
    .unwrap();

    a.set(3).unwrap();
    assert_eq!(seen.get(), 10);
    assert_eq!((cb.get(), cc.get(), cd.get()), (3, 3, 3));
    assert_eq!(subscriber.run_count(), 2);

    // Reading again changes nothing
    assert_eq!(d.get().unwrap(), 10);
    assert_eq!(cd.get(), 3);
}

/// Test that a branch no longer read stops driving recomputation.
#[test]
fn dynamic_dependency_is_dropped() {
    let calls = counter();
    let cond = Source::new(true);
    let a = Source::new(1);
    let b = Source::new(10);

    let (cond1, a1, b1, n) = (cond.clone(), a.clone(), b.clone(), calls.clone());
    let picked = Derived::new(move || {
        bump(&n);
        Ok(if cond1.get() { a1.get() } else { b1.get() })
    });

    let seen = Rc::new(RefCell::new(Vec::new()));
    let (p, log) = (picked.clone(), seen.clone());
    let subscriber = Subscriber::new(move || {
        log.borrow_mut().push(p.get()?);
        Ok(())
    })
    .unwrap();
    assert_eq!(picked.dependency_count(), 2);

    cond.set(false).unwrap();
    assert_eq!(*seen.borrow(), vec![1, 10]);
    assert_eq!(a.dependent_count(), 0);
    assert_eq!(b.dependent_count(), 1);

    let before = calls.get();
    a.set(2).unwrap();
    assert_eq!(calls.get(), before);
    assert_eq!(subscriber.run_count(), 2);

    b.set(11).unwrap();
    assert_eq!(*seen.borrow(), vec![1, 10, 11]);
}

/// Test that an unwatched derived value skips dropped branches on pull.
#[test]
fn unwatched_dependency_drop() {
    let calls = counter();
    let cond = Source::new(true);
    let a = Source::new(1);
    let b = Source::new(10);

    let (cond1, a1, b1, n) = (cond.clone(), a.clone(), b.clone(), calls.clone());
    let picked = Derived::new(move || {
        bump(&n);
        Ok(if cond1.get() { a1.get() } else { b1.get() })
    });

    assert_eq!(picked.get().unwrap(), 1);
    cond.set(false).unwrap();
    assert_eq!(picked.get().unwrap(), 10);
    assert_eq!(calls.get(), 2);

    a.set(5).unwrap();
    assert_eq!(picked.get().unwrap(), 10);
    assert_eq!(calls.get(), 2);
}

/// Test that batched writes are observed once, fully settled.
#[test]
fn batching_is_glitch_free() {
    let a = Source::new(1);
    let b = Source::new(2);
    let (a1, b1) = (a.clone(), b.clone());
    let sum = Derived::new(move || Ok(a1.get() + b1.get()));

    let seen = Rc::new(RefCell::new(Vec::new()));
    let (a2, b2, s, log) = (a.clone(), b.clone(), sum.clone(), seen.clone());
    let _subscriber = Subscriber::new(move || {
        log.borrow_mut().push((a2.get(), b2.get(), s.get()?));
        Ok(())
    })
    .unwrap();

    batch(|| {
        a.set(10).unwrap();
        b.set(20).unwrap();
        // Nothing runs until the outermost batch ends
        assert_eq!(seen.borrow().len(), 1);
    })
    .unwrap();

    assert_eq!(*seen.borrow(), vec![(1, 2, 3), (10, 20, 30)]);
}

/// Test that nested batches collapse into the outermost one.
#[test]
fn nested_batches_flush_once() {
    let a = Source::new(0);
    let runs = counter();
    let (a1, n) = (a.clone(), runs.clone());
    let _subscriber = Subscriber::new(move || {
        a1.get();
        bump(&n);
        Ok(())
    })
    .unwrap();

    let result = batch(|| {
        a.set(1).unwrap();
        batch(|| a.set(2).unwrap()).unwrap();
        assert_eq!(runs.get(), 1);
        "done"
    })
    .unwrap();

    assert_eq!(result, "done");
    assert_eq!(runs.get(), 2);
    assert!(!is_batching());
}

/// Test that writes never recompute a derived value nobody watches.
#[test]
fn unwatched_derived_stays_lazy() {
    let calls = counter();
    let a = Source::new(1);
    let (a1, n) = (a.clone(), calls.clone());
    let doubled = Derived::new(move || {
        bump(&n);
        Ok(a1.get() * 2)
    });

    assert_eq!(doubled.get().unwrap(), 2);
    for i in 0..5 {
        a.set(i).unwrap();
    }
    assert_eq!(calls.get(), 1);
    assert!(!doubled.is_watched());

    assert_eq!(doubled.get().unwrap(), 8);
    assert_eq!(calls.get(), 2);
}

/// Test that a failing derived value caches its error.
#[test]
fn derived_errors_are_cached() {
    let calls = counter();
    let a = Source::new(-1);
    let unrelated = Source::new(0);
    let (a1, n) = (a.clone(), calls.clone());
    let root = Derived::new(move || {
        bump(&n);
        let value = a1.get();
        if value < 0 {
            Err(Error::msg(format!("negative: {}", value)))
        } else {
            Ok(value)
        }
    });

    let first = root.get().unwrap_err();
    assert_eq!(first.to_string(), "negative: -1");

    unrelated.set(1).unwrap();
    let second = root.get().unwrap_err();
    assert!(first.same_as(&second));
    assert_eq!(calls.get(), 1);

    a.set(4).unwrap();
    assert_eq!(root.get().unwrap(), 4);
    assert_eq!(calls.get(), 2);
}

/// Test that a derived error reaches downstream readers unmodified.
#[test]
fn derived_errors_propagate_to_readers() {
    #[derive(Debug, thiserror::Error)]
    #[error("sensor offline")]
    struct Offline;

    let online = Source::new(false);
    let o = online.clone();
    let reading = Derived::new(move || {
        if o.get() {
            Ok(21)
        } else {
            Err(Error::computation(Offline))
        }
    });
    let r = reading.clone();
    let display = Derived::new(move || Ok(format!("{} C", r.get()?)));

    let error = display.get().unwrap_err();
    assert!(error.downcast_ref::<Offline>().is_some());

    online.set(true).unwrap();
    assert_eq!(display.get().unwrap(), "21 C");
}

/// Test that a derived value reading itself is a cycle.
#[test]
fn direct_cycle_is_detected() {
    let slot: Rc<RefCell<Option<Derived<u32>>>> = Rc::new(RefCell::new(None));
    let me = slot.clone();
    let looping = Derived::new(move || match me.borrow().as_ref() {
        Some(me) => Ok(me.get()? + 1),
        None => Ok(0),
    });
    *slot.borrow_mut() = Some(looping.clone());

    let error = looping.get().unwrap_err();
    assert!(matches!(error, Error::CycleDetected));
    slot.borrow_mut().take();
}

/// Test that a cycle through several derived values is detected.
#[test]
fn indirect_cycle_is_detected() {
    let slot: Rc<RefCell<Option<Derived<u32>>>> = Rc::new(RefCell::new(None));

    let me = slot.clone();
    let x = Derived::new(move || match me.borrow().as_ref() {
        Some(z) => Ok(z.get()? + 1),
        None => Ok(0),
    });
    let x1 = x.clone();
    let y = Derived::new(move || Ok(x1.get()? + 1));
    let y1 = y.clone();
    let z = Derived::new(move || Ok(y1.get()? + 1));
    *slot.borrow_mut() = Some(z.clone());

    assert!(x.get().unwrap_err().is_cycle());
    assert!(z.get().unwrap_err().is_cycle());
    slot.borrow_mut().take();
}

/// Test that a subscriber feeding itself fails instead of looping forever.
#[test]
fn runaway_subscriber_is_a_cycle() {
    let a = Source::new(0u32);
    let runs = counter();
    let (a1, n) = (a.clone(), runs.clone());

    let result = Subscriber::new(move || {
        bump(&n);
        let value = a1.get();
        a1.set(value + 1)
    });

    assert!(result.unwrap_err().is_cycle());
    // First run, one hundred permitted passes, and the pass that failed
    assert_eq!(runs.get(), 102);
    assert_eq!(a.dependent_count(), 0);
    assert!(!is_batching());

    // The runtime recovers once the flush is over
    a.set(0).unwrap();
    assert_eq!(runs.get(), 102);
}

/// Test that subscribers chained through writes settle over several passes.
#[test]
fn writes_from_subscribers_cascade() {
    let a = Source::new(1);
    let b = Source::new(0);
    let seen = Rc::new(Cell::new(0));

    let (a1, b1) = (a.clone(), b.clone());
    let _forward = Subscriber::new(move || b1.set(a1.get() * 100)).unwrap();
    let (b2, s) = (b.clone(), seen.clone());
    let _sink = Subscriber::new(move || {
        assert!(is_batching());
        s.set(b2.get());
        Ok(())
    })
    .unwrap();

    assert_eq!(seen.get(), 100);
    a.set(2).unwrap();
    assert_eq!(seen.get(), 200);
}

/// Test that a failing subscriber does not starve the others.
#[test]
fn flush_reports_first_error_after_running_everyone() {
    let a = Source::new(0);
    let seen = Rc::new(Cell::new(0));

    let a1 = a.clone();
    let _failing = Subscriber::new(move || {
        if a1.get() > 0 {
            return Err(Error::msg("bad value"));
        }
        Ok(())
    })
    .unwrap();
    let (a2, s) = (a.clone(), seen.clone());
    let _healthy = Subscriber::new(move || {
        s.set(a2.get());
        Ok(())
    })
    .unwrap();

    let error = a.set(7).unwrap_err();
    assert_eq!(error.to_string(), "bad value");
    assert_eq!(seen.get(), 7);
}

/// Test that disposal mid-flush prevents a queued run.
#[test]
fn disposal_mid_flush_is_immediate() {
    let a = Source::new(0);
    let total_runs = counter();
    let first: Rc<RefCell<Option<Subscriber>>> = Rc::new(RefCell::new(None));
    let second: Rc<RefCell<Option<Subscriber>>> = Rc::new(RefCell::new(None));

    let make = |other: Rc<RefCell<Option<Subscriber>>>| {
        let (a1, n) = (a.clone(), total_runs.clone());
        Subscriber::new(move || {
            bump(&n);
            if a1.get() > 0 {
                if let Some(other) = other.borrow().as_ref() {
                    other.dispose()?;
                }
            }
            Ok(())
        })
        .unwrap()
    };
    let s1 = make(second.clone());
    let s2 = make(first.clone());
    *first.borrow_mut() = Some(s1.clone());
    *second.borrow_mut() = Some(s2.clone());

    a.set(1).unwrap();
    // Whichever ran first disposed the other before its turn
    assert_eq!(total_runs.get(), 3);
    assert!(s1.is_disposed() != s2.is_disposed());

    first.borrow_mut().take();
    second.borrow_mut().take();
}

/// Test that disposal is final and idempotent.
#[test]
fn disposal_is_final() {
    let a = Source::new(0);
    let runs = counter();
    let (a1, n) = (a.clone(), runs.clone());
    let subscriber = Subscriber::new(move || {
        a1.get();
        bump(&n);
        Ok(())
    })
    .unwrap();

    subscriber.dispose().unwrap();
    subscriber.dispose().unwrap();
    assert!(subscriber.is_disposed());
    assert_eq!(a.dependent_count(), 0);

    a.set(1).unwrap();
    subscriber.run().unwrap();
    assert_eq!(runs.get(), 1);
}

/// Test that a disposer scope can own subscribers.
#[test]
fn disposer_owns_subscribers() {
    let a = Source::new(0);
    let scope = Disposer::new();
    let child = Disposer::new();
    scope.adopt(&child).unwrap();

    let a1 = a.clone();
    let subscriber = Subscriber::new(move || {
        a1.get();
        Ok(())
    })
    .unwrap();
    let owned = subscriber.clone();
    child
        .add(move || {
            let _ = owned.dispose();
        })
        .unwrap();

    assert_eq!(a.dependent_count(), 1);
    scope.dispose().unwrap();
    assert!(subscriber.is_disposed());
    assert_eq!(a.dependent_count(), 0);
}

/// Test that a reentrant read of the same source keeps bookkeeping intact.
#[test]
fn nested_reads_of_one_source_share_nothing() {
    let a = Source::new(1);
    let calls = counter();
    let (a1, n) = (a.clone(), calls.clone());
    let inner = Derived::new(move || {
        bump(&n);
        Ok(a1.get() * 10)
    });

    let seen = Rc::new(RefCell::new(Vec::new()));
    let (a2, d, log) = (a.clone(), inner.clone(), seen.clone());
    let subscriber = Subscriber::new(move || {
        let before = a2.get();
        let middle = d.get()?;
        let after = a2.get();
        log.borrow_mut().push((before, middle, after));
        Ok(())
    })
    .unwrap();

    assert_eq!(subscriber.dependency_count(), 2);
    assert_eq!(a.dependent_count(), 2);

    a.set(2).unwrap();
    assert_eq!(*seen.borrow(), vec![(1, 10, 1), (2, 20, 2)]);
    assert_eq!(calls.get(), 2);
    assert_eq!(subscriber.dependency_count(), 2);
}

/// Test that watch hooks follow the dependent list.
#[test]
fn watch_hooks_track_dependents() {
    let watched = counter();
    let unwatched = counter();

    let (w, u) = (watched.clone(), unwatched.clone());
    let a = Source::with_options(
        0,
        SourceOptions::new().on_watch(move || {
            bump(&w);
            let u = u.clone();
            Some(move || bump(&u))
        }),
    );

    let derived_watched = counter();
    let (a1, dw) = (a.clone(), derived_watched.clone());
    let d = Derived::with_options(
        move || Ok(a1.get() + 1),
        DerivedOptions::new().on_watch(move || {
            bump(&dw);
            // Hooks run untracked
            assert!(!is_tracking());
            None::<fn()>
        }),
    );

    let d1 = d.clone();
    let s1 = Subscriber::new(move || d1.get().map(drop)).unwrap();
    let a2 = a.clone();
    let s2 = Subscriber::new(move || {
        a2.get();
        Ok(())
    })
    .unwrap();

    assert_eq!(watched.get(), 1);
    assert_eq!(derived_watched.get(), 1);
    assert!(d.is_watched());

    s1.dispose().unwrap();
    assert!(!d.is_watched());
    assert_eq!(unwatched.get(), 0);

    s2.dispose().unwrap();
    assert_eq!(unwatched.get(), 1);
}

/// Test that batch lifecycle events bracket the outermost batch.
#[test]
fn batch_events_bracket_writes() {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    let _observer = observe_batches(move |event| sink.borrow_mut().push(event));

    let a = Source::new(0);
    a.set(1).unwrap();
    batch(|| {
        a.set(2).unwrap();
        a.set(3).unwrap();
    })
    .unwrap();

    assert_eq!(
        *events.borrow(),
        vec![
            BatchEvent::Started,
            BatchEvent::Ended,
            BatchEvent::Started,
            BatchEvent::Ended
        ]
    );
}

/// Test that untracked reads inside a subscriber create no dependency.
#[test]
fn untracked_reads_do_not_subscribe() {
    let tracked = Source::new(0);
    let hidden = Source::new(0);
    let (t, h) = (tracked.clone(), hidden.clone());
    let subscriber = Subscriber::new(move || {
        t.get();
        untrack(|| h.get());
        let _paused = pause_tracking();
        h.get_untracked();
        Ok(())
    })
    .unwrap();

    assert_eq!(subscriber.dependency_count(), 1);
    hidden.set(1).unwrap();
    assert_eq!(subscriber.run_count(), 1);
    tracked.set(1).unwrap();
    assert_eq!(subscriber.run_count(), 2);
}

/// Test that a frame left behind inside a run is reported.
#[test]
fn leaked_frame_is_out_of_order() {
    let result = Subscriber::new(|| {
        std::mem::forget(pause_tracking());
        Ok(())
    });

    assert!(matches!(result, Err(Error::OutOfOrderCompletion)));
    assert_eq!(ReactiveContext::depth(), 0);
}

/// Test that equal writes and equal recomputes stop propagation.
#[test]
fn custom_equality_stops_propagation() {
    let runs = counter();
    let name = Source::with_options(
        String::from("Ada"),
        SourceOptions::new().equals(|before: &String, after| before.eq_ignore_ascii_case(after)),
    );
    let n = name.clone();
    let length = Derived::with_options(
        move || Ok(n.get().len()),
        DerivedOptions::new().equals(|before: &usize, after| before / 10 == after / 10),
    );
    let (l, r) = (length.clone(), runs.clone());
    let _subscriber = Subscriber::new(move || {
        l.get()?;
        bump(&r);
        Ok(())
    })
    .unwrap();

    name.set(String::from("ADA")).unwrap();
    assert_eq!(name.get(), "Ada");
    assert_eq!(runs.get(), 1);

    name.set(String::from("Grace")).unwrap();
    assert_eq!(length.get().unwrap(), 3);
    assert_eq!(runs.get(), 1);

    name.set(String::from("Margaret Hamilton")).unwrap();
    assert_eq!(length.get().unwrap(), 17);
    assert_eq!(runs.get(), 2);
}

/// Test that a panic caught around a batch leaves the runtime usable.
#[test]
fn caught_panic_in_batch_closes_it() {
    let runs = counter();
    let a = Source::new(0);
    let (a1, r) = (a.clone(), runs.clone());
    let _subscriber = Subscriber::new(move || {
        a1.get();
        bump(&r);
        Ok(())
    })
    .unwrap();

    let caught = panic::catch_unwind(AssertUnwindSafe(|| {
        batch(|| {
            a.set(1).unwrap();
            panic!("interrupted");
        })
    }));
    assert!(caught.is_err());
    assert!(!is_batching());

    a.set(2).unwrap();
    assert_eq!(runs.get(), 2);
}

/// Test that a derived value whose computation panicked recomputes later.
#[test]
fn caught_panic_in_derived_is_not_a_cycle() {
    let a = Source::new(1);
    let a1 = a.clone();
    let inverse = Derived::new(move || {
        let v = a1.get();
        if v == 0 {
            panic!("division by zero");
        }
        Ok(10 / v)
    });
    assert_eq!(inverse.get().unwrap(), 10);

    a.set(0).unwrap();
    assert!(panic::catch_unwind(AssertUnwindSafe(|| inverse.get())).is_err());

    a.set(2).unwrap();
    assert_eq!(inverse.get().unwrap(), 5);
    assert_eq!(inverse.dependency_count(), 1);
}

/// Test that a subscriber panicking mid-flush keeps running afterwards and
/// the rest of its pass is delivered at the next flush.
#[test]
fn caught_panic_in_subscriber_keeps_the_queue() {
    let seen = Rc::new(Cell::new(0));
    let a = Source::new(0);
    let unrelated = Source::new(0);

    let a1 = a.clone();
    let failing = Subscriber::new(move || {
        if a1.get() == 1 {
            panic!("rejected");
        }
        Ok(())
    })
    .unwrap();
    let (a2, s) = (a.clone(), seen.clone());
    let _watcher = Subscriber::new(move || {
        s.set(a2.get());
        Ok(())
    })
    .unwrap();

    assert!(panic::catch_unwind(AssertUnwindSafe(|| a.set(1))).is_err());
    assert!(!is_batching());

    unrelated.set(1).unwrap();
    assert_eq!(seen.get(), 1);

    a.set(2).unwrap();
    assert_eq!(seen.get(), 2);
    assert_eq!(failing.run_count(), 3);
    assert_eq!(failing.dependency_count(), 1);
}
