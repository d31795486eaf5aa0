use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

mod util;

use util::{wait_for, LoopRunner};

#[test]
fn task_fires_once_within_its_window() {
    let fired_at = Arc::new(Mutex::new(Vec::new()));
    let fired_at2 = Arc::clone(&fired_at);

    let (runner, start) = LoopRunner::spawn(move |event_loop| {
        let start = Instant::now();
        let fired_at = fired_at2;
        event_loop.run_after(1, 2, move || {
            fired_at.lock().unwrap().push(start.elapsed());
        });
        start
    });

    assert!(wait_for(Duration::from_secs(4), || {
        !fired_at.lock().unwrap().is_empty()
    }));
    // Room on both sides: the wheel hand is phase-shifted from the
    // insertion instant by up to one tick.
    let elapsed = fired_at.lock().unwrap()[0];
    assert!(elapsed >= Duration::from_millis(900), "fired at {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(3200), "fired at {:?}", elapsed);

    // Exactly one expiry, also after the hand has gone around again.
    std::thread::sleep(Duration::from_millis(2200));
    assert!(start.elapsed() >= Duration::from_secs(3));
    assert_eq!(fired_at.lock().unwrap().len(), 1);

    runner.join();
}

#[test]
fn refresh_pushes_expiry_out() {
    let fired = Arc::new(Mutex::new(Vec::new()));
    let fired2 = Arc::clone(&fired);

    let (runner, start) = LoopRunner::spawn(move |event_loop| {
        let start = Instant::now();

        let fired = fired2;
        event_loop.run_after(1, 3, move || {
            fired.lock().unwrap().push(start.elapsed());
        });

        // Two ticks in, extend the task by its full timeout again.
        let weak = Rc::downgrade(event_loop);
        event_loop.run_after(2, 2, move || {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.refresh_after(1);
            }
        });

        start
    });

    assert!(wait_for(Duration::from_secs(8), || {
        !fired.lock().unwrap().is_empty()
    }));
    let elapsed = fired.lock().unwrap()[0];
    // Refreshed within two ticks and extended by the full 3-tick
    // timeout: past the original deadline, and only one expiry in total.
    assert!(elapsed >= Duration::from_millis(3000), "fired at {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(5800), "fired at {:?}", elapsed);
    assert!(start.elapsed() >= elapsed);
    assert_eq!(fired.lock().unwrap().len(), 1);

    runner.join();
}

#[test]
fn canceled_task_never_fires() {
    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = Arc::clone(&fired);
    let gone = Arc::new(AtomicBool::new(false));
    let gone2 = Arc::clone(&gone);

    let (runner, ()) = LoopRunner::spawn(move |event_loop| {
        let fired = fired2;
        event_loop.run_after(1, 2, move || {
            fired.store(true, Ordering::SeqCst);
        });

        // Cancel from a second timer before the first can expire.
        let weak = Rc::downgrade(event_loop);
        event_loop.run_after(2, 1, move || {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.remove_after(1);
            }
        });

        // Observe, after the canceled slot has drained, that the wheel
        // forgot the task entirely.
        let weak = Rc::downgrade(event_loop);
        let gone = gone2;
        event_loop.run_after(3, 4, move || {
            if let Some(event_loop) = weak.upgrade() {
                gone.store(!event_loop.has_after(1), Ordering::SeqCst);
            }
        });
    });

    assert!(wait_for(Duration::from_secs(6), || {
        gone.load(Ordering::SeqCst)
    }));
    assert!(!fired.load(Ordering::SeqCst));

    runner.join();
}
