use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use weft::fiber::{self, Fiber, FiberState};

#[test]
fn resume_and_yield_walk_the_state_machine() {
    let steps = Arc::new(AtomicU32::new(0));
    let fiber = {
        let steps = steps.clone();
        Fiber::new(
            move || {
                steps.fetch_add(1, Ordering::SeqCst);
                fiber::yield_to_hold();
                steps.fetch_add(1, Ordering::SeqCst);
            },
            64 * 1024,
            false,
        )
    };

    assert_eq!(fiber.state(), FiberState::Init);
    fiber.resume();
    assert_eq!(fiber.state(), FiberState::Hold);
    assert_eq!(steps.load(Ordering::SeqCst), 1);
    fiber.resume();
    assert_eq!(fiber.state(), FiberState::Term);
    assert_eq!(steps.load(Ordering::SeqCst), 2);
}

#[test]
fn a_finished_fiber_can_be_reset_and_rerun() {
    let runs = Arc::new(AtomicU32::new(0));
    let fiber = {
        let runs = runs.clone();
        Fiber::new(
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
            },
            64 * 1024,
            false,
        )
    };
    fiber.resume();
    assert_eq!(fiber.state(), FiberState::Term);

    let runs2 = runs.clone();
    fiber.reset(move || {
        runs2.fetch_add(10, Ordering::SeqCst);
    });
    assert_eq!(fiber.state(), FiberState::Init);
    fiber.resume();
    assert_eq!(fiber.state(), FiberState::Term);
    assert_eq!(runs.load(Ordering::SeqCst), 11);
}

#[test]
fn a_panicking_body_is_contained_in_the_trampoline() {
    let fiber = Fiber::new(|| panic!("deliberate"), 64 * 1024, false);
    fiber.resume();
    assert_eq!(fiber.state(), FiberState::Except);
    // the caller's stack is intact and can keep spawning fibers
    let ok = Fiber::new(|| {}, 64 * 1024, false);
    ok.resume();
    assert_eq!(ok.state(), FiberState::Term);
}

#[test]
fn fiber_count_tracks_lifetimes() {
    let before = Fiber::count();
    let fiber = Fiber::new(|| {}, 64 * 1024, false);
    assert!(Fiber::count() > before);
    fiber.resume();
    drop(fiber);
    // only this test's thread-root (and other tests' fibers) remain
    assert!(Fiber::count() >= before);
}
