use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use weft::fiber::{self, Fiber, FiberState};
use weft::scheduler::Scheduler;

#[test]
fn every_task_runs_exactly_once() {
    let sched = Scheduler::new(2, false, "sched-once");
    sched.start();

    let hits = Arc::new(AtomicU32::new(0));
    for _ in 0..100 {
        let hits = hits.clone();
        sched.schedule(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }

    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 100);
}

#[test]
fn tasks_queued_before_start_still_run() {
    let sched = Scheduler::new(1, false, "sched-prestart");
    let hits = Arc::new(AtomicU32::new(0));
    for _ in 0..10 {
        let hits = hits.clone();
        sched.schedule(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }

    sched.start();
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 10);
}

#[test]
fn use_caller_stop_drains_the_queue_on_the_calling_thread() {
    let sched = Scheduler::new(1, true, "sched-caller");
    sched.start();

    let hits = Arc::new(AtomicU32::new(0));
    for _ in 0..10 {
        let hits = hits.clone();
        sched.schedule(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }

    // no extra worker threads exist: everything runs inside stop()
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 10);
}

#[test]
fn ready_yield_requeues_the_fiber() {
    let sched = Scheduler::new(1, false, "sched-ready");
    sched.start();

    let hits = Arc::new(AtomicU32::new(0));
    let fiber = {
        let hits = hits.clone();
        Fiber::new(
            move || {
                hits.fetch_add(1, Ordering::SeqCst);
                fiber::yield_to_ready();
                hits.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        )
    };

    sched.schedule_fiber(fiber.clone());
    sched.stop();

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(fiber.state(), FiberState::Term);
}

#[test]
fn tasks_can_schedule_more_tasks() {
    let sched = Scheduler::new(2, false, "sched-nested");
    sched.start();

    let hits = Arc::new(AtomicU32::new(0));
    {
        let hits = hits.clone();
        sched.schedule(move || {
            let inner = Scheduler::current().expect("worker thread has a scheduler");
            for _ in 0..5 {
                let hits = hits.clone();
                inner.schedule(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
    }

    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 5);
}

#[test]
fn stop_is_idempotent() {
    let sched = Scheduler::new(2, false, "sched-stop2");
    sched.start();
    sched.schedule(|| {});
    sched.stop();
    sched.stop();
}

#[test]
fn panicking_task_does_not_take_down_the_worker() {
    let sched = Scheduler::new(1, false, "sched-panic");
    sched.start();

    let hits = Arc::new(AtomicU32::new(0));
    sched.schedule(|| panic!("task blew up"));
    {
        let hits = hits.clone();
        sched.schedule(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }

    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
