// Copyright 2025 fiberio contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Scheduling properties that don't need real I/O: single/multiple fibers,
//! spawning from inside a running fiber, and fairness of `yield_now`.

use std::cell::RefCell;
use std::rc::Rc;

use fiberio::io::IoScheduler;
use fiberio::runtime;

fn init_logging() {
    let _ = env_logger::try_init();
}

#[test]
fn single_fiber_runs_to_completion() {
    init_logging();
    let ran = Rc::new(RefCell::new(false));
    let ran2 = ran.clone();

    let mut scheduler = IoScheduler::new().unwrap();
    scheduler.spawn(move || *ran2.borrow_mut() = true).unwrap();
    runtime::scheduler_run(scheduler).unwrap();

    assert!(*ran.borrow());
}

#[test]
fn multiple_independent_fibers_all_run() {
    init_logging();
    let seen = Rc::new(RefCell::new(Vec::new()));

    let mut scheduler = IoScheduler::new().unwrap();
    for id in 0..4 {
        let seen = seen.clone();
        scheduler.spawn(move || seen.borrow_mut().push(id)).unwrap();
    }
    runtime::scheduler_run(scheduler).unwrap();

    let mut seen = seen.borrow().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3]);
}

#[test]
fn recursive_spawn_chain_runs_every_generation() {
    init_logging();
    let ran = Rc::new(RefCell::new(0usize));

    let mut scheduler = IoScheduler::new().unwrap();
    {
        let ran = ran.clone();
        scheduler.spawn(move || spawn_chain(ran, 3)).unwrap();
    }
    runtime::scheduler_run(scheduler).unwrap();

    // The original fiber plus three generations of children it scheduled
    // from inside their own bodies via the ambient `schedule` function.
    assert_eq!(*ran.borrow(), 4);
}

fn spawn_chain(ran: Rc<RefCell<usize>>, remaining: usize) {
    *ran.borrow_mut() += 1;
    if remaining > 0 {
        let ran = ran.clone();
        runtime::schedule(move || spawn_chain(ran, remaining - 1)).unwrap();
    }
}

#[test]
fn yield_now_is_fair_round_robin() {
    init_logging();
    const ITERS: usize = 10;
    let order = Rc::new(RefCell::new(Vec::new()));

    let mut scheduler = IoScheduler::new().unwrap();
    for id in 0..3usize {
        let order = order.clone();
        scheduler
            .spawn(move || {
                for _ in 0..ITERS {
                    order.borrow_mut().push(id);
                    runtime::yield_now().unwrap();
                }
            })
            .unwrap();
    }
    runtime::scheduler_run(scheduler).unwrap();

    let order = order.borrow();
    assert_eq!(order.len(), 3 * ITERS);

    // No fiber ever gets a second turn before every other ready fiber has
    // had one.
    for pair in order.windows(2) {
        assert_ne!(pair[0], pair[1], "the same fiber ran twice in a row");
    }
    for id in 0..3usize {
        assert_eq!(order.iter().filter(|&&x| x == id).count(), ITERS);
    }
}

#[test]
fn scheduler_run_rejects_nested_binding() {
    init_logging();
    let mut outer = IoScheduler::new().unwrap();
    outer
        .spawn(|| {
            let inner = IoScheduler::new().unwrap();
            let err = runtime::scheduler_run(inner).unwrap_err();
            assert!(matches!(err, fiberio::Error::SchedulerAlreadyBound));
        })
        .unwrap();
    runtime::scheduler_run(outer).unwrap();
}
