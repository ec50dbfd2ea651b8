//! Scheduler behavior: priority order, FIFO among equals, the
//! preemption toggle, and the scheduler lock.
use std::sync::Mutex;

use muon_kernel::{priority, this_thread, Thread, ThreadAttributes};
use muon_port_std::run;

mod priority_preempts {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    pub static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn log(entry: &'static str) {
        LOG.lock().unwrap().push(entry);
    }

    fn high(_: usize) -> usize {
        log("high");
        0
    }

    pub fn main() {
        log("main:pre");
        // A higher-priority thread runs the moment it becomes ready.
        let h = Thread::<K>::new(
            ThreadAttributes::new().with_name("high").with_priority(priority::HIGH),
            high,
            0,
        )
        .unwrap();
        log("main:post");
        h.join().unwrap();
    }
}

#[test]
fn higher_priority_thread_preempts_immediately() {
    run::<priority_preempts::K>(priority_preempts::main);
    assert_eq!(
        *priority_preempts::LOG.lock().unwrap(),
        ["main:pre", "high", "main:post"]
    );
}

mod fifo_equals {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    pub static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn log(entry: &'static str) {
        LOG.lock().unwrap().push(entry);
    }

    fn worker_a(_: usize) -> usize {
        log("a1");
        this_thread::yield_now::<K>().unwrap();
        log("a2");
        0
    }

    fn worker_b(_: usize) -> usize {
        log("b1");
        this_thread::yield_now::<K>().unwrap();
        log("b2");
        0
    }

    pub fn main() {
        let a = Thread::<K>::new(
            ThreadAttributes::new().with_name("a").with_priority(priority::BELOW_NORMAL),
            worker_a,
            0,
        )
        .unwrap();
        let b = Thread::<K>::new(
            ThreadAttributes::new().with_name("b").with_priority(priority::BELOW_NORMAL),
            worker_b,
            0,
        )
        .unwrap();
        // Neither ran yet: both are below the main thread's priority.
        assert!(LOG.lock().unwrap().is_empty());
        a.join().unwrap();
        b.join().unwrap();
    }
}

#[test]
fn equal_priorities_run_fifo_and_rotate_on_yield() {
    run::<fifo_equals::K>(fifo_equals::main);
    // `a` became ready first, so it runs first; a yield sends each
    // behind its equal-priority peer.
    assert_eq!(*fifo_equals::LOG.lock().unwrap(), ["a1", "b1", "a2", "b2"]);
}

mod preemption_toggle {
    use super::*;
    use muon_kernel::System;
    muon_port_std::use_port!(unsafe pub struct K);

    pub static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn log(entry: &'static str) {
        LOG.lock().unwrap().push(entry);
    }

    fn high(_: usize) -> usize {
        log("high");
        0
    }

    pub fn main() {
        let prev = System::<K>::set_preemptive(false).unwrap();
        assert!(prev);

        let h = Thread::<K>::new(
            ThreadAttributes::new().with_name("high").with_priority(priority::HIGH),
            high,
            0,
        )
        .unwrap();
        // With preemption off, the higher-priority thread stays ready
        // until an explicit yield point.
        log("main:still-running");
        assert_eq!(*LOG.lock().unwrap(), ["main:still-running"]);

        this_thread::yield_now::<K>().unwrap();
        assert_eq!(*LOG.lock().unwrap(), ["main:still-running", "high"]);

        assert!(!System::<K>::set_preemptive(true).unwrap());
        h.join().unwrap();
    }
}

#[test]
fn preemption_can_be_disabled() {
    run::<preemption_toggle::K>(preemption_toggle::main);
}

mod scheduler_lock {
    use super::*;
    use muon_kernel::System;
    muon_port_std::use_port!(unsafe pub struct K);

    pub static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn log(entry: &'static str) {
        LOG.lock().unwrap().push(entry);
    }

    fn high(_: usize) -> usize {
        log("high");
        0
    }

    pub fn main() {
        let snapshot = System::<K>::lock().unwrap();
        assert_eq!(snapshot, 0);
        assert!(System::<K>::is_locked());

        let h = Thread::<K>::new(
            ThreadAttributes::new().with_name("high").with_priority(priority::HIGH),
            high,
            0,
        )
        .unwrap();
        log("main:locked");
        // Rescheduling is inhibited while the lock is held.
        assert_eq!(*LOG.lock().unwrap(), ["main:locked"]);

        // Dropping the last lock level performs the pending preemption.
        System::<K>::unlock().unwrap();
        assert!(!System::<K>::is_locked());
        assert_eq!(*LOG.lock().unwrap(), ["main:locked", "high"]);

        // `set_locked` restores a snapshot wholesale.
        System::<K>::lock().unwrap();
        System::<K>::lock().unwrap();
        assert!(System::<K>::is_locked());
        System::<K>::set_locked(snapshot).unwrap();
        assert!(!System::<K>::is_locked());

        h.join().unwrap();
    }
}

#[test]
fn scheduler_lock_defers_preemption() {
    run::<scheduler_lock::K>(scheduler_lock::main);
}

mod blocking_while_locked {
    use super::*;
    use muon_kernel::{Error, System};
    muon_port_std::use_port!(unsafe pub struct K);

    pub fn main() {
        System::<K>::lock().unwrap();
        // Blocking calls are contract violations while the scheduler is
        // locked.
        assert_eq!(
            System::<K>::sysclock().sleep_for(1),
            Err(Error::Permission)
        );
        System::<K>::unlock().unwrap();
        System::<K>::sysclock().sleep_for(1).unwrap();
    }
}

#[test]
fn blocking_calls_rejected_while_scheduler_locked() {
    run::<blocking_while_locked::K>(blocking_while_locked::main);
}
