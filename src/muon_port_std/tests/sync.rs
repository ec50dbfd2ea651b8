//! Semaphores, event-flag objects, condition variables, and ISR-side
//! signaling.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex as StdMutex,
};

use muon_kernel::{
    priority, Error, EventFlags, FlagsMode, Mutex, MutexAttributes, Semaphore, System, Thread,
    ThreadAttributes,
};
use muon_port_std::{run, with_interrupt_context};

mod producer_consumer {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    static ITEMS: Semaphore<K> = Semaphore::counting("items", 8, 0);
    pub static CONSUMED: StdMutex<Vec<u32>> = StdMutex::new(Vec::new());
    static DATA: StdMutex<Vec<u32>> = StdMutex::new(Vec::new());

    fn consumer(_: usize) -> usize {
        for _ in 0..4 {
            ITEMS.wait().unwrap();
            let item = DATA.lock().unwrap().remove(0);
            CONSUMED.lock().unwrap().push(item);
        }
        0
    }

    pub fn main() {
        let c = Thread::<K>::new(
            ThreadAttributes::new().with_name("consumer").with_priority(priority::HIGH),
            consumer,
            0,
        )
        .unwrap();
        for i in 0..4 {
            DATA.lock().unwrap().push(i);
            // Each post immediately unblocks the higher-priority
            // consumer (a post strictly happens-before the wake).
            ITEMS.post().unwrap();
            assert_eq!(CONSUMED.lock().unwrap().len(), (i + 1) as usize);
        }
        c.join().unwrap();
        assert_eq!(*CONSUMED.lock().unwrap(), [0, 1, 2, 3]);
    }
}

#[test]
fn semaphore_hands_posts_to_the_waiter() {
    run::<producer_consumer::K>(producer_consumer::main);
}

mod semaphore_bounds {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    static S: Semaphore<K> = Semaphore::counting("bounded", 2, 1);

    pub fn main() {
        assert_eq!(S.value(), 1);
        assert_eq!(S.max_value(), 2);
        S.post().unwrap();
        // The counter saturates at `max_value`.
        assert_eq!(S.post(), Err(Error::Again));
        assert_eq!(S.value(), 2);

        S.wait().unwrap();
        S.wait().unwrap();
        assert_eq!(S.try_wait(), Err(Error::WouldBlock));

        // `reset` restores the initial count.
        S.reset().unwrap();
        assert_eq!(S.value(), 1);
    }
}

#[test]
fn semaphore_respects_its_bounds() {
    run::<semaphore_bounds::K>(semaphore_bounds::main);
}

mod isr_post {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    static S: Semaphore<K> = Semaphore::binary("isr", 0);
    pub static WOKE: AtomicBool = AtomicBool::new(false);

    fn waiter(_: usize) -> usize {
        S.wait().unwrap();
        WOKE.store(true, Ordering::SeqCst);
        0
    }

    pub fn main() {
        let w = Thread::<K>::new(
            ThreadAttributes::new().with_name("waiter").with_priority(priority::HIGH),
            waiter,
            0,
        )
        .unwrap();
        assert!(!WOKE.load(Ordering::SeqCst));

        // Post from (simulated) handler mode: the wake is deferred to
        // the ISR tail, then the waiter preempts us.
        with_interrupt_context::<K>(|| {
            assert!(System::<K>::in_handler_mode());
            S.post().unwrap();
            // Still inside the handler: no context switch yet.
            assert!(!WOKE.load(Ordering::SeqCst));
        });
        assert!(WOKE.load(Ordering::SeqCst));
        w.join().unwrap();
    }
}

#[test]
fn isr_post_defers_the_switch_to_the_tail() {
    run::<isr_post::K>(isr_post::main);
}

mod eventflags_object {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    static FLAGS: EventFlags<K> = EventFlags::new("flags");
    pub static OBSERVED: StdMutex<Vec<u32>> = StdMutex::new(Vec::new());

    fn all_waiter(_: usize) -> usize {
        let got = FLAGS.wait(0b1010, FlagsMode::ALL | FlagsMode::CLEAR).unwrap();
        OBSERVED.lock().unwrap().push(got);
        0
    }

    fn any_waiter(_: usize) -> usize {
        let got = FLAGS.wait(0b0100, FlagsMode::ANY).unwrap();
        OBSERVED.lock().unwrap().push(got);
        0
    }

    pub fn main() {
        let all = Thread::<K>::new(
            ThreadAttributes::new().with_name("all").with_priority(priority::HIGH),
            all_waiter,
            0,
        )
        .unwrap();

        // A partial raise satisfies nobody.
        FLAGS.raise(0b0010).unwrap();
        assert!(OBSERVED.lock().unwrap().is_empty());

        // Completing the mask wakes the all-waiter, which consumes its
        // bits atomically.
        FLAGS.raise(0b1000).unwrap();
        assert_eq!(*OBSERVED.lock().unwrap(), [0b1010]);
        assert_eq!(FLAGS.get(0, FlagsMode::empty()), 0);

        let any = Thread::<K>::new(
            ThreadAttributes::new().with_name("any").with_priority(priority::HIGH),
            any_waiter,
            0,
        )
        .unwrap();
        FLAGS.raise(0b0100).unwrap();
        assert_eq!(*OBSERVED.lock().unwrap(), [0b1010, 0b0100]);
        // ANY without CLEAR leaves the flag raised.
        assert_eq!(FLAGS.get(0b0100, FlagsMode::empty()), 0b0100);
        FLAGS.clear(0b0100).unwrap();
        assert_eq!(FLAGS.get(0, FlagsMode::empty()), 0);

        // Probing variants.
        assert_eq!(
            FLAGS.try_wait(0b1, FlagsMode::ANY),
            Err(Error::WouldBlock)
        );
        assert_eq!(FLAGS.timed_wait(0b1, FlagsMode::ANY, 5), Err(Error::TimedOut));

        all.join().unwrap();
        any.join().unwrap();
    }
}

#[test]
fn eventflags_all_vs_any() {
    run::<eventflags_object::K>(eventflags_object::main);
}

mod condvar_signal {
    use super::*;
    use muon_kernel::ConditionVariable;
    muon_port_std::use_port!(unsafe pub struct K);

    static MX: Mutex<K> = Mutex::new(MutexAttributes::new().with_name("mx"));
    static CV: ConditionVariable<K> = ConditionVariable::new("cv");
    static READY: AtomicBool = AtomicBool::new(false);
    pub static SAW_IT: AtomicBool = AtomicBool::new(false);

    fn waiter(_: usize) -> usize {
        MX.lock().unwrap();
        while !READY.load(Ordering::SeqCst) {
            CV.wait(&MX).unwrap();
        }
        SAW_IT.store(true, Ordering::SeqCst);
        MX.unlock().unwrap();
        0
    }

    pub fn main() {
        let w = Thread::<K>::new(
            ThreadAttributes::new().with_name("waiter").with_priority(priority::ABOVE_NORMAL),
            waiter,
            0,
        )
        .unwrap();

        MX.lock().unwrap();
        READY.store(true, Ordering::SeqCst);
        MX.unlock().unwrap();
        CV.signal().unwrap();

        w.join().unwrap();
        assert!(SAW_IT.load(Ordering::SeqCst));

        // A condition variable wait requires holding the mutex.
        assert_eq!(CV.wait(&MX), Err(Error::Permission));
    }
}

#[test]
fn condvar_signal_wakes_the_waiter() {
    run::<condvar_signal::K>(condvar_signal::main);
}

mod condvar_timeout {
    use super::*;
    use muon_kernel::ConditionVariable;
    muon_port_std::use_port!(unsafe pub struct K);

    static MX: Mutex<K> = Mutex::new(MutexAttributes::new().with_name("mx"));
    static CV: ConditionVariable<K> = ConditionVariable::new("cv");

    pub fn main() {
        MX.lock().unwrap();
        let before = System::<K>::sysclock().steady_now();
        // Nobody signals: the wait expires, with the mutex re-acquired
        // before the error is reported.
        assert_eq!(CV.timed_wait(&MX, 10), Err(Error::TimedOut));
        assert!(System::<K>::sysclock().steady_now() >= before + 10);
        assert!(MX.is_locked());
        MX.unlock().unwrap();
    }
}

#[test]
fn condvar_timed_wait_reacquires_the_mutex() {
    run::<condvar_timeout::K>(condvar_timeout::main);
}

mod condvar_broadcast {
    use super::*;
    use muon_kernel::ConditionVariable;
    use std::sync::atomic::AtomicUsize;
    muon_port_std::use_port!(unsafe pub struct K);

    static MX: Mutex<K> = Mutex::new(MutexAttributes::new().with_name("mx"));
    static CV: ConditionVariable<K> = ConditionVariable::new("cv");
    static READY: AtomicBool = AtomicBool::new(false);
    pub static WOKEN: AtomicUsize = AtomicUsize::new(0);

    fn waiter(_: usize) -> usize {
        MX.lock().unwrap();
        while !READY.load(Ordering::SeqCst) {
            CV.wait(&MX).unwrap();
        }
        WOKEN.fetch_add(1, Ordering::SeqCst);
        MX.unlock().unwrap();
        0
    }

    pub fn main() {
        let threads: Vec<_> = (0..3)
            .map(|_| {
                Thread::<K>::new(
                    ThreadAttributes::new().with_name("waiter").with_priority(priority::HIGH),
                    waiter,
                    0,
                )
                .unwrap()
            })
            .collect();

        READY.store(true, Ordering::SeqCst);
        CV.broadcast().unwrap();
        for t in &threads {
            t.join().unwrap();
        }
        assert_eq!(WOKEN.load(Ordering::SeqCst), 3);
    }
}

#[test]
fn condvar_broadcast_wakes_everyone() {
    run::<condvar_broadcast::K>(condvar_broadcast::main);
}
