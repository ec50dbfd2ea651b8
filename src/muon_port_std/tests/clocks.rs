//! Clocks and timers: sleep accuracy, timeout delivery, periodic
//! non-drift, and the adjustable realtime clock.
use std::sync::Mutex;

use muon_kernel::{
    priority, utils::static_pin, ClockKind, Error, Semaphore, System, Thread, ThreadAttributes,
    Timer, TimerAttributes, TimerState,
};
use muon_port_std::run;

mod sleep_accuracy {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    pub fn main() {
        let clk = System::<K>::sysclock();
        let before = clk.steady_now();
        clk.sleep_for(10).unwrap();
        let after = clk.steady_now();
        assert!(after >= before + 10, "woke at {after}, started at {before}");

        // An absolute sleep against a steady clock.
        let deadline = clk.steady_now() + 7;
        clk.sleep_until(deadline).unwrap();
        assert!(clk.steady_now() >= deadline);

        // A sleep whose deadline already passed returns right away.
        clk.sleep_until(0).unwrap();
    }
}

#[test]
fn sleep_for_never_wakes_early() {
    run::<sleep_accuracy::K>(sleep_accuracy::main);
}

mod semaphore_timeout {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    static S: Semaphore<K> = Semaphore::binary("s", 0);

    pub fn main() {
        // S3: no post ever arrives; the wait expires on time.
        let before = System::<K>::sysclock().steady_now();
        assert_eq!(S.timed_wait(10), Err(Error::TimedOut));
        assert!(System::<K>::sysclock().steady_now() >= before + 10);
    }
}

#[test]
fn semaphore_timed_wait_expires() {
    run::<semaphore_timeout::K>(semaphore_timeout::main);
}

mod periodic_timer {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    pub static FIRES: Mutex<Vec<u64>> = Mutex::new(Vec::new());

    fn on_fire(_: usize) {
        FIRES.lock().unwrap().push(System::<K>::sysclock().steady_now());
    }

    static TIMER: Timer<K> = Timer::new(
        TimerAttributes::new().with_name("periodic").periodic(),
        on_fire,
        0,
    );

    pub fn main() {
        // S5: a period-5 timer fires every 5 ticks, without drift, for
        // at least 10 periods.
        static_pin(&TIMER).start(5).unwrap();
        assert_eq!(TIMER.state(), TimerState::Running);
        System::<K>::sysclock().sleep_for(52).unwrap();
        TIMER.stop().unwrap();
        assert_eq!(TIMER.state(), TimerState::Stopped);
        // Stopping twice is an error.
        assert_eq!(TIMER.stop(), Err(Error::Again));

        let fires = FIRES.lock().unwrap();
        assert!(fires.len() >= 10, "only {} fires", fires.len());
        for pair in fires.windows(2) {
            assert_eq!(pair[1] - pair[0], 5, "drift in {fires:?}");
        }
    }
}

#[test]
fn periodic_timer_does_not_drift() {
    run::<periodic_timer::K>(periodic_timer::main);
}

mod one_shot_timer {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    pub static FIRES: Mutex<Vec<u64>> = Mutex::new(Vec::new());

    fn on_fire(arg: usize) {
        FIRES.lock().unwrap().push(arg as u64);
    }

    static TIMER: Timer<K> = Timer::new(
        TimerAttributes::new().with_name("once").once(),
        on_fire,
        7,
    );

    pub fn main() {
        static_pin(&TIMER).start(3).unwrap();
        System::<K>::sysclock().sleep_for(10).unwrap();
        // Fired exactly once, then stopped on its own.
        assert_eq!(*FIRES.lock().unwrap(), [7]);
        assert_eq!(TIMER.state(), TimerState::Stopped);
        assert_eq!(TIMER.stop(), Err(Error::Again));
    }
}

#[test]
fn one_shot_timer_fires_once() {
    run::<one_shot_timer::K>(one_shot_timer::main);
}

mod hrclock_readings {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    pub fn main() {
        // The cycle clock advances by the port's cycles-per-tick ratio.
        let hr0 = System::<K>::hrclock().steady_now();
        System::<K>::sysclock().sleep_for(4).unwrap();
        let hr1 = System::<K>::hrclock().steady_now();
        assert!(hr1 >= hr0 + 4 * 1000);
        assert_eq!(System::<K>::hrclock().kind(), ClockKind::Steady);
        // Steady clocks reject adjustment.
        assert_eq!(System::<K>::hrclock().set_offset(5), Err(Error::Invalid));
    }
}

#[test]
fn hrclock_tracks_cycles() {
    run::<hrclock_readings::K>(hrclock_readings::main);
}

mod rtclock_offset {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    pub fn main() {
        let rt = System::<K>::rtclock();
        assert_eq!(rt.kind(), ClockKind::Adjustable);
        assert_eq!(rt.offset(), 0);

        // `now` follows the offset; `steady_now` does not.
        let steady = rt.steady_now();
        rt.set_offset(100).unwrap();
        assert_eq!(rt.now(), rt.steady_now().wrapping_add(100));
        assert_eq!(rt.steady_now(), steady);

        // Advancing the offset shortens an absolute-time sleep: the
        // deadline lies 50 adjusted-seconds ahead, but a single
        // realtime tick plus the adjustment below satisfies it.
        let deadline = rt.now() + 50;
        let t = Thread::<K>::new(
            ThreadAttributes::new().with_name("adjust").with_priority(priority::BELOW_NORMAL),
            adjuster,
            (deadline - 1) as usize,
        )
        .unwrap();
        rt.sleep_until(deadline).unwrap();
        assert!(rt.now() >= deadline);
        t.join().unwrap();
    }

    fn adjuster(arg: usize) -> usize {
        let rt = System::<K>::rtclock();
        // Runs once the sleeper has blocked: jump the clock close to
        // the target, so only one more rt tick is needed.
        rt.set_offset((arg as u64).wrapping_sub(rt.steady_now()) as i64).unwrap();
        0
    }
}

#[test]
fn rtclock_offset_moves_absolute_sleeps() {
    run::<rtclock_offset::K>(rtclock_offset::main);
}
