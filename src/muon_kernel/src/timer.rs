//! Software timers: one-shot or periodic callbacks scheduled on a
//! clock's timeout list.
//!
//! The callback runs in the tick handler's context; it may signal
//! semaphores, raise flags, or resume threads, but must not block.
//! Periodic re-arming is computed from the previous fire time, not from
//! "now", so the fire times never accumulate drift.
use core::{marker::PhantomPinned, pin::Pin};

use crate::{
    clock::{self, ClockId, Duration, TimeoutNode},
    error::{Error, Result},
    klock::{lock_cpu, CpuLockCell, CpuLockGuard},
    KernelTraits,
};

/// Timer callback: a plain function pointer plus an opaque argument.
pub type TimerFn = fn(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires once, then stops.
    Once,
    /// Re-arms itself at `fire_time + period` after every fire.
    Periodic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Initialized,
    Running,
    Stopped,
}

/// Construction-time attributes of a timer.
#[derive(Clone, Copy)]
pub struct TimerAttributes {
    pub name: &'static str,
    pub kind: TimerKind,
    /// The clock whose timeout list the timer is scheduled on.
    pub clock: ClockId,
}

impl TimerAttributes {
    pub const fn new() -> Self {
        Self {
            name: "",
            kind: TimerKind::Periodic,
            clock: ClockId::Sys,
        }
    }

    pub const fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub const fn once(mut self) -> Self {
        self.kind = TimerKind::Once;
        self
    }

    pub const fn periodic(mut self) -> Self {
        self.kind = TimerKind::Periodic;
        self
    }

    pub const fn with_clock(mut self, clock: ClockId) -> Self {
        self.clock = clock;
        self
    }
}

impl Default for TimerAttributes {
    fn default() -> Self {
        Self::new()
    }
}

/// A software timer.
///
/// The embedded timestamp node is linked into the clock's timeout list
/// while the timer runs, so a started timer must not move; [`start`]
/// takes a pinned reference ([`crate::utils::static_pin`] covers the
/// common `static` case). Dropping a running timer stops it.
///
/// [`start`]: Timer::start
pub struct Timer<Traits: KernelTraits> {
    name: &'static str,
    kind: TimerKind,
    clock: ClockId,
    entry: TimerFn,
    entry_arg: usize,
    state: CpuLockCell<Traits, TimerState>,
    period: CpuLockCell<Traits, Duration>,
    node: TimeoutNode<Traits>,
    _pin: PhantomPinned,
}

// Safety: all mutable state is behind `CpuLockCell`s
unsafe impl<Traits: KernelTraits> Send for Timer<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for Timer<Traits> {}

impl<Traits: KernelTraits> Timer<Traits> {
    pub const fn new(attr: TimerAttributes, entry: TimerFn, entry_arg: usize) -> Self {
        Self {
            name: attr.name,
            kind: attr.kind,
            clock: attr.clock,
            entry,
            entry_arg,
            state: CpuLockCell::new(TimerState::Initialized),
            period: CpuLockCell::new(0),
            node: TimeoutNode::new(0, timer_action::<Traits>, 0),
            _pin: PhantomPinned,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub fn state(&self) -> TimerState {
        let lock = lock_cpu::<Traits>();
        self.state.get(&*lock)
    }

    pub fn period(&self) -> Duration {
        let lock = lock_cpu::<Traits>();
        self.period.get(&*lock)
    }

    /// Arm the timer to fire `period` clock units from now. Starting a
    /// running timer re-links it with the new period.
    pub fn start(self: Pin<&Self>, period: Duration) -> Result {
        if period == 0 {
            return Err(Error::Invalid);
        }
        let this = self.get_ref();
        let mut lock = lock_cpu::<Traits>();

        if this.node.is_linked(lock.borrow_mut()) {
            clock::remove_timeout(lock.borrow_mut(), &this.node);
        }

        this.period.replace(&mut *lock, period);
        this.node.set_param(lock.borrow_mut(), this as *const Self as usize);

        let clk = this.clock.resolve::<Traits>();
        let deadline = clk.steady_now_locked(lock.borrow_mut()) + period;
        this.node.set_timestamp(lock.borrow_mut(), deadline);

        // Safety: `self` is pinned, so the embedded node won't move
        // while linked
        let node = unsafe { self.map_unchecked(|t| &t.node) };
        clock::insert_timeout(lock.borrow_mut(), clk.steady_queue(), node);

        this.state.replace(&mut *lock, TimerState::Running);
        Ok(())
    }

    /// Disarm the timer. Fails with `Again` if it is not running.
    pub fn stop(&self) -> Result {
        let mut lock = lock_cpu::<Traits>();
        if self.state.get(&*lock) != TimerState::Running {
            return Err(Error::Again);
        }
        clock::remove_timeout(lock.borrow_mut(), &self.node);
        self.state.replace(&mut *lock, TimerState::Stopped);
        Ok(())
    }
}

impl<Traits: KernelTraits> Drop for Timer<Traits> {
    fn drop(&mut self) {
        let mut lock = lock_cpu::<Traits>();
        clock::remove_timeout(lock.borrow_mut(), &self.node);
    }
}

/// The timeout action of a timer: re-arm (periodic) or stop (one-shot),
/// then run the user callback outside the critical section.
fn timer_action<Traits: KernelTraits>(
    param: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    // Safety: the param was set in `start` from a pinned reference, and
    // a linked timer cannot be dropped without unlinking first
    let timer = unsafe { &*(param as *const Timer<Traits>) };

    match timer.kind {
        TimerKind::Periodic => {
            // Re-arm relative to the scheduled fire time.
            let fired_at = timer.node.timestamp(lock.borrow_mut());
            let period = timer.period.get(&*lock);
            timer
                .node
                .set_timestamp(lock.borrow_mut(), fired_at + period);
            let clk = timer.clock.resolve::<Traits>();
            // Safety: the timer stays pinned while Running
            let node = unsafe { Pin::new_unchecked(&timer.node) };
            clock::insert_timeout(lock.borrow_mut(), clk.steady_queue(), node);
        }
        TimerKind::Once => {
            timer.state.replace(&mut *lock, TimerState::Stopped);
        }
    }

    // The callback runs with interrupts re-enabled.
    drop(lock);
    (timer.entry)(timer.entry_arg);
    lock_cpu()
}

impl<Traits: KernelTraits> core::fmt::Debug for Timer<Traits> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Timer")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}
