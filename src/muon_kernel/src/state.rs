//! Process-wide kernel state.
//!
//! The scheduler singleton, the three clocks, the terminated list and
//! the top-level thread list are global mutable state initialized once
//! at startup and torn down never. They live in a single
//! [`KernelState`] value that the port makes available through
//! [`KernelTraits::state`], keeping construction free of
//! order-of-initialization traps.
use crate::{
    clock::{Clock, ClockId, ClockKind},
    error::{Error, Result},
    klock::CpuLockTokenRefMut,
    sched::SchedState,
    KernelTraits,
};

/// All kernel-global mutable state for one kernel instance.
pub struct KernelState<Traits: KernelTraits> {
    pub(crate) sched: SchedState<Traits>,
    pub(crate) sysclock: Clock<Traits>,
    pub(crate) rtclock: Clock<Traits>,
    pub(crate) hrclock: Clock<Traits>,
}

impl<Traits: KernelTraits> KernelState<Traits> {
    pub const fn new() -> Self {
        Self {
            sched: SchedState::new(),
            sysclock: Clock::new("sysclock", ClockKind::Steady, ClockId::Sys),
            rtclock: Clock::new("rtclock", ClockKind::Adjustable, ClockId::Rt),
            hrclock: Clock::new("hrclock", ClockKind::Steady, ClockId::Hr),
        }
    }
}

/// Fail with `Permission` unless the caller is a thread (not an ISR).
pub(crate) fn expect_thread_context<Traits: KernelTraits>() -> Result {
    if Traits::in_handler_mode() {
        Err(Error::Permission)
    } else {
        Ok(())
    }
}

/// Fail with `Permission` unless the caller may block: thread context,
/// scheduler started and not locked.
pub(crate) fn expect_waitable_context<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result {
    let sched = &Traits::state().sched;
    if Traits::in_handler_mode()
        || sched.lock_count.get(&*lock) != 0
        || sched.running.get(&*lock).is_none()
    {
        Err(Error::Permission)
    } else {
        Ok(())
    }
}
