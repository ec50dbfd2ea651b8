//! Event flags: a 32-bit mask with all/any/clear wait modes.
//!
//! The same flag predicate serves two homes: the shared [`EventFlags`]
//! object (multiple waiters, each with its own expected mask and mode
//! recorded in its wait node) and the per-thread flags accessed through
//! [`crate::this_thread`].
use core::fmt;

use bitflags::bitflags;

use crate::{
    clock::{self, ClockId, Duration, TimeoutNode, TimeoutRef},
    error::{Error, Result},
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    sched,
    state::expect_waitable_context,
    wait::{WaitPayload, WaitQueue},
    KernelTraits,
};

bitflags! {
    /// How a flags wait is satisfied and what happens to the bits that
    /// satisfied it.
    pub struct FlagsMode: u32 {
        /// Every bit in the expected mask must be raised.
        const ALL = 1 << 0;
        /// Any bit in the expected mask suffices.
        const ANY = 1 << 1;
        /// The satisfying bits are cleared atomically before returning.
        const CLEAR = 1 << 2;
    }
}

/// The full 32-bit mask, for use as an expected mask.
pub const FLAGS_ALL: u32 = u32::MAX;
/// A zero expected mask: any raised flag satisfies the wait.
pub const FLAGS_ANY: u32 = 0;

/// Check `current` against a wait condition; on success, return the
/// satisfying bits (clearing them from `current` when requested).
///
/// A zero `mask` is satisfied by any raised flag.
pub(crate) fn check_raised(current: &mut u32, mask: u32, mode: FlagsMode) -> Option<u32> {
    if mask == FLAGS_ANY {
        if *current != 0 {
            let out = *current;
            if mode.contains(FlagsMode::CLEAR) {
                *current = 0;
            }
            return Some(out);
        }
        return None;
    }

    let satisfied = if mode.contains(FlagsMode::ALL) {
        (*current & mask) == mask
    } else {
        (*current & mask) != 0
    };
    if satisfied {
        let out = *current & mask;
        if mode.contains(FlagsMode::CLEAR) {
            *current &= !mask;
        }
        Some(out)
    } else {
        None
    }
}

/// Evaluate the condition without consuming anything; used by `raise`
/// to pick which waiters to wake.
fn would_satisfy(current: u32, mask: u32, mode: FlagsMode) -> bool {
    let mut tmp = current;
    check_raised(&mut tmp, mask, mode & !FlagsMode::CLEAR).is_some()
}

/// A shared event-flag object.
pub struct EventFlags<Traits: KernelTraits> {
    name: &'static str,
    clock: ClockId,
    mask: CpuLockCell<Traits, u32>,
    wait_queue: WaitQueue<Traits>,
}

// Safety: all mutable state is behind `CpuLockCell`s
unsafe impl<Traits: KernelTraits> Send for EventFlags<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for EventFlags<Traits> {}

impl<Traits: KernelTraits> EventFlags<Traits> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            clock: ClockId::Sys,
            mask: CpuLockCell::new(0),
            wait_queue: WaitQueue::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Raise flags and wake the waiters whose condition now holds;
    /// each re-checks (and possibly clears) under its own wait mode.
    /// Legal from an ISR. Returns the mask before the raise.
    pub fn raise(&self, mask: u32) -> Result<u32> {
        if mask == 0 {
            return Err(Error::Invalid);
        }
        let mut lock = lock_cpu::<Traits>();
        let previous = self.mask.get(&*lock);
        let current = previous | mask;
        self.mask.replace(&mut *lock, current);

        self.wait_queue
            .resume_matching(lock.borrow_mut(), |payload| match *payload {
                WaitPayload::EventFlags { mask, mode } => would_satisfy(current, mask, mode),
                _ => false,
            });
        sched::unlock_cpu_and_check_preemption(lock);
        Ok(previous)
    }

    /// Wait until the mask satisfies `(mask, mode)`. Returns the
    /// satisfying bits, clearing them first when `CLEAR` is requested.
    pub fn wait(&self, mask: u32, mode: FlagsMode) -> Result<u32> {
        let mut lock = lock_cpu::<Traits>();
        expect_waitable_context::<Traits>(lock.borrow_mut())?;
        let me = Traits::state().sched.running.get(&*lock).unwrap();
        loop {
            if let Some(flags) = self.poll(lock.borrow_mut(), mask, mode) {
                return Ok(flags);
            }
            lock = self
                .wait_queue
                .wait(lock, WaitPayload::EventFlags { mask, mode });
            if me.cb().interrupted.get(&*lock) {
                return Err(Error::Interrupted);
            }
        }
    }

    /// Non-blocking variant of [`wait`](EventFlags::wait).
    pub fn try_wait(&self, mask: u32, mode: FlagsMode) -> Result<u32> {
        let mut lock = lock_cpu::<Traits>();
        self.poll(lock.borrow_mut(), mask, mode)
            .ok_or(Error::WouldBlock)
    }

    /// Timed variant of [`wait`](EventFlags::wait), measured in
    /// sysclock ticks.
    pub fn timed_wait(&self, mask: u32, mode: FlagsMode, timeout: Duration) -> Result<u32> {
        let mut lock = lock_cpu::<Traits>();
        expect_waitable_context::<Traits>(lock.borrow_mut())?;
        let me = Traits::state().sched.running.get(&*lock).unwrap();
        let clk = self.clock.resolve::<Traits>();
        let deadline = clk.steady_now_locked(lock.borrow_mut()) + timeout;
        loop {
            if let Some(flags) = self.poll(lock.borrow_mut(), mask, mode) {
                return Ok(flags);
            }

            let node = TimeoutNode::new_thread_wake(deadline, me);
            pin_utils::pin_mut!(node);
            clock::insert_timeout(lock.borrow_mut(), clk.steady_queue(), node.as_ref());
            me.cb()
                .clock_node
                .replace(&mut *lock, Some(TimeoutRef::new(&node)));

            lock = self
                .wait_queue
                .wait(lock, WaitPayload::EventFlags { mask, mode });

            clock::remove_timeout(lock.borrow_mut(), &node);
            me.cb().clock_node.replace(&mut *lock, None);

            if me.cb().interrupted.get(&*lock) {
                return Err(Error::Interrupted);
            }
            if clk.steady_now_locked(lock.borrow_mut()) >= deadline {
                return Err(Error::TimedOut);
            }
        }
    }

    /// Select bits from the mask: a zero `mask` returns the full mask
    /// untouched, otherwise the selected bits (cleared when `CLEAR` is
    /// in `mode`).
    pub fn get(&self, mask: u32, mode: FlagsMode) -> u32 {
        let mut lock = lock_cpu::<Traits>();
        let current = self.mask.get(&*lock);
        if mask == 0 {
            return current;
        }
        if mode.contains(FlagsMode::CLEAR) {
            self.mask.replace(&mut *lock, current & !mask);
        }
        current & mask
    }

    /// Clear bits; returns the mask before clearing.
    pub fn clear(&self, mask: u32) -> Result<u32> {
        if mask == 0 {
            return Err(Error::Invalid);
        }
        let mut lock = lock_cpu::<Traits>();
        let previous = self.mask.get(&*lock);
        self.mask.replace(&mut *lock, previous & !mask);
        Ok(previous)
    }

    /// Whether any thread is blocked on this object.
    pub fn has_waiters(&self) -> bool {
        let mut lock = lock_cpu::<Traits>();
        !self.wait_queue.is_empty(lock.borrow_mut())
    }

    #[inline]
    fn poll(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mask: u32,
        mode: FlagsMode,
    ) -> Option<u32> {
        let mut current = self.mask.get(&*lock);
        let satisfied = check_raised(&mut current, mask, mode);
        self.mask.replace(&mut *lock, current);
        satisfied
    }
}

impl<Traits: KernelTraits> Drop for EventFlags<Traits> {
    fn drop(&mut self) {
        let mut lock = lock_cpu::<Traits>();
        assert!(
            self.wait_queue.is_empty(lock.borrow_mut()),
            "event flags dropped with waiters"
        );
    }
}

impl<Traits: KernelTraits> fmt::Debug for EventFlags<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventFlags").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_mode_needs_every_bit() {
        let mut cur = 0b0010;
        assert_eq!(check_raised(&mut cur, 0b1010, FlagsMode::ALL), None);
        cur |= 0b1000;
        assert_eq!(
            check_raised(&mut cur, 0b1010, FlagsMode::ALL | FlagsMode::CLEAR),
            Some(0b1010)
        );
        assert_eq!(cur, 0);
    }

    #[test]
    fn any_mode_takes_one_bit() {
        let mut cur = 0b0100;
        assert_eq!(
            check_raised(&mut cur, 0b0110, FlagsMode::ANY),
            Some(0b0100)
        );
        assert_eq!(cur, 0b0100); // no CLEAR requested

        assert_eq!(
            check_raised(&mut cur, 0b0110, FlagsMode::ANY | FlagsMode::CLEAR),
            Some(0b0100)
        );
        assert_eq!(cur & 0b0110, 0);
    }

    #[test]
    fn zero_mask_means_any_flag() {
        let mut cur = 0;
        assert_eq!(check_raised(&mut cur, FLAGS_ANY, FlagsMode::ANY), None);
        cur = 0b1000_0000;
        assert_eq!(
            check_raised(&mut cur, FLAGS_ANY, FlagsMode::ANY | FlagsMode::CLEAR),
            Some(0b1000_0000)
        );
        assert_eq!(cur, 0);
    }
}
