//! Counting and binary semaphores.
use core::fmt;

use crate::{
    clock::{self, ClockId, Duration, TimeoutNode, TimeoutRef},
    error::{Error, Result},
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    sched,
    state::{expect_thread_context, expect_waitable_context},
    wait::{WaitPayload, WaitQueue},
    KernelTraits,
};

/// Counter type. Signed, as in the POSIX `sem_t` tradition.
pub type SemaphoreValue = i16;

/// The largest representable count.
pub const MAX_SEMAPHORE_VALUE: SemaphoreValue = 0x7FFF;

/// A counting semaphore. A binary semaphore is a counting semaphore
/// with `max_value == 1`.
pub struct Semaphore<Traits: KernelTraits> {
    name: &'static str,
    max_value: SemaphoreValue,
    initial_value: SemaphoreValue,
    clock: ClockId,
    count: CpuLockCell<Traits, SemaphoreValue>,
    wait_queue: WaitQueue<Traits>,
}

// Safety: all mutable state is behind `CpuLockCell`s
unsafe impl<Traits: KernelTraits> Send for Semaphore<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for Semaphore<Traits> {}

impl<Traits: KernelTraits> Semaphore<Traits> {
    /// A counting semaphore bounded by `max_value`.
    pub const fn counting(
        name: &'static str,
        max_value: SemaphoreValue,
        initial_value: SemaphoreValue,
    ) -> Self {
        assert!(max_value > 0 && max_value <= MAX_SEMAPHORE_VALUE);
        assert!(initial_value >= 0 && initial_value <= max_value);
        Self {
            name,
            max_value,
            initial_value,
            clock: ClockId::Sys,
            count: CpuLockCell::new(initial_value),
            wait_queue: WaitQueue::new(),
        }
    }

    /// A binary semaphore.
    pub const fn binary(name: &'static str, initial_value: SemaphoreValue) -> Self {
        Self::counting(name, 1, initial_value)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn value(&self) -> SemaphoreValue {
        let lock = lock_cpu::<Traits>();
        self.count.get(&*lock)
    }

    pub fn initial_value(&self) -> SemaphoreValue {
        self.initial_value
    }

    pub fn max_value(&self) -> SemaphoreValue {
        self.max_value
    }

    /// Post one permit and wake the head waiter. Legal from an ISR.
    /// Fails with `Again` when the count is already at `max_value`.
    pub fn post(&self) -> Result {
        let mut lock = lock_cpu::<Traits>();
        let count = self.count.get(&*lock);
        if count >= self.max_value {
            return Err(Error::Again);
        }
        self.count.replace(&mut *lock, count + 1);
        self.wait_queue.resume_one(lock.borrow_mut());
        sched::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Take one permit, suspending until one is available.
    pub fn wait(&self) -> Result {
        let mut lock = lock_cpu::<Traits>();
        expect_waitable_context::<Traits>(lock.borrow_mut())?;
        let me = Traits::state().sched.running.get(&*lock).unwrap();
        loop {
            if self.poll_one(lock.borrow_mut()) {
                return Ok(());
            }
            lock = self.wait_queue.wait(lock, WaitPayload::Semaphore);
            if me.cb().interrupted.get(&*lock) {
                return Err(Error::Interrupted);
            }
        }
    }

    /// Non-blocking permit probe.
    pub fn try_wait(&self) -> Result {
        let mut lock = lock_cpu::<Traits>();
        if self.poll_one(lock.borrow_mut()) {
            Ok(())
        } else {
            Err(Error::WouldBlock)
        }
    }

    /// Like [`wait`](Semaphore::wait), but gives up after `timeout`
    /// sysclock ticks with `Err(TimedOut)`.
    pub fn timed_wait(&self, timeout: Duration) -> Result {
        let mut lock = lock_cpu::<Traits>();
        expect_waitable_context::<Traits>(lock.borrow_mut())?;
        let me = Traits::state().sched.running.get(&*lock).unwrap();
        let clk = self.clock.resolve::<Traits>();
        let deadline = clk.steady_now_locked(lock.borrow_mut()) + timeout;
        loop {
            if self.poll_one(lock.borrow_mut()) {
                return Ok(());
            }

            let node = TimeoutNode::new_thread_wake(deadline, me);
            pin_utils::pin_mut!(node);
            clock::insert_timeout(lock.borrow_mut(), clk.steady_queue(), node.as_ref());
            me.cb()
                .clock_node
                .replace(&mut *lock, Some(TimeoutRef::new(&node)));

            lock = self.wait_queue.wait(lock, WaitPayload::Semaphore);

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

    /// Restore the count to its initial value and wake all waiters;
    /// each consumes a permit if it can, or blocks again.
    pub fn reset(&self) -> Result {
        expect_thread_context::<Traits>()?;
        let mut lock = lock_cpu::<Traits>();
        self.count.replace(&mut *lock, self.initial_value);
        self.wait_queue.resume_all(lock.borrow_mut());
        sched::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    #[inline]
    fn poll_one(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        let count = self.count.get(&*lock);
        if count > 0 {
            self.count.replace(&mut *lock, count - 1);
            true
        } else {
            false
        }
    }
}

impl<Traits: KernelTraits> Drop for Semaphore<Traits> {
    fn drop(&mut self) {
        let mut lock = lock_cpu::<Traits>();
        assert!(
            self.wait_queue.is_empty(lock.borrow_mut()),
            "semaphore dropped with waiters"
        );
    }
}

impl<Traits: KernelTraits> fmt::Debug for Semaphore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("name", &self.name)
            .field("max_value", &self.max_value)
            .finish()
    }
}
