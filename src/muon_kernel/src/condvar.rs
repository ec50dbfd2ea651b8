//! Condition variables.
//!
//! A condition variable is just a waiter list tied to an external
//! mutex: `wait` releases the mutex and links the caller in one
//! critical section (so no signal can slip between), and re-acquires
//! the mutex before returning, whatever the cause of the wake was.
use core::fmt;

use crate::{
    clock::{self, ClockId, Duration, TimeoutNode, TimeoutRef},
    error::{Error, Result},
    klock::lock_cpu,
    mutex::Mutex,
    sched,
    state::{expect_thread_context, expect_waitable_context},
    wait::{WaitPayload, WaitQueue},
    KernelTraits,
};

/// A condition variable.
pub struct ConditionVariable<Traits: KernelTraits> {
    name: &'static str,
    clock: ClockId,
    wait_queue: WaitQueue<Traits>,
}

// Safety: all mutable state is behind `CpuLockCell`s
unsafe impl<Traits: KernelTraits> Send for ConditionVariable<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for ConditionVariable<Traits> {}

impl<Traits: KernelTraits> ConditionVariable<Traits> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            clock: ClockId::Sys,
            wait_queue: WaitQueue::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Atomically release `mutex` and suspend on this condition
    /// variable; re-acquire `mutex` before returning.
    ///
    /// The caller must own `mutex`. As always with condition variables,
    /// the predicate must be re-checked by the caller — wakes may be
    /// spurious.
    pub fn wait(&self, mutex: &Mutex<Traits>) -> Result {
        self.wait_inner(mutex, None)
    }

    /// Like [`wait`](ConditionVariable::wait), but gives up waiting
    /// after `timeout` sysclock ticks. Returns `Err(TimedOut)` — with
    /// the mutex re-acquired first.
    pub fn timed_wait(&self, mutex: &Mutex<Traits>, timeout: Duration) -> Result {
        self.wait_inner(mutex, Some(timeout))
    }

    fn wait_inner(&self, mutex: &Mutex<Traits>, timeout: Option<Duration>) -> Result {
        let mut lock = lock_cpu::<Traits>();
        expect_waitable_context::<Traits>(lock.borrow_mut())?;
        let me = Traits::state().sched.running.get(&*lock).unwrap();
        if !mutex.is_owned_by(lock.borrow_mut(), me) {
            return Err(Error::Permission);
        }

        let clk = self.clock.resolve::<Traits>();
        let deadline = timeout.map(|timeout| clk.steady_now_locked(lock.borrow_mut()) + timeout);

        // Release the mutex and link ourselves without leaving the
        // critical section; a signal cannot be lost in between. The
        // release may wake a mutex waiter; the dispatch happens when we
        // suspend below.
        //
        // The release itself can report the mutex terminally unusable
        // (a robust mutex released without `mark_consistent`). The
        // ownership is gone either way, so the wait still proceeds and
        // the failure resurfaces from the re-acquisition below — the
        // caller always observes the release/suspend/reacquire
        // sequence.
        if let Err(err) = mutex.unlock_core(lock.borrow_mut(), me) {
            debug_assert_eq!(err, Error::NotRecoverable);
        }

        let timed_out;
        if let Some(deadline) = deadline {
            let node = TimeoutNode::new_thread_wake(deadline, me);
            pin_utils::pin_mut!(node);
            clock::insert_timeout(lock.borrow_mut(), clk.steady_queue(), node.as_ref());
            me.cb()
                .clock_node
                .replace(&mut *lock, Some(TimeoutRef::new(&node)));

            lock = self.wait_queue.wait(lock, WaitPayload::CondVar);

            clock::remove_timeout(lock.borrow_mut(), &node);
            me.cb().clock_node.replace(&mut *lock, None);
            timed_out = clk.steady_now_locked(lock.borrow_mut()) >= deadline;
        } else {
            lock = self.wait_queue.wait(lock, WaitPayload::CondVar);
            timed_out = false;
        }
        let interrupted = me.cb().interrupted.get(&*lock);
        drop(lock);

        // Re-acquire the mutex before reporting anything, forwarding a
        // mutex error (e.g. `OwnerDead`) when one occurs.
        mutex.lock()?;

        if interrupted {
            Err(Error::Interrupted)
        } else if timed_out {
            Err(Error::TimedOut)
        } else {
            Ok(())
        }
    }

    /// Wake the head waiter, if any. Rejected in handler mode.
    pub fn signal(&self) -> Result {
        expect_thread_context::<Traits>()?;
        let mut lock = lock_cpu::<Traits>();
        self.wait_queue.resume_one(lock.borrow_mut());
        sched::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Wake all waiters. Rejected in handler mode.
    pub fn broadcast(&self) -> Result {
        expect_thread_context::<Traits>()?;
        let mut lock = lock_cpu::<Traits>();
        self.wait_queue.resume_all(lock.borrow_mut());
        sched::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

impl<Traits: KernelTraits> Drop for ConditionVariable<Traits> {
    fn drop(&mut self) {
        let mut lock = lock_cpu::<Traits>();
        assert!(
            self.wait_queue.is_empty(lock.borrow_mut()),
            "condition variable dropped with waiters"
        );
    }
}

impl<Traits: KernelTraits> fmt::Debug for ConditionVariable<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("name", &self.name)
            .finish()
    }
}
