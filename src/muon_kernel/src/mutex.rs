//! Mutexes with priority-inheritance / priority-ceiling protocols,
//! recursion, and robustness.
//!
//! Ownership is tracked both ways: the mutex holds the owner thread,
//! and the owner's control block heads an intrusive list of all the
//! mutexes it holds (linked through each mutex's `owner_link`). Neither
//! side owns the other in a lifetime sense.
//!
//! Acquisition follows the retry discipline: a failed probe suspends
//! the caller on the priority-ordered waiter list; a release wakes the
//! head waiter, which re-runs the probe.
use core::{fmt, ptr::NonNull};

use crate::{
    clock::{self, ClockId, Duration, TimeoutNode, TimeoutRef},
    error::{Error, Result},
    klock::{lock_cpu, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    priority, sched,
    state::{expect_thread_context, expect_waitable_context},
    thread::{self, ThreadRef},
    utils::intrusive_list::{Link, ListAccessorCell, UnsafeStatic},
    wait::{self, WaitPayload, WaitQueue},
    KernelTraits,
};

/// What happens when the owner relocks, and what unlock checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexType {
    /// No owner checks; relocking by the owner blocks forever.
    Normal,
    /// Relocking fails with `Deadlock`; unlock by a non-owner fails
    /// with `Permission`.
    ErrorCheck,
    /// Relocking increments a counter bounded by `max_count`.
    Recursive,
}

/// The priority protocol applied while the mutex is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    None,
    /// The owner inherits the effective priority of the
    /// highest-priority blocked waiter, transitively across ownership
    /// chains.
    Inherit,
    /// The owner runs at the mutex's priority ceiling for the whole
    /// critical section.
    Protect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexRobustness {
    /// Owner death leaves waiters blocked forever.
    Stalled,
    /// Owner death hands the mutex to the next acquirer with
    /// [`Error::OwnerDead`]; see [`Mutex::mark_consistent`].
    Robust,
}

/// Construction-time attributes of a mutex.
#[derive(Clone, Copy)]
pub struct MutexAttributes {
    pub name: &'static str,
    pub type_: MutexType,
    pub protocol: MutexProtocol,
    pub robustness: MutexRobustness,
    /// Recursion bound for `Recursive` mutexes.
    pub max_count: u16,
    pub priority_ceiling: u8,
    /// The clock timed locks are measured against.
    pub clock: ClockId,
}

impl MutexAttributes {
    pub const fn new() -> Self {
        Self {
            name: "",
            type_: MutexType::Normal,
            protocol: MutexProtocol::Inherit,
            robustness: MutexRobustness::Stalled,
            max_count: u16::MAX,
            priority_ceiling: priority::HIGHEST,
            clock: ClockId::Sys,
        }
    }

    pub const fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub const fn recursive(mut self) -> Self {
        self.type_ = MutexType::Recursive;
        self
    }

    pub const fn errorcheck(mut self) -> Self {
        self.type_ = MutexType::ErrorCheck;
        self
    }

    pub const fn robust(mut self) -> Self {
        self.robustness = MutexRobustness::Robust;
        self
    }

    pub const fn with_protocol(mut self, protocol: MutexProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub const fn with_max_count(mut self, max_count: u16) -> Self {
        self.max_count = max_count;
        self
    }

    pub const fn with_priority_ceiling(mut self, ceiling: u8) -> Self {
        self.priority_ceiling = ceiling;
        self
    }

    pub const fn with_clock(mut self, clock: ClockId) -> Self {
        self.clock = clock;
        self
    }
}

impl Default for MutexAttributes {
    fn default() -> Self {
        Self::new()
    }
}

/// A reference to a [`Mutex`], as linked in a thread's owned-mutex
/// list.
pub(crate) struct MutexRef<Traits: KernelTraits>(NonNull<Mutex<Traits>>);

// Safety: `Mutex` is `Send + Sync`
unsafe impl<Traits: KernelTraits> Send for MutexRef<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for MutexRef<Traits> {}

impl<Traits: KernelTraits> Clone for MutexRef<Traits> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}
impl<Traits: KernelTraits> Copy for MutexRef<Traits> {}

impl<Traits: KernelTraits> PartialEq for MutexRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits: KernelTraits> Eq for MutexRef<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for MutexRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("MutexRef").field(&self.0).finish()
    }
}

impl<Traits: KernelTraits> MutexRef<Traits> {
    pub(crate) fn new(mutex: &Mutex<Traits>) -> Self {
        Self(NonNull::from(mutex))
    }

    /// A mutex linked in kernel state is extant: it unlinks itself (and
    /// asserts emptiness) before dropping.
    #[inline]
    pub(crate) fn mutex<'a>(self) -> &'a Mutex<Traits> {
        // Safety: see above
        unsafe { &*self.0.as_ptr() }
    }
}

impl<Traits: KernelTraits> core::ops::Index<MutexRef<Traits>> for UnsafeStatic {
    type Output = Mutex<Traits>;

    #[inline]
    fn index(&self, index: MutexRef<Traits>) -> &Self::Output {
        index.mutex()
    }
}

/// Get a `ListAccessorCell` for a thread's owned-mutex list.
macro_rules! owned_list_accessor {
    ($owner:expr, $key:expr) => {
        // Safety: owned mutexes are unlinked before they can be dropped
        ListAccessorCell::new(
            &$owner.cb().owned_mutexes,
            unsafe { UnsafeStatic::new() },
            |m: &Mutex<_>| &m.owner_link,
            $key,
        )
    };
}

/// Outcome of a successful acquisition probe.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Acquired {
    Clean,
    /// Acquired, but the previous owner died while holding the lock.
    OwnerDead,
}

/// A mutex.
pub struct Mutex<Traits: KernelTraits> {
    name: &'static str,
    type_: MutexType,
    protocol: MutexProtocol,
    robustness: MutexRobustness,
    max_count: u16,
    initial_ceiling: u8,
    clock: ClockId,

    owner: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,
    count: CpuLockCell<Traits, u16>,
    ceiling: CpuLockCell<Traits, u8>,
    /// The priority contribution this mutex currently applies to its
    /// owner; [`priority::NONE`] when none.
    boosted_priority: CpuLockCell<Traits, u8>,
    owner_dead: CpuLockCell<Traits, bool>,
    consistent: CpuLockCell<Traits, bool>,
    recoverable: CpuLockCell<Traits, bool>,

    /// Node for the owner's owned-mutex list.
    owner_link: CpuLockCell<Traits, Option<Link<MutexRef<Traits>>>>,
    wait_queue: WaitQueue<Traits>,
}

// Safety: all mutable state is behind `CpuLockCell`s
unsafe impl<Traits: KernelTraits> Send for Mutex<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for Mutex<Traits> {}

impl<Traits: KernelTraits> Mutex<Traits> {
    pub const fn new(attr: MutexAttributes) -> Self {
        assert!(
            attr.priority_ceiling >= priority::LOWEST && attr.priority_ceiling <= priority::HIGHEST,
            "priority ceiling out of range"
        );
        Self {
            name: attr.name,
            type_: attr.type_,
            protocol: attr.protocol,
            robustness: attr.robustness,
            max_count: attr.max_count,
            initial_ceiling: attr.priority_ceiling,
            clock: attr.clock,
            owner: CpuLockCell::new(None),
            count: CpuLockCell::new(0),
            ceiling: CpuLockCell::new(attr.priority_ceiling),
            boosted_priority: CpuLockCell::new(priority::NONE),
            owner_dead: CpuLockCell::new(false),
            consistent: CpuLockCell::new(true),
            recoverable: CpuLockCell::new(true),
            owner_link: CpuLockCell::new(None),
            wait_queue: WaitQueue::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_(&self) -> MutexType {
        self.type_
    }

    pub fn protocol(&self) -> MutexProtocol {
        self.protocol
    }

    pub fn robustness(&self) -> MutexRobustness {
        self.robustness
    }

    pub fn is_locked(&self) -> bool {
        let lock = lock_cpu::<Traits>();
        self.owner.get(&*lock).is_some()
    }

    /// The recursion depth (0 when free).
    pub fn count(&self) -> u16 {
        let lock = lock_cpu::<Traits>();
        self.count.get(&*lock)
    }

    pub fn priority_ceiling(&self) -> u8 {
        let lock = lock_cpu::<Traits>();
        self.ceiling.get(&*lock)
    }

    /// Whether `thread` currently owns the lock.
    pub(crate) fn is_owned_by(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        thread: ThreadRef<Traits>,
    ) -> bool {
        self.owner.get(&*lock) == Some(thread)
    }

    /// Acquire the mutex, blocking while another thread owns it.
    ///
    /// Returns `Err(OwnerDead)` when a robust mutex is handed over from
    /// a dead owner — the caller then holds the lock and is expected to
    /// repair the protected state and call [`mark_consistent`].
    ///
    /// [`mark_consistent`]: Mutex::mark_consistent
    pub fn lock(&self) -> Result {
        match self.lock_internal(None, true)? {
            Acquired::Clean => Ok(()),
            Acquired::OwnerDead => Err(Error::OwnerDead),
        }
    }

    /// Like [`lock`](Mutex::lock), but gives up after `timeout` units
    /// of the mutex's clock with `Err(TimedOut)`.
    pub fn timed_lock(&self, timeout: Duration) -> Result {
        match self.lock_internal(Some(timeout), true)? {
            Acquired::Clean => Ok(()),
            Acquired::OwnerDead => Err(Error::OwnerDead),
        }
    }

    /// Non-blocking acquisition probe; fails with `WouldBlock` when the
    /// mutex is held by another thread.
    pub fn try_lock(&self) -> Result {
        expect_thread_context::<Traits>()?;
        let mut lock = lock_cpu::<Traits>();
        if !self.recoverable.get(&*lock) {
            return Err(Error::NotRecoverable);
        }
        let me = Traits::state()
            .sched
            .running
            .get(&*lock)
            .ok_or(Error::Permission)?;
        match self.try_acquire(lock.borrow_mut(), me, true)? {
            Acquired::Clean => Ok(()),
            Acquired::OwnerDead => Err(Error::OwnerDead),
        }
    }

    /// The blocking acquisition loop shared by `lock`, `timed_lock` and
    /// the priority-ceiling setter (which bypasses the `Protect`
    /// validation while it updates the ceiling).
    fn lock_internal(&self, timeout: Option<Duration>, honor_protect: bool) -> Result<Acquired> {
        let mut lock = lock_cpu::<Traits>();
        expect_waitable_context::<Traits>(lock.borrow_mut())?;
        if !self.recoverable.get(&*lock) {
            return Err(Error::NotRecoverable);
        }
        let me = Traits::state().sched.running.get(&*lock).unwrap();

        let clk = self.clock.resolve::<Traits>();
        let deadline =
            timeout.map(|timeout| clk.steady_now_locked(lock.borrow_mut()) + timeout);

        loop {
            match self.try_acquire(lock.borrow_mut(), me, honor_protect) {
                Err(Error::WouldBlock) => {}
                other => return other,
            }

            // Blocked: suspend on the waiter list, with the timeout
            // node linked in the same critical section when a deadline
            // was requested.
            if let Some(deadline) = deadline {
                let node = TimeoutNode::new_thread_wake(deadline, me);
                pin_utils::pin_mut!(node);
                clock::insert_timeout(lock.borrow_mut(), clk.steady_queue(), node.as_ref());
                me.cb()
                    .clock_node
                    .replace(&mut *lock, Some(TimeoutRef::new(&node)));

                lock = self
                    .wait_queue
                    .wait(lock, WaitPayload::Mutex(MutexRef::new(self)));

                clock::remove_timeout(lock.borrow_mut(), &node);
                me.cb().clock_node.replace(&mut *lock, None);
            } else {
                lock = self
                    .wait_queue
                    .wait(lock, WaitPayload::Mutex(MutexRef::new(self)));
            }

            if me.cb().interrupted.get(&*lock) {
                self.rebalance_after_waiter_left(lock.borrow_mut());
                return Err(Error::Interrupted);
            }
            if let Some(deadline) = deadline {
                if clk.steady_now_locked(lock.borrow_mut()) >= deadline {
                    self.rebalance_after_waiter_left(lock.borrow_mut());
                    return Err(Error::TimedOut);
                }
            }
        }
    }

    /// One acquisition probe. Returns `Err(WouldBlock)` when the caller
    /// should suspend.
    fn try_acquire(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        me: ThreadRef<Traits>,
        honor_protect: bool,
    ) -> Result<Acquired> {
        let owner = self.owner.get(&*lock);

        if owner.is_none() {
            // First lock: take ownership.
            self.owner.replace(&mut *lock, Some(me));
            self.count.replace(&mut *lock, 1);
            {
                let mut acc = owned_list_accessor!(me, lock.borrow_mut());
                acc.push_back(MutexRef::new(self));
            }
            let acquired = me.cb().acquired_mutexes.get(&*lock);
            me.cb().acquired_mutexes.replace(&mut *lock, acquired + 1);

            if self.protocol == MutexProtocol::Protect && honor_protect {
                let ceiling = self.ceiling.get(&*lock);
                if me.cb().effective_priority(&*lock) > ceiling {
                    // The ceiling must be at least the priority of the
                    // highest-priority locking thread; undo.
                    {
                        let mut acc = owned_list_accessor!(me, lock.borrow_mut());
                        acc.remove(MutexRef::new(self));
                    }
                    me.cb().acquired_mutexes.replace(&mut *lock, acquired);
                    self.owner.replace(&mut *lock, None);
                    self.count.replace(&mut *lock, 0);
                    return Err(Error::Invalid);
                }
                self.boosted_priority.replace(&mut *lock, ceiling);
                if ceiling > me.cb().priority_inherited.get(&*lock) {
                    thread::set_inherited_priority(lock.borrow_mut(), me, ceiling);
                }
            }

            if self.owner_dead.get(&*lock) {
                return Ok(Acquired::OwnerDead);
            }
            return Ok(Acquired::Clean);
        }

        if owner == Some(me) {
            // Relock by the owner.
            return match self.type_ {
                MutexType::Recursive => {
                    let count = self.count.get(&*lock);
                    if count >= self.max_count {
                        Err(Error::Again)
                    } else {
                        self.count.replace(&mut *lock, count + 1);
                        Ok(Acquired::Clean)
                    }
                }
                MutexType::ErrorCheck => Err(Error::Deadlock),
                MutexType::Normal => Err(Error::WouldBlock),
            };
        }

        // Another thread owns the mutex. Under the inherit protocol the
        // owner executes at the highest effective priority among the
        // blocked threads, propagated recursively when the owner itself
        // is blocked on another inherit-protocol mutex.
        let owner = owner.unwrap();
        if self.protocol == MutexProtocol::Inherit {
            let prio = me.cb().effective_priority(&*lock);
            if prio > self.boosted_priority.get(&*lock) {
                self.boosted_priority.replace(&mut *lock, prio);
            }
            let boosted = self.boosted_priority.get(&*lock);
            if boosted > owner.cb().priority_inherited.get(&*lock) {
                raise_inherited_chain(lock.borrow_mut(), owner, boosted);
            }
        }

        Err(Error::WouldBlock)
    }

    /// A waiter gave up (timeout or interrupt): re-derive this mutex's
    /// boost from the remaining waiters and the owner's inherited
    /// priority from all its owned mutexes, so no stale boost survives.
    fn rebalance_after_waiter_left(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        if self.protocol != MutexProtocol::Inherit
            || self.boosted_priority.get(&*lock) == priority::NONE
        {
            return;
        }
        let remaining = self
            .wait_queue
            .max_waiter_priority(lock.borrow_mut())
            .unwrap_or(priority::NONE);
        self.boosted_priority.replace(&mut *lock, remaining);
        if let Some(owner) = self.owner.get(&*lock) {
            refresh_inherited_priority(lock.borrow_mut(), owner);
        }
    }

    /// Release the mutex. The manner depends on the type and
    /// robustness; see the error table in the crate documentation.
    pub fn unlock(&self) -> Result {
        expect_thread_context::<Traits>()?;
        let mut lock = lock_cpu::<Traits>();
        let me = Traits::state()
            .sched
            .running
            .get(&*lock)
            .ok_or(Error::Permission)?;
        let result = self.unlock_core(lock.borrow_mut(), me);
        sched::unlock_cpu_and_check_preemption(lock);
        result
    }

    /// The release path proper, runnable inside a caller-provided
    /// critical section (the condition variable releases the mutex and
    /// links its wait node atomically this way).
    pub(crate) fn unlock_core(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        me: ThreadRef<Traits>,
    ) -> Result {
        if !self.recoverable.get(&*lock) {
            return Err(Error::NotRecoverable);
        }

        if self.owner.get(&*lock) != Some(me) {
            // Not the rightful owner.
            return if self.type_ == MutexType::ErrorCheck
                || self.type_ == MutexType::Recursive
                || self.robustness == MutexRobustness::Robust
            {
                Err(Error::Permission)
            } else {
                // Normal non-robust: nominally undefined; reported as
                // unrecoverable rather than asserted.
                Err(Error::NotRecoverable)
            };
        }

        if self.type_ == MutexType::Recursive {
            let count = self.count.get(&*lock);
            if count > 1 {
                self.count.replace(&mut *lock, count - 1);
                return Ok(());
            }
        }

        let acquired = me.cb().acquired_mutexes.get(&*lock);
        me.cb().acquired_mutexes.replace(&mut *lock, acquired - 1);
        {
            let mut acc = owned_list_accessor!(me, lock.borrow_mut());
            acc.remove(MutexRef::new(self));
        }

        // The departing owner's boost is removed before the new owner's
        // is applied, inside the same critical section — no window in
        // which the owner runs at the inherited priority is observable.
        if self.boosted_priority.get(&*lock) != priority::NONE {
            self.boosted_priority.replace(&mut *lock, priority::NONE);
            refresh_inherited_priority(lock.borrow_mut(), me);
        }

        self.wait_queue.resume_one(lock.borrow_mut());

        self.owner.replace(&mut *lock, None);
        self.count.replace(&mut *lock, 0);

        if self.owner_dead.get(&*lock) {
            self.owner_dead.replace(&mut *lock, false);
            if !self.consistent.get(&*lock) {
                // Released without `mark_consistent` after an owner
                // death: permanently unusable from here on.
                self.recoverable.replace(&mut *lock, false);
                return Err(Error::NotRecoverable);
            }
        }

        Ok(())
    }

    /// Declare the state protected by this robust mutex repaired after
    /// an `OwnerDead` acquisition. Legal only for the thread currently
    /// holding the lock, and only after an owner death was observed.
    pub fn mark_consistent(&self) -> Result {
        let mut lock = lock_cpu::<Traits>();
        let me = Traits::state()
            .sched
            .running
            .get(&*lock)
            .ok_or(Error::Permission)?;
        if self.owner.get(&*lock) != Some(me) {
            return Err(Error::Permission);
        }
        if !self.owner_dead.get(&*lock) {
            return Err(Error::Invalid);
        }
        self.consistent.replace(&mut *lock, true);
        Ok(())
    }

    /// Change the priority ceiling; returns the previous one. The
    /// update is an acquire-update-release sequence that does not
    /// itself adhere to the `Protect` validation.
    pub fn set_priority_ceiling(&self, ceiling: u8) -> Result<u8> {
        if ceiling < priority::LOWEST || ceiling > priority::HIGHEST {
            return Err(Error::Invalid);
        }
        self.lock_internal(None, false)?;
        let previous = {
            let mut lock = lock_cpu::<Traits>();
            self.ceiling.replace(&mut *lock, ceiling)
        };
        self.unlock()?;
        Ok(previous)
    }

    /// Force the mutex back to its pristine state and wake all waiters;
    /// each re-runs its acquisition loop and observes the outcome of
    /// the retry.
    pub fn reset(&self) -> Result {
        expect_thread_context::<Traits>()?;
        let mut lock = lock_cpu::<Traits>();

        if let Some(owner) = self.owner.get(&*lock) {
            let acquired = owner.cb().acquired_mutexes.get(&*lock);
            owner
                .cb()
                .acquired_mutexes
                .replace(&mut *lock, acquired - 1);
            {
                let mut acc = owned_list_accessor!(owner, lock.borrow_mut());
                acc.remove(MutexRef::new(self));
            }
            if self.boosted_priority.get(&*lock) != priority::NONE {
                self.boosted_priority.replace(&mut *lock, priority::NONE);
                refresh_inherited_priority(lock.borrow_mut(), owner);
            }
        }

        self.owner.replace(&mut *lock, None);
        self.count.replace(&mut *lock, 0);
        self.ceiling.replace(&mut *lock, self.initial_ceiling);
        self.boosted_priority.replace(&mut *lock, priority::NONE);
        self.owner_dead.replace(&mut *lock, false);
        self.consistent.replace(&mut *lock, true);
        self.recoverable.replace(&mut *lock, true);

        self.wait_queue.resume_all(lock.borrow_mut());
        sched::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

impl<Traits: KernelTraits> Drop for Mutex<Traits> {
    fn drop(&mut self) {
        let mut lock = lock_cpu::<Traits>();
        assert!(
            self.owner.get(&*lock).is_none() && self.wait_queue.is_empty(lock.borrow_mut()),
            "mutex dropped while in use"
        );
    }
}

impl<Traits: KernelTraits> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("name", &self.name)
            .field("type", &self.type_)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Raise `thread`'s inherited priority to `boost` and propagate along
/// the chain of inherit-protocol mutexes the successive owners are
/// blocked on.
fn raise_inherited_chain<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
    boost: u8,
) {
    let mut thread = thread;
    loop {
        if boost <= thread.cb().priority_inherited.get(&*lock) {
            return;
        }
        thread::set_inherited_priority(lock.borrow_mut(), thread, boost);

        let next = match wait::waited_mutex(lock.borrow_mut(), thread) {
            Some(m) if m.mutex().protocol == MutexProtocol::Inherit => m,
            _ => return,
        };
        let mutex = next.mutex();
        if boost > mutex.boosted_priority.get(&*lock) {
            mutex.boosted_priority.replace(&mut *lock, boost);
        }
        thread = match mutex.owner.get(&*lock) {
            Some(owner) => owner,
            None => return,
        };
    }
}

/// Recompute a thread's inherited priority as the maximum boost across
/// the mutexes it still owns.
pub(crate) fn refresh_inherited_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
) {
    let mut max_boost = priority::NONE;
    {
        let acc = owned_list_accessor!(thread, lock.borrow_mut());
        let mut cur = acc.front();
        while let Some(m) = cur {
            let boost = acc.pool()[m].boosted_priority.read(&**acc.cell_key()).clone();
            if boost > max_boost {
                max_boost = boost;
            }
            cur = acc.next(m);
        }
    }
    thread::set_inherited_priority(lock.borrow_mut(), thread, max_boost);
}

/// Release every mutex held by a dying thread, marking robust ones
/// owner-dead, and wake their next waiters. The thread's own effective
/// priority is not restored — it is never scheduled again.
pub(crate) fn abandon_held_mutexes<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
    thread: ThreadRef<Traits>,
) -> CpuLockGuard<Traits> {
    loop {
        let m = {
            let mut acc = owned_list_accessor!(thread, lock.borrow_mut());
            match acc.pop_front() {
                Some(m) => m,
                None => break,
            }
        };
        let mutex = m.mutex();

        if mutex.robustness == MutexRobustness::Robust {
            mutex.owner_dead.replace(&mut *lock, true);
            mutex.consistent.replace(&mut *lock, false);
        }

        let acquired = thread.cb().acquired_mutexes.get(&*lock);
        thread
            .cb()
            .acquired_mutexes
            .replace(&mut *lock, acquired - 1);
        mutex.boosted_priority.replace(&mut *lock, priority::NONE);
        mutex.owner.replace(&mut *lock, None);
        mutex.count.replace(&mut *lock, 0);
        mutex.wait_queue.resume_one(lock.borrow_mut());
    }
    lock
}
