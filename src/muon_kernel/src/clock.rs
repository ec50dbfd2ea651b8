//! Clocks and timed events.
//!
//! Three process-wide clocks, each a monotonic 64-bit counter with its
//! own unit: *sysclock* (ticks, steady), *rtclock* (seconds,
//! adjustable), *hrclock* (cycles, steady, derived from the tick plus a
//! sub-tick port reading).
//!
//! Every clock carries ordered lists of *timeout nodes*, each holding a
//! target timestamp and an action. The tick ISR advances the counter,
//! then pops every head whose timestamp is due and invokes its action.
//! Adjustable clocks keep a second list whose timestamps are compared
//! against the offset-adjusted time, so changing the offset shortens or
//! lengthens the remaining sleeps measured against absolute time.
use core::{fmt, marker::PhantomPinned, pin::Pin, ptr::NonNull};

use crate::{
    error::{Error, Result},
    klock::{lock_cpu, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    sched,
    state::expect_waitable_context,
    thread::ThreadRef,
    utils::intrusive_list::{Link, ListAccessorCell, ListHead, UnsafeStatic},
    wait, KernelTraits,
};

/// An absolute point on a clock, in that clock's units.
pub type Timestamp = u64;
/// A time span, in the clock's units.
pub type Duration = u64;
/// Adjustment applied to an adjustable clock's reading.
pub type Offset = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockKind {
    /// Monotonic non-decreasing, unaffected by adjustment.
    Steady,
    /// Carries an offset; `now = steady_count + offset`.
    Adjustable,
}

/// Selects one of the three kernel clocks, e.g. for a thread's timed
/// waits or a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockId {
    /// The system tick clock.
    Sys,
    /// The realtime (seconds) clock.
    Rt,
    /// The high-resolution (cycle) clock.
    Hr,
}

impl ClockId {
    pub(crate) fn resolve<Traits: KernelTraits>(self) -> &'static Clock<Traits> {
        let state = Traits::state();
        match self {
            Self::Sys => &state.sysclock,
            Self::Rt => &state.rtclock,
            Self::Hr => &state.hrclock,
        }
    }
}

/// Timeout action: runs in the tick handler's context with the CPU Lock
/// held (passed through the guard). May wake threads; the ISR tail
/// takes care of dispatching.
pub(crate) type TimeoutFn<Traits> = fn(usize, CpuLockGuard<Traits>) -> CpuLockGuard<Traits>;

/// Wrapper making a timeout-queue pointer `Send` so it can live in a
/// [`CpuLockCell`].
pub(crate) struct QueueRef<Traits: KernelTraits>(NonNull<TimeoutQueue<Traits>>);

// Safety: only dereferenced under the CPU Lock
unsafe impl<Traits: KernelTraits> Send for QueueRef<Traits> {}

impl<Traits: KernelTraits> Clone for QueueRef<Traits> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}
impl<Traits: KernelTraits> Copy for QueueRef<Traits> {}

/// A timestamp node: a target time plus the action to run when the
/// clock passes it.
///
/// Once linked, the node must stay in place until unlinked; waits keep
/// them pinned on the waiting thread's stack and timers pin themselves.
/// Dropping a node that is still linked is a kernel bug and panics.
pub(crate) struct TimeoutNode<Traits: KernelTraits> {
    timestamp: CpuLockCell<Traits, Timestamp>,
    link: CpuLockCell<Traits, Option<Link<TimeoutRef<Traits>>>>,
    /// The queue this node is currently linked in, for find-and-unlink
    /// through a back-pointer (cancellation, kill).
    home: CpuLockCell<Traits, Option<QueueRef<Traits>>>,
    action: TimeoutFn<Traits>,
    /// Opaque argument for `action`. A cell because self-referential
    /// owners (timers) can only learn their own address after
    /// construction.
    param: CpuLockCell<Traits, usize>,
    _pin: PhantomPinned,
}

impl<Traits: KernelTraits> TimeoutNode<Traits> {
    pub(crate) const fn new(timestamp: Timestamp, action: TimeoutFn<Traits>, param: usize) -> Self {
        Self {
            timestamp: CpuLockCell::new(timestamp),
            link: CpuLockCell::new(None),
            home: CpuLockCell::new(None),
            action,
            param: CpuLockCell::new(param),
            _pin: PhantomPinned,
        }
    }

    pub(crate) fn set_param(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, param: usize) {
        self.param.replace(&mut *lock, param);
    }

    /// A node that wakes `thread` when due (the timed-wait timeout).
    pub(crate) fn new_thread_wake(timestamp: Timestamp, thread: ThreadRef<Traits>) -> Self {
        Self::new(timestamp, thread_wake_action::<Traits>, thread.as_usize())
    }

    pub(crate) fn timestamp(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Timestamp {
        self.timestamp.get(&*lock)
    }

    pub(crate) fn set_timestamp(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        timestamp: Timestamp,
    ) {
        debug_assert!(self.home.get(&*lock).is_none(), "node is linked");
        self.timestamp.replace(&mut *lock, timestamp);
    }

    pub(crate) fn is_linked(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.home.get(&*lock).is_some()
    }
}

impl<Traits: KernelTraits> Drop for TimeoutNode<Traits> {
    fn drop(&mut self) {
        // Dropping a linked node would leave the queue pointing into a
        // dead stack frame.
        assert!(
            self.home.get_mut().is_none(),
            "timeout node dropped while linked"
        );
    }
}

/// A reference to a [`TimeoutNode`].
pub(crate) struct TimeoutRef<Traits: KernelTraits>(NonNull<TimeoutNode<Traits>>);

// Safety: `TimeoutNode` is only accessed under the CPU Lock
unsafe impl<Traits: KernelTraits> Send for TimeoutRef<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for TimeoutRef<Traits> {}

impl<Traits: KernelTraits> Clone for TimeoutRef<Traits> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}
impl<Traits: KernelTraits> Copy for TimeoutRef<Traits> {}

impl<Traits: KernelTraits> PartialEq for TimeoutRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits: KernelTraits> Eq for TimeoutRef<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for TimeoutRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TimeoutRef").field(&self.0).finish()
    }
}

impl<Traits: KernelTraits> TimeoutRef<Traits> {
    pub(crate) fn new(node: &TimeoutNode<Traits>) -> Self {
        Self(NonNull::from(node))
    }

    /// Linked nodes are extant: a node is unlinked before its frame is
    /// torn down.
    #[inline]
    pub(crate) fn node<'a>(self) -> &'a TimeoutNode<Traits> {
        // Safety: see above
        unsafe { &*self.0.as_ptr() }
    }
}

impl<Traits: KernelTraits> core::ops::Index<TimeoutRef<Traits>> for UnsafeStatic {
    type Output = TimeoutNode<Traits>;

    #[inline]
    fn index(&self, index: TimeoutRef<Traits>) -> &Self::Output {
        index.node()
    }
}

/// One ordered timeout list, sorted ascending by timestamp.
pub(crate) struct TimeoutQueue<Traits: KernelTraits> {
    head: CpuLockCell<Traits, ListHead<TimeoutRef<Traits>>>,
}

macro_rules! timeout_queue_accessor {
    ($queue:expr, $key:expr) => {
        // Safety: all linked timeout nodes are extant; see `TimeoutRef`
        ListAccessorCell::new(
            &$queue.head,
            unsafe { UnsafeStatic::new() },
            |node: &TimeoutNode<_>| &node.link,
            $key,
        )
    };
}

impl<Traits: KernelTraits> TimeoutQueue<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            head: CpuLockCell::new(ListHead::new()),
        }
    }
}

/// Link `node` into `queue`, keeping the list sorted ascending by
/// timestamp (FIFO among equal timestamps). The common case is a
/// near-future timestamp, so the scan starts from the tail.
pub(crate) fn insert_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    queue: &TimeoutQueue<Traits>,
    node: Pin<&TimeoutNode<Traits>>,
) {
    let node = node.get_ref();
    debug_assert!(
        node.home.get(&*lock).is_none(),
        "timeout node is already linked"
    );
    let node_ref = TimeoutRef::new(node);
    let timestamp = node.timestamp.get(&*lock);

    {
        let mut acc = timeout_queue_accessor!(queue, lock.borrow_mut());
        let mut insert_at = None;
        let mut cursor = acc.back();
        while let Some(c) = cursor {
            if acc.pool()[c].timestamp.read(&**acc.cell_key()).clone() > timestamp {
                insert_at = Some(c);
                cursor = acc.prev(c);
            } else {
                break;
            }
        }
        acc.insert(node_ref, insert_at);
    }
    node.home
        .replace(&mut *lock, Some(QueueRef(NonNull::from(queue))));
}

/// Unlink `node` from whatever queue it is in. Does nothing if it is
/// not linked (e.g. it already fired).
pub(crate) fn remove_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    node: &TimeoutNode<Traits>,
) {
    let home = match node.home.replace(&mut *lock, None) {
        Some(home) => home,
        None => return,
    };
    // Safety: a queue outlives the nodes linked in it
    let queue = unsafe { home.0.as_ref() };
    let mut acc = timeout_queue_accessor!(queue, lock.borrow_mut());
    acc.remove(TimeoutRef::new(node));
}

/// [`remove_timeout`] through a [`TimeoutRef`] (the kill path, which
/// only has the thread's back-pointer).
pub(crate) fn remove_timeout_ref<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    node_ref: TimeoutRef<Traits>,
) {
    remove_timeout(lock, node_ref.node());
}

/// The timeout action of a timed wait: drop the waiting thread's
/// back-pointer, unlink it from any waiter list, and make it Ready.
/// The woken thread observes the expiry by re-checking its deadline.
fn thread_wake_action<Traits: KernelTraits>(
    param: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    let thread = ThreadRef::<Traits>::from_usize(param);
    thread.cb().clock_node.replace(&mut *lock, None);
    if let Some(node) = thread.cb().waiting_node.replace(&mut *lock, None) {
        wait::unlink_node(lock.borrow_mut(), node);
    }
    sched::resume(lock.borrow_mut(), thread);
    lock
}

/// Pop and run every due head of `queue`.
fn process_queue<Traits: KernelTraits>(
    queue: &TimeoutQueue<Traits>,
    now: Timestamp,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    loop {
        let head = {
            let mut acc = timeout_queue_accessor!(queue, lock.borrow_mut());
            match acc.front() {
                Some(head) if acc.pool()[head].timestamp.read(&**acc.cell_key()).clone() <= now =>
                {
                    acc.remove(head);
                    head
                }
                _ => break,
            }
        };
        let node = head.node();
        node.home.replace(&mut *lock, None);
        let param = node.param.get(&*lock);
        // (The node may be re-linked by the action, e.g. a periodic
        // timer re-arming itself.)
        lock = (node.action)(param, lock);
    }
    lock
}

/// One of the kernel clocks.
pub struct Clock<Traits: KernelTraits> {
    name: &'static str,
    kind: ClockKind,
    id: ClockId,
    steady_count: CpuLockCell<Traits, u64>,
    offset: CpuLockCell<Traits, i64>,
    steady_queue: TimeoutQueue<Traits>,
    /// Timeouts measured against the adjusted time. Only populated for
    /// adjustable clocks.
    adjusted_queue: TimeoutQueue<Traits>,
}

impl<Traits: KernelTraits> Clock<Traits> {
    pub(crate) const fn new(name: &'static str, kind: ClockKind, id: ClockId) -> Self {
        Self {
            name,
            kind,
            id,
            steady_count: CpuLockCell::new(0),
            offset: CpuLockCell::new(0),
            steady_queue: TimeoutQueue::new(),
            adjusted_queue: TimeoutQueue::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> ClockKind {
        self.kind
    }

    pub(crate) fn steady_queue(&self) -> &TimeoutQueue<Traits> {
        &self.steady_queue
    }

    pub(crate) fn advance(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, by: u64) {
        let count = self.steady_count.get(&*lock);
        self.steady_count.replace(&mut *lock, count + by);
    }

    pub(crate) fn steady_now_locked(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Timestamp {
        let base = self.steady_count.get(&*lock);
        match self.id {
            ClockId::Hr => base + Traits::hrclock_subticks(),
            _ => base,
        }
    }

    pub(crate) fn now_locked(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> Timestamp {
        let steady = self.steady_now_locked(lock.borrow_mut());
        match self.kind {
            ClockKind::Steady => steady,
            ClockKind::Adjustable => steady.wrapping_add(self.offset.get(&*lock) as u64),
        }
    }

    /// The clock's current reading (offset-adjusted for adjustable
    /// clocks).
    pub fn now(&self) -> Timestamp {
        let mut lock = lock_cpu::<Traits>();
        self.now_locked(lock.borrow_mut())
    }

    /// The monotonic reading, unaffected by adjustment.
    pub fn steady_now(&self) -> Timestamp {
        let mut lock = lock_cpu::<Traits>();
        self.steady_now_locked(lock.borrow_mut())
    }

    /// The adjustment currently applied; zero for steady clocks.
    pub fn offset(&self) -> Offset {
        let lock = lock_cpu::<Traits>();
        self.offset.get(&*lock)
    }

    /// Replace the adjustment; returns the previous one. Fails with
    /// `Invalid` on a steady clock.
    pub fn set_offset(&self, offset: Offset) -> Result<Offset> {
        if self.kind != ClockKind::Adjustable {
            return Err(Error::Invalid);
        }
        let mut lock = lock_cpu::<Traits>();
        Ok(self.offset.replace(&mut *lock, offset))
    }

    /// Suspend the calling thread for at least `duration` clock units.
    ///
    /// Returns `Ok(())` once the deadline has passed, or
    /// `Err(Interrupted)` if the thread's interrupt flag was raised.
    pub fn sleep_for(&'static self, duration: Duration) -> Result {
        let mut lock = lock_cpu::<Traits>();
        expect_waitable_context::<Traits>(lock.borrow_mut())?;
        let deadline = self.steady_now_locked(lock.borrow_mut()) + duration;
        self.sleep_loop(lock, deadline, false)
    }

    /// Suspend the calling thread until the clock reads at least
    /// `deadline`. On an adjustable clock the comparison is against the
    /// adjusted time, so changing the offset moves the wake-up.
    pub fn sleep_until(&'static self, deadline: Timestamp) -> Result {
        let mut lock = lock_cpu::<Traits>();
        expect_waitable_context::<Traits>(lock.borrow_mut())?;
        self.sleep_loop(lock, deadline, self.kind == ClockKind::Adjustable)
    }

    fn sleep_loop(
        &'static self,
        mut lock: CpuLockGuard<Traits>,
        deadline: Timestamp,
        adjusted: bool,
    ) -> Result {
        let me = Traits::state()
            .sched
            .running
            .get(&*lock)
            .expect("no running thread");
        loop {
            let now = if adjusted {
                self.now_locked(lock.borrow_mut())
            } else {
                self.steady_now_locked(lock.borrow_mut())
            };
            if now >= deadline {
                return Ok(());
            }

            let queue = if adjusted {
                &self.adjusted_queue
            } else {
                &self.steady_queue
            };
            let node = TimeoutNode::new_thread_wake(deadline, me);
            pin_utils::pin_mut!(node);
            insert_timeout(lock.borrow_mut(), queue, node.as_ref());
            me.cb()
                .clock_node
                .replace(&mut *lock, Some(TimeoutRef::new(&node)));

            lock = sched::suspend_current(lock);

            remove_timeout(lock.borrow_mut(), &node);
            me.cb().clock_node.replace(&mut *lock, None);

            if me.cb().interrupted.get(&*lock) {
                return Err(Error::Interrupted);
            }
        }
    }

    /// Single-shot timed suspension: returns after the first wake
    /// regardless of cause. `Ok(())` when woken before the deadline,
    /// `Err(TimedOut)` on expiry, `Err(Interrupted)` on interrupt.
    ///
    /// Composed by primitives that pair a timeout with their own waiter
    /// queue.
    pub fn wait_for(&'static self, duration: Duration) -> Result {
        let mut lock = lock_cpu::<Traits>();
        expect_waitable_context::<Traits>(lock.borrow_mut())?;
        let me = Traits::state()
            .sched
            .running
            .get(&*lock)
            .expect("no running thread");
        let deadline = self.steady_now_locked(lock.borrow_mut()) + duration;

        let node = TimeoutNode::new_thread_wake(deadline, me);
        pin_utils::pin_mut!(node);
        insert_timeout(lock.borrow_mut(), &self.steady_queue, node.as_ref());
        me.cb()
            .clock_node
            .replace(&mut *lock, Some(TimeoutRef::new(&node)));

        lock = sched::suspend_current(lock);

        remove_timeout(lock.borrow_mut(), &node);
        me.cb().clock_node.replace(&mut *lock, None);

        if me.cb().interrupted.get(&*lock) {
            Err(Error::Interrupted)
        } else if self.steady_now_locked(lock.borrow_mut()) >= deadline {
            Err(Error::TimedOut)
        } else {
            Ok(())
        }
    }

    /// Pop and run everything due on this clock.
    pub(crate) fn process_due(&self, mut lock: CpuLockGuard<Traits>) -> CpuLockGuard<Traits> {
        let now_steady = self.steady_now_locked(lock.borrow_mut());
        lock = process_queue(&self.steady_queue, now_steady, lock);
        let now_adjusted = self.now_locked(lock.borrow_mut());
        process_queue(&self.adjusted_queue, now_adjusted, lock)
    }
}

impl<Traits: KernelTraits> fmt::Debug for Clock<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Clock")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// The system-tick ISR body: advance the tick-driven clocks, fire due
/// timeouts, and request a reschedule for the ISR tail.
pub(crate) fn systick_handler<Traits: KernelTraits>() {
    let mut lock = lock_cpu::<Traits>();
    let state = Traits::state();
    state.sysclock.advance(lock.borrow_mut(), 1);
    state
        .hrclock
        .advance(lock.borrow_mut(), Traits::HRCLOCK_CYCLES_PER_TICK);
    let lock = state.sysclock.process_due(lock);
    let lock = state.hrclock.process_due(lock);
    drop(lock);
    sched::reschedule::<Traits>();
}

/// The realtime-clock ISR body: advance the seconds counter and fire
/// due timeouts.
pub(crate) fn rtc_handler<Traits: KernelTraits>() {
    let mut lock = lock_cpu::<Traits>();
    let state = Traits::state();
    state.rtclock.advance(lock.borrow_mut(), 1);
    let lock = state.rtclock.process_due(lock);
    drop(lock);
    sched::reschedule::<Traits>();
}
