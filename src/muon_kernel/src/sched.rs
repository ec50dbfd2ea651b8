//! The preemptive priority scheduler.
//!
//! The ready list is an intrusive list ordered by effective priority,
//! highest first, FIFO among equals. The running thread is *not* linked
//! in the ready list. There is no time slicing: an equal-priority peer
//! only runs when the current thread blocks, exits, or yields.
use crate::{
    error::{Error, Result},
    klock::{lock_cpu, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state::expect_thread_context,
    thread::{self, ThreadCb, ThreadRef, ThreadState},
    utils::intrusive_list::{ListAccessorCell, ListHead, UnsafeStatic},
    KernelTraits,
};

/// A snapshot of the scheduler lock counter, as returned by
/// [`System::lock`] and restored by [`System::set_locked`].
///
/// [`System::lock`]: crate::System::lock
/// [`System::set_locked`]: crate::System::set_locked
pub type SchedulerLockState = u32;

/// Scheduler state: ready queue, current thread, lock counter,
/// preemption flag, and the deferred-cleanup (terminated) list.
pub(crate) struct SchedState<Traits: KernelTraits> {
    pub(crate) running: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,
    pub(crate) ready: CpuLockCell<Traits, ListHead<ThreadRef<Traits>>>,
    /// Threads awaiting deferred cleanup, drained by the idle thread.
    /// Linked through the same node as the ready list; a thread is never
    /// in both.
    pub(crate) terminated: CpuLockCell<Traits, ListHead<ThreadRef<Traits>>>,
    /// Threads with no parent (the children list of "nobody").
    pub(crate) top_threads: CpuLockCell<Traits, ListHead<ThreadRef<Traits>>>,
    pub(crate) lock_count: CpuLockCell<Traits, u32>,
    pub(crate) preemptive: CpuLockCell<Traits, bool>,
    pub(crate) initialized: CpuLockCell<Traits, bool>,
    pub(crate) started: CpuLockCell<Traits, bool>,
    pub(crate) idle: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,
}

impl<Traits: KernelTraits> SchedState<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            running: CpuLockCell::new(None),
            ready: CpuLockCell::new(ListHead::new()),
            terminated: CpuLockCell::new(ListHead::new()),
            top_threads: CpuLockCell::new(ListHead::new()),
            lock_count: CpuLockCell::new(0),
            preemptive: CpuLockCell::new(true),
            initialized: CpuLockCell::new(false),
            started: CpuLockCell::new(false),
            idle: CpuLockCell::new(None),
        }
    }
}

/// Get a `ListAccessorCell` for the ready list (or any other list linked
/// through `ThreadCb::ready_link`).
macro_rules! thread_list_accessor {
    ($head:expr, $key:expr) => {
        // Safety: every thread linked in a scheduler list is kept alive
        //     until it has been unlinked from all of them.
        ListAccessorCell::new(
            $head,
            unsafe { UnsafeStatic::new() },
            |cb: &ThreadCb<Traits>| &cb.ready_link,
            $key,
        )
    };
}

/// Find the ordered-insertion position for priority `prio`: after every
/// linked thread of priority `>= prio` (FIFO within equals), scanning
/// from the tail because new arrivals usually go last.
macro_rules! position_by_priority {
    ($acc:expr, $prio:expr) => {{
        let mut insert_at = None;
        let mut cursor = $acc.back();
        while let Some(c) = cursor {
            let c_prio = $acc.pool()[c].effective_priority(&**$acc.cell_key());
            if c_prio < $prio {
                insert_at = Some(c);
                cursor = $acc.prev(c);
            } else {
                break;
            }
        }
        insert_at
    }};
}

pub(crate) use thread_list_accessor;

/// Transition `thread` into Ready and link it into the ready list at its
/// effective priority. The caller is responsible for requesting a
/// reschedule afterwards (see [`unlock_cpu_and_check_preemption`]).
pub(crate) fn make_ready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
) {
    thread.cb().st.replace(&mut *lock, ThreadState::Ready);

    let mut acc = thread_list_accessor!(&Traits::state().sched.ready, lock.borrow_mut());
    let prio = thread.cb().effective_priority(&**acc.cell_key());
    let at = position_by_priority!(acc, prio);
    acc.insert(thread, at);
}

/// The resume contract: mark a suspended thread ready. Returns
/// `false` if the thread was not suspended (the wake is then spurious
/// and the thread's wait loop re-checks its predicate anyway).
pub(crate) fn resume<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
) -> bool {
    if thread.cb().state_read(&*lock) == ThreadState::Suspended {
        make_ready(lock.borrow_mut(), thread);
        true
    } else {
        false
    }
}

/// Re-link a Ready thread after its effective priority changed.
pub(crate) fn reposition_ready<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>, thread: ThreadRef<Traits>) {
    let mut acc = thread_list_accessor!(&Traits::state().sched.ready, lock.borrow_mut());
    if acc.remove(thread) {
        let prio = thread.cb().effective_priority(&**acc.cell_key());
        let at = position_by_priority!(acc, prio);
        acc.insert(thread, at);
    }
}

pub(crate) fn link_terminated<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
) {
    thread.cb().st.replace(&mut *lock, ThreadState::Terminated);
    let mut acc = thread_list_accessor!(&Traits::state().sched.terminated, lock.borrow_mut());
    acc.push_back(thread);
}

/// Transition the running thread into Suspended and switch to the
/// ready-list head. Returns with a fresh critical section once the
/// thread has been resumed.
///
/// The caller must have verified the context is waitable and must have
/// linked whatever wait/timeout nodes will wake the thread up again.
pub(crate) fn suspend_current<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    let sched = &Traits::state().sched;
    let cur = sched.running.get(&*lock).expect("no running thread");
    debug_assert_eq!(cur.cb().state_read(&*lock), ThreadState::Running);
    cur.cb().st.replace(&mut *lock, ThreadState::Suspended);

    // The idle thread never blocks, so the ready list cannot be empty.
    let next = {
        let mut acc = thread_list_accessor!(&sched.ready, lock.borrow_mut());
        acc.pop_front().expect("no runnable thread")
    };
    next.cb().st.replace(&mut *lock, ThreadState::Running);
    sched.running.replace(&mut *lock, Some(next));

    drop(lock);
    // Safety: CPU Lock inactive; `next` is the thread elected above
    unsafe { Traits::context_switch_to(next.cb()) };

    lock_cpu()
}

/// Relinquish the critical section; if a higher-priority thread is ready
/// and preemption is permitted, perform the context switch.
///
/// Services that transition a thread into Ready call this before
/// returning. In handler mode the switch is left to the ISR tail.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    let sched = &Traits::state().sched;
    if Traits::in_handler_mode()
        || !sched.started.get(&*lock)
        || sched.lock_count.get(&*lock) != 0
        || !sched.preemptive.get(&*lock)
    {
        return;
    }
    let cur = match sched.running.get(&*lock) {
        Some(cur) => cur,
        None => return,
    };
    if cur.cb().state_read(&*lock) != ThreadState::Running {
        return;
    }
    let cur_prio = cur.cb().effective_priority(&*lock);

    let next = {
        let mut acc = thread_list_accessor!(&sched.ready, lock.borrow_mut());
        let head = match acc.front() {
            Some(head) => head,
            None => return,
        };
        if acc.pool()[head].effective_priority(&**acc.cell_key()) <= cur_prio {
            return;
        }
        acc.remove(head);
        head
    };

    make_ready(lock.borrow_mut(), cur);
    next.cb().st.replace(&mut *lock, ThreadState::Running);
    sched.running.replace(&mut *lock, Some(next));

    drop(lock);
    // Safety: CPU Lock inactive
    unsafe { Traits::context_switch_to(next.cb()) };
}

/// Implements [`System::reschedule`]. Safe to invoke from an ISR tail;
/// a no-op whenever switching is inhibited.
///
/// [`System::reschedule`]: crate::System::reschedule
pub(crate) fn reschedule<Traits: KernelTraits>() {
    unlock_cpu_and_check_preemption::<Traits>(lock_cpu());
}

/// Implements [`System::initialize`]: prepares the idle thread.
///
/// [`System::initialize`]: crate::System::initialize
pub(crate) fn initialize<Traits: KernelTraits>() -> Result {
    expect_thread_context::<Traits>()?;
    {
        let mut lock = lock_cpu::<Traits>();
        let sched = &Traits::state().sched;
        if sched.initialized.get(&*lock) {
            return Err(Error::Invalid);
        }
        sched.initialized.replace(&mut *lock, true);
    }

    let idle = thread::spawn_idle::<Traits>(idle_entry::<Traits>)?;

    let mut lock = lock_cpu::<Traits>();
    Traits::state().sched.idle.replace(&mut *lock, Some(idle));
    Ok(())
}

/// Implements [`System::start`]: installs the tick source and switches
/// to the highest-priority ready thread. Does not return; misuse is a
/// startup bug and panics.
///
/// [`System::start`]: crate::System::start
pub(crate) fn start<Traits: KernelTraits>() -> ! {
    assert!(
        !Traits::in_handler_mode(),
        "the scheduler cannot be started from an ISR"
    );

    let first = {
        let mut lock = lock_cpu::<Traits>();
        let sched = &Traits::state().sched;
        assert!(sched.initialized.get(&*lock), "scheduler is not initialized");
        assert!(
            sched.idle.get(&*lock).is_some(),
            "the idle thread is missing"
        );
        assert!(!sched.started.get(&*lock), "scheduler is already started");
        sched.started.replace(&mut *lock, true);

        let first = {
            let mut acc = thread_list_accessor!(&sched.ready, lock.borrow_mut());
            acc.pop_front().expect("no ready thread to start with")
        };
        first.cb().st.replace(&mut *lock, ThreadState::Running);
        sched.running.replace(&mut *lock, Some(first));
        first
    };

    // Safety: called exactly once, before dispatching the first thread
    unsafe { Traits::start_systick() };
    // Safety: `first` was just elected; this call never returns
    unsafe { Traits::start_scheduler(first.cb()) }
}

pub(crate) fn is_started<Traits: KernelTraits>() -> bool {
    let lock = lock_cpu::<Traits>();
    Traits::state().sched.started.get(&*lock)
}

/// Lock the scheduler (inhibit rescheduling). Reentrant; returns the
/// previous counter snapshot.
pub(crate) fn lock_scheduler<Traits: KernelTraits>() -> SchedulerLockState {
    let mut lock = lock_cpu::<Traits>();
    let sched = &Traits::state().sched;
    let prev = sched.lock_count.get(&*lock);
    sched.lock_count.replace(&mut *lock, prev + 1);
    prev
}

/// Undo one [`lock_scheduler`]; returns the previous snapshot. When the
/// counter drops to zero, a pending preemption is performed.
pub(crate) fn unlock_scheduler<Traits: KernelTraits>() -> SchedulerLockState {
    let mut lock = lock_cpu::<Traits>();
    let sched = &Traits::state().sched;
    let prev = sched.lock_count.get(&*lock);
    debug_assert!(prev > 0, "scheduler is not locked");
    sched.lock_count.replace(&mut *lock, prev.saturating_sub(1));
    if prev <= 1 {
        unlock_cpu_and_check_preemption(lock);
    }
    prev
}

/// Restore the lock counter to a snapshot taken earlier.
pub(crate) fn set_locked<Traits: KernelTraits>(snapshot: SchedulerLockState) -> SchedulerLockState {
    let mut lock = lock_cpu::<Traits>();
    let sched = &Traits::state().sched;
    let prev = sched.lock_count.replace(&mut *lock, snapshot);
    if snapshot == 0 && prev != 0 {
        unlock_cpu_and_check_preemption(lock);
    }
    prev
}

pub(crate) fn is_locked<Traits: KernelTraits>() -> bool {
    let lock = lock_cpu::<Traits>();
    Traits::state().sched.lock_count.get(&*lock) != 0
}

/// Toggle preemption; returns the previous setting.
pub(crate) fn set_preemptive<Traits: KernelTraits>(preemptive: bool) -> bool {
    let mut lock = lock_cpu::<Traits>();
    let prev = Traits::state()
        .sched
        .preemptive
        .replace(&mut *lock, preemptive);
    if preemptive && !prev {
        unlock_cpu_and_check_preemption(lock);
    }
    prev
}

pub(crate) fn is_preemptive<Traits: KernelTraits>() -> bool {
    let lock = lock_cpu::<Traits>();
    Traits::state().sched.preemptive.get(&*lock)
}

/// Voluntarily relinquish the processor: the current thread goes behind
/// its equal-priority peers and the ready-list head runs. Not gated by
/// the preemption flag; inhibited while the scheduler is locked.
pub(crate) fn yield_current<Traits: KernelTraits>() -> Result {
    expect_thread_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>();
    let sched = &Traits::state().sched;
    if !sched.started.get(&*lock) || sched.lock_count.get(&*lock) != 0 {
        return Ok(());
    }
    let cur = match sched.running.get(&*lock) {
        Some(cur) => cur,
        None => return Ok(()),
    };
    if sched.ready.get(&*lock).is_empty() {
        return Ok(());
    }

    make_ready(lock.borrow_mut(), cur);
    let next = {
        let mut acc = thread_list_accessor!(&sched.ready, lock.borrow_mut());
        acc.pop_front().expect("ready list cannot be empty here")
    };
    next.cb().st.replace(&mut *lock, ThreadState::Running);
    sched.running.replace(&mut *lock, Some(next));

    if next != cur {
        drop(lock);
        // Safety: CPU Lock inactive
        unsafe { Traits::context_switch_to(next.cb()) };
    }
    Ok(())
}

/// The idle thread: lowest priority, never exits. Continuously performs
/// deferred cleanup of terminated threads, then lets the port wait for
/// the next interrupt.
fn idle_entry<Traits: KernelTraits>(_arg: usize) -> usize {
    loop {
        loop {
            let mut lock = lock_cpu::<Traits>();
            let dead = {
                let mut acc =
                    thread_list_accessor!(&Traits::state().sched.terminated, lock.borrow_mut());
                acc.pop_front()
            };
            match dead {
                Some(dead) => {
                    let lock = thread::destroy_terminated(lock, dead);
                    unlock_cpu_and_check_preemption(lock);
                }
                None => break,
            }
        }

        // Safety: thread context, CPU Lock inactive
        unsafe { Traits::wait_for_interrupt() };
        let _ = yield_current::<Traits>();
    }
}
