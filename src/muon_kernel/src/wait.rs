//! Waiter lists.
//!
//! A blocked thread is represented by a *wait node* constructed on the
//! waiting thread's stack frame inside the blocking call; it only lives
//! until that call returns, and is guaranteed to be unlinked by then.
//! Waiter lists are ordered by effective priority (highest first, FIFO
//! among equals).
//!
//! Wake-up follows the retry discipline: a waker unlinks the node and
//! makes the thread Ready, and the woken thread re-checks its predicate
//! and loops if it does not hold — a spurious wake merely costs another
//! iteration.
use core::{fmt, ptr::NonNull};

use crate::{
    eventflags::FlagsMode,
    klock::{CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    mutex::MutexRef,
    sched,
    thread::ThreadRef,
    utils::intrusive_list::{Link, ListAccessorCell, ListHead, UnsafeStatic},
    KernelTraits,
};

/// What a blocked thread is waiting for. Recorded in the wait node so
/// that wakers (and the priority-inheritance walk) can act on it.
pub(crate) enum WaitPayload<Traits: KernelTraits> {
    Mutex(MutexRef<Traits>),
    Semaphore,
    CondVar,
    EventFlags { mask: u32, mode: FlagsMode },
    MemPool,
    MsgSend,
    MsgRecv,
}

impl<Traits: KernelTraits> Clone for WaitPayload<Traits> {
    fn clone(&self) -> Self {
        match *self {
            Self::Mutex(m) => Self::Mutex(m),
            Self::Semaphore => Self::Semaphore,
            Self::CondVar => Self::CondVar,
            Self::EventFlags { mask, mode } => Self::EventFlags { mask, mode },
            Self::MemPool => Self::MemPool,
            Self::MsgSend => Self::MsgSend,
            Self::MsgRecv => Self::MsgRecv,
        }
    }
}
impl<Traits: KernelTraits> Copy for WaitPayload<Traits> {}

/// A wait object linking a suspended thread to the queue it blocks on.
pub(crate) struct WaitNode<Traits: KernelTraits> {
    pub(crate) thread: ThreadRef<Traits>,
    link: CpuLockCell<Traits, Option<Link<WaitNodeRef<Traits>>>>,
    queue: NonNull<WaitQueue<Traits>>,
    pub(crate) payload: WaitPayload<Traits>,
}

/// A reference to a [`WaitNode`].
pub(crate) struct WaitNodeRef<Traits: KernelTraits>(NonNull<WaitNode<Traits>>);

// Safety: `WaitNode` is only accessed under the CPU Lock
unsafe impl<Traits: KernelTraits> Send for WaitNodeRef<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for WaitNodeRef<Traits> {}

impl<Traits: KernelTraits> Clone for WaitNodeRef<Traits> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}
impl<Traits: KernelTraits> Copy for WaitNodeRef<Traits> {}

impl<Traits: KernelTraits> PartialEq for WaitNodeRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits: KernelTraits> Eq for WaitNodeRef<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for WaitNodeRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitNodeRef").field(&self.0).finish()
    }
}

impl<Traits: KernelTraits> WaitNodeRef<Traits> {
    /// All wait nodes reachable through kernel state are extant: a node
    /// is unlinked before the frame holding it is torn down.
    #[inline]
    pub(crate) fn node<'a>(self) -> &'a WaitNode<Traits> {
        // Safety: see above
        unsafe { &*self.0.as_ptr() }
    }
}

impl<Traits: KernelTraits> core::ops::Index<WaitNodeRef<Traits>> for UnsafeStatic {
    type Output = WaitNode<Traits>;

    #[inline]
    fn index(&self, index: WaitNodeRef<Traits>) -> &Self::Output {
        index.node()
    }
}

/// A queue of threads suspended on one primitive, ordered by effective
/// priority, FIFO within equals.
pub(crate) struct WaitQueue<Traits: KernelTraits> {
    waits: CpuLockCell<Traits, ListHead<WaitNodeRef<Traits>>>,
}

macro_rules! wait_queue_accessor {
    ($queue:expr, $key:expr) => {
        // Safety: all linked wait nodes are extant; see `WaitNodeRef`
        ListAccessorCell::new(
            &$queue.waits,
            unsafe { UnsafeStatic::new() },
            |node: &WaitNode<_>| &node.link,
            $key,
        )
    };
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            waits: CpuLockCell::new(ListHead::new()),
        }
    }

    /// Suspend the running thread on this queue. Linking and suspension
    /// happen inside the critical section carried by `lock`, so no wake
    /// can be lost in between. Returns once the thread has been woken,
    /// with the node unlinked; the caller re-checks its predicate.
    ///
    /// The caller must have verified the context is waitable.
    pub(crate) fn wait(
        &self,
        mut lock: CpuLockGuard<Traits>,
        payload: WaitPayload<Traits>,
    ) -> CpuLockGuard<Traits> {
        let me = Traits::state()
            .sched
            .running
            .get(&*lock)
            .expect("no running thread");
        let node = WaitNode {
            thread: me,
            link: CpuLockCell::new(None),
            queue: NonNull::from(self),
            payload,
        };
        let node_ref = WaitNodeRef(NonNull::from(&node));

        {
            let mut acc = wait_queue_accessor!(self, lock.borrow_mut());
            let prio = me.cb().effective_priority(&**acc.cell_key());
            let at = wait_position_by_priority(&acc, prio);
            acc.insert(node_ref, at);
        }
        me.cb().waiting_node.replace(&mut *lock, Some(node_ref));

        let mut lock = sched::suspend_current(lock);

        // A waker unlinks the node before resuming us; do it ourselves
        // when the wake came from elsewhere (interrupt, timeout on a
        // different list, spurious resume).
        {
            let mut acc = wait_queue_accessor!(self, lock.borrow_mut());
            acc.remove(node_ref);
        }
        me.cb().waiting_node.replace(&mut *lock, None);
        lock
    }

    /// Wake up the next waiter, if any: unlink the head (the
    /// highest-priority, longest-waiting thread) and make it Ready.
    /// Doesn't yield the processor; call
    /// `unlock_cpu_and_check_preemption` as needed.
    pub(crate) fn resume_one(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        let head = {
            let mut acc = wait_queue_accessor!(self, lock.borrow_mut());
            match acc.front() {
                Some(head) => {
                    acc.remove(head);
                    head
                }
                None => return false,
            }
        };
        let thread = head.node().thread;
        thread.cb().waiting_node.replace(&mut *lock, None);
        sched::resume(lock.borrow_mut(), thread);
        true
    }

    /// Wake up every waiter.
    pub(crate) fn resume_all(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        while self.resume_one(lock.borrow_mut()) {}
    }

    /// Wake up the waiters whose payload satisfies `cond`.
    pub(crate) fn resume_matching(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mut cond: impl FnMut(&WaitPayload<Traits>) -> bool,
    ) {
        let mut cur = {
            let acc = wait_queue_accessor!(self, lock.borrow_mut());
            acc.front()
        };
        while let Some(node_ref) = cur {
            // Find the successor before possibly unlinking `node_ref`.
            cur = {
                let acc = wait_queue_accessor!(self, lock.borrow_mut());
                acc.next(node_ref)
            };
            if !cond(&node_ref.node().payload) {
                continue;
            }
            {
                let mut acc = wait_queue_accessor!(self, lock.borrow_mut());
                acc.remove(node_ref);
            }
            let thread = node_ref.node().thread;
            thread.cb().waiting_node.replace(&mut *lock, None);
            sched::resume(lock.borrow_mut(), thread);
        }
    }

    /// The highest effective priority among the waiters. The list is
    /// priority-ordered, so this is the head's.
    pub(crate) fn max_waiter_priority(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<u8> {
        let acc = wait_queue_accessor!(self, lock.borrow_mut());
        acc.front()
            .map(|r| r.node().thread.cb().effective_priority(&**acc.cell_key()))
    }

    pub(crate) fn is_empty(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.waits.get(&*lock).is_empty()
    }
}

/// Ordered-insertion position for a waiter of priority `prio`: after
/// all linked waiters of priority `>= prio`, scanning from the tail.
fn wait_position_by_priority<Traits: KernelTraits, M>(
    acc: &ListAccessorCell<
        '_,
        &CpuLockCell<Traits, ListHead<WaitNodeRef<Traits>>>,
        UnsafeStatic,
        M,
        CpuLockTokenRefMut<'_, Traits>,
    >,
    prio: u8,
) -> Option<WaitNodeRef<Traits>>
where
    M: Fn(&WaitNode<Traits>) -> &CpuLockCell<Traits, Option<Link<WaitNodeRef<Traits>>>>,
{
    let mut insert_at = None;
    let mut cursor = acc.back();
    while let Some(c) = cursor {
        let c_prio = acc.pool()[c]
            .thread
            .cb()
            .effective_priority(&**acc.cell_key());
        if c_prio < prio {
            insert_at = Some(c);
            cursor = acc.prev(c);
        } else {
            break;
        }
    }
    insert_at
}

/// Unlink a wait node found through a thread's `waiting_node`
/// back-pointer (the kill / timeout / interrupt path).
pub(crate) fn unlink_node<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    node_ref: WaitNodeRef<Traits>,
) {
    // Safety: the queue outlives its waiters
    let queue = unsafe { node_ref.node().queue.as_ref() };
    let mut acc = wait_queue_accessor!(queue, lock.borrow_mut());
    acc.remove(node_ref);
}

/// Reposition the given thread's wait node after a priority change.
/// Does nothing if the thread is not blocked on a queue.
pub(crate) fn reorder_wait_of<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
) {
    let node_ref = match thread.cb().waiting_node.get(&*lock) {
        Some(node_ref) => node_ref,
        None => return,
    };
    // Safety: the queue outlives its waiters
    let queue = unsafe { node_ref.node().queue.as_ref() };
    let mut acc = wait_queue_accessor!(queue, lock.borrow_mut());
    if acc.remove(node_ref) {
        let prio = thread.cb().effective_priority(&**acc.cell_key());
        let at = wait_position_by_priority(&acc, prio);
        acc.insert(node_ref, at);
    }
}

/// The mutex the thread is currently blocked trying to acquire, if any.
/// Used by the priority-inheritance walk.
pub(crate) fn waited_mutex<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
) -> Option<MutexRef<Traits>> {
    match thread.cb().waiting_node.get(&*lock) {
        Some(node_ref) => match node_ref.node().payload {
            WaitPayload::Mutex(m) => Some(m),
            _ => None,
        },
        None => None,
    }
}
