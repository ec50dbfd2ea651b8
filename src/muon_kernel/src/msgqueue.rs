//! Priority-ordered bounded message queues.
//!
//! An arena of `N` fixed-size slots. Messages are copied in on send and
//! out on receive; in-flight messages form a singly-linked list ordered
//! by message priority (higher first, FIFO within equals). Senders
//! block when all slots are in use, receivers when none are.
use core::{alloc::Layout, fmt, mem, ptr, ptr::NonNull};

use crate::{
    clock::{self, ClockId, Duration, TimeoutNode, TimeoutRef},
    error::{Error, Result},
    klock::{lock_cpu, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    sched,
    state::expect_waitable_context,
    wait::{WaitPayload, WaitQueue},
    KernelTraits, MemoryResource,
};

const NO_SLOT: usize = usize::MAX;

/// Per-slot bookkeeping, stored out-of-line from the payload arena.
/// Only touched under the CPU Lock.
struct SlotMeta {
    next: usize,
    priority: u8,
    len: usize,
}

/// A bounded queue of `capacity` messages of up to `msg_size` bytes.
pub struct MessageQueue<Traits: KernelTraits> {
    name: &'static str,
    msg_size: usize,
    capacity: usize,
    clock: ClockId,
    arena: usize,
    arena_layout: Layout,
    meta: NonNull<SlotMeta>,
    meta_layout: Layout,
    resource: &'static dyn MemoryResource,
    /// Free-slot chain through `SlotMeta::next`.
    free_head: CpuLockCell<Traits, usize>,
    /// Head of the in-flight list, highest priority first.
    queue_head: CpuLockCell<Traits, usize>,
    count: CpuLockCell<Traits, usize>,
    send_waiters: WaitQueue<Traits>,
    recv_waiters: WaitQueue<Traits>,
}

// Safety: the arenas are exclusively owned and only touched under the
// CPU Lock
unsafe impl<Traits: KernelTraits> Send for MessageQueue<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for MessageQueue<Traits> {}

impl<Traits: KernelTraits> MessageQueue<Traits> {
    pub fn new(name: &'static str, capacity: usize, msg_size: usize) -> Result<Self> {
        if capacity == 0 || msg_size == 0 {
            return Err(Error::Invalid);
        }
        let resource = Traits::memory_resource();

        let arena_layout = Layout::from_size_align(capacity * msg_size, mem::align_of::<usize>())
            .map_err(|_| Error::Invalid)?;
        // Safety: a live layout; released in `drop`
        let arena = unsafe { resource.allocate(arena_layout) }.ok_or(Error::OutOfMemory)?;

        let meta_layout = Layout::array::<SlotMeta>(capacity).map_err(|_| Error::Invalid)?;
        // Safety: ditto
        let meta = match unsafe { resource.allocate(meta_layout) } {
            Some(meta) => meta.cast::<SlotMeta>(),
            None => {
                // Safety: allocated just above
                unsafe { resource.deallocate(arena, arena_layout) };
                return Err(Error::OutOfMemory);
            }
        };
        for i in 0..capacity {
            let next = if i + 1 < capacity { i + 1 } else { NO_SLOT };
            // Safety: `meta` spans `capacity` elements
            unsafe {
                meta.as_ptr().add(i).write(SlotMeta {
                    next,
                    priority: 0,
                    len: 0,
                })
            };
        }

        Ok(Self {
            name,
            msg_size,
            capacity,
            clock: ClockId::Sys,
            arena: arena.as_ptr() as usize,
            arena_layout,
            meta,
            meta_layout,
            resource,
            free_head: CpuLockCell::new(0),
            queue_head: CpuLockCell::new(NO_SLOT),
            count: CpuLockCell::new(0),
            send_waiters: WaitQueue::new(),
            recv_waiters: WaitQueue::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        let lock = lock_cpu::<Traits>();
        self.count.get(&*lock)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Copy `msg` into the queue at `priority`, suspending while all
    /// slots are in use. Higher priorities dequeue earlier; equal
    /// priorities dequeue in send order.
    pub fn send(&self, msg: &[u8], priority: u8) -> Result {
        self.send_inner(msg, priority, Blocking::Forever)
    }

    /// Non-blocking [`send`](MessageQueue::send).
    pub fn try_send(&self, msg: &[u8], priority: u8) -> Result {
        self.send_inner(msg, priority, Blocking::Never)
    }

    /// [`send`](MessageQueue::send) that gives up after `timeout`
    /// sysclock ticks.
    pub fn timed_send(&self, msg: &[u8], priority: u8, timeout: Duration) -> Result {
        self.send_inner(msg, priority, Blocking::Timeout(timeout))
    }

    /// Dequeue the highest-priority oldest message into `buf` (which
    /// must hold `msg_size` bytes), suspending while the queue is
    /// empty. Returns the message length and priority.
    pub fn receive(&self, buf: &mut [u8]) -> Result<(usize, u8)> {
        self.receive_inner(buf, Blocking::Forever)
    }

    /// Non-blocking [`receive`](MessageQueue::receive).
    pub fn try_receive(&self, buf: &mut [u8]) -> Result<(usize, u8)> {
        self.receive_inner(buf, Blocking::Never)
    }

    /// [`receive`](MessageQueue::receive) that gives up after `timeout`
    /// sysclock ticks.
    pub fn timed_receive(&self, buf: &mut [u8], timeout: Duration) -> Result<(usize, u8)> {
        self.receive_inner(buf, Blocking::Timeout(timeout))
    }

    fn send_inner(&self, msg: &[u8], priority: u8, blocking: Blocking) -> Result {
        if msg.len() > self.msg_size {
            return Err(Error::Invalid);
        }
        let lock = lock_cpu::<Traits>();
        self.block_loop(
            lock,
            blocking,
            &self.send_waiters,
            WaitPayload::MsgSend,
            |this, mut lock| {
                let slot = {
                    let head = this.free_head.get(&*lock);
                    if head == NO_SLOT {
                        return None;
                    }
                    // Safety: `head` is a valid slot index
                    this.free_head
                        .replace(&mut *lock, unsafe { this.meta_at(head).next });
                    head
                };
                // Safety: `slot` is a valid slot index; we own it now
                unsafe {
                    ptr::copy_nonoverlapping(
                        msg.as_ptr(),
                        (this.arena + slot * this.msg_size) as *mut u8,
                        msg.len(),
                    );
                    let meta = this.meta_at_mut(slot);
                    meta.priority = priority;
                    meta.len = msg.len();
                }
                this.insert_by_priority(lock.borrow_mut(), slot, priority);
                let count = this.count.get(&*lock);
                this.count.replace(&mut *lock, count + 1);
                this.recv_waiters.resume_one(lock.borrow_mut());
                Some(())
            },
        )
    }

    fn receive_inner(&self, buf: &mut [u8], blocking: Blocking) -> Result<(usize, u8)> {
        if buf.len() < self.msg_size {
            return Err(Error::Invalid);
        }
        let lock = lock_cpu::<Traits>();
        let buf_ptr = buf.as_mut_ptr();
        self.block_loop(
            lock,
            blocking,
            &self.recv_waiters,
            WaitPayload::MsgRecv,
            |this, mut lock| {
                let slot = this.queue_head.get(&*lock);
                if slot == NO_SLOT {
                    return None;
                }
                // Safety: `slot` is a valid, queued slot index
                let (len, priority) = unsafe {
                    let meta = this.meta_at(slot);
                    this.queue_head.replace(&mut *lock, meta.next);
                    ptr::copy_nonoverlapping(
                        (this.arena + slot * this.msg_size) as *const u8,
                        buf_ptr,
                        meta.len,
                    );
                    (meta.len, meta.priority)
                };
                // Return the slot to the free chain.
                let free = this.free_head.replace(&mut *lock, slot);
                // Safety: we own the slot
                unsafe { this.meta_at_mut(slot).next = free };
                let count = this.count.get(&*lock);
                this.count.replace(&mut *lock, count - 1);
                this.send_waiters.resume_one(lock.borrow_mut());
                Some((len, priority))
            },
        )
    }

    /// The common probe-or-suspend loop of the four blocking entry
    /// points.
    fn block_loop<R>(
        &self,
        mut lock: CpuLockGuard<Traits>,
        blocking: Blocking,
        waiters: &WaitQueue<Traits>,
        payload: WaitPayload<Traits>,
        mut probe: impl FnMut(&Self, CpuLockTokenRefMut<'_, Traits>) -> Option<R>,
    ) -> Result<R> {
        if let Some(hit) = probe(self, lock.borrow_mut()) {
            sched::unlock_cpu_and_check_preemption(lock);
            return Ok(hit);
        }
        if matches!(blocking, Blocking::Never) {
            return Err(Error::WouldBlock);
        }

        expect_waitable_context::<Traits>(lock.borrow_mut())?;
        let me = Traits::state().sched.running.get(&*lock).unwrap();
        let clk = self.clock.resolve::<Traits>();
        let deadline = match blocking {
            Blocking::Timeout(timeout) => {
                Some(clk.steady_now_locked(lock.borrow_mut()) + timeout)
            }
            _ => None,
        };

        loop {
            if let Some(hit) = probe(self, lock.borrow_mut()) {
                sched::unlock_cpu_and_check_preemption(lock);
                return Ok(hit);
            }

            if let Some(deadline) = deadline {
                let node = TimeoutNode::new_thread_wake(deadline, me);
                pin_utils::pin_mut!(node);
                clock::insert_timeout(lock.borrow_mut(), clk.steady_queue(), node.as_ref());
                me.cb()
                    .clock_node
                    .replace(&mut *lock, Some(TimeoutRef::new(&node)));

                lock = waiters.wait(lock, payload);

                clock::remove_timeout(lock.borrow_mut(), &node);
                me.cb().clock_node.replace(&mut *lock, None);
            } else {
                lock = waiters.wait(lock, payload);
            }

            if me.cb().interrupted.get(&*lock) {
                return Err(Error::Interrupted);
            }
            if let Some(deadline) = deadline {
                if clk.steady_now_locked(lock.borrow_mut()) >= deadline {
                    return Err(Error::TimedOut);
                }
            }
        }
    }

    /// Link `slot` into the in-flight list after every queued message
    /// of priority `>= priority`.
    fn insert_by_priority(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        slot: usize,
        priority: u8,
    ) {
        let mut prev = NO_SLOT;
        let mut cur = self.queue_head.get(&*lock);
        // Safety: every index in the in-flight list is valid
        unsafe {
            while cur != NO_SLOT && self.meta_at(cur).priority >= priority {
                prev = cur;
                cur = self.meta_at(cur).next;
            }
            self.meta_at_mut(slot).next = cur;
            if prev == NO_SLOT {
                self.queue_head.replace(&mut *lock, slot);
            } else {
                self.meta_at_mut(prev).next = slot;
            }
        }
    }

    /// # Safety
    ///
    /// `i < capacity`; the CPU Lock must be held.
    unsafe fn meta_at(&self, i: usize) -> &SlotMeta {
        unsafe { &*self.meta.as_ptr().add(i) }
    }

    /// # Safety
    ///
    /// `i < capacity`; the CPU Lock must be held and the slot owned by
    /// the caller.
    #[allow(clippy::mut_from_ref)]
    unsafe fn meta_at_mut(&self, i: usize) -> &mut SlotMeta {
        unsafe { &mut *self.meta.as_ptr().add(i) }
    }
}

/// Blocking behavior of a queue entry point.
#[derive(Clone, Copy)]
enum Blocking {
    Forever,
    Never,
    Timeout(Duration),
}

impl<Traits: KernelTraits> Drop for MessageQueue<Traits> {
    fn drop(&mut self) {
        {
            let mut lock = lock_cpu::<Traits>();
            assert!(
                self.send_waiters.is_empty(lock.borrow_mut())
                    && self.recv_waiters.is_empty(lock.borrow_mut()),
                "message queue dropped with waiters"
            );
        }
        // Safety: allocated in `new` with these layouts
        unsafe {
            self.resource.deallocate(
                NonNull::new(self.arena as *mut u8).expect("arena pointer is non-null"),
                self.arena_layout,
            );
            self.resource.deallocate(self.meta.cast(), self.meta_layout);
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for MessageQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("msg_size", &self.msg_size)
            .finish()
    }
}
