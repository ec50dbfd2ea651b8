//! Fixed-size block pools.
//!
//! An arena of `N` equal-size blocks with an intrusive free list (the
//! first word of a free block points at the next one) and a waiter list
//! for exhaustion.
use core::{alloc::Layout, fmt, mem, ptr::NonNull};

use crate::{
    clock::{self, ClockId, Duration, TimeoutNode, TimeoutRef},
    error::{Error, Result},
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    sched,
    state::expect_waitable_context,
    wait::{WaitPayload, WaitQueue},
    KernelTraits, MemoryResource,
};

const NO_BLOCK: usize = 0;

/// A pool of `capacity` blocks of `block_size` bytes, carved out of an
/// arena taken from the kernel's memory resource.
pub struct MemoryPool<Traits: KernelTraits> {
    name: &'static str,
    block_size: usize,
    capacity: usize,
    clock: ClockId,
    arena: usize,
    arena_layout: Layout,
    resource: &'static dyn MemoryResource,
    /// Address of the first free block; the free list threads through
    /// the first word of each free block.
    free_head: CpuLockCell<Traits, usize>,
    allocated: CpuLockCell<Traits, usize>,
    wait_queue: WaitQueue<Traits>,
}

// Safety: the arena is exclusively owned and only touched under the
// CPU Lock
unsafe impl<Traits: KernelTraits> Send for MemoryPool<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for MemoryPool<Traits> {}

impl<Traits: KernelTraits> MemoryPool<Traits> {
    /// Create a pool of `capacity` blocks of at least `block_size`
    /// bytes each. The block size is extended to a multiple of the
    /// pointer size so the free list can thread through free blocks.
    pub fn new(name: &'static str, capacity: usize, block_size: usize) -> Result<Self> {
        if capacity == 0 || block_size == 0 {
            return Err(Error::Invalid);
        }
        let word = mem::size_of::<usize>();
        let block_size = block_size.div_ceil(word) * word;

        let arena_layout =
            Layout::from_size_align(capacity * block_size, word).map_err(|_| Error::Invalid)?;
        let resource = Traits::memory_resource();
        // Safety: a live layout; released in `drop`
        let arena = unsafe { resource.allocate(arena_layout) }.ok_or(Error::OutOfMemory)?;
        let arena = arena.as_ptr() as usize;

        // Thread the initial free list through the blocks.
        for i in 0..capacity {
            let block = arena + i * block_size;
            let next = if i + 1 < capacity {
                arena + (i + 1) * block_size
            } else {
                NO_BLOCK
            };
            // Safety: `block` is within the arena just allocated
            unsafe { (block as *mut usize).write(next) };
        }

        Ok(Self {
            name,
            block_size,
            capacity,
            clock: ClockId::Sys,
            arena,
            arena_layout,
            resource,
            free_head: CpuLockCell::new(arena),
            allocated: CpuLockCell::new(0),
            wait_queue: WaitQueue::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks currently handed out.
    pub fn allocated(&self) -> usize {
        let lock = lock_cpu::<Traits>();
        self.allocated.get(&*lock)
    }

    pub fn is_empty(&self) -> bool {
        self.allocated() == 0
    }

    pub fn is_full(&self) -> bool {
        self.allocated() == self.capacity
    }

    /// Take a block, suspending until one is free.
    pub fn alloc(&self) -> Result<NonNull<u8>> {
        let mut lock = lock_cpu::<Traits>();
        expect_waitable_context::<Traits>(lock.borrow_mut())?;
        let me = Traits::state().sched.running.get(&*lock).unwrap();
        loop {
            if let Some(block) = self.pop_free(lock.borrow_mut()) {
                return Ok(block);
            }
            lock = self.wait_queue.wait(lock, WaitPayload::MemPool);
            if me.cb().interrupted.get(&*lock) {
                return Err(Error::Interrupted);
            }
        }
    }

    /// Non-blocking block probe.
    pub fn try_alloc(&self) -> Result<NonNull<u8>> {
        let mut lock = lock_cpu::<Traits>();
        self.pop_free(lock.borrow_mut()).ok_or(Error::WouldBlock)
    }

    /// Like [`alloc`](MemoryPool::alloc), but gives up after `timeout`
    /// sysclock ticks with `Err(TimedOut)`.
    pub fn timed_alloc(&self, timeout: Duration) -> Result<NonNull<u8>> {
        let mut lock = lock_cpu::<Traits>();
        expect_waitable_context::<Traits>(lock.borrow_mut())?;
        let me = Traits::state().sched.running.get(&*lock).unwrap();
        let clk = self.clock.resolve::<Traits>();
        let deadline = clk.steady_now_locked(lock.borrow_mut()) + timeout;
        loop {
            if let Some(block) = self.pop_free(lock.borrow_mut()) {
                return Ok(block);
            }

            let node = TimeoutNode::new_thread_wake(deadline, me);
            pin_utils::pin_mut!(node);
            clock::insert_timeout(lock.borrow_mut(), clk.steady_queue(), node.as_ref());
            me.cb()
                .clock_node
                .replace(&mut *lock, Some(TimeoutRef::new(&node)));

            lock = self.wait_queue.wait(lock, WaitPayload::MemPool);

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

    /// Return a block to the pool and wake the highest-priority waiter.
    /// The pointer must have come from this pool.
    pub fn free(&self, block: NonNull<u8>) -> Result {
        let addr = block.as_ptr() as usize;
        if addr < self.arena
            || addr >= self.arena + self.capacity * self.block_size
            || (addr - self.arena) % self.block_size != 0
        {
            return Err(Error::Invalid);
        }

        let mut lock = lock_cpu::<Traits>();
        let allocated = self.allocated.get(&*lock);
        if allocated == 0 {
            return Err(Error::Invalid);
        }
        let head = self.free_head.get(&*lock);
        // Safety: `addr` was validated to be a block boundary
        unsafe { (addr as *mut usize).write(head) };
        self.free_head.replace(&mut *lock, addr);
        self.allocated.replace(&mut *lock, allocated - 1);

        self.wait_queue.resume_one(lock.borrow_mut());
        sched::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    fn pop_free(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> Option<NonNull<u8>> {
        let head = self.free_head.get(&*lock);
        if head == NO_BLOCK {
            return None;
        }
        // Safety: free blocks hold the next-free address in their first
        // word
        let next = unsafe { (head as *const usize).read() };
        self.free_head.replace(&mut *lock, next);
        let allocated = self.allocated.get(&*lock);
        self.allocated.replace(&mut *lock, allocated + 1);
        NonNull::new(head as *mut u8)
    }
}

impl<Traits: KernelTraits> Drop for MemoryPool<Traits> {
    fn drop(&mut self) {
        {
            let mut lock = lock_cpu::<Traits>();
            assert!(
                self.wait_queue.is_empty(lock.borrow_mut()),
                "memory pool dropped with waiters"
            );
        }
        // Safety: allocated in `new` with this layout
        unsafe {
            self.resource.deallocate(
                NonNull::new(self.arena as *mut u8).expect("arena pointer is non-null"),
                self.arena_layout,
            );
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for MemoryPool<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("block_size", &self.block_size)
            .finish()
    }
}
