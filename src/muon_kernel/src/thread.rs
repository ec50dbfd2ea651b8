//! Threads: execution contexts, the thread life cycle, and the stack
//! discipline.
//!
//! A thread is represented by a heap-resident control block
//! ([`ThreadCb`]) allocated from a memory resource, and owned by a
//! [`Thread`] handle. The control block participates in intrusive lists
//! (ready/terminated, siblings, owned mutexes) and carries the wait
//! bookkeeping that lets `kill` and timeouts find and unlink a blocked
//! thread from whatever it is waiting on.
//!
//! The life cycle is `Ready → Running → {Suspended, Terminated}`;
//! `Terminated` threads sit on the scheduler's terminated list until the
//! idle thread performs the deferred cleanup that moves them to
//! `Destroyed` (stack released, joiner woken).
use core::{alloc::Layout, fmt, marker::PhantomData, ptr::NonNull};
use num_integer::Integer;

use crate::{
    clock::{self, ClockId, Duration, TimeoutNode, TimeoutRef},
    error::{Error, Result},
    eventflags::{check_raised, FlagsMode},
    klock::{lock_cpu, CpuLockCell, CpuLockGuard, CpuLockToken, CpuLockTokenRefMut},
    mutex::{self, MutexRef},
    priority, sched,
    sched::thread_list_accessor,
    state::{expect_thread_context, expect_waitable_context},
    utils::intrusive_list::{Link, ListAccessorCell, ListHead, UnsafeStatic},
    wait::{self, WaitNodeRef},
    KernelTraits, MemoryResource,
};

/// Thread entry point: an opaque argument in, the thread's result out.
/// The result is what [`Thread::join`] observes.
pub type ThreadFn = fn(usize) -> usize;

/// Thread state machine. `Terminated` is transient (deferred cleanup
/// pending); `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Constructed but not yet linked anywhere. Never observable through
    /// the public API.
    Undefined,
    Ready,
    Running,
    Suspended,
    Terminated,
    Destroyed,
}

/// A non-owning reference to a [`ThreadCb`].
pub(crate) struct ThreadRef<Traits: KernelTraits>(pub(crate) NonNull<ThreadCb<Traits>>);

// Safety: `ThreadCb` is `Send + Sync`
unsafe impl<Traits: KernelTraits> Send for ThreadRef<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for ThreadRef<Traits> {}

impl<Traits: KernelTraits> Clone for ThreadRef<Traits> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}
impl<Traits: KernelTraits> Copy for ThreadRef<Traits> {}

impl<Traits: KernelTraits> PartialEq for ThreadRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits: KernelTraits> Eq for ThreadRef<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for ThreadRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ThreadRef").field(&self.0).finish()
    }
}

impl<Traits: KernelTraits> ThreadRef<Traits> {
    /// Dereference the control block.
    ///
    /// The pointee is valid for as long as the kernel can reach this
    /// reference: a control block is only freed after the thread is
    /// `Destroyed` and unlinked from every kernel list.
    #[inline]
    pub(crate) fn cb<'a>(self) -> &'a ThreadCb<Traits> {
        // Safety: see above
        unsafe { &*self.0.as_ptr() }
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0.as_ptr() as usize
    }

    pub(crate) fn from_usize(addr: usize) -> Self {
        Self(NonNull::new(addr as *mut ThreadCb<Traits>).unwrap())
    }
}

impl<Traits: KernelTraits> core::ops::Index<ThreadRef<Traits>> for UnsafeStatic {
    type Output = ThreadCb<Traits>;

    #[inline]
    fn index(&self, index: ThreadRef<Traits>) -> &Self::Output {
        index.cb()
    }
}

/// Descriptor of a thread's stack region, in 32-bit words.
///
/// The first and the last word hold guard magics; everything between is
/// filled with a sentinel pattern at construction, which the destroy
/// path consults for a high-water estimate.
#[derive(Clone, Copy)]
pub(crate) struct StackDesc {
    bottom: *mut u32,
    words: usize,
    owned: bool,
}

// Safety: a plain memory descriptor; the pointee is only touched under
// the CPU Lock.
unsafe impl Send for StackDesc {}

const STACK_FILL: u32 = 0xEFBE_ADDE;
const STACK_GUARD_MAGIC: u32 = 0x600D_C0DE;

impl StackDesc {
    const NONE: Self = Self {
        bottom: core::ptr::null_mut(),
        words: 0,
        owned: false,
    };

    fn initialize(&self) {
        // Safety: `bottom..bottom+words` is owned by this thread
        unsafe {
            for i in 0..self.words {
                self.bottom.add(i).write(STACK_FILL);
            }
            self.bottom.write(STACK_GUARD_MAGIC);
            self.bottom.add(self.words - 1).write(STACK_GUARD_MAGIC);
        }
    }

    fn guards_intact(&self) -> bool {
        // Safety: same region as `initialize`
        unsafe {
            self.bottom.read() == STACK_GUARD_MAGIC
                && self.bottom.add(self.words - 1).read() == STACK_GUARD_MAGIC
        }
    }

    /// Bytes never overwritten since construction, measured from the
    /// sentinel fill.
    fn available_bytes(&self) -> usize {
        let mut n = 0;
        // Safety: same region as `initialize`
        unsafe {
            for i in 1..self.words - 1 {
                if self.bottom.add(i).read() != STACK_FILL {
                    break;
                }
                n += 1;
            }
        }
        n * 4
    }

    fn size_bytes(&self) -> usize {
        self.words * 4
    }
}

/// *Thread control block* — the state data of a thread.
#[repr(C)]
pub struct ThreadCb<Traits: KernelTraits> {
    /// The port's context block (register save area, stack pointer).
    /// Placed first so assembler code can refer to it easily.
    pub port_thread_state: <Traits as crate::PortThreading>::ThreadState,

    pub(crate) name: &'static str,
    pub(crate) clock: ClockId,
    pub(crate) memory_resource: &'static dyn MemoryResource,
    pub(crate) entry: ThreadFn,
    pub(crate) entry_arg: usize,

    pub(crate) st: CpuLockCell<Traits, ThreadState>,
    pub(crate) priority_assigned: CpuLockCell<Traits, u8>,
    /// Maximum boost contributed by owned mutexes;
    /// [`priority::NONE`] when uncontested.
    pub(crate) priority_inherited: CpuLockCell<Traits, u8>,

    /// Node for the ready list while Ready, and for the scheduler's
    /// terminated list while Terminated. Mutually exclusive uses.
    pub(crate) ready_link: CpuLockCell<Traits, Option<Link<ThreadRef<Traits>>>>,
    /// Node for the parent's children list (or the top-threads list).
    pub(crate) child_link: CpuLockCell<Traits, Option<Link<ThreadRef<Traits>>>>,
    pub(crate) children: CpuLockCell<Traits, ListHead<ThreadRef<Traits>>>,
    pub(crate) parent: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,

    /// Mutexes currently owned, linked through each mutex's
    /// `owner_link`.
    pub(crate) owned_mutexes: CpuLockCell<Traits, ListHead<MutexRef<Traits>>>,
    pub(crate) acquired_mutexes: CpuLockCell<Traits, usize>,

    /// Back-pointer to the wait node linked in a primitive's waiter
    /// list, used to find-and-unlink on kill or timeout.
    pub(crate) waiting_node: CpuLockCell<Traits, Option<WaitNodeRef<Traits>>>,
    /// Back-pointer to the timeout node linked in a clock's timeout
    /// list, for the same purpose.
    pub(crate) clock_node: CpuLockCell<Traits, Option<TimeoutRef<Traits>>>,

    pub(crate) joiner: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,
    pub(crate) interrupted: CpuLockCell<Traits, bool>,
    pub(crate) event_flags: CpuLockCell<Traits, u32>,
    pub(crate) func_result: CpuLockCell<Traits, usize>,

    pub(crate) stack: CpuLockCell<Traits, StackDesc>,
}

impl<Traits: KernelTraits> ThreadCb<Traits> {
    /// Effective priority: the maximum of the assigned priority and any
    /// inherited boost.
    #[inline]
    pub(crate) fn effective_priority(&self, token: &CpuLockToken<Traits>) -> u8 {
        let assigned = *self.priority_assigned.read(token);
        let inherited = *self.priority_inherited.read(token);
        if assigned > inherited {
            assigned
        } else {
            inherited
        }
    }

    #[inline]
    pub(crate) fn state_read(&self, token: &CpuLockToken<Traits>) -> ThreadState {
        *self.st.read(token)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<Traits: KernelTraits> fmt::Debug for ThreadCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .finish()
    }
}

/// Construction-time attributes of a thread.
pub struct ThreadAttributes {
    pub name: &'static str,
    /// Initial assigned priority; see [`crate::priority`].
    pub priority: u8,
    /// Requested stack size in bytes; `0` selects the port default.
    pub stack_size: usize,
    /// A caller-supplied stack buffer. Adopted (and not released) when
    /// it meets the port's minimum size; must be 4-byte aligned.
    pub stack_buffer: Option<&'static mut [u8]>,
    /// The clock this thread's timed waits are measured against.
    pub clock: ClockId,
}

impl ThreadAttributes {
    pub fn new() -> Self {
        Self {
            name: "",
            priority: priority::NORMAL,
            stack_size: 0,
            stack_buffer: None,
            clock: ClockId::Sys,
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn with_stack_buffer(mut self, buffer: &'static mut [u8]) -> Self {
        self.stack_buffer = Some(buffer);
        self
    }

    pub fn with_clock(mut self, clock: ClockId) -> Self {
        self.clock = clock;
        self
    }
}

impl Default for ThreadAttributes {
    fn default() -> Self {
        Self::new()
    }
}

/// An owning handle to a thread.
///
/// Dropping the handle of a thread that has not reached `Destroyed`
/// kills it first; the control block is released either way.
pub struct Thread<Traits: KernelTraits> {
    cb: ThreadRef<Traits>,
    _no_clone: PhantomData<*mut ()>,
}

// Safety: all methods synchronize through the CPU Lock
unsafe impl<Traits: KernelTraits> Send for Thread<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for Thread<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for Thread<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Thread").field(&self.cb).finish()
    }
}

/// Get a `ListAccessorCell` for a children list (a list linked through
/// `ThreadCb::child_link`).
macro_rules! child_list_accessor {
    ($head:expr, $key:expr) => {
        // Safety: linked threads outlive their membership in the list
        ListAccessorCell::new(
            $head,
            unsafe { UnsafeStatic::new() },
            |cb: &ThreadCb<_>| &cb.child_link,
            $key,
        )
    };
}

fn unlink_from_siblings<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
) {
    let parent = thread.cb().parent.get(&*lock);
    match parent {
        Some(parent) => {
            let mut acc = child_list_accessor!(&parent.cb().children, lock.borrow_mut());
            acc.remove(thread);
        }
        None => {
            let mut acc =
                child_list_accessor!(&Traits::state().sched.top_threads, lock.borrow_mut());
            acc.remove(thread);
        }
    }
    thread.cb().parent.replace(&mut *lock, None);
}

fn allocate_stack<Traits: KernelTraits>(
    attr_stack_size: usize,
    resource: &'static dyn MemoryResource,
) -> Result<StackDesc> {
    let mut bytes = attr_stack_size;
    if bytes == 0 {
        bytes = Traits::STACK_SIZE_DEFAULT;
    }
    if bytes < Traits::STACK_SIZE_MIN {
        bytes = Traits::STACK_SIZE_MIN;
    }
    let words: usize = Integer::div_ceil(&bytes, &4);
    let layout = Layout::from_size_align(words * 4, Traits::STACK_ALIGN)
        .map_err(|_| Error::Invalid)?;
    // Safety: a live layout; the region is released in `destroy`
    let bottom = unsafe { resource.allocate(layout) }.ok_or(Error::OutOfMemory)?;
    Ok(StackDesc {
        bottom: bottom.as_ptr() as *mut u32,
        words,
        owned: true,
    })
}

fn adopt_stack<Traits: KernelTraits>(buffer: &'static mut [u8]) -> Result<StackDesc> {
    if buffer.len() < Traits::STACK_SIZE_MIN || (buffer.as_ptr() as usize) % 4 != 0 {
        return Err(Error::Invalid);
    }
    Ok(StackDesc {
        bottom: buffer.as_mut_ptr() as *mut u32,
        words: buffer.len() / 4,
        owned: false,
    })
}

/// Construct a thread control block, link it into the thread hierarchy,
/// and make it Ready. Common to [`Thread::new`] and the idle thread.
pub(crate) fn spawn_internal<Traits: KernelTraits>(
    attr: ThreadAttributes,
    entry: ThreadFn,
    entry_arg: usize,
) -> Result<ThreadRef<Traits>> {
    expect_thread_context::<Traits>()?;
    if attr.priority == priority::NONE || attr.priority > priority::HIGHEST {
        return Err(Error::Invalid);
    }

    let resource = Traits::memory_resource();
    let stack = match attr.stack_buffer {
        Some(buffer) => adopt_stack::<Traits>(buffer)?,
        None => allocate_stack::<Traits>(attr.stack_size, resource)?,
    };
    stack.initialize();

    let cb = ThreadCb::<Traits> {
        port_thread_state: crate::utils::Init::INIT,
        name: attr.name,
        clock: attr.clock,
        memory_resource: resource,
        entry,
        entry_arg,
        st: CpuLockCell::new(ThreadState::Undefined),
        priority_assigned: CpuLockCell::new(attr.priority),
        priority_inherited: CpuLockCell::new(priority::NONE),
        ready_link: CpuLockCell::new(None),
        child_link: CpuLockCell::new(None),
        children: CpuLockCell::new(ListHead::new()),
        parent: CpuLockCell::new(None),
        owned_mutexes: CpuLockCell::new(ListHead::new()),
        acquired_mutexes: CpuLockCell::new(0),
        waiting_node: CpuLockCell::new(None),
        clock_node: CpuLockCell::new(None),
        joiner: CpuLockCell::new(None),
        interrupted: CpuLockCell::new(false),
        event_flags: CpuLockCell::new(0),
        func_result: CpuLockCell::new(0),
        stack: CpuLockCell::new(stack),
    };

    let layout = Layout::new::<ThreadCb<Traits>>();
    // Safety: a live layout; released when the handle is dropped
    let raw = match unsafe { resource.allocate(layout) } {
        Some(raw) => raw.cast::<ThreadCb<Traits>>(),
        None => {
            if stack.owned {
                // Safety: the stack was allocated just above
                unsafe {
                    release_stack::<Traits>(resource, stack);
                }
            }
            return Err(Error::OutOfMemory);
        }
    };
    // Safety: `raw` is valid, properly aligned, and uninitialized
    unsafe { raw.as_ptr().write(cb) };
    let thread = ThreadRef(raw);

    // Safety: the control block is fully initialized and Undefined
    unsafe { Traits::initialize_thread_state(thread.cb()) };

    let mut lock = lock_cpu::<Traits>();
    let parent = Traits::state().sched.running.get(&*lock);
    thread.cb().parent.replace(&mut *lock, parent);
    match parent {
        Some(parent) => {
            let mut acc = child_list_accessor!(&parent.cb().children, lock.borrow_mut());
            acc.push_back(thread);
        }
        None => {
            let mut acc =
                child_list_accessor!(&Traits::state().sched.top_threads, lock.borrow_mut());
            acc.push_back(thread);
        }
    }
    sched::make_ready(lock.borrow_mut(), thread);
    sched::unlock_cpu_and_check_preemption(lock);

    Ok(thread)
}

pub(crate) fn spawn_idle<Traits: KernelTraits>(entry: ThreadFn) -> Result<ThreadRef<Traits>> {
    spawn_internal::<Traits>(
        ThreadAttributes::new()
            .with_name("idle")
            .with_priority(priority::IDLE),
        entry,
        0,
    )
}

unsafe fn release_stack<Traits: KernelTraits>(resource: &dyn MemoryResource, stack: StackDesc) {
    let layout = Layout::from_size_align(stack.words * 4, Traits::STACK_ALIGN)
        .expect("stack layout was valid at creation");
    // Safety: `stack.bottom` came from `resource.allocate` with this
    // same layout
    unsafe {
        resource.deallocate(
            NonNull::new(stack.bottom as *mut u8).expect("stack pointer is non-null"),
            layout,
        )
    };
}

impl<Traits: KernelTraits> Thread<Traits> {
    /// Create a thread and make it Ready. The new thread becomes a child
    /// of the creating thread and may preempt it immediately if it has a
    /// higher priority.
    pub fn new(attr: ThreadAttributes, entry: ThreadFn, arg: usize) -> Result<Self> {
        Ok(Self {
            cb: spawn_internal::<Traits>(attr, entry, arg)?,
            _no_clone: PhantomData,
        })
    }

    pub fn name(&self) -> &'static str {
        self.cb.cb().name
    }

    pub fn state(&self) -> ThreadState {
        let lock = lock_cpu::<Traits>();
        self.cb.cb().state_read(&*lock)
    }

    /// The effective priority (assigned or inherited, whichever is
    /// higher).
    pub fn priority(&self) -> u8 {
        let lock = lock_cpu::<Traits>();
        self.cb.cb().effective_priority(&*lock)
    }

    pub fn assigned_priority(&self) -> u8 {
        let lock = lock_cpu::<Traits>();
        *self.cb.cb().priority_assigned.read(&*lock)
    }

    pub fn inherited_priority(&self) -> u8 {
        let lock = lock_cpu::<Traits>();
        *self.cb.cb().priority_inherited.read(&*lock)
    }

    /// Change the assigned priority. A Ready thread is re-linked at its
    /// new position; a waiting thread is repositioned in its waiter
    /// list; either change can cause an immediate context switch.
    pub fn set_priority(&self, priority: u8) -> Result {
        if priority == priority::NONE || priority > priority::HIGHEST {
            return Err(Error::Invalid);
        }
        let mut lock = lock_cpu::<Traits>();
        let cb = self.cb.cb();
        match cb.state_read(&*lock) {
            ThreadState::Destroyed | ThreadState::Terminated | ThreadState::Undefined => {
                return Err(Error::Invalid)
            }
            _ => {}
        }
        let old_effective = cb.effective_priority(&*lock);
        cb.priority_assigned.replace(&mut *lock, priority);
        if cb.effective_priority(&*lock) != old_effective {
            apply_priority_change(lock.borrow_mut(), self.cb);
        }
        sched::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Set or clear the interrupt flag. Setting it forces any ongoing
    /// wait to return [`Error::Interrupted`]. The flag is never cleared
    /// by the kernel; clearing is the application's responsibility.
    pub fn interrupt(&self, interrupted: bool) {
        let mut lock = lock_cpu::<Traits>();
        self.cb.cb().interrupted.replace(&mut *lock, interrupted);
        if interrupted && sched::resume(lock.borrow_mut(), self.cb) {
            sched::unlock_cpu_and_check_preemption(lock);
        }
    }

    pub fn interrupted(&self) -> bool {
        let lock = lock_cpu::<Traits>();
        self.cb.cb().interrupted.get(&*lock)
    }

    /// Suspend the caller until this thread is destroyed, then return
    /// the thread's function result.
    ///
    /// A thread is joinable at most once; a second joiner fails with
    /// [`Error::Invalid`]. Joining self fails with [`Error::Deadlock`].
    pub fn join(&self) -> Result<usize> {
        let mut lock = lock_cpu::<Traits>();
        expect_waitable_context::<Traits>(lock.borrow_mut())?;
        let me = Traits::state().sched.running.get(&*lock).unwrap();
        if me == self.cb {
            return Err(Error::Deadlock);
        }
        loop {
            let cb = self.cb.cb();
            if cb.state_read(&*lock) == ThreadState::Destroyed {
                return Ok(cb.func_result.get(&*lock));
            }
            match cb.joiner.get(&*lock) {
                Some(joiner) if joiner != me => return Err(Error::Invalid),
                _ => {}
            }
            cb.joiner.replace(&mut *lock, Some(me));
            lock = sched::suspend_current(lock);
            if me.cb().interrupted.get(&*lock) {
                // Withdraw as the joiner so the destroy path can't wake
                // a thread that has moved on.
                if cb.joiner.get(&*lock) == Some(me) {
                    cb.joiner.replace(&mut *lock, None);
                }
                return Err(Error::Interrupted);
            }
        }
    }

    /// Externally terminate the thread. It is removed from every queue
    /// it is linked in; owned robust mutexes are marked owner-dead and
    /// released; the thread transitions directly to Destroyed and any
    /// joiner is woken.
    pub fn kill(&self) -> Result {
        kill_thread::<Traits>(self.cb)
    }

    /// Raise event flags in the thread's per-thread mask and wake it to
    /// re-evaluate its wait. Legal from an ISR. Returns the mask before
    /// the raise.
    pub fn flags_raise(&self, mask: u32) -> Result<u32> {
        if mask == 0 {
            return Err(Error::Invalid);
        }
        let mut lock = lock_cpu::<Traits>();
        let cb = self.cb.cb();
        let previous = cb.event_flags.get(&*lock);
        cb.event_flags.replace(&mut *lock, previous | mask);
        if sched::resume(lock.borrow_mut(), self.cb) {
            sched::unlock_cpu_and_check_preemption(lock);
        }
        Ok(previous)
    }

    /// An estimate of the stack bytes ever used, measured against the
    /// construction-time sentinel fill.
    pub fn stack_high_water(&self) -> usize {
        let lock = lock_cpu::<Traits>();
        let stack = self.cb.cb().stack.get(&*lock);
        if stack.bottom.is_null() {
            0
        } else {
            stack.size_bytes() - stack.available_bytes() - 2 * 4
        }
    }
}

impl<Traits: KernelTraits> Drop for Thread<Traits> {
    fn drop(&mut self) {
        {
            let lock = lock_cpu::<Traits>();
            let st = self.cb.cb().state_read(&*lock);
            drop(lock);
            if st != ThreadState::Destroyed {
                // Matches the original's destructor contract: a live
                // thread whose handle goes away is killed. Killing the
                // running thread itself is a programming error.
                kill_thread::<Traits>(self.cb).expect("cannot drop the handle of the running thread");
            }
        }
        let cb = self.cb.cb();
        let resource = cb.memory_resource;
        let layout = Layout::new::<ThreadCb<Traits>>();
        // Safety: the thread is Destroyed and unlinked from every
        // kernel list; nothing can reach the control block anymore.
        unsafe {
            core::ptr::drop_in_place(self.cb.0.as_ptr());
            resource.deallocate(self.cb.0.cast(), layout);
        }
    }
}

/// Reposition a thread in the scheduler's or a primitive's ordered
/// structures after its effective priority changed.
pub(crate) fn apply_priority_change<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
) {
    match thread.cb().state_read(&*lock) {
        ThreadState::Ready => sched::reposition_ready(lock.borrow_mut(), thread),
        ThreadState::Suspended => wait::reorder_wait_of(lock.borrow_mut(), thread),
        _ => {}
    }
}

/// Internal inherited-priority setter used by the mutex protocols.
/// The caller decides whether to reschedule.
pub(crate) fn set_inherited_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
    inherited: u8,
) {
    let cb = thread.cb();
    let old_effective = cb.effective_priority(&*lock);
    cb.priority_inherited.replace(&mut *lock, inherited);
    if cb.effective_priority(&*lock) != old_effective {
        apply_priority_change(lock.borrow_mut(), thread);
    }
}

/// The first function a new thread executes, entered from the port's
/// context trampoline. Runs the entry function, then takes the thread
/// through the exit path.
///
/// # Safety
///
/// Only meant to be called by a kernel port, exactly once per thread,
/// with a pointer previously passed to `initialize_thread_state`.
pub unsafe fn enter_thread<Traits: KernelTraits>(cb: *const ThreadCb<Traits>) -> ! {
    // Safety: the port passes the pointer it was given
    let cb_ref = unsafe { &*cb };
    let result = (cb_ref.entry)(cb_ref.entry_arg);
    exit_current::<Traits>(result)
}

/// The exit path: unlink from the hierarchy, stash the result, park the
/// control block on the terminated list for deferred cleanup, and
/// dispatch the next thread. Exiting with live children or owned
/// mutexes is a programming error and fatal by design.
pub(crate) fn exit_current<Traits: KernelTraits>(result: usize) -> ! {
    assert!(
        !Traits::in_handler_mode(),
        "a thread cannot exit from an ISR"
    );

    let mut lock = lock_cpu::<Traits>();
    let sched_state = &Traits::state().sched;
    let me = sched_state.running.get(&*lock).expect("no running thread");
    let cb = me.cb();

    unlink_from_siblings(lock.borrow_mut(), me);
    assert!(
        cb.children.get(&*lock).is_empty(),
        "thread exited with live children"
    );
    assert!(
        cb.owned_mutexes.get(&*lock).is_empty() && cb.acquired_mutexes.get(&*lock) == 0,
        "thread exited while owning mutexes"
    );

    cb.func_result.replace(&mut *lock, result);
    sched::link_terminated(lock.borrow_mut(), me);
    sched_state.running.replace(&mut *lock, None);

    let next = {
        let mut acc = thread_list_accessor!(&sched_state.ready, lock.borrow_mut());
        acc.pop_front().expect("no runnable thread")
    };
    next.cb().st.replace(&mut *lock, ThreadState::Running);
    sched_state.running.replace(&mut *lock, Some(next));

    drop(lock);
    // Safety: CPU Lock inactive; the current context is discarded
    unsafe { Traits::exit_and_dispatch(next.cb()) }
}

/// Deferred cleanup of a thread popped from the terminated list, run by
/// the idle thread.
pub(crate) fn destroy_terminated<Traits: KernelTraits>(
    lock: CpuLockGuard<Traits>,
    thread: ThreadRef<Traits>,
) -> CpuLockGuard<Traits> {
    debug_assert_eq!(thread.cb().state_read(&*lock), ThreadState::Terminated);
    destroy::<Traits>(lock, thread)
}

/// Release the thread's resources and transition it to Destroyed:
/// stack-guard check, stack release, owned-mutex abandonment, joiner
/// wake. Shared by the idle thread's cleanup and `kill`.
fn destroy<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
    thread: ThreadRef<Traits>,
) -> CpuLockGuard<Traits> {
    let cb = thread.cb();

    let stack = cb.stack.get(&*lock);
    if !stack.bottom.is_null() {
        assert!(
            stack.guards_intact(),
            "stack guard corrupted on thread '{}'",
            cb.name
        );
        let _high_water = stack.size_bytes() - stack.available_bytes();
        if stack.owned {
            // Safety: allocated at construction from this resource
            unsafe { release_stack::<Traits>(cb.memory_resource, stack) };
        }
        cb.stack.replace(&mut *lock, StackDesc::NONE);
    }

    lock = mutex::abandon_held_mutexes(lock, thread);

    cb.st.replace(&mut *lock, ThreadState::Destroyed);

    if let Some(joiner) = cb.joiner.replace(&mut *lock, None) {
        sched::resume(lock.borrow_mut(), joiner);
    }
    lock
}

fn kill_thread<Traits: KernelTraits>(thread: ThreadRef<Traits>) -> Result {
    expect_thread_context::<Traits>()?;

    let mut lock = lock_cpu::<Traits>();
    let cb = thread.cb();
    let st = cb.state_read(&*lock);
    if st == ThreadState::Destroyed {
        return Ok(()); // already exited on its own
    }
    if Traits::state().sched.running.get(&*lock) == Some(thread) {
        return Err(Error::Permission);
    }

    // Remove the thread from every queue it is linked in.
    match st {
        ThreadState::Ready => {
            let mut acc = thread_list_accessor!(&Traits::state().sched.ready, lock.borrow_mut());
            acc.remove(thread);
        }
        ThreadState::Terminated => {
            let mut acc =
                thread_list_accessor!(&Traits::state().sched.terminated, lock.borrow_mut());
            acc.remove(thread);
        }
        ThreadState::Suspended => {
            if let Some(node) = cb.waiting_node.replace(&mut *lock, None) {
                wait::unlink_node(lock.borrow_mut(), node);
            }
            if let Some(node) = cb.clock_node.replace(&mut *lock, None) {
                clock::remove_timeout_ref(lock.borrow_mut(), node);
            }
        }
        ThreadState::Running | ThreadState::Undefined | ThreadState::Destroyed => unreachable!(),
    }

    unlink_from_siblings(lock.borrow_mut(), thread);
    assert!(
        cb.children.get(&*lock).is_empty(),
        "thread killed with live children"
    );

    // Safety: the thread will never be dispatched again
    unsafe { Traits::discard_thread_state(cb) };

    cb.func_result.replace(&mut *lock, 0);
    let lock = destroy::<Traits>(lock, thread);
    sched::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Operations on the calling thread.
pub mod this_thread {
    use super::*;

    /// Voluntarily let the ready-list head run; the caller is re-queued
    /// behind its equal-priority peers.
    pub fn yield_now<Traits: KernelTraits>() -> Result {
        sched::yield_current::<Traits>()
    }

    /// Terminate the calling thread with the given result.
    pub fn exit<Traits: KernelTraits>(result: usize) -> ! {
        exit_current::<Traits>(result)
    }

    pub fn name<Traits: KernelTraits>() -> Option<&'static str> {
        let lock = lock_cpu::<Traits>();
        Traits::state()
            .sched
            .running
            .get(&*lock)
            .map(|t| t.cb().name)
    }

    /// The calling thread's interrupt flag. Consulted, never cleared,
    /// by the wait loops.
    pub fn interrupted<Traits: KernelTraits>() -> bool {
        let lock = lock_cpu::<Traits>();
        match Traits::state().sched.running.get(&*lock) {
            Some(me) => me.cb().interrupted.get(&*lock),
            None => false,
        }
    }

    pub fn set_interrupted<Traits: KernelTraits>(interrupted: bool) {
        let mut lock = lock_cpu::<Traits>();
        if let Some(me) = Traits::state().sched.running.get(&*lock) {
            me.cb().interrupted.replace(&mut *lock, interrupted);
        }
    }

    /// Wait until the calling thread's event-flag mask satisfies
    /// `(mask, mode)`; see [`FlagsMode`]. Returns the satisfying flags,
    /// clearing them first when `CLEAR` is requested. Returns only on
    /// success or interruption.
    pub fn flags_wait<Traits: KernelTraits>(mask: u32, mode: FlagsMode) -> Result<u32> {
        let mut lock = lock_cpu::<Traits>();
        expect_waitable_context::<Traits>(lock.borrow_mut())?;
        let me = Traits::state().sched.running.get(&*lock).unwrap();
        loop {
            if let Some(flags) = poll_own_flags(lock.borrow_mut(), me, mask, mode) {
                return Ok(flags);
            }
            lock = sched::suspend_current(lock);
            if me.cb().interrupted.get(&*lock) {
                return Err(Error::Interrupted);
            }
        }
    }

    /// Non-blocking variant of [`flags_wait`].
    pub fn flags_try_wait<Traits: KernelTraits>(mask: u32, mode: FlagsMode) -> Result<u32> {
        expect_thread_context::<Traits>()?;
        let mut lock = lock_cpu::<Traits>();
        let me = Traits::state()
            .sched
            .running
            .get(&*lock)
            .ok_or(Error::Permission)?;
        poll_own_flags(lock.borrow_mut(), me, mask, mode).ok_or(Error::WouldBlock)
    }

    /// Timed variant of [`flags_wait`], measured on the thread's clock.
    pub fn flags_timed_wait<Traits: KernelTraits>(
        mask: u32,
        mode: FlagsMode,
        timeout: Duration,
    ) -> Result<u32> {
        let mut lock = lock_cpu::<Traits>();
        expect_waitable_context::<Traits>(lock.borrow_mut())?;
        let me = Traits::state().sched.running.get(&*lock).unwrap();
        let clk = me.cb().clock.resolve::<Traits>();
        let deadline = clk.steady_now_locked(lock.borrow_mut()) + timeout;
        loop {
            if let Some(flags) = poll_own_flags(lock.borrow_mut(), me, mask, mode) {
                return Ok(flags);
            }

            let node = TimeoutNode::new_thread_wake(deadline, me);
            pin_utils::pin_mut!(node);
            clock::insert_timeout(lock.borrow_mut(), clk.steady_queue(), node.as_ref());
            me.cb()
                .clock_node
                .replace(&mut *lock, Some(TimeoutRef::new(&node)));

            lock = sched::suspend_current(lock);

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

    /// Clear bits in the calling thread's event-flag mask; returns the
    /// mask before clearing.
    pub fn flags_clear<Traits: KernelTraits>(mask: u32) -> Result<u32> {
        if mask == 0 {
            return Err(Error::Invalid);
        }
        let mut lock = lock_cpu::<Traits>();
        let me = Traits::state()
            .sched
            .running
            .get(&*lock)
            .ok_or(Error::Permission)?;
        let previous = me.cb().event_flags.get(&*lock);
        me.cb().event_flags.replace(&mut *lock, previous & !mask);
        Ok(previous)
    }

    /// Select bits from the calling thread's mask. A zero `mask` returns
    /// the full mask untouched; otherwise the selected bits are
    /// returned, and cleared when `mode` contains `CLEAR`.
    pub fn flags_get<Traits: KernelTraits>(mask: u32, mode: FlagsMode) -> Result<u32> {
        expect_thread_context::<Traits>()?;
        let mut lock = lock_cpu::<Traits>();
        let me = Traits::state()
            .sched
            .running
            .get(&*lock)
            .ok_or(Error::Permission)?;
        let current = me.cb().event_flags.get(&*lock);
        if mask == 0 {
            return Ok(current);
        }
        if mode.contains(FlagsMode::CLEAR) {
            me.cb().event_flags.replace(&mut *lock, current & !mask);
        }
        Ok(current & mask)
    }

    fn poll_own_flags<Traits: KernelTraits>(
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        me: ThreadRef<Traits>,
        mask: u32,
        mode: FlagsMode,
    ) -> Option<u32> {
        let mut current = me.cb().event_flags.get(&*lock);
        let satisfied = check_raised(&mut current, mask, mode);
        me.cb().event_flags.replace(&mut *lock, current);
        satisfied
    }
}
