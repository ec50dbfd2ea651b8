//! A POSIX-inspired real-time kernel core for resource-constrained
//! microcontrollers.
//!
//! The kernel multiplexes a single CPU across cooperating threads under
//! a preemptive priority scheduler (strict priority order, FIFO among
//! equals, no time slicing), coordinates them with mutexes (priority
//! inheritance / priority ceiling, robustness), condition variables,
//! semaphores, event flags, memory pools and message queues, and
//! provides time services through three clocks and software timers.
//!
//! # Ports
//!
//! Everything hardware-specific is consumed through the [`PortThreading`]
//! and [`PortTimer`] traits: context creation and switching, interrupt
//! masking, the tick source. A port instantiates the kernel by
//! implementing them plus [`KernelTraits`], which supplies the
//! process-wide [`KernelState`] and the default [`MemoryResource`].
//!
//! # Contexts
//!
//! Most services are callable from threads only. Services documented as
//! ISR-legal (`Semaphore::post`, `Thread::flags_raise`,
//! `EventFlags::raise`, `System::reschedule`, non-blocking probes) may
//! also run in handler mode; everything else fails there with
//! [`Error::Permission`]. Blocking services additionally require the
//! scheduler to be started and not locked.
#![cfg_attr(not(test), no_std)]

use core::{alloc::Layout, marker::PhantomData, ptr::NonNull};

pub mod clock;
pub mod condvar;
pub mod error;
pub mod eventflags;
mod klock;
pub mod mempool;
pub mod msgqueue;
pub mod mutex;
pub mod sched;
pub mod semaphore;
mod state;
pub mod thread;
pub mod timer;
pub mod utils;
mod wait;

pub use crate::{
    clock::{Clock, ClockId, ClockKind, Duration, Offset, Timestamp},
    condvar::ConditionVariable,
    error::{errno, Error, Result},
    eventflags::{EventFlags, FlagsMode, FLAGS_ALL, FLAGS_ANY},
    mempool::MemoryPool,
    msgqueue::MessageQueue,
    mutex::{Mutex, MutexAttributes, MutexProtocol, MutexRobustness, MutexType},
    sched::SchedulerLockState,
    semaphore::{Semaphore, SemaphoreValue, MAX_SEMAPHORE_VALUE},
    state::KernelState,
    thread::{this_thread, Thread, ThreadAttributes, ThreadCb, ThreadFn, ThreadState},
    timer::{Timer, TimerAttributes, TimerFn, TimerKind, TimerState},
};

/// Priority values: an 8-bit space quantized in steps of 16. Higher
/// numbers run first. `NONE` is not a schedulable priority — it marks
/// the absence of an inherited boost.
pub mod priority {
    pub const NONE: u8 = 0;
    pub const IDLE: u8 = 16;
    pub const LOWEST: u8 = 32;
    pub const BELOW_NORMAL: u8 = 64;
    pub const NORMAL: u8 = 96;
    pub const ABOVE_NORMAL: u8 = 128;
    pub const HIGH: u8 = 160;
    pub const REALTIME: u8 = 192;
    pub const HIGHEST: u8 = 223;
    pub const ISR: u8 = 239;
    pub const ERROR: u8 = 255;
}

/// The memory-resource interface the kernel allocates from (thread
/// stacks and control blocks, pool arenas, queue slots) when no
/// preallocated storage is supplied in attributes.
///
/// # Safety
///
/// An implementation must return memory satisfying the layout, unique
/// until deallocated, and must accept any pointer it previously
/// returned (with the same layout) in `deallocate`.
pub unsafe trait MemoryResource: Sync {
    /// Allocate `layout.size()` bytes at `layout.align()` alignment.
    /// Returns `None` when exhausted.
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must have come from `allocate` on the same resource with
    /// the same layout.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The thread-execution half of the port interface: context blocks,
/// context switching, and interrupt masking.
///
/// # Safety
///
/// The implementation is trusted with the kernel's integrity: it must
/// honor every contract documented on the individual items.
pub unsafe trait PortThreading: Sized + 'static {
    /// The port's per-thread context block, embedded first in
    /// [`ThreadCb`].
    type ThreadState: utils::Init + Send + Sync + 'static;

    /// Saved interrupt-mask state, restored when a critical section
    /// ends.
    type IrqStatus: Copy + 'static;

    const STACK_SIZE_MIN: usize;
    const STACK_SIZE_DEFAULT: usize;
    /// Must be a power of two, at least 4.
    const STACK_ALIGN: usize = 16;

    /// Whether an interrupt handler is currently executing.
    fn in_handler_mode() -> bool;

    /// Raise the interrupt mask to the kernel's boundary priority and
    /// return the state to restore. Nestable via the saved state.
    unsafe fn disable_interrupts() -> Self::IrqStatus;
    unsafe fn restore_interrupts(status: Self::IrqStatus);

    /// Prepare the context block so that the first switch-in enters
    /// [`thread::enter_thread`] for this control block.
    unsafe fn initialize_thread_state(thread: &ThreadCb<Self>)
    where
        Self: KernelTraits;

    /// The thread was killed without ever being switched in again;
    /// release whatever `initialize_thread_state` set up.
    unsafe fn discard_thread_state(thread: &ThreadCb<Self>)
    where
        Self: KernelTraits;

    /// Suspend the calling context and run `next` (already marked
    /// Running by the kernel). Returns when the calling thread is
    /// scheduled again. Called with interrupts unmasked.
    unsafe fn context_switch_to(next: &ThreadCb<Self>)
    where
        Self: KernelTraits;

    /// Discard the calling context forever and run `next`.
    unsafe fn exit_and_dispatch(next: &ThreadCb<Self>) -> !
    where
        Self: KernelTraits;

    /// Dispatch the very first thread. Does not return.
    unsafe fn start_scheduler(first: &ThreadCb<Self>) -> !
    where
        Self: KernelTraits;
}

/// The time half of the port interface: the tick source and the
/// idle-loop hook.
///
/// # Safety
///
/// See [`PortThreading`].
pub unsafe trait PortTimer: Sized + 'static {
    /// Sysclock ticks per rtclock second.
    const SYSCLOCK_HZ: u64;
    /// Hrclock cycles per sysclock tick.
    const HRCLOCK_CYCLES_PER_TICK: u64;

    /// Install and start the tick source. Called once from
    /// [`System::start`].
    unsafe fn start_systick();

    /// Cycles elapsed since the last tick, for sub-tick hrclock
    /// readings.
    fn hrclock_subticks() -> u64;

    /// Idle-loop hook: let the CPU rest until the next interrupt.
    /// Called from the idle thread with interrupts unmasked.
    unsafe fn wait_for_interrupt();
}

/// Binds a port to one kernel instance.
pub trait KernelTraits: PortThreading + PortTimer {
    /// The kernel instance's global state. Typically a `static` defined
    /// by the port's instantiation macro.
    fn state() -> &'static KernelState<Self>;

    /// The default memory resource, injected into everything that
    /// allocates.
    fn memory_resource() -> &'static dyn MemoryResource;
}

/// Kernel-wide operations of one kernel instance.
///
/// The scheduler-related operations mirror the classic RTOS surface:
/// `initialize`/`start` at boot, a reentrant scheduler lock, a
/// preemption toggle, and the ISR-tail `reschedule` hook.
pub struct System<Traits>(PhantomData<Traits>);

impl<Traits: KernelTraits> System<Traits> {
    /// Prepare the scheduler: creates the idle thread. Must be called
    /// (once) before [`start`](System::start). Fails with `Permission`
    /// in handler mode.
    pub fn initialize() -> Result {
        sched::initialize::<Traits>()
    }

    /// Install the tick source and switch to the highest-priority
    /// ready thread. Does not return.
    pub fn start() -> ! {
        sched::start::<Traits>()
    }

    pub fn is_started() -> bool {
        sched::is_started::<Traits>()
    }

    /// Lock the scheduler (inhibit context switches). Reentrant;
    /// returns the previous counter for [`set_locked`](System::set_locked).
    pub fn lock() -> Result<SchedulerLockState> {
        state::expect_thread_context::<Traits>()?;
        Ok(sched::lock_scheduler::<Traits>())
    }

    /// Undo one [`lock`](System::lock); performs any pending preemption
    /// when the counter reaches zero.
    pub fn unlock() -> Result<SchedulerLockState> {
        state::expect_thread_context::<Traits>()?;
        Ok(sched::unlock_scheduler::<Traits>())
    }

    /// Restore the scheduler lock to a snapshot taken by
    /// [`lock`](System::lock).
    pub fn set_locked(snapshot: SchedulerLockState) -> Result<SchedulerLockState> {
        state::expect_thread_context::<Traits>()?;
        Ok(sched::set_locked::<Traits>(snapshot))
    }

    pub fn is_locked() -> bool {
        sched::is_locked::<Traits>()
    }

    /// Toggle preemption; returns the previous setting. With preemption
    /// off, context switches only occur at explicit yield points.
    pub fn set_preemptive(preemptive: bool) -> Result<bool> {
        state::expect_thread_context::<Traits>()?;
        Ok(sched::set_preemptive::<Traits>(preemptive))
    }

    pub fn is_preemptive() -> bool {
        sched::is_preemptive::<Traits>()
    }

    /// Whether an interrupt handler is currently executing.
    pub fn in_handler_mode() -> bool {
        Traits::in_handler_mode()
    }

    /// Perform a pending context switch if one is due. Always safe to
    /// invoke (typically from an ISR tail); a no-op whenever switching
    /// is inhibited.
    pub fn reschedule() {
        sched::reschedule::<Traits>()
    }

    /// The system tick ISR body. The platform's tick interrupt must
    /// invoke this.
    pub fn systick_handler() {
        clock::systick_handler::<Traits>()
    }

    /// The realtime-clock ISR body, invoked once per second by the
    /// platform's RTC interrupt.
    pub fn rtc_handler() {
        clock::rtc_handler::<Traits>()
    }

    /// The tick-driven steady clock.
    pub fn sysclock() -> &'static Clock<Traits> {
        &Traits::state().sysclock
    }

    /// The adjustable realtime (seconds) clock.
    pub fn rtclock() -> &'static Clock<Traits> {
        &Traits::state().rtclock
    }

    /// The high-resolution (cycle) steady clock.
    pub fn hrclock() -> &'static Clock<Traits> {
        &Traits::state().hrclock
    }
}
