//! Simulation environment for running the muon kernel on a hosted
//! environment.
//!
//! Each kernel thread is backed by a host OS thread, but exactly one of
//! them is ever unparked: a context switch hands the execution baton to
//! the elected thread and parks the caller until it is elected again.
//! The result is a deterministic single-CPU simulation in which
//! preemption happens at kernel-operation boundaries — which is all the
//! kernel itself ever guarantees observably.
//!
//! Time is virtual. The tick "interrupt" fires from the idle thread's
//! [`PortTimer::wait_for_interrupt`] hook: each call advances the tick
//! counter by one and runs the tick handler in simulated handler mode,
//! so timed waits make progress exactly when the system is otherwise
//! idle. [`with_interrupt_context`] does the same for arbitrary
//! ISR-legal calls.
//!
//! A kernel instance is declared with [`use_port!`] and driven with
//! [`run`]; the boot sequence creates a `main` thread for the supplied
//! function and starts the scheduler. `run` returns when [`stop`] is
//! called (which [`run`]'s main trampoline does as soon as the main
//! function returns). Worker threads still parked at that point are
//! abandoned; panics in any kernel thread propagate out of [`run`].
//!
//! [`PortTimer::wait_for_interrupt`]: muon_kernel::PortTimer::wait_for_interrupt
use std::{
    any::Any,
    cell::Cell,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        mpsc,
    },
};

use spin::Mutex as SpinMutex;

pub use muon_kernel as kernel;
use muon_kernel::{thread::ThreadCb, utils::Init, System, Thread, ThreadAttributes};

/// Idle ticks tolerated with nothing becoming runnable before the
/// simulation declares the system deadlocked.
const DEADLOCK_IDLE_TICKS: u64 = 10_000_000;

thread_local! {
    /// The control-block address of the kernel thread backed by this
    /// host thread. Zero on non-worker threads.
    static CURRENT_CB: Cell<usize> = Cell::new(0);
}

/// Implemented on a kernel trait type by [`use_port!`].
pub trait PortInstance:
    muon_kernel::KernelTraits + muon_kernel::PortThreading<ThreadState = ThreadCtx>
{
    fn port_state() -> &'static State;
}

/// What ended a simulation.
enum Verdict {
    Stopped,
    Panicked(Box<dyn Any + Send>),
}

/// The internal state of one port instance.
pub struct State {
    /// Control-block address of the thread holding the execution baton.
    running: AtomicUsize,
    cpu_lock: AtomicBool,
    handler_depth: AtomicUsize,
    ticks: AtomicU64,
    /// Consecutive idle ticks since the last context switch; the
    /// runaway guard for wedged tests.
    idle_ticks: AtomicU64,
    supervisor: SpinMutex<Option<mpsc::Sender<Verdict>>>,
}

impl State {
    pub const fn new() -> Self {
        Self {
            running: AtomicUsize::new(0),
            cpu_lock: AtomicBool::new(false),
            handler_depth: AtomicUsize::new(0),
            ticks: AtomicU64::new(0),
            idle_ticks: AtomicU64::new(0),
            supervisor: SpinMutex::new(None),
        }
    }

    fn report(&self, verdict: Verdict) {
        let tx = self.supervisor.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(verdict);
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// The port's per-thread context block: the host thread backing the
/// kernel thread.
pub struct ThreadCtx {
    host: SpinMutex<Option<std::thread::Thread>>,
}

impl Init for ThreadCtx {
    const INIT: Self = Self {
        host: SpinMutex::new(None),
    };
}

fn park_forever() -> ! {
    loop {
        std::thread::park();
    }
}

fn wait_until_scheduled(state: &'static State, me: usize) {
    while state.running.load(Ordering::SeqCst) != me {
        std::thread::park();
    }
    state.idle_ticks.store(0, Ordering::SeqCst);
}

fn unpark_thread<Traits: PortInstance>(cb: &ThreadCb<Traits>) {
    let host = cb
        .port_thread_state
        .host
        .lock()
        .clone()
        .expect("thread has no backing host thread");
    host.unpark();
}

/// Generic implementations behind the `use_port!`-generated trait
/// impls.
#[doc(hidden)]
pub mod imp {
    use super::*;

    pub fn initialize_thread_state<Traits: PortInstance>(thread: &ThreadCb<Traits>) {
        let state = Traits::port_state();
        let cb_addr = thread as *const ThreadCb<Traits> as usize;

        let host = std::thread::Builder::new()
            .name(format!("kthread:{}", thread.name()))
            .spawn(move || {
                CURRENT_CB.with(|c| c.set(cb_addr));
                // Block until the scheduler elects this thread for the
                // first time.
                wait_until_scheduled(state, cb_addr);

                let result = catch_unwind(AssertUnwindSafe(|| {
                    // Safety: `cb_addr` was given to us by the kernel in
                    // `initialize_thread_state`
                    unsafe { muon_kernel::thread::enter_thread::<Traits>(cb_addr as *const _) };
                }));
                // `enter_thread` never returns; getting here means a
                // panic unwound out of the kernel thread.
                if let Err(payload) = result {
                    state.report(Verdict::Panicked(payload));
                }
                park_forever();
            })
            .expect("failed to spawn a worker thread");

        *thread.port_thread_state.host.lock() = Some(host.thread().clone());
    }

    pub fn discard_thread_state<Traits: PortInstance>(thread: &ThreadCb<Traits>) {
        // The backing host thread is parked and will never be elected
        // again; abandon it.
        log::trace!("discarding the context of {:?}", thread.name());
    }

    pub fn context_switch_to<Traits: PortInstance>(next: &ThreadCb<Traits>) {
        let state = Traits::port_state();
        let me = CURRENT_CB.with(|c| c.get());
        debug_assert_ne!(me, 0, "context switch from a non-worker thread");
        let next_addr = next as *const ThreadCb<Traits> as usize;
        if next_addr == me {
            return;
        }
        log::trace!("switching to {:?}", next.name());
        state.running.store(next_addr, Ordering::SeqCst);
        unpark_thread(next);
        wait_until_scheduled(state, me);
    }

    pub fn exit_and_dispatch<Traits: PortInstance>(next: &ThreadCb<Traits>) -> ! {
        let state = Traits::port_state();
        log::trace!("exiting; dispatching {:?}", next.name());
        state
            .running
            .store(next as *const ThreadCb<Traits> as usize, Ordering::SeqCst);
        unpark_thread(next);
        park_forever()
    }

    pub fn start_scheduler<Traits: PortInstance>(first: &ThreadCb<Traits>) -> ! {
        let state = Traits::port_state();
        log::trace!("dispatching the first thread {:?}", first.name());
        state
            .running
            .store(first as *const ThreadCb<Traits> as usize, Ordering::SeqCst);
        unpark_thread(first);
        // The boot context is no longer needed.
        park_forever()
    }

    /// The virtual tick source: one call, one tick, delivered in
    /// simulated handler mode, with the deferred dispatch at the "ISR
    /// tail".
    pub fn wait_for_interrupt<Traits: PortInstance>() {
        let state = Traits::port_state();
        let idle = state.idle_ticks.fetch_add(1, Ordering::SeqCst) + 1;
        assert!(
            idle < DEADLOCK_IDLE_TICKS,
            "every thread is blocked and no timeout will ever wake one"
        );

        state.handler_depth.fetch_add(1, Ordering::SeqCst);
        System::<Traits>::systick_handler();
        let ticks = state.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        if ticks % Traits::SYSCLOCK_HZ == 0 {
            System::<Traits>::rtc_handler();
        }
        state.handler_depth.fetch_sub(1, Ordering::SeqCst);

        // ISR tail: perform whatever dispatch the handlers requested.
        System::<Traits>::reschedule();
    }

    pub fn in_handler_mode<Traits: PortInstance>() -> bool {
        Traits::port_state().handler_depth.load(Ordering::SeqCst) != 0
    }

    pub fn disable_interrupts<Traits: PortInstance>() -> bool {
        Traits::port_state().cpu_lock.swap(true, Ordering::SeqCst)
    }

    pub fn restore_interrupts<Traits: PortInstance>(status: bool) {
        Traits::port_state().cpu_lock.store(status, Ordering::SeqCst);
    }
}

/// Run `f` in simulated handler mode, then perform the deferred
/// ISR-tail dispatch. For exercising ISR-legal services
/// (`Semaphore::post`, `flags_raise`, …) the way a real interrupt
/// would.
pub fn with_interrupt_context<Traits: PortInstance>(f: impl FnOnce()) {
    let state = Traits::port_state();
    state.handler_depth.fetch_add(1, Ordering::SeqCst);
    f();
    state.handler_depth.fetch_sub(1, Ordering::SeqCst);
    System::<Traits>::reschedule();
}

/// End the simulation; [`run`] returns in the host. Never returns in
/// the calling kernel thread.
pub fn stop<Traits: PortInstance>() -> ! {
    Traits::port_state().report(Verdict::Stopped);
    park_forever()
}

fn main_trampoline<Traits: PortInstance>(arg: usize) -> usize {
    // Safety: `run` smuggled a `fn()` through the entry argument
    let main_fn: fn() = unsafe { std::mem::transmute(arg) };
    main_fn();
    stop::<Traits>()
}

/// Boot the kernel and run `main_fn` as the body of its `main` thread.
/// Returns when the simulation is stopped; re-raises any panic that
/// occurred in a kernel thread.
pub fn run<Traits: PortInstance>(main_fn: fn()) {
    let _ = env_logger::builder().is_test(true).try_init();

    let state = Traits::port_state();
    let (tx, rx) = mpsc::channel();
    {
        let mut supervisor = state.supervisor.lock();
        assert!(
            supervisor.is_none(),
            "this kernel instance was already run"
        );
        *supervisor = Some(tx);
    }

    std::thread::Builder::new()
        .name("boot".to_owned())
        .spawn(move || {
            let result = catch_unwind(|| {
                System::<Traits>::initialize().expect("kernel initialization failed");
                let main = Thread::<Traits>::new(
                    ThreadAttributes::new().with_name("main"),
                    main_trampoline::<Traits>,
                    main_fn as usize,
                )
                .expect("failed to create the main thread");
                // The main thread never exits (`stop` parks it), so the
                // handle is intentionally leaked.
                std::mem::forget(main);
                System::<Traits>::start();
            });
            if let Err(payload) = result {
                Traits::port_state().report(Verdict::Panicked(payload));
            }
        })
        .expect("failed to spawn the boot thread");

    match rx.recv().expect("the kernel went away without a verdict") {
        Verdict::Stopped => {}
        Verdict::Panicked(payload) => std::panic::resume_unwind(payload),
    }
}

/// A [`MemoryResource`] backed by the host's global allocator.
///
/// [`MemoryResource`]: muon_kernel::MemoryResource
pub struct SystemMemoryResource;

// Safety: delegates to the (correct) host allocator
unsafe impl muon_kernel::MemoryResource for SystemMemoryResource {
    unsafe fn allocate(
        &self,
        layout: std::alloc::Layout,
    ) -> Option<core::ptr::NonNull<u8>> {
        // Safety: the kernel never requests zero-size layouts
        core::ptr::NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: core::ptr::NonNull<u8>, layout: std::alloc::Layout) {
        // Safety: forwarded contract
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Instantiate the kernel for a unit struct: defines the port trait
/// impls and the per-instance static state.
///
/// ```ignore
/// muon_port_std::use_port!(unsafe struct SystemTraits);
/// type System = muon_kernel::System<SystemTraits>;
/// ```
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $Traits:ident) => {
        $vis struct $Traits;

        impl $crate::PortInstance for $Traits {
            fn port_state() -> &'static $crate::State {
                static PORT_STATE: $crate::State = $crate::State::new();
                &PORT_STATE
            }
        }

        impl $crate::kernel::KernelTraits for $Traits {
            fn state() -> &'static $crate::kernel::KernelState<Self> {
                static KERNEL_STATE: $crate::kernel::KernelState<$Traits> =
                    $crate::kernel::KernelState::new();
                &KERNEL_STATE
            }

            fn memory_resource() -> &'static dyn $crate::kernel::MemoryResource {
                &$crate::SystemMemoryResource
            }
        }

        unsafe impl $crate::kernel::PortThreading for $Traits {
            type ThreadState = $crate::ThreadCtx;
            type IrqStatus = bool;

            const STACK_SIZE_MIN: usize = 1024;
            const STACK_SIZE_DEFAULT: usize = 16 * 1024;

            fn in_handler_mode() -> bool {
                $crate::imp::in_handler_mode::<Self>()
            }

            unsafe fn disable_interrupts() -> bool {
                $crate::imp::disable_interrupts::<Self>()
            }

            unsafe fn restore_interrupts(status: bool) {
                $crate::imp::restore_interrupts::<Self>(status)
            }

            unsafe fn initialize_thread_state(thread: &$crate::kernel::ThreadCb<Self>) {
                $crate::imp::initialize_thread_state::<Self>(thread)
            }

            unsafe fn discard_thread_state(thread: &$crate::kernel::ThreadCb<Self>) {
                $crate::imp::discard_thread_state::<Self>(thread)
            }

            unsafe fn context_switch_to(next: &$crate::kernel::ThreadCb<Self>) {
                $crate::imp::context_switch_to::<Self>(next)
            }

            unsafe fn exit_and_dispatch(next: &$crate::kernel::ThreadCb<Self>) -> ! {
                $crate::imp::exit_and_dispatch::<Self>(next)
            }

            unsafe fn start_scheduler(first: &$crate::kernel::ThreadCb<Self>) -> ! {
                $crate::imp::start_scheduler::<Self>(first)
            }
        }

        unsafe impl $crate::kernel::PortTimer for $Traits {
            const SYSCLOCK_HZ: u64 = 1000;
            const HRCLOCK_CYCLES_PER_TICK: u64 = 1000;

            unsafe fn start_systick() {
                // Virtual time: ticks are delivered from the idle hook.
            }

            fn hrclock_subticks() -> u64 {
                0
            }

            unsafe fn wait_for_interrupt() {
                $crate::imp::wait_for_interrupt::<Self>()
            }
        }
    };
}
