//! Interrupt critical sections and the cells they guard.
//!
//! All kernel-shared mutable state (ready list, waiter lists, clock
//! timeout lists, thread control blocks) lives in [`CpuLockCell`]s.
//! A cell can only be read or written while the CPU Lock is held — an
//! interrupt critical section — which is materialized as a zero-sized
//! token ([`CpuLockToken`]) carried by the RAII guard returned from
//! [`lock_cpu`]. Forgetting to enter the critical section is therefore
//! a compile error, not a race.
//!
//! The port implements the actual masking with save/restore semantics,
//! so a kernel critical section nests correctly inside an application
//! one. The kernel itself never nests two `CpuLockGuard`s; a guard (or a
//! borrow of its token) is passed down instead.
use core::ops;
use tokenlock::UnsyncTokenLock;

use crate::{
    utils::{intrusive_list::CellLike, Init},
    PortThreading,
};

pub(crate) struct CpuLockTag<Traits>(Traits);

/// The key that "unlocks" [`CpuLockCell`].
pub(crate) type CpuLockToken<Traits> = tokenlock::UnsyncSingletonToken<CpuLockTag<Traits>>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
pub(crate) type CpuLockKeyhole<Traits> = tokenlock::SingletonTokenId<CpuLockTag<Traits>>;

/// Cell type accessible only while the CPU Lock is held.
pub(crate) struct CpuLockCell<Traits, T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole<Traits>>);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::INIT, x))
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    const INIT: Self = Self(Init::INIT);
}

impl<Traits, T> ops::Deref for CpuLockCell<Traits, T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits, T> ops::DerefMut for CpuLockCell<Traits, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<'a, Element: Clone, Traits: PortThreading> CellLike<&'a mut CpuLockGuard<Traits>>
    for CpuLockCell<Traits, Element>
{
    type Target = Element;

    fn get(&self, key: &&'a mut CpuLockGuard<Traits>) -> Self::Target {
        (**self).read(&***key).clone()
    }
    fn set(&self, key: &mut &'a mut CpuLockGuard<Traits>, value: Self::Target) {
        (**self).replace(&mut ***key, value);
    }
}

impl<'a, Element: Clone, Traits: PortThreading> CellLike<CpuLockTokenRefMut<'a, Traits>>
    for CpuLockCell<Traits, Element>
{
    type Target = Element;

    fn get(&self, key: &CpuLockTokenRefMut<'a, Traits>) -> Self::Target {
        (**self).read(&**key).clone()
    }
    fn set(&self, key: &mut CpuLockTokenRefMut<'a, Traits>, value: Self::Target) {
        (**self).replace(&mut **key, value);
    }
}

/// Enter an interrupt critical section and get an RAII guard for it.
///
/// The port's masking is save/restore, so this is legal in any context,
/// including handler mode — the tick ISR manipulates the timeout lists
/// under the same guard.
pub(crate) fn lock_cpu<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    // Safety: paired with `restore_interrupts` in `CpuLockGuard::drop`
    let saved = unsafe { Traits::disable_interrupts() };
    CpuLockGuard {
        saved,
        // Safety: Interrupts are masked and the kernel never nests
        //         guards, so this is the only live token.
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// RAII guard for an interrupt critical section.
///
/// [`CpuLockToken`] can be borrowed from this type.
pub(crate) struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
    saved: Traits::IrqStatus,
}

impl<Traits: PortThreading> CpuLockGuard<Traits> {
    /// Construct a [`CpuLockTokenRefMut`] by borrowing `self`.
    pub(crate) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: restores the state saved when the guard was created
        unsafe {
            Traits::restore_interrupts(self.saved);
        }
    }
}

impl<Traits: PortThreading> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Borrowed version of [`CpuLockGuard`]. Equivalent to
/// `&'a mut CpuLockGuard` but does not consume memory.
///
/// Unlike `&mut _`, the compiler does not reborrow this automatically
/// when passing it to a function — call [`borrow_mut`] at each use.
///
/// [`borrow_mut`]: tokenlock::UnsyncSingletonTokenRefMut::borrow_mut
pub(crate) type CpuLockTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<Traits>>;
