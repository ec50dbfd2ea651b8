//! Status codes returned by kernel services.
//!
//! The kernel reports caller mistakes and transient failures as plain
//! statuses and never panics on them; panics are reserved for broken
//! kernel invariants (a corrupted stack guard, a thread exiting while
//! still owning mutexes).
use core::fmt;

/// The result type of every fallible kernel service.
pub type Result<T = ()> = core::result::Result<T, Error>;

/// Error statuses, aligned with the POSIX `errno` values a C adapter
/// layer would expose. See [`Error::errno`].
#[derive(Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The calling context is not allowed to perform the operation
    /// (handler mode, scheduler locked, or not the owner). `EPERM`
    Permission,
    /// An argument is out of its domain (priority out of range, zero
    /// mask, ceiling below the locking thread's priority). `EINVAL`
    Invalid,
    /// A bounded resource is momentarily exhausted (semaphore at its
    /// maximum, recursive mutex at `max_count`, timer not running).
    /// `EAGAIN`
    Again,
    /// A non-blocking probe found the predicate false. `EWOULDBLOCK`
    WouldBlock,
    /// A timed wait expired before the predicate became true.
    /// `ETIMEDOUT`
    TimedOut,
    /// The wait was cut short by [`Thread::interrupt`].
    /// `EINTR`
    ///
    /// [`Thread::interrupt`]: crate::thread::Thread::interrupt
    Interrupted,
    /// Relocking an errorcheck mutex already held by the caller.
    /// `EDEADLK`
    Deadlock,
    /// A robust mutex was acquired after its previous owner died while
    /// holding it. The new owner holds the lock and is responsible for
    /// repairing the protected state. `EOWNERDEAD`
    OwnerDead,
    /// A robust mutex was released without `mark_consistent` after an
    /// owner death; it is permanently unusable. `ENOTRECOVERABLE`
    NotRecoverable,
    /// The memory resource could not satisfy an allocation. `ENOMEM`
    OutOfMemory,
}

/// POSIX `errno` constants used for the numeric view of [`Error`].
///
/// These are the values a flat C API layered over this kernel would
/// return, chosen for binary compatibility with newlib-style libcs.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const EINTR: i32 = 4;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EINVAL: i32 = 22;
    pub const EDEADLK: i32 = 45;
    /// Same value as `EAGAIN`, as on most libcs.
    pub const EWOULDBLOCK: i32 = EAGAIN;
    pub const ETIMEDOUT: i32 = 116;
    pub const ENOTRECOVERABLE: i32 = 141;
    pub const EOWNERDEAD: i32 = 142;
}

impl Error {
    /// The POSIX `errno` value corresponding to this status.
    /// `result::ok` is `0` and is represented by `Ok(_)`, so every
    /// variant maps to a nonzero value.
    pub const fn errno(self) -> i32 {
        match self {
            Self::Permission => errno::EPERM,
            Self::Invalid => errno::EINVAL,
            Self::Again => errno::EAGAIN,
            Self::WouldBlock => errno::EWOULDBLOCK,
            Self::TimedOut => errno::ETIMEDOUT,
            Self::Interrupted => errno::EINTR,
            Self::Deadlock => errno::EDEADLK,
            Self::OwnerDead => errno::EOWNERDEAD,
            Self::NotRecoverable => errno::ENOTRECOVERABLE,
            Self::OutOfMemory => errno::ENOMEM,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Permission => "Permission",
            Self::Invalid => "Invalid",
            Self::Again => "Again",
            Self::WouldBlock => "WouldBlock",
            Self::TimedOut => "TimedOut",
            Self::Interrupted => "Interrupted",
            Self::Deadlock => "Deadlock",
            Self::OwnerDead => "OwnerDead",
            Self::NotRecoverable => "NotRecoverable",
            Self::OutOfMemory => "OutOfMemory",
        };
        write!(f, "{name} (errno {})", self.errno())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values() {
        assert_eq!(Error::Permission.errno(), 1);
        assert_eq!(Error::Interrupted.errno(), 4);
        assert_eq!(Error::Again.errno(), 11);
        assert_eq!(Error::WouldBlock.errno(), 11);
        assert_eq!(Error::OutOfMemory.errno(), 12);
        assert_eq!(Error::Invalid.errno(), 22);
    }

    #[test]
    fn distinct_from_ok() {
        let all = [
            Error::Permission,
            Error::Invalid,
            Error::Again,
            Error::WouldBlock,
            Error::TimedOut,
            Error::Interrupted,
            Error::Deadlock,
            Error::OwnerDead,
            Error::NotRecoverable,
            Error::OutOfMemory,
        ];
        for e in all {
            assert_ne!(e.errno(), 0);
        }
    }
}
