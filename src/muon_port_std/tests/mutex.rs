//! Mutex semantics: recursion accounting, priority inheritance and
//! ceiling, robustness, and the error paths.
use std::sync::Mutex as StdMutex;

use muon_kernel::{
    priority, Error, Mutex, MutexAttributes, MutexProtocol, Semaphore, System, Thread,
    ThreadAttributes,
};
use muon_port_std::run;
use once_cell::sync::OnceCell;

mod recursion {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    static M: Mutex<K> = Mutex::new(
        MutexAttributes::new()
            .with_name("recursive")
            .recursive()
            .with_max_count(3),
    );

    pub fn main() {
        // S1: three locks succeed, the fourth exceeds `max_count`.
        M.lock().unwrap();
        M.lock().unwrap();
        M.lock().unwrap();
        assert_eq!(M.count(), 3);
        assert_eq!(M.lock(), Err(Error::Again));

        M.unlock().unwrap();
        assert_eq!(M.count(), 2);
        M.unlock().unwrap();
        M.unlock().unwrap();
        assert!(!M.is_locked());
        // A fourth unlock has no owner behind it.
        assert_eq!(M.unlock(), Err(Error::Permission));
    }
}

#[test]
fn recursive_lock_accounting() {
    run::<recursion::K>(recursion::main);
}

mod errorcheck {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    static M: Mutex<K> = Mutex::new(MutexAttributes::new().with_name("ec").errorcheck());

    pub fn main() {
        M.lock().unwrap();
        assert_eq!(M.lock(), Err(Error::Deadlock));
        M.unlock().unwrap();
        assert_eq!(M.unlock(), Err(Error::Permission));
    }
}

#[test]
fn errorcheck_detects_relock_and_bad_unlock() {
    run::<errorcheck::K>(errorcheck::main);
}

mod inheritance {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    static X: Mutex<K> = Mutex::new(
        MutexAttributes::new()
            .with_name("x")
            .with_protocol(MutexProtocol::Inherit),
    );
    static SEM_MAIN: Semaphore<K> = Semaphore::binary("sem-main", 0);
    static SEM_M: Semaphore<K> = Semaphore::binary("sem-m", 0);
    static SEM_L: Semaphore<K> = Semaphore::binary("sem-l", 0);
    static L_THREAD: OnceCell<Thread<K>> = OnceCell::new();
    pub static LOG: StdMutex<Vec<&'static str>> = StdMutex::new(Vec::new());

    fn log(entry: &'static str) {
        LOG.lock().unwrap().push(entry);
    }

    fn low(_: usize) -> usize {
        X.lock().unwrap();
        log("L:locked");
        SEM_MAIN.post().unwrap();
        SEM_L.wait().unwrap();
        log("L:unlock");
        X.unlock().unwrap();
        log("L:done");
        0
    }

    fn mid(_: usize) -> usize {
        log("M:start");
        SEM_M.wait().unwrap();
        log("M:run");
        0
    }

    fn high(_: usize) -> usize {
        log("H:try");
        X.lock().unwrap();
        log("H:locked");
        X.unlock().unwrap();
        0
    }

    pub fn main() {
        // S2: L (64) holds X; H (160) blocks on it; M (128) must not
        // run before L leaves the critical section.
        let l = Thread::<K>::new(
            ThreadAttributes::new().with_name("L").with_priority(priority::BELOW_NORMAL),
            low,
            0,
        )
        .unwrap();
        L_THREAD.set(l).ok().unwrap();
        let l = L_THREAD.get().unwrap();

        // Let L run and take the mutex.
        SEM_MAIN.wait().unwrap();

        let m = Thread::<K>::new(
            ThreadAttributes::new().with_name("M").with_priority(priority::ABOVE_NORMAL),
            mid,
            0,
        )
        .unwrap();
        let h = Thread::<K>::new(
            ThreadAttributes::new().with_name("H").with_priority(priority::HIGH),
            high,
            0,
        )
        .unwrap();

        // H is blocked on X now; L runs at H's priority.
        assert_eq!(l.inherited_priority(), priority::HIGH);
        assert_eq!(l.priority(), priority::HIGH);

        // Release L: being boosted above M, it finishes the critical
        // section first; the hand-over then runs H, and only then M.
        // Control returns here once H has exited and L has dropped
        // back below us.
        SEM_L.post().unwrap();

        // No stale boost once the contested mutex is gone.
        assert_eq!(l.inherited_priority(), priority::NONE);
        assert_eq!(l.priority(), priority::BELOW_NORMAL);

        SEM_M.post().unwrap();
        h.join().unwrap();
        m.join().unwrap();
        l.join().unwrap();
    }
}

#[test]
fn priority_inheritance_prevents_inversion() {
    run::<inheritance::K>(inheritance::main);
    assert_eq!(
        *inheritance::LOG.lock().unwrap(),
        ["L:locked", "M:start", "H:try", "L:unlock", "H:locked", "M:run", "L:done"]
    );
}

mod ceiling {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    static P: Mutex<K> = Mutex::new(
        MutexAttributes::new()
            .with_name("ceiling")
            .with_protocol(MutexProtocol::Protect)
            .with_priority_ceiling(priority::HIGH),
    );

    fn overly_important(_: usize) -> usize {
        // Locking from above the ceiling is a configuration error.
        match P.lock() {
            Err(Error::Invalid) => 1,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    pub fn main() {
        P.lock().unwrap();
        P.unlock().unwrap();

        let t = Thread::<K>::new(
            ThreadAttributes::new().with_name("realtime").with_priority(priority::REALTIME),
            overly_important,
            0,
        )
        .unwrap();
        assert_eq!(t.join().unwrap(), 1);

        // The ceiling can be updated; the setter reports the old one.
        assert_eq!(P.set_priority_ceiling(priority::REALTIME).unwrap(), priority::HIGH);
        assert_eq!(P.priority_ceiling(), priority::REALTIME);
        assert_eq!(P.set_priority_ceiling(priority::ERROR), Err(Error::Invalid));
    }
}

#[test]
fn ceiling_protocol_validates_and_updates() {
    run::<ceiling::K>(ceiling::main);
}

mod ceiling_boost {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    static P: Mutex<K> = Mutex::new(
        MutexAttributes::new()
            .with_name("ceiling")
            .with_protocol(MutexProtocol::Protect)
            .with_priority_ceiling(priority::HIGH),
    );
    static HOLDER: OnceCell<Thread<K>> = OnceCell::new();
    static READY: Semaphore<K> = Semaphore::binary("ready", 0);
    static GO: Semaphore<K> = Semaphore::binary("go", 0);

    fn holder(_: usize) -> usize {
        P.lock().unwrap();
        READY.post().unwrap();
        GO.wait().unwrap();
        P.unlock().unwrap();
        0
    }

    pub fn main() {
        let t = Thread::<K>::new(
            ThreadAttributes::new().with_name("holder").with_priority(priority::LOWEST),
            holder,
            0,
        )
        .unwrap();
        HOLDER.set(t).ok().unwrap();
        let t = HOLDER.get().unwrap();

        READY.wait().unwrap();
        // While the ceiling mutex is held, the owner executes at the
        // ceiling regardless of contention.
        assert_eq!(t.priority(), priority::HIGH);
        assert_eq!(t.assigned_priority(), priority::LOWEST);

        GO.post().unwrap();
        t.join().unwrap();
        assert_eq!(t.inherited_priority(), priority::NONE);
    }
}

#[test]
fn ceiling_boost_applies_without_contention() {
    run::<ceiling_boost::K>(ceiling_boost::main);
}

mod timed_lock {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    static M: Mutex<K> = Mutex::new(
        MutexAttributes::new()
            .with_name("timed")
            .with_protocol(MutexProtocol::Inherit),
    );
    static HOLDER: OnceCell<Thread<K>> = OnceCell::new();
    static READY: Semaphore<K> = Semaphore::binary("ready", 0);
    static GO: Semaphore<K> = Semaphore::binary("go", 0);

    fn holder(_: usize) -> usize {
        M.lock().unwrap();
        READY.post().unwrap();
        GO.wait().unwrap();
        M.unlock().unwrap();
        0
    }

    pub fn main() {
        let t = Thread::<K>::new(
            ThreadAttributes::new().with_name("holder").with_priority(priority::ABOVE_NORMAL),
            holder,
            0,
        )
        .unwrap();
        HOLDER.set(t).ok().unwrap();
        let t = HOLDER.get().unwrap();
        READY.wait().unwrap();

        assert_eq!(M.try_lock(), Err(Error::WouldBlock));

        let before = System::<K>::sysclock().steady_now();
        assert_eq!(M.timed_lock(10), Err(Error::TimedOut));
        assert!(System::<K>::sysclock().steady_now() >= before + 10);
        // The failed wait must leave no stale boost on the holder.
        assert_eq!(t.inherited_priority(), priority::NONE);

        GO.post().unwrap();
        t.join().unwrap();
        M.lock().unwrap();
        M.unlock().unwrap();
    }
}

#[test]
fn timed_lock_expires_and_reverses_boost() {
    run::<timed_lock::K>(timed_lock::main);
}

mod robust {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    static R: Mutex<K> = Mutex::new(MutexAttributes::new().with_name("robust").robust());
    static NEVER: Semaphore<K> = Semaphore::binary("never", 0);

    fn doomed(_: usize) -> usize {
        R.lock().unwrap();
        NEVER.wait().unwrap();
        unreachable!();
    }

    pub fn main() {
        // S6: A dies holding R; the next acquirer is told.
        let a = Thread::<K>::new(
            ThreadAttributes::new().with_name("doomed").with_priority(priority::HIGH),
            doomed,
            0,
        )
        .unwrap();
        a.kill().unwrap();

        assert_eq!(R.lock(), Err(Error::OwnerDead));
        // Repair the protected state, declare it consistent, release.
        R.mark_consistent().unwrap();
        R.unlock().unwrap();

        // The mutex is fully usable again.
        R.lock().unwrap();
        R.unlock().unwrap();
        a.join().unwrap();
    }
}

#[test]
fn robust_mutex_recovers_after_owner_death() {
    run::<robust::K>(robust::main);
}

mod robust_unrecovered {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    static R: Mutex<K> = Mutex::new(MutexAttributes::new().with_name("robust").robust());
    static NEVER: Semaphore<K> = Semaphore::binary("never", 0);

    fn doomed(_: usize) -> usize {
        R.lock().unwrap();
        NEVER.wait().unwrap();
        unreachable!();
    }

    pub fn main() {
        let a = Thread::<K>::new(
            ThreadAttributes::new().with_name("doomed").with_priority(priority::HIGH),
            doomed,
            0,
        )
        .unwrap();
        a.kill().unwrap();

        assert_eq!(R.lock(), Err(Error::OwnerDead));
        // Alternate ending: releasing without `mark_consistent` makes
        // the mutex permanently unusable.
        assert_eq!(R.unlock(), Err(Error::NotRecoverable));
        assert_eq!(R.lock(), Err(Error::NotRecoverable));
        assert_eq!(R.try_lock(), Err(Error::NotRecoverable));

        // `reset` is the only way back.
        R.reset().unwrap();
        R.lock().unwrap();
        R.unlock().unwrap();
        a.join().unwrap();
    }
}

#[test]
fn robust_mutex_poisons_without_mark_consistent() {
    run::<robust_unrecovered::K>(robust_unrecovered::main);
}
