//! Memory pools and message queues.
use muon_kernel::{priority, Error, MemoryPool, MessageQueue, Thread, ThreadAttributes};
use muon_port_std::run;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};

mod pool_basics {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    static POOL: OnceCell<MemoryPool<K>> = OnceCell::new();

    pub fn main() {
        POOL.set(MemoryPool::new("pool", 3, 24).unwrap()).ok().unwrap();
        let pool = POOL.get().unwrap();
        assert_eq!(pool.capacity(), 3);
        assert!(pool.block_size() >= 24);
        assert!(pool.is_empty());

        let a = pool.alloc().unwrap();
        let b = pool.try_alloc().unwrap();
        let c = pool.timed_alloc(5).unwrap();
        assert!(pool.is_full());
        assert_eq!(pool.try_alloc(), Err(Error::WouldBlock));
        assert_eq!(pool.timed_alloc(3), Err(Error::TimedOut));

        // A foreign pointer is rejected.
        let mut outside = 0u8;
        assert_eq!(
            pool.free(core::ptr::NonNull::from(&mut outside)),
            Err(Error::Invalid)
        );

        pool.free(b).unwrap();
        pool.free(a).unwrap();
        pool.free(c).unwrap();
        assert!(pool.is_empty());
    }
}

#[test]
fn pool_allocates_and_validates_frees() {
    run::<pool_basics::K>(pool_basics::main);
}

mod pool_blocking {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    static POOL: OnceCell<MemoryPool<K>> = OnceCell::new();
    pub static GOT_BLOCK: AtomicUsize = AtomicUsize::new(0);

    fn hungry(_: usize) -> usize {
        let pool = POOL.get().unwrap();
        // Exhausted at this point; blocks until the main thread frees.
        let block = pool.alloc().unwrap();
        GOT_BLOCK.store(block.as_ptr() as usize, Ordering::SeqCst);
        pool.free(block).unwrap();
        0
    }

    pub fn main() {
        POOL.set(MemoryPool::new("pool", 1, 16).unwrap()).ok().unwrap();
        let pool = POOL.get().unwrap();
        let block = pool.alloc().unwrap();

        let t = Thread::<K>::new(
            ThreadAttributes::new().with_name("hungry").with_priority(priority::HIGH),
            hungry,
            0,
        )
        .unwrap();
        assert_eq!(GOT_BLOCK.load(Ordering::SeqCst), 0);

        // Freeing replenishes the pool and wakes the waiter, which
        // receives the very same block.
        pool.free(block).unwrap();
        assert_eq!(GOT_BLOCK.load(Ordering::SeqCst), block.as_ptr() as usize);
        t.join().unwrap();
    }
}

#[test]
fn pool_exhaustion_blocks_until_free() {
    run::<pool_blocking::K>(pool_blocking::main);
}

mod queue_priorities {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    static Q: OnceCell<MessageQueue<K>> = OnceCell::new();

    pub fn main() {
        Q.set(MessageQueue::new("q", 4, 8).unwrap()).ok().unwrap();
        let q = Q.get().unwrap();
        assert!(q.is_empty());

        // Priority decides the dequeue order; send order breaks ties.
        q.send(b"a", 1).unwrap();
        q.send(b"b", 2).unwrap();
        q.send(b"c", 2).unwrap();
        q.send(b"d", 3).unwrap();
        assert!(q.is_full());
        assert_eq!(q.try_send(b"e", 9), Err(Error::WouldBlock));

        let mut buf = [0u8; 8];
        let expect = [(b"d", 3u8), (b"b", 2), (b"c", 2), (b"a", 1)];
        for (msg, prio) in expect {
            let (len, got_prio) = q.receive(&mut buf).unwrap();
            assert_eq!((&buf[..len], got_prio), (&msg[..], prio));
        }
        assert!(q.is_empty());
        assert_eq!(q.try_receive(&mut buf), Err(Error::WouldBlock));
        assert_eq!(q.timed_receive(&mut buf, 4), Err(Error::TimedOut));

        // Oversized messages and undersized buffers are rejected.
        assert_eq!(q.send(b"too-long-msg", 0), Err(Error::Invalid));
        let mut small = [0u8; 2];
        assert_eq!(q.try_receive(&mut small), Err(Error::Invalid));
    }
}

#[test]
fn queue_orders_by_priority_fifo_within() {
    run::<queue_priorities::K>(queue_priorities::main);
}

mod queue_blocking {
    use super::*;
    muon_port_std::use_port!(unsafe pub struct K);

    static Q: OnceCell<MessageQueue<K>> = OnceCell::new();
    pub static RECEIVED: AtomicUsize = AtomicUsize::new(0);

    fn receiver(_: usize) -> usize {
        let q = Q.get().unwrap();
        let mut buf = [0u8; 4];
        // Blocks: the queue starts empty.
        let (len, prio) = q.receive(&mut buf).unwrap();
        assert_eq!((len, prio, &buf[..len]), (4, 7, &b"ping"[..]));
        RECEIVED.fetch_add(1, Ordering::SeqCst);
        0
    }

    pub fn main() {
        Q.set(MessageQueue::new("q", 2, 4).unwrap()).ok().unwrap();
        let q = Q.get().unwrap();

        let r = Thread::<K>::new(
            ThreadAttributes::new().with_name("receiver").with_priority(priority::HIGH),
            receiver,
            0,
        )
        .unwrap();
        assert_eq!(RECEIVED.load(Ordering::SeqCst), 0);

        q.send(b"ping", 7).unwrap();
        assert_eq!(RECEIVED.load(Ordering::SeqCst), 1);
        r.join().unwrap();
    }
}

#[test]
fn queue_receive_blocks_until_send() {
    run::<queue_blocking::K>(queue_blocking::main);
}
