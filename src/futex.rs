//! Wait/wake on an address inside shared memory.
//!
//! On Linux this is a raw futex. The futex is not `FUTEX_PRIVATE`: the peer
//! process maps the same page at a different address and must still be
//! reachable.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// How a successful [`WaitWake::wait`] ended. All three mean "re-check the
/// word".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by a `wake` (or spuriously).
    Woken,
    /// The word no longer held `expected` when the kernel checked it.
    Changed,
    /// A signal interrupted the wait.
    Interrupted,
}

/// Block on, and wake threads blocked on, a 32-bit word.
pub trait WaitWake: Send + Sync + fmt::Debug {
    /// Wake up to `count` threads blocked on `word`. Returns how many were
    /// woken; waking nobody is not an error.
    fn wake(&self, word: &AtomicU32, count: u32) -> io::Result<u32>;

    /// Block while `*word == expected`. The comparison happens atomically
    /// with going to sleep, so a change made before the block is never missed.
    fn wait(&self, word: &AtomicU32, expected: u32) -> io::Result<WaitOutcome>;
}

/// Linux futex.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct Futex;

#[cfg(target_os = "linux")]
impl WaitWake for Futex {
    fn wake(&self, word: &AtomicU32, count: u32) -> io::Result<u32> {
        let futex_ptr = word as *const AtomicU32 as *const u32;
        // The kernel reads the count as a signed int.
        let count = count.min(i32::MAX as u32) as libc::c_int;

        let result = unsafe {
            libc::syscall(
                libc::SYS_futex,
                futex_ptr,
                libc::FUTEX_WAKE,
                count,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            )
        };

        if result >= 0 {
            Ok(result as u32)
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn wait(&self, word: &AtomicU32, expected: u32) -> io::Result<WaitOutcome> {
        let futex_ptr = word as *const AtomicU32 as *const u32;

        let result = unsafe {
            libc::syscall(
                libc::SYS_futex,
                futex_ptr,
                libc::FUTEX_WAIT,
                expected,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            )
        };

        if result == 0 {
            return Ok(WaitOutcome::Woken);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(WaitOutcome::Changed),
            Some(libc::EINTR) => Ok(WaitOutcome::Interrupted),
            _ => Err(err),
        }
    }
}

const BUCKETS: usize = 64;

struct Bucket {
    lock: Mutex<()>,
    cvar: Condvar,
}

impl Bucket {
    const fn new() -> Self {
        Self {
            lock: parking_lot::const_mutex(()),
            cvar: Condvar::new(),
        }
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_BUCKET: Bucket = Bucket::new();
static PARKING_TABLE: [Bucket; BUCKETS] = [EMPTY_BUCKET; BUCKETS];

fn bucket_for(word: &AtomicU32) -> &'static Bucket {
    let addr = word as *const AtomicU32 as usize;
    // Fibonacci hashing; the low bits of an aligned address carry nothing.
    let hash = (addr >> 2).wrapping_mul(0x9E37_79B9_7F4A_7C15_u64 as usize);
    &PARKING_TABLE[hash >> (usize::BITS - BUCKETS.trailing_zeros())]
}

/// Condition-variable fallback keyed by the word's address.
///
/// Only threads of one process that see the word at the same address can
/// reach each other. Several addresses may share a bucket, so every wake
/// notifies the whole bucket and waiters re-check their own word.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParkingLot;

impl WaitWake for ParkingLot {
    fn wake(&self, word: &AtomicU32, _count: u32) -> io::Result<u32> {
        let bucket = bucket_for(word);
        // Taking the lock orders this wake after any waiter's check.
        let _guard = bucket.lock.lock();
        Ok(bucket.cvar.notify_all() as u32)
    }

    fn wait(&self, word: &AtomicU32, expected: u32) -> io::Result<WaitOutcome> {
        let bucket = bucket_for(word);
        let mut guard = bucket.lock.lock();
        if word.load(Ordering::Acquire) != expected {
            return Ok(WaitOutcome::Changed);
        }
        bucket.cvar.wait(&mut guard);
        Ok(WaitOutcome::Woken)
    }
}

/// The best wait/wake implementation for this platform.
pub fn default_waiter() -> Arc<dyn WaitWake> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(Futex)
    }

    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(ParkingLot)
    }
}

/// Give up the rest of this thread's time slice.
#[inline]
pub fn yield_thread() {
    std::thread::yield_now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn waiters() -> Vec<Arc<dyn WaitWake>> {
        vec![default_waiter(), Arc::new(ParkingLot)]
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn futex_wake_without_waiters() {
        let word = AtomicU32::new(0);
        assert_eq!(Futex.wake(&word, 1).unwrap(), 0);
    }

    #[test]
    fn parking_lot_wake_without_waiters_is_ok() {
        // Other tests may be parked in the same bucket, so only the result
        // kind is checked.
        let word = AtomicU32::new(0);
        assert!(ParkingLot.wake(&word, 1).is_ok());
    }

    #[test]
    fn wait_value_mismatch_returns_immediately() {
        for waiter in waiters() {
            let word = AtomicU32::new(42);
            let outcome = waiter.wait(&word, 0).unwrap();
            assert_eq!(outcome, WaitOutcome::Changed, "{waiter:?}");
        }
    }

    #[test]
    fn store_then_wake_releases_waiter() {
        for waiter in waiters() {
            let word = Arc::new(AtomicU32::new(1));

            let handle = {
                let word = word.clone();
                let waiter = waiter.clone();
                thread::spawn(move || {
                    while word.load(Ordering::Acquire) == 1 {
                        waiter.wait(&word, 1).unwrap();
                    }
                })
            };

            thread::sleep(Duration::from_millis(20));
            word.store(2, Ordering::Release);
            waiter.wake(&word, 1).unwrap();

            handle.join().unwrap();
        }
    }

    #[test]
    fn huge_wake_count_is_accepted() {
        for waiter in waiters() {
            let word = AtomicU32::new(0);
            assert!(waiter.wake(&word, u32::MAX).is_ok());
        }
    }

    #[test]
    fn bucket_lookup_is_stable_and_in_range() {
        let word = AtomicU32::new(0);
        let a = bucket_for(&word) as *const Bucket;
        let b = bucket_for(&word) as *const Bucket;
        assert_eq!(a, b);

        let base = PARKING_TABLE.as_ptr() as usize;
        let idx = (a as usize - base) / std::mem::size_of::<Bucket>();
        assert!(idx < BUCKETS);
    }

    #[test]
    fn yield_thread_returns() {
        yield_thread();
    }
}
