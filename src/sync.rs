//! Synchronization primitives
//!
//! The coremap and the other short-critical-section structures use
//! [`spinning_top::Spinlock`] directly. This module adds the two
//! primitives the cores need on top of that:
//!
//! - [`WaitChannel`]: a generation-counted wakeup channel. `sleep`
//!   atomically releases a spinlock guard, waits for a `wake_all`, and
//!   reacquires the lock — the pattern the eviction path and the busy-bit
//!   protocol are built on.
//! - [`Sleeplock`]: a sleepable mutex built from an atomic flag and a
//!   wait channel. Held across long operations (page fault handling,
//!   fork copy, freemap updates) where a spinlock would be wrong.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub use spinning_top::Spinlock;
pub use spinning_top::guard::SpinlockGuard;

/// Give the CPU away while waiting.
#[inline]
fn relinquish() {
    #[cfg(test)]
    std::thread::yield_now();
    #[cfg(not(test))]
    core::hint::spin_loop();
}

// ============================================================================
// Wait Channel
// ============================================================================

/// A wakeup channel keyed by a generation counter.
///
/// A sleeper snapshots the generation while it still holds the lock that
/// protects the condition it is waiting on, releases the lock, and then
/// waits for the generation to move. Because the snapshot happens under
/// the lock, a wakeup between release and wait cannot be missed.
pub struct WaitChannel {
    generation: AtomicU64,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    /// Snapshot the current generation. Pair with [`WaitChannel::wait_from`].
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Wait until the generation moves past `seen`.
    pub fn wait_from(&self, seen: u64) {
        while self.generation.load(Ordering::Acquire) == seen {
            relinquish();
        }
    }

    /// Release `guard`, wait for a wakeup, and reacquire `lock`.
    ///
    /// The generation is snapshotted before the guard is dropped, so a
    /// `wake_all` that races with the release is observed.
    pub fn sleep<'a, T>(
        &self,
        lock: &'a Spinlock<T>,
        guard: SpinlockGuard<'a, T>,
    ) -> SpinlockGuard<'a, T> {
        let seen = self.generation.load(Ordering::Acquire);
        drop(guard);
        self.wait_from(seen);
        lock.lock()
    }

    /// Wake every sleeper on this channel.
    pub fn wake_all(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Sleeplock
// ============================================================================

/// A sleepable mutual-exclusion lock.
///
/// Unlike a spinlock this may be held across blocking operations; waiters
/// sleep on the embedded wait channel instead of burning the lock's cache
/// line.
pub struct Sleeplock<T> {
    held: AtomicBool,
    chan: WaitChannel,
    data: UnsafeCell<T>,
}

// SAFETY: the lock protocol guarantees exclusive access to `data`.
unsafe impl<T: Send> Send for Sleeplock<T> {}
unsafe impl<T: Send> Sync for Sleeplock<T> {}

impl<T> Sleeplock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            chan: WaitChannel::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, sleeping until it is free.
    pub fn lock(&self) -> SleeplockGuard<'_, T> {
        loop {
            let seen = self.chan.generation();
            if self
                .held
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SleeplockGuard { lock: self };
            }
            self.chan.wait_from(seen);
        }
    }

    /// Try to acquire the lock without sleeping.
    pub fn try_lock(&self) -> Option<SleeplockGuard<'_, T>> {
        if self
            .held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SleeplockGuard { lock: self })
        } else {
            None
        }
    }

    /// Whether the lock is currently held by someone.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}

pub struct SleeplockGuard<'a, T> {
    lock: &'a Sleeplock<T>,
}

impl<T> Deref for SleeplockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleeplockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleeplockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
        self.lock.chan.wake_all();
    }
}
