// =============================================================================
// OpalOS — Ticket Spinlock
// =============================================================================
//
// A ticket spinlock provides mutual exclusion between kernel threads.
// It's the simplest fair lock: threads acquire the lock in FIFO order,
// preventing starvation.
//
// HOW IT WORKS:
//   - Two counters: `next_ticket` and `now_serving`
//   - To lock: atomically increment `next_ticket`, get your ticket number.
//     Spin until `now_serving` equals your ticket.
//   - To unlock: increment `now_serving`, which lets the next waiter proceed.
//
// WHY TICKET SPINLOCK (not test-and-set)?
//   - Fair: threads are served in arrival order (FIFO)
//   - No starvation: every thread eventually gets the lock
//   - Predictable: bounded wait time proportional to number of waiters
//
// RULES OF USE:
//   - Never suspend while holding a spinlock; critical sections are short
//     and never allocate.
//   - The VM lock order is: page-table lock, then frame-table lock. The
//     bootstrap-allocator lock is disjoint. Never invert the order.
//   - Interrupt-priority manipulation is the machine interface's business;
//     the one path that races the trap handler (the TLB write in the fault
//     handler) raises priority explicitly around it.
//
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// A ticket-based spinlock.
///
/// This lock is suitable for protecting shared kernel data structures.
/// It guarantees FIFO ordering of waiters.
///
/// # Type Parameter
/// - `T`: The data protected by the lock. Must be `Send` because ownership
///   effectively transfers between threads when the lock is acquired.
///
/// # Examples
/// ```
/// use opalos_kernel::sync::spinlock::SpinLock;
/// static COUNTER: SpinLock<u64> = SpinLock::new(0);
///
/// {
///     let mut guard = COUNTER.lock();
///     *guard += 1;
/// } // Lock automatically released when guard goes out of scope
/// ```
pub struct SpinLock<T> {
    /// The next ticket to be dispensed (atomically incremented by each locker).
    next_ticket: AtomicU32,

    /// The ticket number currently being served (incremented on unlock).
    now_serving: AtomicU32,

    /// The protected data. UnsafeCell is required because we mutate through
    /// a shared reference (the lock ensures exclusive access at runtime).
    data: UnsafeCell<T>,
}

// SAFETY: SpinLock<T> can be shared between threads as long as T itself can
// be sent between threads. The lock ensures that only one thread accesses
// T at a time.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock wrapping the given value.
    ///
    /// The lock is initially unlocked (next_ticket == now_serving == 0).
    /// This is a const fn so spinlocks can be used in statics.
    pub const fn new(value: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it is available.
    ///
    /// Returns a `SpinLockGuard` that provides `Deref`/`DerefMut` access
    /// to the protected data. The lock is automatically released when the
    /// guard is dropped.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        // Take a ticket number atomically. Relaxed ordering is fine here —
        // the spin loop below provides the necessary synchronization barrier.
        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        // Spin until our ticket is being served. Acquire ordering ensures we
        // see all writes made by the previous lock holder before we access
        // the protected data.
        while self.now_serving.load(Ordering::Acquire) != my_ticket {
            core::hint::spin_loop();
        }

        SpinLockGuard { lock: self }
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// This is safe because `&mut self` guarantees exclusive access
    /// at compile time — no lock needed. Useful during initialization
    /// before the lock is shared.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard for a held spinlock.
///
/// While this guard exists the holder has exclusive access to the protected
/// data; other threads trying to lock() will spin. When the guard is dropped
/// the lock is released (now_serving incremented).
///
/// This follows the RAII pattern — you can never forget to unlock because
/// the compiler ensures `drop()` is called.
pub struct SpinLockGuard<'a, T> {
    /// Reference to the lock we're guarding.
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    /// Provides read access to the protected data.
    fn deref(&self) -> &T {
        // SAFETY: We hold the lock, so we have exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    /// Provides write access to the protected data.
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: We hold the lock, so we have exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    /// Releases the lock.
    ///
    /// Release ordering ensures all our writes to the protected data are
    /// visible to the next lock holder before they see the incremented
    /// `now_serving` value.
    fn drop(&mut self) {
        self.lock.now_serving.fetch_add(1, Ordering::Release);
    }
}
