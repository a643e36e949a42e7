//! A fiber-aware condition variable.
//!
//! Follows the textbook `wait(lock)` protocol: atomically release `lock`
//! and park, then reacquire `lock` before returning, on every exit path
//! including an interrupted one. The wait queue is FIFO and polymorphic
//! over [`Waiter`] so a thread's main context can wait on a condvar exactly
//! like a fiber can -- including across threads, where a fiber on one
//! thread signals a condvar a different thread's main context is blocked
//! on.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;

use crate::error::Result;
use crate::fiber::control_block::Waiter;
use crate::scheduler;
use crate::sync::mutex::{Mutex, MutexGuard};
use crate::this_fiber;

/// A condition variable, parameterized the same way `std::sync::Condvar`
/// is: callers always pair it with a specific [`Mutex`] via `wait`.
pub struct Condvar {
    queue: StdMutex<VecDeque<Waiter>>,
}

struct Parked<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    waiter: Waiter,
}

impl Condvar {
    pub fn new() -> Self {
        Condvar {
            queue: StdMutex::new(VecDeque::new()),
        }
    }

    /// Atomically releases `guard`'s lock and blocks until woken by
    /// [`notify_one`](Self::notify_one) or [`notify_all`](Self::notify_all),
    /// then reacquires the lock before returning -- on every exit path,
    /// including an interrupted one, so the caller never has to guess
    /// whether it's still holding the mutex.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> Result<MutexGuard<'a, T>> {
        let parked = self.park(guard);

        // Whether we were woken by a real `notify` (which already popped
        // us) or by a direct interrupt while still queued, make sure we
        // don't linger as a ghost entry that would steal a future notify
        // meant for someone else: a fiber interrupted while parked here
        // must be removed from the wait list before the interruption
        // propagates.
        let mutex = parked.mutex;
        self.queue.lock().unwrap().retain(|w| !w.id_eq(&parked.waiter));

        let reacquired = mutex.lock_uninterruptible();
        match this_fiber::interruption_point() {
            Ok(_) => Ok(reacquired),
            Err(e) => {
                // The lock is already back in our hands (see doc above); drop
                // it before propagating so we don't leak ownership to a fiber
                // that's about to unwind out of this call.
                drop(reacquired);
                Err(e)
            }
        }
    }

    /// Like [`wait`](Self::wait), but only returns once `predicate` holds,
    /// re-parking on spurious (or legitimately unrelated) wakeups. There
    /// are no spurious wakeups in this runtime's own delivery path, but a
    /// predicate loop is still the correct pattern since `notify_all` wakes
    /// everyone regardless of what each waiter was actually waiting for.
    pub fn wait_while<'a, T>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut predicate: impl FnMut(&mut T) -> bool,
    ) -> Result<MutexGuard<'a, T>> {
        while predicate(&mut guard) {
            guard = self.wait(guard)?;
        }
        Ok(guard)
    }

    /// Releases `guard`'s mutex and parks the caller on this condvar's wait
    /// queue, returning the mutex (for reacquiring) and the waiter identity
    /// just parked (for removing it from the queue once woken). Internal
    /// half of `wait`, split out so the mutex is released (opening the
    /// window for someone else to notify) strictly before the caller
    /// actually suspends.
    fn park<'a, T>(&self, guard: MutexGuard<'a, T>) -> Parked<'a, T> {
        let waiter = scheduler::current_waiter();
        self.queue.lock().unwrap().push_back(waiter.clone());

        let mutex = guard.mutex_ref();
        drop(guard); // release the lock before actually parking

        match &waiter {
            Waiter::Fiber(_) => scheduler::wait_raw(),
            Waiter::Main(notifier) => {
                while !notifier.is_ready() {
                    scheduler::run();
                }
            }
        }
        Parked { mutex, waiter }
    }

    /// Wakes one waiter, FIFO. A no-op if none are waiting.
    pub fn notify_one(&self) {
        if let Some(waiter) = self.queue.lock().unwrap().pop_front() {
            waiter.wake();
        }
    }

    /// Wakes every current waiter. Fibers queued by a later `wait` call
    /// (including one made by a fiber this very call wakes, if it
    /// immediately loops back around) are not included -- this drains
    /// exactly the set present at the time of the call.
    pub fn notify_all(&self) {
        let drained: Vec<Waiter> = std::mem::take(&mut *self.queue.lock().unwrap()).into();
        for waiter in drained {
            waiter.wake();
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
