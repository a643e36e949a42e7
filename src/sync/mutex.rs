//! A fiber-aware, fair mutex.
//!
//! Ownership transfers directly from the unlocking holder to the head of
//! the wait queue rather than being re-contested: `unlock` pops the queue
//! and hands the lock straight to whoever's been waiting longest, waking
//! them only after the handoff is already recorded. This rules out barging
//! (a fiber that merely calls `lock()` racing ahead of someone already
//! queued) and is also what makes the mutex safe to pair with [`Condvar`]
//! (`super::Condvar`): a condvar's reacquire step is just another `lock()`
//! call and inherits the same fairness.
//!
//! The queue and owner live behind a single `std::sync::Mutex`: actual
//! contention is expected to be rare and brief (the queue is only ever
//! touched for the instant it takes to push/pop/compare an `Arc`), so the
//! OS mutex here is a building block, not a bottleneck.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex as StdMutex;

use crate::error::{Error, LockError, Result};
use crate::fiber::control_block::{OwnerId, Waiter};
use crate::scheduler;
use crate::this_fiber;

struct State {
    owner: Option<OwnerId>,
    queue: VecDeque<Waiter>,
}

/// A mutual-exclusion lock whose `lock()` is a suspension point: a fiber
/// that finds it held parks in the FCB wait machinery instead of spinning,
/// and is handed the lock directly by whichever holder unlocks next.
pub struct Mutex<T: ?Sized> {
    state: StdMutex<State>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex {
            state: StdMutex::new(State {
                owner: None,
                queue: VecDeque::new(),
            }),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the lock, blocking the calling fiber (or busy-looping the
    /// scheduler, if called from a thread's main context) until it's free.
    ///
    /// Returns [`LockError::WouldDeadlock`] if the caller already holds
    /// this lock (it is not recursive), and [`Error::Interrupted`] if the
    /// caller is interrupted while waiting -- in which case the lock was
    /// never acquired and nothing needs releasing.
    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        let me = scheduler::current_owner_id();
        {
            let mut st = self.state.lock().unwrap();
            if st.owner.is_none() {
                st.owner = Some(me);
                return Ok(MutexGuard { mutex: self });
            }
            if st.owner == Some(me) {
                return Err(Error::LockError(LockError::WouldDeadlock));
            }
            let waiter = scheduler::current_waiter();
            st.queue.push_back(waiter.clone());
            drop(st);
            self.park_until_woken(&waiter);
        }

        // We were woken either by a handoff (we're now the owner) or by a
        // direct interrupt while still queued. Check which.
        let already_owner = { self.state.lock().unwrap().owner == Some(me) };
        if already_owner {
            if let Err(e) = this_fiber::interruption_point() {
                // We hold the lock but must not keep it while unwinding
                // with a pending interruption: hand it straight off again.
                let _ = self.unlock_as(me);
                return Err(e);
            }
            return Ok(MutexGuard { mutex: self });
        }

        // Interrupted before handoff: remove ourselves from the queue (a
        // no-op if a racing `unlock` already popped us) and propagate.
        let waiter = scheduler::current_waiter();
        self.state.lock().unwrap().queue.retain(|w| !w.id_eq(&waiter));
        Err(this_fiber::interruption_point().err().unwrap_or(Error::Interrupted))
    }

    /// Like [`lock`](Self::lock), but used internally by [`Condvar`]'s
    /// reacquire step, which must reacquire the lock on every exit path,
    /// including an interrupted one, and therefore must not itself be
    /// interrupted.
    pub(crate) fn lock_uninterruptible(&self) -> MutexGuard<'_, T> {
        let me = scheduler::current_owner_id();
        loop {
            let mut st = self.state.lock().unwrap();
            if st.owner.is_none() {
                st.owner = Some(me);
                return MutexGuard { mutex: self };
            }
            debug_assert_ne!(st.owner, Some(me), "recursive lock during condvar reacquire");
            let waiter = scheduler::current_waiter();
            st.queue.push_back(waiter.clone());
            drop(st);
            self.park_until_woken(&waiter);
            if self.state.lock().unwrap().owner == Some(me) {
                return MutexGuard { mutex: self };
            }
        }
    }

    fn park_until_woken(&self, waiter: &Waiter) {
        match waiter {
            Waiter::Fiber(_) => scheduler::wait_raw(),
            Waiter::Main(notifier) => {
                while !notifier.is_ready() {
                    scheduler::run();
                }
            }
        }
    }

    /// Attempts to acquire the lock without blocking. Returns `Ok(None)` if
    /// it's currently held by someone else, `Err` if the caller already
    /// holds it.
    pub fn try_lock(&self) -> Result<Option<MutexGuard<'_, T>>> {
        let me = scheduler::current_owner_id();
        let mut st = self.state.lock().unwrap();
        if st.owner.is_none() {
            st.owner = Some(me);
            return Ok(Some(MutexGuard { mutex: self }));
        }
        if st.owner == Some(me) {
            return Err(Error::LockError(LockError::WouldDeadlock));
        }
        Ok(None)
    }

    /// Releases the lock, consuming the guard. Equivalent to `drop(guard)`;
    /// provided for parity with explicit-unlock APIs and readability at
    /// call sites that want the release to be visible.
    pub fn unlock(guard: MutexGuard<'_, T>) {
        drop(guard);
    }

    fn unlock_as(&self, owner: OwnerId) -> std::result::Result<(), LockError> {
        let mut st = self.state.lock().unwrap();
        match st.owner {
            None => return Err(LockError::NotLocked),
            Some(o) if o != owner => return Err(LockError::NotOwner),
            _ => {}
        }
        if let Some(next) = st.queue.pop_front() {
            st.owner = Some(next.owner_id());
            drop(st);
            next.wake();
        } else {
            st.owner = None;
        }
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Ok(Some(guard)) => f.debug_struct("Mutex").field("data", &&*guard).finish(),
            Ok(None) | Err(_) => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

/// RAII guard returned by [`Mutex::lock`]. Releases the lock on drop,
/// handing it directly to the next queued waiter if there is one.
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    /// The mutex this guard locks, without releasing it. Used by
    /// [`Condvar`](super::Condvar) to hang onto a reference across the
    /// release-then-reacquire straddle of a `wait` call.
    pub(crate) fn mutex_ref(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        let me = scheduler::current_owner_id();
        self.mutex
            .unlock_as(me)
            .expect("a held MutexGuard's owner must match the mutex's recorded owner");
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_lock_and_unlock() {
        let m = Mutex::new(5);
        {
            let mut guard = m.lock().unwrap();
            *guard += 1;
        }
        assert_eq!(*m.lock().unwrap(), 6);
    }

    #[test]
    fn recursive_lock_would_deadlock() {
        let m = Mutex::new(0);
        let _guard = m.lock().unwrap();
        match m.lock() {
            Err(Error::LockError(LockError::WouldDeadlock)) => {}
            other => panic!("expected WouldDeadlock, got {other:?}"),
        };
    }

    #[test]
    fn try_lock_reports_contention_without_blocking() {
        let m = Mutex::new(0);
        let guard = m.lock().unwrap();
        assert!(m.try_lock().unwrap().is_none());
        drop(guard);
        assert!(m.try_lock().unwrap().is_some());
    }

    #[test]
    fn unlock_by_non_owner_is_rejected() {
        use crate::fiber::control_block::ControlBlock;

        let m = Mutex::new(0);
        let _guard = m.lock().unwrap();
        // A foreign identity trying to release it directly, bypassing the
        // guard (which can only ever be constructed for the real owner).
        let impostor = ControlBlock::new_placeholder();
        assert_eq!(
            m.unlock_as(OwnerId::Fiber(impostor.id())),
            Err(LockError::NotOwner)
        );
    }

    #[test]
    fn unlock_of_unlocked_mutex_is_rejected() {
        let m: Mutex<i32> = Mutex::new(0);
        let me = scheduler::current_owner_id();
        assert_eq!(m.unlock_as(me), Err(LockError::NotLocked));
    }
}
