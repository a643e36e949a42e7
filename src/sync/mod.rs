//! Synchronization primitives built directly on the FCB wait machinery
//! rather than the operating system's: a fair [`Mutex`] and a [`Condvar`]
//! that suspend the calling fiber instead of blocking its OS thread.

mod condvar;
mod mutex;

pub use condvar::Condvar;
pub use mutex::{Mutex, MutexGuard};
