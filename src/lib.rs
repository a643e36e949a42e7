//! Stackful cooperative fibers for building user-space schedulers on top of
//! OS threads.
//!
//! A fiber is a unit of execution with its own stack, multiplexed onto an
//! OS thread by voluntary context switches rather than by the kernel's
//! preemptive scheduler: a fiber runs until it calls
//! [`this_fiber::yield_now`], blocks on a [`sync::Mutex`] or
//! [`sync::Condvar`], or returns. Fibers never migrate between threads once
//! first resumed, and exactly one fiber runs per thread at a time -- the
//! two invariants every other guarantee in this crate builds on.
//!
//! ```
//! let handle = fiber::spawn(|| 2 + 2).unwrap();
//! let sum = handle.join().unwrap(); // pumps the scheduler until it terminates
//! assert_eq!(sum, 4);
//! ```
//!
//! A thread's main (non-fiber) context drives the scheduler by calling
//! [`scheduler::run`] to perform one scheduling step, or indirectly by
//! blocking on a [`sync::Mutex`]/[`sync::Condvar`] that loops `run()`
//! internally until it's woken.

pub mod attributes;
pub mod context;
pub mod error;
pub mod fiber;
pub mod scheduler;
pub mod stack;
pub mod sync;
pub mod this_fiber;

#[cfg(feature = "test-helpers")]
pub mod testing;

pub use attributes::Attributes;
pub use error::{Error, LockError, Result};
pub use fiber::{spawn, Builder, FiberId, JoinHandle};
