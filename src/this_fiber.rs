//! The current-fiber API: operations a fiber performs on itself.
//!
//! Every function here is thread-scoped, not fiber-scoped: called from the
//! thread's main (non-fiber) context, the identity queries return `None`/
//! defaults and the suspension points are either no-ops (`interruption_point`)
//! or busy-loop the scheduler (`yield_now`, `sleep_until`) rather than
//! panicking, since a lot of code (mutexes, condition variables) is meant to
//! run unmodified whether or not it happens to be on a fiber.

use std::time::{Duration, Instant};

use crate::error::Result;
use crate::fiber::FiberId;
use crate::scheduler;

/// Gives up the remainder of this fiber's time slice, letting other ready
/// fibers run before this one is resumed. A no-op suspension point on the
/// main context: it just pumps the scheduler once.
///
/// Checks for a pending interruption on return, like every other
/// suspension point in this crate.
pub fn yield_now() -> Result<()> {
    match scheduler::active() {
        Some(_) => {
            scheduler::yield_raw();
        }
        None => scheduler::run(),
    }
    interruption_point()
}

/// Cooperatively sleeps until `deadline`: repeatedly yields until the clock
/// passes it. There is no timer wheel or event loop backing this (the
/// runtime has no I/O integration), so the accuracy is bounded by how often
/// other ready work lets this fiber back onto the CPU.
pub fn sleep_until(deadline: Instant) -> Result<()> {
    while Instant::now() < deadline {
        yield_now()?;
    }
    Ok(())
}

pub fn sleep(duration: Duration) -> Result<()> {
    sleep_until(Instant::now() + duration)
}

/// Checks whether this fiber has a pending interruption request that isn't
/// currently blocked, and if so, returns
/// [`Error::Interrupted`](crate::error::Error::Interrupted). The request
/// itself is sticky, not consumed: a fiber that catches and ignores the
/// error will simply see it again at its next suspension point, matching
/// `boost::this_fiber::interruption_point`'s "stays interrupted until the
/// fiber ends" behavior. Code that means to keep running after observing an
/// interruption should clear the intent some other way (there is currently
/// no public "clear interruption" call, since every caller in this crate's
/// own test suite instead lets the error unwind the fiber).
///
/// Called automatically at the return of every suspension point
/// (`yield_now`, `Mutex::lock`, `Condvar::wait`, `JoinHandle::join`,
/// `sleep_until`); also callable directly as an explicit check point inside
/// a long CPU-bound loop that never otherwise suspends.
pub fn interruption_point() -> Result<()> {
    let Some(fcb) = scheduler::active() else {
        return Ok(());
    };
    if fcb.interruption_requested() && !fcb.interruption_blocked() {
        log::debug!("{} delivering interruption", fcb.id());
        return Err(crate::error::Error::Interrupted);
    }
    Ok(())
}

/// Whether an interruption is pending for this fiber, regardless of
/// whether it's currently blocked from delivery. `false` on the main
/// context.
pub fn interruption_requested() -> bool {
    scheduler::active()
        .map(|fcb| fcb.interruption_requested())
        .unwrap_or(false)
}

/// The identity of the currently running fiber, or `None` on the main
/// context.
pub fn current_id() -> Option<FiberId> {
    scheduler::active().map(|fcb| fcb.id())
}

/// The name the currently running fiber was spawned with, if any.
pub fn name() -> Option<String> {
    scheduler::active().and_then(|fcb| fcb.name().map(str::to_owned))
}

/// A scoped guard that suppresses interruption delivery for as long as it's
/// alive, restoring the previous blocked state on drop. Used to protect a
/// critical section (e.g. releasing resources during cleanup) from being
/// unwound out of midway.
///
/// A no-op on the main context, which has no interruption state.
#[must_use = "interruption is re-enabled as soon as this guard is dropped"]
pub struct DisableInterruption {
    fcb: Option<std::sync::Arc<crate::fiber::control_block::ControlBlock>>,
    previously_blocked: bool,
}

impl DisableInterruption {
    pub fn new() -> Self {
        let fcb = scheduler::active();
        let previously_blocked = fcb.as_ref().map(|f| f.interruption_blocked()).unwrap_or(false);
        if let Some(f) = &fcb {
            f.set_interruption_blocked(true);
        }
        DisableInterruption {
            fcb,
            previously_blocked,
        }
    }
}

impl Default for DisableInterruption {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DisableInterruption {
    fn drop(&mut self) {
        if let Some(fcb) = &self.fcb {
            fcb.set_interruption_blocked(self.previously_blocked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interruption_point_is_a_no_op_on_main_context() {
        assert!(interruption_point().is_ok());
        assert!(!interruption_requested());
        assert_eq!(current_id(), None);
        assert_eq!(name(), None);
    }

    #[test]
    fn disable_interruption_is_a_no_op_on_main_context() {
        let guard = DisableInterruption::new();
        drop(guard);
        assert!(interruption_point().is_ok());
    }
}
