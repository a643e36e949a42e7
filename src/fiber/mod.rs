//! Fiber construction, identity, and the join/detach lifecycle.
//!
//! The state machine and low-level plumbing live in
//! [`control_block`]; this module is the part users actually touch:
//! [`Builder`] to configure and spawn a fiber, [`JoinHandle`] to join or
//! detach it, and [`spawn`] as the common-case shortcut.

pub(crate) mod control_block;
mod handle;

use std::sync::Arc;

pub use control_block::{FiberId, State};
pub use handle::{Builder, JoinHandle};

use control_block::ControlBlock;

/// Spawns a fiber with default attributes and priority. Equivalent to
/// `Builder::new().spawn(f)`.
pub fn spawn<F, T>(f: F) -> crate::error::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().spawn(f)
}

/// The bootstrap trampoline every fresh fiber stack starts at.
///
/// `arg` is the raw pointer to this fiber's own `Arc<ControlBlock>`,
/// produced by `scheduler::run`'s first resume and reclaimed here with
/// `Arc::from_raw` -- the one-time handoff that lets the fiber find its own
/// control block without any global registry.
pub(crate) extern "C" fn bootstrap_trampoline(arg: usize) -> ! {
    // Safety: `arg` was produced by exactly one `Arc::into_raw` call, made
    // immediately before the switch that resumed here for the first time.
    let fcb: Arc<ControlBlock> = unsafe { Arc::from_raw(arg as *const ControlBlock) };

    let entry = fcb.take_entry();
    fcb.run_catching_panics(entry);
    fcb.set_terminated();

    for joiner in fcb.release_joiners() {
        joiner.wake();
    }

    let caller = fcb.caller_context();
    // Safety: this fiber never runs again after this switch; `context` is
    // written one last time but never read, since `mark_started` plus the
    // TERMINATED state together keep the scheduler from ever resuming it.
    unsafe {
        crate::context::switch(&mut *fcb.context_slot(), caller, 0);
    }
    unreachable!("a terminated fiber must never be resumed");
}
