//! The per-thread scheduler: ready queue, currently-active FCB, and the
//! cross-thread wake inbox.
//!
//! Exactly one `Scheduler` exists per OS thread that ever touches a fiber,
//! created lazily in a `thread_local!`. Fibers never migrate between
//! threads once first resumed; the only cross-thread mutation path on an
//! FCB is `wake`, which posts into the owning thread's inbox rather than
//! touching its `thread_local` state directly (impossible from another
//! thread anyway).
//!
//! The ready queue is a `BTreeMap<i32, VecDeque<Arc<ControlBlock>>>`: one
//! FIFO bucket per distinct priority, buckets visited highest priority
//! first. This is also what makes the resolved open question on
//! re-prioritizing an already-queued fiber (`reprioritize`) cheap: moving a
//! fiber to a new priority is just relocating it to a different bucket.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::context;
use crate::fiber::control_block::{Binding, ControlBlock, OwnerId, Waiter};

thread_local! {
    static SCHEDULER: RefCell<Scheduler> = RefCell::new(Scheduler::new());
}

struct Scheduler {
    active: Option<Arc<ControlBlock>>,
    ready: BTreeMap<i32, VecDeque<Arc<ControlBlock>>>,
    inbox: Arc<SegQueue<Arc<ControlBlock>>>,
    switch_count: u64,
}

impl Scheduler {
    fn new() -> Self {
        Scheduler {
            active: None,
            ready: BTreeMap::new(),
            inbox: Arc::new(SegQueue::new()),
            switch_count: 0,
        }
    }

    fn drain_inbox(&mut self) {
        while let Some(fcb) = self.inbox.pop() {
            self.enqueue(fcb);
        }
    }

    fn enqueue(&mut self, fcb: Arc<ControlBlock>) {
        self.ready.entry(fcb.priority()).or_default().push_back(fcb);
    }

    /// Removes `fcb` from its current ready bucket, if it's sitting in one
    /// on this thread. Used by `reprioritize` before re-inserting under the
    /// new priority.
    fn remove_from_ready(&mut self, priority: i32, fcb: &Arc<ControlBlock>) -> bool {
        let Some(bucket) = self.ready.get_mut(&priority) else {
            return false;
        };
        let Some(pos) = bucket.iter().position(|f| Arc::ptr_eq(f, fcb)) else {
            return false;
        };
        bucket.remove(pos);
        if bucket.is_empty() {
            self.ready.remove(&priority);
        }
        true
    }

    fn pop_ready(&mut self) -> Option<Arc<ControlBlock>> {
        self.drain_inbox();
        let mut entry = self.ready.last_entry()?;
        let bucket = entry.get_mut();
        let fcb = bucket.pop_front();
        if bucket.is_empty() {
            entry.remove();
        }
        fcb
    }
}

/// The FCB currently RUNNING on this thread, or `None` if the thread's
/// non-fiber ("main") context is the one executing.
pub(crate) fn active() -> Option<Arc<ControlBlock>> {
    SCHEDULER.with(|s| s.borrow().active.clone())
}

/// The identity to record as a sync primitive's owner/waiter for the
/// context currently executing on this thread: the active fiber, or this
/// thread's main context.
pub(crate) fn current_owner_id() -> OwnerId {
    match active() {
        Some(fcb) => OwnerId::Fiber(fcb.id()),
        None => OwnerId::Thread(std::thread::current().id()),
    }
}

/// A fresh [`Waiter`] representing whoever is currently executing on this
/// thread, suitable for enqueueing on a sync primitive about to block.
pub(crate) fn current_waiter() -> Waiter {
    match active() {
        Some(fcb) => Waiter::Fiber(fcb),
        None => Waiter::Main(crate::fiber::control_block::MainNotifier::new()),
    }
}

/// Registers a freshly constructed, never-yet-resumed FCB with this
/// thread's scheduler and makes it READY. Precondition: the FCB's state is
/// READY and it has not been bound to any thread yet (enforced by
/// `ControlBlock::bind_to_current_thread`'s assertion).
pub(crate) fn spawn(fcb: Arc<ControlBlock>) {
    SCHEDULER.with(|s| {
        let mut sched = s.borrow_mut();
        fcb.bind_to_current_thread(sched.inbox.clone());
        sched.enqueue(fcb);
    });
}

/// Runs one scheduling step: pops the highest-priority ready FCB (oldest
/// first within a priority) and resumes it. Returns once that fiber
/// suspends (yields, blocks, or terminates) or immediately if the ready
/// queue (including anything pending in the cross-thread inbox) is empty.
pub fn run() {
    let fcb = match SCHEDULER.with(|s| s.borrow_mut().pop_ready()) {
        Some(fcb) => fcb,
        None => return,
    };

    SCHEDULER.with(|s| s.borrow_mut().active = Some(fcb.clone()));
    fcb.set_running();

    let started = fcb.mark_started();
    let arg = if started {
        Arc::into_raw(fcb.clone()) as usize
    } else {
        0
    };
    let to = fcb.stack_pointer();

    // Safety: `to` was produced either by `context::init_stack` (first
    // resume) or by this same fiber's own last suspend, and no other
    // thread resumes it concurrently (enforced by `bind_to_current_thread`).
    unsafe {
        context::switch(&mut *fcb.caller_context_slot(), to, arg);
    }

    SCHEDULER.with(|s| {
        let mut sched = s.borrow_mut();
        sched.active = None;
        sched.switch_count += 1;
    });
}

/// Suspends the calling fiber (RUNNING -> READY) and gives control back to
/// whoever last resumed it, re-enqueueing it first so a later `run` picks
/// it back up. Panics if called outside of a fiber.
pub(crate) fn yield_raw() {
    let fcb = active().expect("this_fiber::yield_now() called outside of a fiber");
    fcb.set_ready();
    SCHEDULER.with(|s| {
        let mut sched = s.borrow_mut();
        sched.enqueue(fcb.clone());
        sched.active = None;
    });
    let caller = fcb.caller_context();
    // Safety: see `run`'s switch; `caller` is this fiber's own recorded
    // resumer, valid until this exact switch consumes it.
    unsafe {
        context::switch(&mut *fcb.context_slot(), caller, 0);
    }
}

/// Suspends the calling fiber (RUNNING -> WAITING) without re-enqueueing
/// it: the caller is responsible for having already recorded it on some
/// primitive's wait list before calling this. Panics if called outside of
/// a fiber.
pub(crate) fn wait_raw() {
    let fcb = active().expect("fiber blocked outside of a fiber context");
    fcb.set_waiting();
    SCHEDULER.with(|s| s.borrow_mut().active = None);
    let caller = fcb.caller_context();
    unsafe {
        context::switch(&mut *fcb.context_slot(), caller, 0);
    }
}

/// Wakes `fcb`: transitions WAITING -> READY and, only if that transition
/// actually happened, schedules it -- locally if this is its owning
/// thread, or via that thread's cross-thread inbox otherwise. A no-op on
/// an FCB that is TERMINATED, already READY, or RUNNING: these are the
/// benign races a cross-thread wake can observe, tolerated rather than
/// treated as misuse (see `ControlBlock::wake_if_waiting`).
pub(crate) fn wake(fcb: &Arc<ControlBlock>) {
    if !fcb.wake_if_waiting() {
        return;
    }
    match fcb.binding() {
        Some(Binding { thread, inbox }) if thread == std::thread::current().id() => {
            SCHEDULER.with(|s| s.borrow_mut().enqueue(fcb.clone()));
        }
        Some(Binding { inbox, .. }) => {
            inbox.push(fcb.clone());
        }
        None => {
            log::warn!("{} woken before ever being bound to a thread", fcb.id());
        }
    }
}

/// A priority change on a fiber already sitting in its thread's ready queue
/// re-sorts it immediately by moving it to the new priority's bucket;
/// otherwise the new priority just takes effect the next time the fiber is
/// enqueued.
pub(crate) fn reprioritize(fcb: &Arc<ControlBlock>, new_priority: i32) {
    SCHEDULER.with(|s| {
        let mut sched = s.borrow_mut();
        let old_priority = fcb.priority();
        if old_priority == new_priority {
            return;
        }
        let was_queued = sched.remove_from_ready(old_priority, fcb);
        fcb.set_priority(new_priority);
        if was_queued {
            sched.enqueue(fcb.clone());
        }
    });
}

/// The number of completed context switches performed by this thread's
/// scheduler. Backs the `test-helpers` `csw()` helper.
#[cfg(feature = "test-helpers")]
pub(crate) fn switch_count() -> u64 {
    SCHEDULER.with(|s| s.borrow().switch_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_ready_drains_priority_buckets_highest_first() {
        SCHEDULER.with(|s| {
            let mut sched = s.borrow_mut();
            let low = ControlBlock::new_placeholder();
            low.set_priority(0);
            low.set_ready();
            let high = ControlBlock::new_placeholder();
            high.set_priority(5);
            high.set_ready();
            sched.enqueue(low.clone());
            sched.enqueue(high.clone());

            let first = sched.pop_ready().unwrap();
            assert_eq!(first.id(), high.id());
            let second = sched.pop_ready().unwrap();
            assert_eq!(second.id(), low.id());
            assert!(sched.pop_ready().is_none());
        });
    }

    #[test]
    fn pop_ready_is_fifo_within_a_priority() {
        SCHEDULER.with(|s| {
            let mut sched = s.borrow_mut();
            let a = ControlBlock::new_placeholder();
            let b = ControlBlock::new_placeholder();
            sched.enqueue(a.clone());
            sched.enqueue(b.clone());
            assert_eq!(sched.pop_ready().unwrap().id(), a.id());
            assert_eq!(sched.pop_ready().unwrap().id(), b.id());
        });
    }
}
