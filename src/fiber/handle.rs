//! The fiber handle: construction via [`Builder`], and the
//! join/detach/interrupt surface of [`JoinHandle`].

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;

use crate::attributes::Attributes;
use crate::error::{Error, Result};
use crate::fiber::control_block::{ControlBlock, OwnerId};
use crate::scheduler;
use crate::stack::Stack;
use crate::this_fiber;

/// Where a fiber's return value is handed from its entry closure to its
/// joiner. Shared via `Arc` rather than a channel: there is exactly one
/// writer (the fiber, once, right before it terminates) and exactly one
/// reader (the joiner, once, after observing TERMINATED), and the FCB's own
/// state transition already establishes the happens-before edge between
/// them.
struct ResultSlot<T>(UnsafeCell<Option<T>>);

// Safety: see the struct doc -- single writer before termination, single
// reader after, synchronized by the FCB's Acquire/Release state transition.
unsafe impl<T: Send> Send for ResultSlot<T> {}
unsafe impl<T: Send> Sync for ResultSlot<T> {}

/// Builds a fiber with optional name, stack size, priority, and FPU-save
/// policy before spawning it. Mirrors `std::thread::Builder`: a plain value
/// consumed by a single terminal `spawn` call.
#[derive(Debug, Clone)]
pub struct Builder {
    name: Option<String>,
    priority: i32,
    attributes: Attributes,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            name: None,
            priority: 0,
            attributes: Attributes::new(),
        }
    }

    /// Names the fiber, visible in logs and [`ControlBlock::name`].
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Requests a stack of at least `size` bytes; the allocator may round
    /// up.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.attributes.stack_size = size;
        self
    }

    /// Sets the initial scheduling priority. Higher runs first; fibers of
    /// equal priority run in the order they became ready.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn preserve_fpu(mut self, preserve: bool) -> Self {
        self.attributes.preserve_fpu = preserve;
        self
    }

    /// Allocates a stack, constructs the FCB, and hands it to the current
    /// thread's scheduler as READY. The fiber does not actually run until a
    /// subsequent `scheduler::run()` (driven, directly or indirectly, by
    /// `this_fiber::yield_now` or the owning main loop) picks it up.
    pub fn spawn<F, T>(self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut stack = Stack::allocate(self.attributes.stack_size)?;
        let top = stack.top();

        let result = Arc::new(ResultSlot(UnsafeCell::new(None)));
        let result_for_entry = Arc::clone(&result);
        let entry: Box<dyn FnOnce() + Send + 'static> = Box::new(move || {
            let value = f();
            // Safety: see `ResultSlot`'s doc; this is the single write,
            // before the FCB transitions to TERMINATED.
            unsafe {
                *result_for_entry.0.get() = Some(value);
            }
        });

        let fcb = ControlBlock::new(self.name, self.priority, self.attributes.preserve_fpu, stack, entry);
        // Safety: `top` is the high address of the stack just moved into
        // `fcb`, which outlives every switch into the pointer produced
        // here.
        let sp = unsafe { crate::context::init_stack(top, crate::fiber::bootstrap_trampoline) };
        fcb.set_stack_pointer(sp);

        scheduler::spawn(Arc::clone(&fcb));

        Ok(JoinHandle {
            fcb: Some(fcb),
            result,
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// An owning handle to a spawned fiber.
///
/// Exactly one of [`join`](JoinHandle::join) or [`detach`](JoinHandle::detach)
/// must be called before the handle is dropped; dropping a still-joinable
/// handle means the program has lost the only way to observe that fiber's
/// completion or propagate its panic, which this crate treats as the same
/// class of bug as a leaked `JoinGuard` -- it aborts the process rather
/// than silently leaking.
pub struct JoinHandle<T = ()> {
    fcb: Option<Arc<ControlBlock>>,
    result: Arc<ResultSlot<T>>,
}

impl<T> JoinHandle<T> {
    /// `false` after [`join`](Self::join) or [`detach`](Self::detach) has
    /// consumed this handle.
    pub fn joinable(&self) -> bool {
        self.fcb.is_some()
    }

    fn fcb(&self) -> &Arc<ControlBlock> {
        self.fcb
            .as_ref()
            .expect("fiber handle used after join() or detach()")
    }

    pub fn get_id(&self) -> crate::fiber::FiberId {
        self.fcb().id()
    }

    pub fn priority(&self) -> i32 {
        self.fcb().priority()
    }

    /// Changes the fiber's scheduling priority, re-sorting it in its
    /// thread's ready queue immediately if it's currently sitting in one.
    pub fn set_priority(&self, priority: i32) {
        scheduler::reprioritize(self.fcb(), priority);
    }

    /// Requests cooperative interruption: the target observes this at its
    /// next suspension point and unwinds with [`Error::Interrupted`]. A
    /// no-op if the target has already terminated.
    pub fn interrupt(&self) {
        let fcb = self.fcb();
        fcb.request_interruption(true);
        if fcb.state() == crate::fiber::control_block::State::Waiting {
            scheduler::wake(fcb);
        }
    }

    /// Releases this handle without waiting for the fiber to finish. The
    /// fiber keeps running (or waiting to run) on its own; nothing observes
    /// its eventual panic other than the scheduler's own diagnostics.
    pub fn detach(mut self) {
        self.fcb.take();
    }

    /// Swaps the fibers two handles refer to. Fails if either handle has
    /// already been joined or detached -- there is nothing left to swap.
    pub fn swap(&mut self, other: &mut Self) -> Result<()> {
        if self.fcb.is_none() || other.fcb.is_none() {
            return Err(Error::InvalidOperation(
                "cannot swap a fiber handle that has already been joined or detached",
            ));
        }
        std::mem::swap(self, other);
        Ok(())
    }

    /// Blocks until the target fiber terminates, then returns its result.
    ///
    /// If the target panicked, returns [`Error::FiberPanic`] carrying the
    /// original payload; feed it to [`Error::resume_or_panic`] to re-raise
    /// it exactly as if the call had been inline. If the calling fiber is
    /// interrupted while waiting, returns [`Error::Interrupted`] and the
    /// target keeps running detached in the background (its eventual
    /// result, if any, is simply never observed).
    pub fn join(mut self) -> Result<T> {
        let fcb = self.fcb.take().expect("join() called after detach()");

        if scheduler::current_owner_id() == OwnerId::Fiber(fcb.id()) {
            return Err(Error::InvalidOperation("a fiber cannot join itself"));
        }

        if !fcb.is_terminated() {
            let me = scheduler::current_waiter();
            if fcb.join(me.clone()) {
                let outcome = match &me {
                    crate::fiber::control_block::Waiter::Fiber(_) => {
                        scheduler::wait_raw();
                        this_fiber::interruption_point()
                    }
                    crate::fiber::control_block::Waiter::Main(notifier) => {
                        while !notifier.is_ready() {
                            scheduler::run();
                        }
                        Ok(())
                    }
                };
                if let Err(e) = outcome {
                    fcb.remove_joiner(&me);
                    return Err(e);
                }
            }
        }

        if let Some(payload) = fcb.take_panic() {
            return Err(Error::FiberPanic(payload));
        }
        let value = unsafe { (*self.result.0.get()).take() }
            .expect("a terminated fiber with no panic must have stored a result");
        Ok(value)
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if let Some(fcb) = &self.fcb {
            log::error!(
                "{fcb} dropped while still joinable; call join() or detach() first",
                fcb = fcb.id()
            );
            std::process::abort();
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.fcb.as_ref().map(|fcb| fcb.id()))
            .finish()
    }
}

impl<T> PartialEq for JoinHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.get_id() == other.get_id()
    }
}
impl<T> Eq for JoinHandle<T> {}

impl<T> PartialOrd for JoinHandle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for JoinHandle<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.get_id().cmp(&other.get_id())
    }
}
