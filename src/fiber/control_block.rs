//! The fiber control block (FCB): a fiber's stack, saved context, state
//! machine, flags, priority, captured panic, and joiner list.

use std::cell::UnsafeCell;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use bitflags::bitflags;
use crossbeam_queue::SegQueue;

use crate::context::StackPointer;
use crate::error::PanicPayload;
use crate::stack::Stack;

/// The cross-thread wake inbox of whichever thread an FCB is bound to: a
/// lock-free MPMC queue that a foreign thread can push an `Arc<ControlBlock>`
/// into without touching that thread's `thread_local!` scheduler state
/// directly (only the owning thread may ever look inside its own
/// `thread_local`). See `scheduler::wake`.
pub(crate) type Inbox = Arc<SegQueue<Arc<ControlBlock>>>;

/// Recorded once, on an FCB's first resume: which OS thread it is pinned to
/// and a handle to that thread's wake inbox, so a foreign thread calling
/// `wake` can route the FCB back to its owner without needing any other
/// registry.
#[derive(Clone)]
pub(crate) struct Binding {
    pub thread: ThreadId,
    pub inbox: Inbox,
}

bitflags! {
    /// Per-FCB flags, read and written with atomic operations so a foreign
    /// thread can request interruption without taking a lock.
    pub(crate) struct Flags: u32 {
        /// Context switches into/out of this fiber save and restore
        /// FPU/vector state. Accepted for parity with the external
        /// interface; see `attributes.rs` for why there is currently no
        /// separate fast path.
        const PRESERVE_FPU            = 0b0000_0001;
        /// The fiber is being force-unwound (stack destruction in
        /// progress), as opposed to a normal return.
        const FORCE_UNWIND            = 0b0000_0010;
        /// An unwind of this fiber's stack has been requested.
        const UNWIND_REQUESTED        = 0b0000_0100;
        /// Interruption delivery is currently suppressed for this fiber.
        const INTERRUPTION_BLOCKED    = 0b0000_1000;
        /// An interruption is pending delivery at the next suspension
        /// point.
        const INTERRUPTION_REQUESTED  = 0b0001_0000;
    }
}

/// The four states an FCB may be in. See the crate-level invariants: exactly
/// zero or one FCB is RUNNING per thread, TERMINATED is absorbing, and a
/// `set_ready` may race benignly with the fiber's own termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Ready = 0,
    Running = 1,
    Waiting = 2,
    Terminated = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Ready,
            1 => State::Running,
            2 => State::Waiting,
            3 => State::Terminated,
            _ => unreachable!("corrupt fiber state byte"),
        }
    }
}

/// Process-wide monotonically increasing fiber identifier.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A fiber's identity. Stable for the lifetime of the fiber, ordered by
/// creation order, usable as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(u64);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

/// The identity of whoever currently holds or waits on a sync primitive: a
/// specific fiber, or the non-fiber ("main") context of a specific OS
/// thread. Unlike [`Waiter`], this carries no wake capability -- it exists
/// purely for equality checks (recursive-lock detection, unlock-by-owner
/// checks), so it's cheap to recompute on every call rather than threading a
/// `Waiter` through code paths that never block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OwnerId {
    Fiber(FiberId),
    Thread(ThreadId),
}

/// The boxed entry closure a fresh FCB runs once resumed for the first
/// time. Boxed twice over (`Box<dyn FnOnce()>` inside an `Option` inside a
/// `Mutex`) only conceptually; in practice it's taken exactly once from an
/// `UnsafeCell`, which is sound because only the owning thread ever resumes
/// the fiber that would read it.
type Entry = Box<dyn FnOnce() + Send + 'static>;

/// The fiber control block.
///
/// Shared ownership (the `fiber` handle, the scheduler's ready queue,
/// joiners, and sync-primitive wait queues) is realized directly as
/// `Arc<ControlBlock>` rather than a hand-rolled atomic refcount with
/// intrusive links: `Arc`'s strong count already is the reference count an
/// FCB with several owners needs, and cloning an `Arc` into a `VecDeque` is
/// exactly "queues hold strong references" without any extra bookkeeping.
pub struct ControlBlock {
    id: FiberId,
    name: Option<String>,
    state: AtomicU8,
    flags: AtomicU32,
    priority: AtomicI32,
    switch_count: AtomicU64,

    /// Set exactly once, on the first resume.
    binding: Mutex<Option<Binding>>,

    /// This fiber's own saved context: where it suspended itself, or (for
    /// a fiber that has never run) the bootstrap entry point written by
    /// `context::init_stack`.
    pub(crate) context: UnsafeCell<StackPointer>,
    /// The context to return to when this fiber suspends: the scheduler's
    /// record of whoever most recently called `resume`. Null until the
    /// first resume.
    pub(crate) caller_context: UnsafeCell<StackPointer>,

    /// Set right before the first context switch into this fiber, so the
    /// resumer knows to pass the bootstrap argument (a pointer back to
    /// this `Arc<ControlBlock>`) exactly once.
    started: std::sync::atomic::AtomicBool,

    /// The stack backing this fiber. `None` for the dummy FCB a thread's
    /// main context is occasionally represented by (see `scheduler.rs`);
    /// `Some` for every real fiber, taken out only by `Drop`.
    stack: UnsafeCell<Option<Stack>>,
    entry: UnsafeCell<Option<Entry>>,

    except: Mutex<Option<PanicPayload>>,
    joiners: Mutex<Vec<Waiter>>,
}

// Safety: `ControlBlock`'s interior-mutable fields (`context`,
// `caller_context`, `stack`, `entry`) are touched only by the single OS
// thread that owns the fiber (established by `binding` and enforced by the
// scheduler, which never resumes a fiber from any other thread). Every
// field that can legitimately be touched cross-thread (`state`, `flags`,
// `priority`, `switch_count`, `except`, `joiners`, `binding`) is itself
// atomic or mutex-guarded.
unsafe impl Send for ControlBlock {}
unsafe impl Sync for ControlBlock {}

impl ControlBlock {
    pub(crate) fn new(
        name: Option<String>,
        priority: i32,
        preserve_fpu: bool,
        stack: Stack,
        entry: Entry,
    ) -> Arc<Self> {
        let mut flags = Flags::empty();
        flags.set(Flags::PRESERVE_FPU, preserve_fpu);
        Arc::new(ControlBlock {
            id: FiberId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            name,
            state: AtomicU8::new(State::Ready as u8),
            flags: AtomicU32::new(flags.bits()),
            priority: AtomicI32::new(priority),
            switch_count: AtomicU64::new(0),
            binding: Mutex::new(None),
            context: UnsafeCell::new(StackPointer::null()),
            caller_context: UnsafeCell::new(StackPointer::null()),
            started: std::sync::atomic::AtomicBool::new(false),
            stack: UnsafeCell::new(Some(stack)),
            entry: UnsafeCell::new(Some(entry)),
            except: Mutex::new(None),
            joiners: Mutex::new(Vec::new()),
        })
    }

    /// A lightweight FCB with no stack and no entry closure, used only to
    /// represent "self" when a thread's main (non-fiber) context needs to
    /// be findable by identity. Never scheduled, never resumed.
    #[cfg(test)]
    pub(crate) fn new_placeholder() -> Arc<Self> {
        Arc::new(ControlBlock {
            id: FiberId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            name: Some("<main>".to_string()),
            state: AtomicU8::new(State::Running as u8),
            flags: AtomicU32::new(Flags::PRESERVE_FPU.bits()),
            priority: AtomicI32::new(0),
            switch_count: AtomicU64::new(0),
            binding: Mutex::new(None),
            context: UnsafeCell::new(StackPointer::null()),
            caller_context: UnsafeCell::new(StackPointer::null()),
            started: std::sync::atomic::AtomicBool::new(true),
            stack: UnsafeCell::new(None),
            entry: UnsafeCell::new(None),
            except: Mutex::new(None),
            joiners: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub(crate) fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub(crate) fn switch_count(&self) -> u64 {
        self.switch_count.load(Ordering::Relaxed)
    }

    pub(crate) fn record_switch(&self) {
        self.switch_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Pointer to this FCB's own saved-context cell, used as the `current`
    /// out-slot of a `context::switch` call made from *inside* this fiber
    /// (a suspend: yield, wait, or termination).
    pub(crate) fn context_slot(&self) -> *mut StackPointer {
        self.context.get()
    }

    /// Pointer to the cell recording whoever most recently resumed this
    /// fiber, used as the `current` out-slot of a `context::switch` call
    /// made by the scheduler to *resume* this fiber.
    pub(crate) fn caller_context_slot(&self) -> *mut StackPointer {
        self.caller_context.get()
    }

    pub(crate) fn stack_pointer(&self) -> StackPointer {
        unsafe { *self.context.get() }
    }

    /// Writes the bootstrap entry point produced by `context::init_stack`.
    /// Called exactly once, by the scheduler, right after construction and
    /// before this FCB is ever enqueued.
    pub(crate) fn set_stack_pointer(&self, sp: StackPointer) {
        unsafe {
            *self.context.get() = sp;
        }
    }

    pub(crate) fn caller_context(&self) -> StackPointer {
        unsafe { *self.caller_context.get() }
    }

    /// Returns `true` if this is the very first resume of this fiber,
    /// marking it started as a side effect. Every later call returns
    /// `false`.
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn take_entry(&self) -> Entry {
        unsafe { (*self.entry.get()).take().expect("fiber entry already consumed") }
    }

    /// Binds this FCB to the calling thread and its wake inbox if it isn't
    /// bound yet; otherwise asserts that the calling thread is the one it's
    /// already bound to. Fibers never migrate between threads once first
    /// resumed.
    pub(crate) fn bind_to_current_thread(&self, inbox: Inbox) {
        let current = std::thread::current().id();
        let mut binding = self.binding.lock().unwrap();
        match &*binding {
            Some(existing) => assert_eq!(
                existing.thread, current,
                "fiber resumed from a thread other than the one that first resumed it"
            ),
            None => {
                *binding = Some(Binding {
                    thread: current,
                    inbox,
                })
            }
        }
    }

    /// The thread and inbox this FCB is pinned to, if it has been resumed
    /// at least once.
    pub(crate) fn binding(&self) -> Option<Binding> {
        self.binding.lock().unwrap().clone()
    }

    // ---- state ----------------------------------------------------------

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == State::Terminated
    }

    /// `yield`/bootstrap-entry transition: READY -> RUNNING.
    pub(crate) fn set_running(&self) {
        let previous = self.state.swap(State::Running as u8, Ordering::AcqRel);
        debug_assert_eq!(
            State::from_u8(previous),
            State::Ready,
            "only a READY fiber may become RUNNING"
        );
    }

    /// Called by the running fiber itself (`yield`). Tolerates WAITING,
    /// RUNNING, or READY as the prior state; a TERMINATED prior state is
    /// restored rather than overwritten (see the module doc on the
    /// RUNNING/READY race).
    pub(crate) fn set_ready(&self) {
        let previous = self.state.swap(State::Ready as u8, Ordering::AcqRel);
        let previous = State::from_u8(previous);
        if previous == State::Terminated {
            self.state.store(State::Terminated as u8, Ordering::Release);
            return;
        }
        log::trace!("{} -> READY (was {:?})", self.id, previous);
    }

    /// The scheduler's wake operation: atomically transitions
    /// WAITING -> READY and reports whether that's the transition that
    /// happened. A foreign-thread or same-thread wake of an FCB that is
    /// already RUNNING, already READY, or TERMINATED is a tolerated no-op
    /// as far as *scheduling* goes (resolved open question: waking a
    /// TERMINATED fiber never enqueues it) -- only a genuine WAITING ->
    /// READY transition means there is a parked fiber that now needs a
    /// ready-queue slot.
    pub(crate) fn wake_if_waiting(&self) -> bool {
        let previous = self.state.swap(State::Ready as u8, Ordering::AcqRel);
        let previous = State::from_u8(previous);
        match previous {
            State::Terminated => {
                self.state.store(State::Terminated as u8, Ordering::Release);
                false
            }
            State::Waiting => {
                log::trace!("{} -> READY (woken)", self.id);
                true
            }
            State::Ready | State::Running => {
                log::trace!("{} wake() no-op, was already {:?}", self.id, previous);
                false
            }
        }
    }

    /// Called by the running fiber when it blocks on a primitive that has
    /// already recorded it as a waiter.
    pub(crate) fn set_waiting(&self) {
        let previous = self.state.swap(State::Waiting as u8, Ordering::AcqRel);
        let previous = State::from_u8(previous);
        debug_assert!(
            previous == State::Running,
            "only a RUNNING fiber may become WAITING, was {previous:?}"
        );
    }

    /// Called once, from the bootstrap trampoline, after the entry closure
    /// returns or panics.
    pub(crate) fn set_terminated(&self) {
        let previous = self.state.swap(State::Terminated as u8, Ordering::AcqRel);
        debug_assert_eq!(
            State::from_u8(previous),
            State::Running,
            "a fiber may only terminate from RUNNING"
        );
        log::trace!("{} -> TERMINATED", self.id);
    }

    // ---- flags ------------------------------------------------------------

    fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set_flag(&self, flag: Flags, value: bool) {
        if value {
            self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        }
    }

    pub fn preserve_fpu(&self) -> bool {
        self.flags().contains(Flags::PRESERVE_FPU)
    }

    pub fn interruption_blocked(&self) -> bool {
        self.flags().contains(Flags::INTERRUPTION_BLOCKED)
    }

    pub(crate) fn set_interruption_blocked(&self, blocked: bool) {
        self.set_flag(Flags::INTERRUPTION_BLOCKED, blocked);
    }

    pub fn interruption_requested(&self) -> bool {
        self.flags().contains(Flags::INTERRUPTION_REQUESTED)
    }

    pub(crate) fn request_interruption(&self, requested: bool) {
        self.set_flag(Flags::INTERRUPTION_REQUESTED, requested);
        if requested {
            log::debug!("{} interruption requested", self.id);
        }
    }

    // ---- exception / join ---------------------------------------------

    pub(crate) fn store_panic(&self, payload: PanicPayload) {
        log::warn!(
            "{} terminating via panic: {}",
            self.id,
            crate::error::PanicPayloadDebug(&payload)
        );
        *self.except.lock().unwrap() = Some(payload);
    }

    pub(crate) fn take_panic(&self) -> Option<PanicPayload> {
        self.except.lock().unwrap().take()
    }

    pub fn has_exception(&self) -> bool {
        self.except.lock().unwrap().is_some()
    }

    /// Registers `joiner` as waiting for this FCB to terminate.
    ///
    /// Returns `false` if this FCB is already TERMINATED (no wait needed,
    /// the caller should proceed as if woken immediately); `true` if the
    /// joiner was enqueued and the caller must now transition to WAITING
    /// (or, for a main-context joiner, spin `scheduler::run()`).
    pub(crate) fn join(&self, joiner: Waiter) -> bool {
        let mut joiners = self.joiners.lock().unwrap();
        if self.is_terminated() {
            return false;
        }
        joiners.push(joiner);
        true
    }

    /// Removes `joiner` from the joiner list without waking anyone, used
    /// when a join is abandoned because of interruption before this FCB
    /// terminated. A no-op if a concurrent `release_joiners` already
    /// removed it.
    pub(crate) fn remove_joiner(&self, joiner: &Waiter) {
        self.joiners.lock().unwrap().retain(|w| !w.id_eq(joiner));
    }

    /// Drains the joiner list. Called exactly once, by the bootstrap
    /// trampoline, right after `set_terminated`.
    pub(crate) fn release_joiners(&self) -> Vec<Waiter> {
        std::mem::take(&mut *self.joiners.lock().unwrap())
    }

    /// Runs `body`, catching a panic and storing it rather than letting it
    /// unwind across the context-switch boundary (which would corrupt the
    /// fiber's own stack bookkeeping). Used only by the bootstrap
    /// trampoline.
    pub(crate) fn run_catching_panics(&self, body: Entry) {
        let result = std::panic::catch_unwind(AssertUnwindSafe(body));
        if let Err(payload) = result {
            self.store_panic(payload);
        }
    }
}

impl fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBlock")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("priority", &self.priority())
            .finish_non_exhaustive()
    }
}

impl PartialEq for ControlBlock {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for ControlBlock {}

impl std::hash::Hash for ControlBlock {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A minimal notifiable for a thread's non-fiber ("main") context: no
/// stack, just a flag a condition variable or mutex can set and a loop can
/// poll. Constructed fresh for each blocking call; identity is carried
/// separately by [`OwnerId::Thread`] for ownership checks that must survive
/// beyond a single blocking call (e.g. holding a mutex across statements).
#[derive(Debug)]
pub(crate) struct MainNotifier {
    ready: std::sync::atomic::AtomicBool,
    thread: ThreadId,
}

impl MainNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(MainNotifier {
            ready: std::sync::atomic::AtomicBool::new(false),
            thread: std::thread::current().id(),
        })
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}

/// Something that can be parked in a wait queue and later signaled: a
/// fiber, or the owning thread's main context. A sync primitive's wait
/// queue is polymorphic over this pair so that a thread's ordinary,
/// non-fiber code can block on the same `Mutex`/`Condvar` a fiber does.
#[derive(Clone)]
pub(crate) enum Waiter {
    Fiber(Arc<ControlBlock>),
    Main(Arc<MainNotifier>),
}

impl Waiter {
    pub fn id_eq(&self, other: &Waiter) -> bool {
        match (self, other) {
            (Waiter::Fiber(a), Waiter::Fiber(b)) => Arc::ptr_eq(a, b),
            (Waiter::Main(a), Waiter::Main(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The stable identity to record as a sync primitive's owner, as
    /// opposed to this waiter's one-shot wake capability.
    pub fn owner_id(&self) -> OwnerId {
        match self {
            Waiter::Fiber(fcb) => OwnerId::Fiber(fcb.id()),
            Waiter::Main(notifier) => OwnerId::Thread(notifier.thread()),
        }
    }

    /// Wakes whoever is parked here: routes a fiber through the scheduler's
    /// cross-thread-aware wake, or just flips the main context's flag.
    pub fn wake(&self) {
        match self {
            Waiter::Fiber(fcb) => crate::scheduler::wake(fcb),
            Waiter::Main(notifier) => notifier.mark_ready(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_starts_running_and_bound() {
        let main = ControlBlock::new_placeholder();
        assert_eq!(main.state(), State::Running);
        assert!(main.is_terminated().eq(&false));
    }

    #[test]
    fn wake_if_waiting_only_reports_true_from_waiting() {
        let fcb = ControlBlock::new_placeholder();
        // Placeholder starts RUNNING; waking it is a no-op for scheduling.
        assert!(!fcb.wake_if_waiting());
        assert_eq!(fcb.state(), State::Ready);

        fcb.set_running();
        fcb.set_waiting();
        assert!(fcb.wake_if_waiting());
        assert_eq!(fcb.state(), State::Ready);

        // Idempotent: already READY, no further scheduling action.
        assert!(!fcb.wake_if_waiting());
    }

    #[test]
    fn wake_if_waiting_is_a_no_op_on_terminated() {
        let fcb = ControlBlock::new_placeholder();
        fcb.set_terminated();
        assert!(!fcb.wake_if_waiting());
        assert_eq!(fcb.state(), State::Terminated);
    }

    #[test]
    fn join_returns_false_once_terminated() {
        let target = ControlBlock::new_placeholder(); // starts RUNNING, not terminated
        let joiner = ControlBlock::new_placeholder();
        assert!(target.join(Waiter::Fiber(joiner)));

        target.set_terminated();
        let joiner = ControlBlock::new_placeholder();
        assert!(!target.join(Waiter::Fiber(joiner)));
    }
}
