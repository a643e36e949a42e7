//! The machine-specific context switch primitive.
//!
//! This is the one piece of the runtime that cannot be written in safe,
//! portable Rust: swapping the active call stack. The contract is the one
//! `jump_fcontext` exposes to Boost.Fiber: given a target [`StackPointer`],
//! save the current callee-saved register file and return address onto the
//! current stack, switch `rsp` to the target, and resume whatever was
//! suspended there. The call "returns", on the *original* stack with the
//! registers it had before switching away, only once some other switch
//! targets it again.
//!
//! Only the callee-saved register set needs saving explicitly: the SysV
//! AMD64 ABI already requires the compiler to spill every caller-saved
//! register around a call, so `switch_stack` only has to protect `rbp`,
//! `rbx`, and `r12`..`r15` plus the stack pointer itself. This keeps a
//! switch to a handful of instructions and is why stackful coroutine
//! libraries report context switches an order of magnitude cheaper than a
//! thread context switch.
//!
//! Only x86_64 is implemented; other architectures are expected to plug in
//! an analogous `global_asm!` routine following the same register-save
//! convention (see the riscv64 variant's callee-saved list for the shape
//! such a port would take).

#[cfg(not(target_arch = "x86_64"))]
compile_error!("fiber: context switching is only implemented for x86_64");

/// An opaque, architecture-specific stack pointer captured by a context
/// switch. Valid only as the `to` argument of a later [`switch`] call, and
/// only while the stack it points into is alive.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct StackPointer(pub(crate) *mut u8);

// Safety: a `StackPointer` is a bare address. It is `Send` because control
// over the stack it identifies is transferred, never shared, between
// threads (a fiber is resumed by exactly one thread at a time, per the
// runtime's pinning invariant); it carries no aliasing of its own.
unsafe impl Send for StackPointer {}

impl StackPointer {
    /// A sentinel value with no valid target, used to initialize an FCB's
    /// `caller_context` before it has ever been resumed. Never passed as
    /// the `to` argument of [`switch`].
    pub(crate) fn null() -> Self {
        StackPointer(std::ptr::null_mut())
    }
}

impl std::fmt::Debug for StackPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StackPointer({:p})", self.0)
    }
}

extern "C" {
    /// Saves the current callee-saved registers and stack pointer onto the
    /// current stack, stores the resulting stack pointer into `*old_sp`,
    /// then switches `rsp` to `new_sp` and pops the callee-saved registers
    /// that were saved there by a previous call (or by [`init_stack`]'s
    /// synthetic frame), and returns.
    ///
    /// `arg` is passed through untouched in `rax` and is returned by the
    /// call that resumes this side; it is used to hand a single word of
    /// payload across the switch (e.g. "the fiber that just suspended").
    fn fiber_switch_stack(old_sp: *mut *mut u8, new_sp: *mut u8, arg: usize) -> usize;
}

std::arch::global_asm!(
    ".text",
    ".globl fiber_switch_stack",
    ".p2align 4",
    "fiber_switch_stack:",
    // rdi = old_sp (*mut *mut u8), rsi = new_sp, rdx = arg
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "mov rax, rdx",
    "ret",
);

/// Switches execution from the current stack to `to`, passing `arg` across
/// the switch. Returns the `arg` some later switch back into the caller's
/// stack was given.
///
/// # Safety
/// `to` must be a [`StackPointer`] produced by [`init_stack`] (never yet
/// resumed) or by a previous `switch` call that saved into a stack which is
/// still alive and not concurrently being switched into from elsewhere.
pub unsafe fn switch(current: &mut StackPointer, to: StackPointer, arg: usize) -> usize {
    fiber_switch_stack(&mut current.0, to.0, arg)
}

/// Prepares a fresh stack so that the first [`switch`] into it transfers
/// control to `entry`, which receives the `arg` passed to that first
/// switch.
///
/// `entry` must never return: the convention (enforced by the bootstrap
/// trampoline in `fiber::control_block`) is that it ends by switching away
/// one final time and never coming back, since there is no caller frame to
/// return into.
///
/// # Safety
/// `stack_top` must be the high address of a region of at least
/// `STACK_RESERVE` bytes that outlives every switch into the returned
/// pointer.
pub unsafe fn init_stack(stack_top: *mut u8, entry: extern "C" fn(usize) -> !) -> StackPointer {
    // Reserve room below the top for the synthetic frame: a return address
    // plus six callee-saved register slots (rbp, rbx, r12..r15), all 8
    // bytes wide, kept 16-byte aligned per the SysV ABI's stack alignment
    // requirement at a `call` boundary.
    let mut sp = (stack_top as usize & !0xf) as *mut u8;

    sp = sp.sub(8);
    (sp as *mut usize).write(entry as usize);
    // The six registers `fiber_switch_stack` pops, in pop order: r15, r14,
    // r13, r12, rbx, rbp. Their initial values are irrelevant; they're
    // clobbered by real data the first time this fiber itself switches
    // away.
    for _ in 0..6 {
        sp = sp.sub(8);
        (sp as *mut usize).write(0);
    }

    StackPointer(sp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Stack;

    thread_local! {
        // Address of the caller's `StackPointer` local. By the time the
        // entry point below runs, `fiber_switch_stack` has already written
        // the caller's current `rsp` into that local (that write happens
        // before the jump), so dereferencing it hands back a valid target.
        static CALLER: std::cell::Cell<*mut StackPointer> = std::cell::Cell::new(std::ptr::null_mut());
    }

    extern "C" fn add_one_and_bounce(arg: usize) -> ! {
        unsafe {
            let caller_slot = CALLER.with(|c| c.get());
            let target = *caller_slot;
            let mut from = StackPointer(std::ptr::null_mut());
            switch(&mut from, target, arg + 1);
        }
        unreachable!("a fiber entry point must never be resumed after bouncing back");
    }

    #[test]
    fn switch_round_trips_through_a_fresh_stack() {
        let mut stack = Stack::allocate(64 * 1024).unwrap();
        let top = stack.top();
        let target = unsafe { init_stack(top, add_one_and_bounce) };

        let mut here = StackPointer(std::ptr::null_mut());
        let here_ptr: *mut StackPointer = &mut here;
        CALLER.with(|c| c.set(here_ptr));

        let result = unsafe { switch(&mut here, target, 41) };
        assert_eq!(result, 42);
    }
}
