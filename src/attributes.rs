//! Fiber construction attributes.

use crate::stack::DEFAULT_STACK_SIZE;

/// Configuration carried into a new fiber at construction time: how big a
/// stack it gets and whether its context switches preserve FPU/vector
/// state.
///
/// Mirrors `boost::fibers::attributes`: a plain data holder with sensible
/// defaults, consumed once by the [`Builder`](crate::fiber::Builder) and
/// never examined again after the fiber starts.
#[derive(Debug, Clone, Copy)]
pub struct Attributes {
    /// Requested stack size in bytes. The allocator may round this up.
    pub stack_size: usize,
    /// Whether context switches into and out of this fiber save and
    /// restore FPU/vector registers. Defaults to `true`; fibers that are
    /// known not to touch floating point can set this to `false` to shave
    /// a little time off every switch.
    pub preserve_fpu: bool,
}

impl Attributes {
    /// Attributes with the default stack size and `preserve_fpu = true`.
    pub fn new() -> Self {
        Attributes {
            stack_size: DEFAULT_STACK_SIZE,
            preserve_fpu: true,
        }
    }
}

impl Default for Attributes {
    fn default() -> Self {
        Self::new()
    }
}
