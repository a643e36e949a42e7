//! Error handling utils.
//!
//! Every fallible operation in this crate returns a [`Result`] carrying an
//! [`Error`] from this module rather than an error code; the runtime never
//! hands a raw status integer across a public boundary.

use std::any::Any;
use std::fmt;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The payload captured when a fiber's entry closure unwinds.
///
/// This is exactly what [`std::panic::catch_unwind`] hands back; the runtime
/// does not attempt to downcast or format it until someone actually joins
/// the fiber and asks for the value.
pub type PanicPayload = Box<dyn Any + Send + 'static>;

/// Represents all error cases raised by the fiber runtime.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Thrown at a suspension point when interruption is pending and not
    /// blocked.
    #[error("fiber was interrupted")]
    Interrupted,

    /// A lock was used incorrectly: double unlock, unlock by a fiber that
    /// doesn't hold it, or a recursive lock on a non-recursive mutex.
    #[error("lock error: {0}")]
    LockError(#[from] LockError),

    /// The stack allocator failed to provide a stack of the requested size.
    #[error("failed to allocate a {requested}-byte fiber stack")]
    ResourceExhausted {
        /// The stack size that was requested, in bytes.
        requested: usize,
    },

    /// An operation was requested that is never valid, regardless of
    /// timing: joining oneself, joining a detached handle, resuming a
    /// terminated fiber.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// Rethrown by [`join`](crate::fiber::JoinHandle::join) when the target
    /// fiber's entry closure panicked. The original payload is preserved
    /// verbatim; callers typically feed it straight to
    /// [`std::panic::resume_unwind`] to keep the panic message and location
    /// intact rather than reporting it as a `FiberPanic` wrapper.
    #[error("fiber panicked")]
    FiberPanic(PanicPayload),
}

impl Error {
    /// Resumes unwinding with the original panic payload if this error
    /// wraps one, otherwise panics with this error's [`Display`] message.
    ///
    /// This is the usual way to turn a failed [`join`](crate::fiber::JoinHandle::join)
    /// back into "what would have happened had the fiber's body run inline".
    pub fn resume_or_panic(self) -> ! {
        match self {
            Error::FiberPanic(payload) => std::panic::resume_unwind(payload),
            other => panic!("{other}"),
        }
    }
}

/// The specific way a [`Mutex`](crate::sync::Mutex) was misused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum LockError {
    /// `unlock()` was called on a mutex that was not locked.
    #[error("unlock of a mutex that isn't locked")]
    NotLocked,

    /// `unlock()` was called by a fiber other than the one holding the
    /// lock.
    #[error("unlock of a mutex by a fiber that doesn't own it")]
    NotOwner,

    /// `lock()` was called by the fiber that already holds the lock; this
    /// mutex is not recursive.
    #[error("recursive lock of a non-recursive mutex")]
    WouldDeadlock,
}

impl fmt::Display for PanicPayloadDebug<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<&str>() {
            write!(f, "{s}")
        } else if let Some(s) = self.0.downcast_ref::<String>() {
            write!(f, "{s}")
        } else {
            write!(f, "Box<dyn Any>")
        }
    }
}

/// Helper for formatting a panic payload in diagnostic output.
pub(crate) struct PanicPayloadDebug<'a>(pub &'a PanicPayload);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(Error::Interrupted.to_string(), "fiber was interrupted");
        assert_eq!(
            Error::LockError(LockError::NotOwner).to_string(),
            "lock error: unlock of a mutex by a fiber that doesn't own it"
        );
        assert_eq!(
            Error::ResourceExhausted { requested: 4096 }.to_string(),
            "failed to allocate a 4096-byte fiber stack"
        );
        assert_eq!(
            Error::InvalidOperation("join on self").to_string(),
            "invalid operation: join on self"
        );
    }

    #[test]
    fn fiber_panic_does_not_depend_on_link_error() {
        // Constructing and displaying an `Error` must never touch anything
        // beyond what's linked into a plain `cargo test` run.
        let err = Error::FiberPanic(Box::new("boom"));
        assert_eq!(err.to_string(), "fiber panicked");
    }
}
