//! Kernel error types.
//!
//! All readiness subsystems surface errors through [`KernelError`], which is
//! the single error type returned by every public API in this crate.  Each
//! variant maps onto exactly one POSIX errno via [`KernelError::errno`], so the
//! syscall layer never has to inspect message strings.

/// Unified error type for the posixd readiness core.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Cancellation -------------------------------------------------------
    /// A suspended poll or wait was unblocked by an explicit cancellation
    /// request.  This is an outcome, not a failure of the object.
    #[error("operation cancelled")]
    Cancelled,

    // -- Contract violations ------------------------------------------------
    /// The caller passed an argument the operation cannot accept (e.g. a
    /// zero-capacity event buffer or a malformed timespec).
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The object is already watched by this multiplexer.
    #[error("object {object} is already watched")]
    AlreadyWatched { object: String },

    /// The object is not watched by this multiplexer.
    #[error("object {object} is not watched")]
    NotWatched { object: String },

    /// A read was attempted while there is nothing to report.
    #[error("operation would block")]
    WouldBlock,

    // -- Range errors -------------------------------------------------------
    /// Arithmetic combining time components exceeded the representable range.
    #[error("overflow in {context}")]
    Overflow { context: &'static str },

    // -- Object lifecycle ---------------------------------------------------
    /// The object was closed while (or before) the caller waited on it.
    #[error("file closed")]
    FileClosed,

    // -- Configuration ------------------------------------------------------
    /// The kernel configuration could not be parsed.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl KernelError {
    /// The POSIX errno the syscall layer reports for this error.
    pub fn errno(&self) -> i32 {
        match self {
            KernelError::Cancelled => errno::EINTR,
            KernelError::InvalidArgument { .. } => errno::EINVAL,
            KernelError::AlreadyWatched { .. } => errno::EEXIST,
            KernelError::NotWatched { .. } => errno::ENOENT,
            KernelError::WouldBlock => errno::EAGAIN,
            KernelError::Overflow { .. } => errno::EINVAL,
            KernelError::FileClosed => errno::EBADF,
            KernelError::InvalidConfig { .. } => errno::EINVAL,
        }
    }

    /// Returns `true` for the cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, KernelError::Cancelled)
    }
}

/// Linux errno values used by the syscall layer.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EINTR: i32 = 4;
    pub const EBADF: i32 = 9;
    pub const EAGAIN: i32 = 11;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(KernelError::Cancelled.errno(), errno::EINTR);
        assert_eq!(KernelError::WouldBlock.errno(), errno::EAGAIN);
        assert_eq!(
            KernelError::Overflow { context: "timerfd" }.errno(),
            errno::EINVAL
        );
        assert_eq!(
            KernelError::AlreadyWatched { object: "timerfd".into() }.errno(),
            errno::EEXIST
        );
    }

    #[test]
    fn display_includes_context() {
        let err = KernelError::Overflow {
            context: "timerfd interval",
        };
        assert_eq!(err.to_string(), "overflow in timerfd interval");
        assert!(KernelError::Cancelled.is_cancelled());
        assert!(!KernelError::FileClosed.is_cancelled());
    }
}
