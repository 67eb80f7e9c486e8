//! Error taxonomy for the profiler.
//!
//! Parse failures and transient pipe conditions are recovered where they
//! occur; the variants here are the ones that cross module boundaries.

use thiserror::Error;

/// Errors surfaced by the debugger driver and the sampling controller.
#[derive(Error, Debug)]
pub enum ProfilerError {
    /// Non-retryable read or write on the debugger pipe.
    #[error("gdb pipe I/O failed: {0}")]
    DriverIo(#[from] std::io::Error),

    /// `fetch` hit its retry ceiling without seeing a terminator. The
    /// bytes accumulated so far ride along so the caller can use them.
    #[error("no terminator in gdb response after {attempts} read attempts")]
    DriverTimeout { attempts: u32, partial: String },

    /// Attach was refused: no such process, or not permitted.
    #[error("{0}")]
    TargetUnreachable(String),

    /// The debugger could not start the target binary.
    #[error("{0}")]
    LaunchFailed(String),

    /// A backtrace response could not be parsed.
    #[error("malformed backtrace response: {0}")]
    Parse(String),
}

impl ProfilerError {
    /// True for the cases caused by the operator's input rather than an
    /// internal fault; these print a message and exit zero.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ProfilerError::TargetUnreachable(_) | ProfilerError::LaunchFailed(_)
        )
    }
}
