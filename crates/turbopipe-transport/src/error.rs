//! Transport error types
//!
//! Errors are grouped the way callers need to react to them:
//! - Construction errors: the child could not be built or spawned
//! - I/O errors: a pipe broke while the transport was running
//! - Framing errors: a frame was malformed, oversized or truncated
//! - Shutdown errors: the child could not be confirmed dead
//! - Lifecycle errors: the call is not valid in the current state

use crate::stdio::ExitInfo;
use std::time::Duration;
use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Boxed error returned by custom construction hooks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur in transport operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The child process could not be constructed or spawned
    #[error("process construction failed: {0}")]
    Construction(#[source] ConstructionError),

    /// A pipe to or from the child failed
    #[error("I/O error while {context}: {source}")]
    Io {
        /// What the transport was doing when the error happened
        context: &'static str,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A frame could not be encoded or decoded
    #[error("framing error: {0}")]
    Framing(#[from] FrameError),

    /// The child could not be shut down cleanly
    #[error("shutdown failed: {0}")]
    Shutdown(#[from] ShutdownError),

    /// `start` was called on a transport that is already starting or running
    #[error("transport already started")]
    AlreadyStarted,

    /// The operation needs a running transport
    #[error("transport not started")]
    NotStarted,

    /// The transport has been closed or has failed
    #[error("transport closed")]
    Closed,

    /// The child exited and no more frames will arrive
    #[error("process exited ({0})")]
    ProcessExited(ExitInfo),

    /// An operation exceeded its configured timeout
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// A JSON helper could not (de)serialize a frame
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of [`TransportError`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Building or spawning the child failed
    Construction,
    /// Steady-state pipe failure
    Io,
    /// Malformed or truncated frame
    Framing,
    /// Graceful or forced shutdown failed
    Shutdown,
    /// Operation invalid for the current lifecycle state
    Lifecycle,
    /// Caller-side encoding failure
    Serialization,
}

impl TransportError {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    /// Classify the error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Construction(_) => ErrorCategory::Construction,
            Self::Io { .. } => ErrorCategory::Io,
            Self::Framing(_) => ErrorCategory::Framing,
            Self::Shutdown(_) => ErrorCategory::Shutdown,
            Self::AlreadyStarted
            | Self::NotStarted
            | Self::Closed
            | Self::ProcessExited(_)
            | Self::Timeout(_)
            | Self::Cancelled => ErrorCategory::Lifecycle,
            Self::Serialization(_) => ErrorCategory::Serialization,
        }
    }

    /// Whether the transport is unusable after this error
    ///
    /// Framing, serialization, cancellation and timeout errors leave a running
    /// transport usable; everything that ends or prevents the child's life
    /// does not.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Construction(_)
            | Self::Io { .. }
            | Self::Shutdown(_)
            | Self::Closed
            | Self::ProcessExited(_) => true,
            Self::Framing(FrameError::Truncated { .. }) => true,
            Self::Framing(_)
            | Self::AlreadyStarted
            | Self::NotStarted
            | Self::Timeout(_)
            | Self::Cancelled
            | Self::Serialization(_) => false,
        }
    }
}

impl From<ConstructionError> for TransportError {
    fn from(err: ConstructionError) -> Self {
        Self::Construction(err)
    }
}

/// Errors raised while building or spawning the child process
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConstructionError {
    /// The executable could not be resolved on the search path
    #[error("executable `{name}` not found: {reason}")]
    ExecutableNotFound {
        /// Executable as configured
        name: String,
        /// Resolver diagnostic
        reason: String,
    },

    /// The command description is unusable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A custom construction hook reported an error
    #[error("construction hook failed: {0}")]
    Hook(#[source] BoxError),

    /// The OS refused to start the process
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        /// Program that was being spawned
        program: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// A standard stream was not piped by the handle
    #[error("child {0} is not piped")]
    MissingPipe(&'static str),
}

impl ConstructionError {
    /// Wrap an arbitrary error returned by a custom hook
    pub fn hook(err: impl Into<BoxError>) -> Self {
        Self::Hook(err.into())
    }
}

/// Errors produced by frame codecs
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FrameError {
    /// A frame exceeded the configured maximum size
    #[error("frame of {len} bytes exceeds maximum of {max} bytes")]
    TooLarge {
        /// Observed or declared frame length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// An outbound payload contains the frame delimiter
    #[error("payload contains the frame delimiter at byte {0}")]
    EmbeddedDelimiter(usize),

    /// An empty payload cannot be told apart from a blank line
    #[error("empty frame cannot be sent with line framing")]
    Empty,

    /// The stream ended in the middle of a frame
    #[error("stream closed with {remaining} bytes of an incomplete frame")]
    Truncated {
        /// Number of bytes left over
        remaining: usize,
    },

    /// The underlying pipe failed while encoding or decoding
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while stopping the child
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ShutdownError {
    /// The child survived a forced kill; its resources may leak
    #[error("process {pid:?} did not exit within {waited:?} of being killed")]
    KillFailed {
        /// OS process id, if still known
        pid: Option<u32>,
        /// How long the supervisor waited after the kill
        waited: Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TransportError>();
    }

    #[test]
    fn test_construction_error_message() {
        let err = TransportError::from(ConstructionError::hook("no such user"));
        assert_eq!(
            err.to_string(),
            "process construction failed: construction hook failed: no such user"
        );
        assert_eq!(err.category(), ErrorCategory::Construction);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_closed_message() {
        assert_eq!(TransportError::Closed.to_string(), "transport closed");
        assert_eq!(
            TransportError::AlreadyStarted.to_string(),
            "transport already started"
        );
    }

    #[test]
    fn test_framing_errors_are_recoverable_unless_truncated() {
        let too_large = TransportError::from(FrameError::TooLarge { len: 10, max: 4 });
        assert_eq!(too_large.category(), ErrorCategory::Framing);
        assert!(!too_large.is_fatal());

        let truncated = TransportError::from(FrameError::Truncated { remaining: 3 });
        assert!(truncated.is_fatal());
    }

    #[test]
    fn test_process_exited_display() {
        let err = TransportError::ProcessExited(ExitInfo::from_code(3));
        assert_eq!(err.to_string(), "process exited (exit code 3)");
        assert_eq!(err.category(), ErrorCategory::Lifecycle);
    }

    #[test]
    fn test_shutdown_error_is_fatal() {
        let err = TransportError::from(ShutdownError::KillFailed {
            pid: Some(42),
            waited: Duration::from_secs(5),
        });
        assert_eq!(err.category(), ErrorCategory::Shutdown);
        assert!(err.is_fatal());
    }
}
