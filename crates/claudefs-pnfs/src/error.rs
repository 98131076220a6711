//! Error types for the ClaudeFS pNFS layout manager

use thiserror::Error;

use crate::types::DeviceId;

/// NFSv4 status: OK (success)
pub const NFS4_OK: u32 = 0;
/// NFSv4 status: no such file or directory (unknown device id)
pub const NFS4ERR_NOENT: u32 = 2;
/// NFSv4 status: invalid argument
pub const NFS4ERR_INVAL: u32 = 22;
/// NFSv4 status: operation not supported
pub const NFS4ERR_NOTSUPP: u32 = 10004;
/// NFSv4 status: server fault
pub const NFS4ERR_SERVERFAULT: u32 = 10006;
/// NFSv4 status: bad stateid
pub const NFS4ERR_BAD_STATEID: u32 = 10025;
/// NFSv4 status: bad layout
pub const NFS4ERR_BADLAYOUT: u32 = 10050;
/// NFSv4 status: layout temporarily unavailable, retry later
pub const NFS4ERR_LAYOUTTRYLATER: u32 = 10058;

/// Failures returned by layout manager operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Presented stateid does not match the current authoritative state
    #[error("bad stateid: {reason}")]
    BadStateid {
        /// Why the stateid was rejected
        reason: String,
    },
    /// Layout or stripe map violates a structural invariant
    #[error("bad layout: {reason}")]
    BadLayout {
        /// The violated invariant
        reason: String,
    },
    /// Device id is not registered
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),
    /// Device registration violates addressing invariants
    #[error("invalid device: {reason}")]
    InvalidDevice {
        /// The violated invariant
        reason: String,
    },
    /// Client is blacklisted or must wait for a recall; retry with backoff
    #[error("try later: {reason}")]
    TryLater {
        /// Why the request was deferred
        reason: String,
    },
    /// Layout type or operation variant not enabled in this deployment
    #[error("unsupported: {feature}")]
    Unsupported {
        /// The unsupported feature
        feature: String,
    },
    /// Malformed request argument
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// The offending argument
        reason: String,
    },
    /// Internal invariant violation; the request is aborted
    #[error("internal error: {reason}")]
    Internal {
        /// Details of the fault
        reason: String,
    },
}

impl LayoutError {
    /// Shorthand for [`LayoutError::BadStateid`].
    pub fn bad_stateid(reason: impl Into<String>) -> Self {
        LayoutError::BadStateid {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`LayoutError::BadLayout`].
    pub fn bad_layout(reason: impl Into<String>) -> Self {
        LayoutError::BadLayout {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`LayoutError::InvalidDevice`].
    pub fn invalid_device(reason: impl Into<String>) -> Self {
        LayoutError::InvalidDevice {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`LayoutError::TryLater`].
    pub fn try_later(reason: impl Into<String>) -> Self {
        LayoutError::TryLater {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`LayoutError::Unsupported`].
    pub fn unsupported(feature: impl Into<String>) -> Self {
        LayoutError::Unsupported {
            feature: feature.into(),
        }
    }

    /// Shorthand for [`LayoutError::InvalidArgument`].
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        LayoutError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`LayoutError::Internal`].
    pub fn internal(reason: impl Into<String>) -> Self {
        LayoutError::Internal {
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LayoutError::TryLater { .. })
    }

    /// Converts the error to an NFSv4 status code for protocol responses.
    pub fn nfs4_status(&self) -> u32 {
        match self {
            LayoutError::BadStateid { .. } => NFS4ERR_BAD_STATEID,
            LayoutError::BadLayout { .. } => NFS4ERR_BADLAYOUT,
            LayoutError::UnknownDevice(_) => NFS4ERR_NOENT,
            LayoutError::InvalidDevice { .. } => NFS4ERR_INVAL,
            LayoutError::TryLater { .. } => NFS4ERR_LAYOUTTRYLATER,
            LayoutError::Unsupported { .. } => NFS4ERR_NOTSUPP,
            LayoutError::InvalidArgument { .. } => NFS4ERR_INVAL,
            LayoutError::Internal { .. } => NFS4ERR_SERVERFAULT,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for LayoutError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        LayoutError::internal(format!("lock poisoned: {}", e))
    }
}

/// Result type alias using LayoutError as the error type.
pub type Result<T> = std::result::Result<T, LayoutError>;
