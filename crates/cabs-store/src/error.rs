use std::fmt;
use std::sync::Arc;

use cabs_types::{Ref, Timestamp, TypeError};

/// The classification every [`StoreError`] maps onto.
///
/// Drivers translate their native failures into these kinds once; callers
/// branch on the kind rather than on driver-specific detail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The blob or anchor does not exist.
    NotFound,
    /// A compare-and-set precondition failed; the caller may retry.
    Conflict,
    /// No anchor map root has been installed yet.
    NoAnchorMap,
    /// The store lacks the anchor capability.
    NotAnchorStore,
    /// A blob was used as a type it does not hold.
    WrongType,
    /// Retrying may help.
    Transient,
    /// Do not retry.
    Fatal,
    /// The operation's context was cancelled or its deadline passed.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::NoAnchorMap => "no anchor map",
            Self::NotAnchorStore => "not an anchor store",
            Self::WrongType => "wrong type",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Errors from blob-store and anchor operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested blob was not found.
    #[error("blob not found: {0}")]
    NotFound(Ref),

    /// No anchor entry exists for the name at or before the instant.
    #[error("anchor not found: {name} at {}", .at.to_rfc3339())]
    AnchorNotFound { name: String, at: Timestamp },

    /// A compare-and-set precondition failed.
    #[error("update conflict: {0}")]
    Conflict(String),

    /// No anchor map root has been installed yet.
    #[error("no anchor map")]
    NoAnchorMap,

    /// The store does not offer the anchor capability.
    #[error("not an anchor store")]
    NotAnchorStore,

    /// A blob did not decode as the expected structure.
    #[error("wrong type: {0}")]
    WrongType(String),

    /// A backend failure that may succeed on retry.
    #[error("transient error: {0}")]
    Transient(String),

    /// A backend failure that will not succeed on retry.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// The operation's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation's context deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A ref, key, or timestamp failed to parse.
    #[error(transparent)]
    InvalidData(#[from] TypeError),

    /// A replicated store latched an asynchronous failure.
    #[error("replica poisoned: {0}")]
    Poisoned(Arc<StoreError>),
}

impl StoreError {
    /// The kind this error classifies as.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::AnchorNotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NoAnchorMap => ErrorKind::NoAnchorMap,
            Self::NotAnchorStore => ErrorKind::NotAnchorStore,
            Self::WrongType(_) => ErrorKind::WrongType,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            Self::Io(_) => ErrorKind::Transient,
            Self::Fatal(_) | Self::Serialization(_) | Self::InvalidData(_) => ErrorKind::Fatal,
            Self::Cancelled | Self::DeadlineExceeded => ErrorKind::Cancelled,
            Self::Poisoned(inner) => inner.kind(),
        }
    }

    /// Returns `true` if this error classifies as `kind`.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }

    /// Shorthand for `is(ErrorKind::NotFound)`.
    pub fn is_not_found(&self) -> bool {
        self.is(ErrorKind::NotFound)
    }

    pub(crate) fn serialization(e: impl fmt::Display) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert!(StoreError::NotFound(Ref::zero()).is_not_found());
        assert!(StoreError::Conflict("x".into()).is(ErrorKind::Conflict));
        assert!(StoreError::DeadlineExceeded.is(ErrorKind::Cancelled));
        assert!(StoreError::InvalidData(TypeError::InvalidHex("q".into())).is(ErrorKind::Fatal));
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(StoreError::Io(io).is_not_found());
    }

    #[test]
    fn poisoned_delegates_kind() {
        let inner = Arc::new(StoreError::Transient("disk full".into()));
        let err = StoreError::Poisoned(inner);
        assert!(err.is(ErrorKind::Transient));
        assert!(err.to_string().contains("disk full"));
    }
}
