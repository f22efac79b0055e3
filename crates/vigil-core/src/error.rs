//! Error types and result aliases for vigil storage operations.
//!
//! Every failure surfaced by the storage layer is classified into one of four
//! kinds (see [`ErrorKind`]). Lease logic above this layer branches on the
//! kind, never on message text.

use std::fmt;

/// The result type used throughout vigil-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a storage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The object or its container does not exist.
    NotFound,
    /// A lease or precondition conflict (someone else holds the lease).
    Conflict,
    /// A server-side failure that is expected to clear on retry.
    Transient,
    /// Anything else, e.g. permission denial or a corrupt record.
    Fatal,
}

impl ErrorKind {
    /// Stable lowercase label, used for metrics and log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in vigil storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The container holding an object does not exist.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// A lease is held by someone else, or a conditional write lost a race.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// The storage service reported a server-side failure.
    #[error("server error: {message}")]
    Server {
        /// Description of the server failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A non-retryable storage failure.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A lease record could not be encoded or decoded.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a new transient server error.
    #[must_use]
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new transient server error with a source cause.
    #[must_use]
    pub fn server_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Server {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::ContainerNotFound(_) => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Server { .. } => ErrorKind::Transient,
            Self::Storage { .. }
            | Self::Serialization { .. }
            | Self::InvalidInput(_)
            | Self::Internal { .. } => ErrorKind::Fatal,
        }
    }

    /// Returns true if the object or its container is missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }

    /// Returns true if this is a lease or precondition conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict)
    }

    /// Returns true if the failure is server-side and worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }
}
