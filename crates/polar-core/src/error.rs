//! Error types for polar.

use thiserror::Error;

use crate::Implementation;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a node.
#[derive(Debug, Error)]
pub enum Error {
    /// The node descriptor is malformed or does not match the service using it.
    #[error("config error: {0}")]
    Configuration(String),

    /// The daemon could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// The daemon answered with an error payload.
    #[error("{code}: {message}")]
    Protocol {
        /// Daemon error code, verbatim.
        code: String,
        /// Daemon error message, verbatim.
        message: String,
    },

    /// The daemon answered with data that cannot be normalized.
    #[error("unexpected response: {0}")]
    ResponseShape(String),

    /// The daemon variant does not implement this capability.
    #[error("{operation} is not supported by {implementation} nodes")]
    Unsupported {
        /// Implementation kind of the node.
        implementation: Implementation,
        /// Name of the operation that was requested.
        operation: &'static str,
    },

    /// A caller supplied argument is malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Build an [`Error::Unsupported`] for `operation` on `implementation`.
    #[must_use]
    pub const fn unsupported(implementation: Implementation, operation: &'static str) -> Self {
        Self::Unsupported {
            implementation,
            operation,
        }
    }

    /// Build an [`Error::Protocol`] from a daemon code/message pair.
    pub fn protocol(code: impl ToString, message: impl Into<String>) -> Self {
        Self::Protocol {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Whether the capability is absent rather than the call having failed.
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// Whether a caller may retry the same request.
    ///
    /// Only network-level failures qualify. Daemon-reported errors and shape
    /// errors repeat deterministically.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
