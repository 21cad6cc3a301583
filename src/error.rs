//! Error types for rmw-query-transport.

use crate::attachment::AttachmentError;
use crate::liveliness::TokenError;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A correlation attachment could not be decoded.
    #[error("attachment error: {0}")]
    Attachment(#[from] AttachmentError),

    /// A liveliness token could not be built or parsed.
    #[error("liveliness token error: {0}")]
    Token(#[from] TokenError),

    /// The transport refused a declaration, query or reply.
    #[error("transport error: {0}")]
    Transport(String),

    /// Payload (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The object has been shut down.
    #[error("{0} is shut down")]
    ShutDown(&'static str),

    /// A blocking operation was called on a runtime thread that cannot block.
    #[error("{0} blocks and cannot run on a current-thread async runtime")]
    BlockingInRuntime(&'static str),

    /// A registry entry with this handle already exists.
    #[error("{kind} with id {id} already exists")]
    AlreadyExists {
        /// Kind of entry.
        kind: &'static str,
        /// Handle that collided.
        id: usize,
    },

    /// A request with the same client and sequence number is already pending.
    #[error("request with sequence number {sequence_number} is already pending")]
    DuplicateRequest {
        /// Sequence number of the request.
        sequence_number: i64,
    },

    /// The discovery controller was driven out of order.
    #[error("invalid discovery state: expected {expected}, found {found}")]
    InvalidState {
        /// State the operation requires.
        expected: &'static str,
        /// State the controller was in.
        found: &'static str,
    },
}

impl Error {
    /// Create a transport error.
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a codec error.
    pub fn codec<S: Into<String>>(msg: S) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }
}
