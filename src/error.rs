//! Error types for pgrelay.

use thiserror::Error;

/// Main error type for all pgrelay operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A declared message size exceeds the relevant bound (startup cap or a
    /// caller-configured cap).
    #[error("message of {size} bytes exceeds limit of {limit}")]
    TooBig { size: u32, limit: u32 },

    /// A message's declared size does not match the size its kind requires.
    #[error("expected message of {expected} bytes, got {got}")]
    WrongSize { expected: u32, got: u32 },

    /// StartupMessage carried an unsupported protocol version word.
    #[error("bad startup version: got {got:#010x}, expected {expected:#010x}")]
    StartupVersion { got: u32, expected: u32 },

    /// StartupMessage key/value block is malformed.
    #[error("malformed startup packet: {0}")]
    StartupFormat(&'static str),

    /// A decoder was applied to a message with the wrong type tag.
    #[error("invalid message type {got:?}, expected {expected:?}")]
    BadTypeCode { expected: u8, got: u8 },

    /// Server answered 'N' to SSLRequest while the mode was Require.
    #[error("SSL required but declined by server")]
    TlsRejected,

    /// I/O error from the underlying transport.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// End of stream reached in the middle of a field or payload.
    #[error("unexpected end of stream mid-message")]
    TruncatedRead,

    /// Clean end of stream at a message boundary.
    #[error("end of stream")]
    Eof,

    /// A cancellation request named a session this manager does not hold.
    #[error("no session matches the requested backend key")]
    SessionNotFound,

    /// Protocol violation outside the named taxonomy (unexpected negotiation
    /// byte, bad request code, and the like).
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type alias using pgrelay's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
