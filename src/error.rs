//! Crate-wide error type.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by session, transport and server operations.
///
/// No operation unwinds implicitly; everything that can fail returns one of
/// these through [`Result`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The byte stream violated the negotiated framing (RFC 6242).
    #[error("malformed framing: {0}")]
    MalformedFraming(String),

    #[error("malformed XML: {0}")]
    MalformedXml(String),

    /// The peers do not share a NETCONF base version.
    #[error("no common NETCONF protocol version")]
    VersionMismatch,

    #[error("capability missing: {0}")]
    CapabilityMissing(String),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer closed the transport in an orderly fashion.
    #[error("transport closed by peer")]
    TransportEof,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The operation did not complete within the caller's timeout. Never
    /// fatal to the session.
    #[error("operation timed out")]
    Timeout,

    #[error("schema missing: {0}")]
    SchemaMissing(String),

    /// The session is closing or already invalid.
    #[error("session is closed")]
    SessionClosed,

    /// The transport lock could not be acquired within the timeout; the
    /// would-block outcome of a send or receive.
    #[error("session transport is busy")]
    Busy,
}

impl Error {
    /// Whether this error invalidates the session it occurred on.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::TransportEof)
    }

    pub(crate) fn other<E: std::fmt::Display>(what: &str, e: E) -> Error {
        Error::Transport(io::Error::new(io::ErrorKind::Other, format!("{what}: {e}")))
    }
}
