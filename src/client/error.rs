use std::sync::Arc;

use http::StatusCode;
use thiserror::Error;

use crate::transport::UriError;
use crate::BoxError;

/// A shared, clonable error source.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Streaming client error type.
///
/// Errors are clonable, because one connection attempt may be awaited by many callers.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The target's initializer failed to produce a transport.
    #[error("transport construction: {0}")]
    TransportConstruction(#[source] SharedError),

    /// The transport failed before a response arrived.
    #[error("transport: {0}")]
    Transport(#[source] SharedError),

    /// The response status was not `200 OK`.
    #[error("bad status code: {code}\n{body}", code = .status.as_u16())]
    BadStatus {
        /// The response status.
        status: StatusCode,
        /// The full response body.
        body: String,
    },

    /// The socket was idle for longer than the socket timeout.
    #[error("socket timeout")]
    SocketTimeout,

    /// The socket closed with an error.
    #[error("connection closed with error")]
    ConnectionClosed,

    /// The transport stopped producing events before the request finished.
    #[error("transport closed before a response")]
    TransportClosed,

    /// A recovery sequence is already running.
    #[error("recovery already in progress")]
    RecoveryInProgress,

    /// The client is stopping, so no recovery may begin.
    #[error("recovery blocked by pending stop")]
    RecoveryBlockedByStop,

    /// The client was stopped before the operation finished.
    #[error("client stopped")]
    Stopped,

    /// The target URL is not usable.
    #[error(transparent)]
    InvalidUri(Arc<UriError>),
}

impl Error {
    pub(crate) fn construction(error: BoxError) -> Self {
        Error::TransportConstruction(Arc::from(error))
    }

    pub(crate) fn transport(error: BoxError) -> Self {
        Error::Transport(Arc::from(error))
    }

    /// Whether this is one of the immediate rejections from [`recover`](super::StreamClient::recover).
    pub fn is_recovery_guard(&self) -> bool {
        matches!(
            self,
            Error::RecoveryInProgress | Error::RecoveryBlockedByStop
        )
    }
}

impl From<UriError> for Error {
    fn from(error: UriError) -> Self {
        Error::InvalidUri(Arc::new(error))
    }
}
