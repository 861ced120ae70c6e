//! Error types surfaced by the SDK.

use std::time::Duration;

/// Problems reported by the stream client to its consumer.
///
/// None of these are fatal to the process. `ConnectionLost` and `OpenFailed`
/// are reported while the client keeps retrying; `RetriesExhausted` comes
/// with the `failed` state and needs an explicit `reconnect()`.
/// `EndedByBackend` comes with `disconnected`; the subscription is gone.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The transport closed unexpectedly.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The transport could not be opened.
    #[error("failed to open stream: {0}")]
    OpenFailed(String),

    /// Gave up after the configured number of reconnect attempts.
    #[error("gave up after {attempts} reconnect attempts")]
    RetriesExhausted { attempts: u32 },

    /// The backend stopped reading the channel and told us so.
    #[error("backend ended the analysis")]
    EndedByBackend,
}

impl StreamError {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamError::ConnectionLost(_) => "connection-lost",
            StreamError::OpenFailed(_) => "open-failed",
            StreamError::RetriesExhausted { .. } => "retries-exhausted",
            StreamError::EndedByBackend => "ended-by-backend",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamError::RetriesExhausted { .. } | StreamError::EndedByBackend
        )
    }
}

/// Errors raised by a [`Transport`](crate::transport::Transport) adapter.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("unexpected content type '{0}'")]
    ContentType(String),

    #[error("open timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid utf-8 in stream")]
    Utf8,

    #[error("stream event larger than {0} bytes")]
    FrameTooLarge(usize),

    #[error("{0}")]
    Other(String),
}

/// Errors from the REST backend.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The call needs a logged-in user.
    #[error("not logged in")]
    Unauthenticated,

    /// A success response without a field the client needs.
    #[error("response is missing '{0}'")]
    MissingField(&'static str),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Http(e) => e.status().map(|s| s.as_u16()),
            ApiError::Unauthenticated => Some(401),
            ApiError::MissingField(_) => None,
        }
    }
}

/// Errors from [`AnalysisSession`](crate::session::AnalysisSession) operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Rejected before any network call: nobody is logged in.
    #[error("log in before starting an analysis")]
    Unauthenticated,

    #[error(transparent)]
    Api(#[from] ApiError),

    /// Nothing to operate on (e.g. saving history with no active channel).
    #[error("no active session")]
    NoSession,

    /// The session was ended before the start finished.
    #[error("analysis start cancelled")]
    Cancelled,
}
