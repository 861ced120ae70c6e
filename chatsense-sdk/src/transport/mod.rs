//! Transport adapters for the chat stream.
//!
//! A transport knows how to open one physical connection for a channel and
//! turn it into a stream of raw JSON frames. Reconnection, backoff and
//! decoding live in [`StreamClient`](crate::stream::StreamClient), so each
//! adapter only has to do the I/O.

pub mod sse;
pub mod websocket;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::error::TransportError;

pub use sse::SseTransport;
pub use websocket::WsTransport;

/// Raw frames read from an open connection.
///
/// The stream ending (`None`) means the peer closed the connection; an `Err`
/// item means it broke. Either way the connection is finished.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// Opens server-push connections for a channel.
pub trait Transport: Send + Sync + 'static {
    /// Short name for logs ("sse", "ws").
    fn name(&self) -> &'static str;

    /// Open a connection. Resolves once the handshake is done.
    fn open(&self, channel: &str) -> BoxFuture<'static, Result<FrameStream, TransportError>>;
}

/// Which adapter to build from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Sse,
    WebSocket,
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sse" => Ok(TransportKind::Sse),
            "ws" | "websocket" => Ok(TransportKind::WebSocket),
            other => Err(format!("unknown transport '{other}' (expected sse or ws)")),
        }
    }
}

impl TransportKind {
    /// Build the adapter for `api_url` (the backend's http(s) base URL).
    ///
    /// The SSE adapter reuses `client` so it sends the REST session cookies.
    pub fn build(self, api_url: &str, client: reqwest::Client) -> std::sync::Arc<dyn Transport> {
        match self {
            TransportKind::Sse => std::sync::Arc::new(SseTransport::with_client(api_url, client)),
            TransportKind::WebSocket => std::sync::Arc::new(WsTransport::new(api_url)),
        }
    }
}

const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'_').remove(b'-').remove(b'.');

/// Percent-encode a channel name for use as a path segment.
pub(crate) fn channel_segment(channel: &str) -> String {
    utf8_percent_encode(channel, PATH_SEGMENT).to_string()
}
