//! WebSocket transport.
//!
//! Connects to `{ws-api}/ws/chat/{channel}` and yields every text frame.
//! While the connection is open the client sends a JSON ping every
//! `ping_interval` so idle proxies keep it alive; the backend answers with
//! `pong` events which the stream client ignores.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use super::{FrameStream, Transport, channel_segment};
use crate::error::TransportError;

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket adapter backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    ws_url: String,
    ping_interval: Duration,
}

impl WsTransport {
    /// `api_url` is the backend's http(s) base; the scheme is swapped for ws(s).
    pub fn new(api_url: &str) -> Self {
        Self {
            ws_url: to_ws_base(api_url.trim_end_matches('/')),
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn endpoint(&self, channel: &str) -> String {
        format!("{}/ws/chat/{}", self.ws_url, channel_segment(channel))
    }
}

fn to_ws_base(api_url: &str) -> String {
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_url.to_string()
    }
}

/// Aborts the ping task when the frame stream is dropped.
struct PingGuard(tokio::task::JoinHandle<()>);

impl Drop for PingGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        "ws"
    }

    fn open(&self, channel: &str) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let url = self.endpoint(channel);
        let ping_interval = self.ping_interval;
        Box::pin(async move {
            tracing::debug!(%url, "Opening WebSocket");
            let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str()).await?;
            let (mut sink, read) = ws.split();

            let ping = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(ping_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let ping = serde_json::json!({
                        "type": "ping",
                        "timestamp": chrono::Utc::now().to_rfc3339(),
                    });
                    if sink.send(Message::Text(ping.to_string())).await.is_err() {
                        break;
                    }
                }
            });
            let guard = PingGuard(ping);

            let frames = read
                .take_while(|item| futures::future::ready(!matches!(item, Ok(Message::Close(_)))))
                .filter_map(move |item| {
                    let _keep = &guard;
                    futures::future::ready(match item {
                        Ok(Message::Text(text)) => Some(Ok(text)),
                        Ok(_) => None,
                        Err(e) => Some(Err(TransportError::WebSocket(e))),
                    })
                });
            Ok(frames.boxed())
        })
    }
}
