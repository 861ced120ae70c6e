//! Server-Sent Events transport.
//!
//! Opens `GET {api}/api/sse/chat/{channel}` and yields the `data` payload of
//! every dispatched event. Only the parts of the event-stream format the
//! backend uses are interpreted: `data` lines are joined with `\n`, a blank
//! line dispatches, comment lines and the `event`/`id`/`retry` fields are
//! ignored.
//!
//! A line or event larger than [`MAX_EVENT_LEN`] fails the stream with
//! [`TransportError::FrameTooLarge`] instead of buffering without bound.

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};

use super::{FrameStream, Transport, channel_segment};
use crate::error::TransportError;

/// Largest line, and largest joined `data` payload, the decoder accepts.
pub const MAX_EVENT_LEN: usize = 1024 * 1024;

/// SSE adapter backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct SseTransport {
    client: reqwest::Client,
    api_url: String,
}

impl SseTransport {
    pub fn new(api_url: &str) -> Self {
        Self::with_client(api_url, reqwest::Client::new())
    }

    /// Share an existing client, so the stream request carries the same
    /// session cookies as the REST calls.
    pub fn with_client(api_url: &str, client: reqwest::Client) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self, channel: &str) -> String {
        format!("{}/api/sse/chat/{}", self.api_url, channel_segment(channel))
    }
}

impl Transport for SseTransport {
    fn name(&self) -> &'static str {
        "sse"
    }

    fn open(&self, channel: &str) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let url = self.endpoint(channel);
        let client = self.client.clone();
        Box::pin(async move {
            tracing::debug!(%url, "Opening SSE stream");
            let resp = client
                .get(&url)
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache")
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                return Err(TransportError::Status(status.as_u16()));
            }
            if let Some(ct) = resp.headers().get(CONTENT_TYPE) {
                let ct = ct.to_str().unwrap_or("");
                if !ct.contains("text/event-stream") {
                    return Err(TransportError::ContentType(ct.to_string()));
                }
            }
            Ok(decode_frames(resp.bytes_stream()))
        })
    }
}

/// Turn a body byte stream into a stream of event payloads.
pub fn decode_frames<S, E>(body: S) -> FrameStream
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: Into<TransportError> + Send + 'static,
{
    let state = (Some(body.boxed()), SseDecoder::default(), VecDeque::new());
    futures::stream::unfold(state, |(mut body, mut decoder, mut ready)| async move {
        loop {
            if let Some(frame) = ready.pop_front() {
                return Some((Ok(frame), (body, decoder, ready)));
            }
            // An error ends the stream; the body is dropped with it.
            match body.as_mut()?.next().await {
                Some(Ok(chunk)) => match decoder.feed(&chunk) {
                    Ok(frames) => ready.extend(frames),
                    Err(e) => return Some((Err(e), (None, decoder, ready))),
                },
                Some(Err(e)) => return Some((Err(e.into()), (None, decoder, ready))),
                None => return None,
            }
        }
    })
    .boxed()
}

/// Incremental event-stream decoder.
#[derive(Debug)]
pub struct SseDecoder {
    buf: BytesMut,
    data: Option<String>,
    max_len: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_len(MAX_EVENT_LEN)
    }
}

impl SseDecoder {
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            data: None,
            max_len,
        }
    }

    /// Feed a chunk; returns the payloads of every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, TransportError> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some((end, skip)) = self.next_line_end() {
            let line = self.buf.split_to(end);
            self.buf.advance(skip);
            let line = std::str::from_utf8(&line).map_err(|_| TransportError::Utf8)?;
            if let Some(payload) = self.handle_line(line) {
                out.push(payload);
            }
            self.check_len(self.data.as_ref().map_or(0, String::len))?;
        }
        // Whatever is left is one unterminated line.
        self.check_len(self.buf.len())?;
        Ok(out)
    }

    fn check_len(&mut self, len: usize) -> Result<(), TransportError> {
        if len > self.max_len {
            self.buf.clear();
            self.data = None;
            return Err(TransportError::FrameTooLarge(self.max_len));
        }
        Ok(())
    }

    /// Position of the next line terminator and its length. A trailing `\r`
    /// is held back until we know whether `\n` follows.
    fn next_line_end(&self) -> Option<(usize, usize)> {
        let pos = self.buf.iter().position(|b| *b == b'\n' || *b == b'\r')?;
        if self.buf[pos] == b'\n' {
            return Some((pos, 1));
        }
        match self.buf.get(pos + 1) {
            Some(b'\n') => Some((pos, 2)),
            Some(_) => Some((pos, 1)),
            None => None,
        }
    }

    fn handle_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.data.take();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        if field == "data" {
            match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            }
        }
        None
    }
}
