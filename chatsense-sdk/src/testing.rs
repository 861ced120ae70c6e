//! Test doubles for driving the stream client and session deterministically.
//!
//! - [`ManualScheduler`]: timers only fire when the test says so.
//! - [`ScriptedTransport`]: opens succeed, fail or hang as scripted, and the
//!   test pushes frames into the open connection.
//! - [`FakeChannelApi`]: records backend calls, with switchable failures.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::api::AnalysisSummary;
use crate::error::{ApiError, TransportError};
use crate::event::Sentiment;
use crate::scheduler::{Scheduler, TimerHandle, TimerTask};
use crate::session::ChannelApi;
use crate::transport::{FrameStream, Transport};

/// Let spawned tasks run until they block again.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// JSON frame for a `message` event.
pub fn message_frame(username: &str, message: &str, sentiment: Sentiment) -> String {
    serde_json::json!({
        "type": "message",
        "data": { "username": username, "message": message, "sentiment": sentiment },
    })
    .to_string()
}

// ── ManualScheduler ─────────────────────────────────────────────

struct PendingTimer {
    delay: Duration,
    cancelled: Arc<AtomicBool>,
    task: TimerTask,
}

#[derive(Default)]
struct ManualInner {
    pending: VecDeque<PendingTimer>,
    history: Vec<Duration>,
}

/// Scheduler whose timers fire only through [`ManualScheduler::fire_next`].
#[derive(Clone, Default)]
pub struct ManualScheduler {
    inner: Arc<Mutex<ManualInner>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays of timers that are still armed, oldest first.
    pub fn pending_delays(&self) -> Vec<Duration> {
        self.inner
            .lock()
            .pending
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .map(|t| t.delay)
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.pending_delays().len()
    }

    /// Every delay ever scheduled, including cancelled ones.
    pub fn scheduled(&self) -> Vec<Duration> {
        self.inner.lock().history.clone()
    }

    /// Run the oldest armed timer. Returns false if none was armed.
    pub fn fire_next(&self) -> bool {
        let task = {
            let mut inner = self.inner.lock();
            loop {
                match inner.pending.pop_front() {
                    Some(t) if t.cancelled.load(Ordering::SeqCst) => continue,
                    Some(t) => break Some(t.task),
                    None => break None,
                }
            }
        };
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut inner = self.inner.lock();
        inner.history.push(delay);
        inner.pending.push_back(PendingTimer {
            delay,
            cancelled: cancelled.clone(),
            task,
        });
        TimerHandle::new(cancelled)
    }
}

// ── ScriptedTransport ───────────────────────────────────────────

/// What the next `open()` does.
#[derive(Debug, Clone)]
pub enum OpenPlan {
    Accept,
    Fail(String),
    /// Never resolves; exercises the open timeout.
    Hang,
}

type FrameSender = mpsc::UnboundedSender<Result<String, TransportError>>;

#[derive(Default)]
struct ScriptInner {
    plans: VecDeque<OpenPlan>,
    opened: Vec<String>,
    live: Option<FrameSender>,
}

/// In-memory transport. Opens follow the queued plans, then accept.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<ScriptInner>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_plan(&self, plan: OpenPlan) {
        self.inner.lock().plans.push_back(plan);
    }

    pub fn fail_next_opens(&self, n: usize, reason: &str) {
        let mut inner = self.inner.lock();
        for _ in 0..n {
            inner.plans.push_back(OpenPlan::Fail(reason.to_string()));
        }
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().opened.len()
    }

    pub fn opened_channels(&self) -> Vec<String> {
        self.inner.lock().opened.clone()
    }

    /// Whether the most recent connection is still open.
    pub fn is_open(&self) -> bool {
        self.inner
            .lock()
            .live
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Push a raw frame. Returns false if no connection is open.
    pub fn send_raw(&self, frame: &str) -> bool {
        match self.inner.lock().live.as_ref() {
            Some(tx) => tx.unbounded_send(Ok(frame.to_string())).is_ok(),
            None => false,
        }
    }

    pub fn send_json(&self, value: serde_json::Value) -> bool {
        self.send_raw(&value.to_string())
    }

    pub fn send_message(&self, username: &str, message: &str, sentiment: Sentiment) -> bool {
        self.send_raw(&message_frame(username, message, sentiment))
    }

    /// Break the open connection with an error.
    pub fn fail_stream(&self, reason: &str) {
        if let Some(tx) = self.inner.lock().live.take() {
            let _ = tx.unbounded_send(Err(TransportError::Other(reason.to_string())));
        }
    }

    /// End the open connection as if the server closed it.
    pub fn close_stream(&self) {
        self.inner.lock().live.take();
    }
}

impl Transport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn open(&self, channel: &str) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let mut inner = self.inner.lock();
        inner.opened.push(channel.to_string());
        match inner.plans.pop_front().unwrap_or(OpenPlan::Accept) {
            OpenPlan::Accept => {
                let (tx, rx) = mpsc::unbounded();
                inner.live = Some(tx);
                async move { Ok(rx.boxed()) }.boxed()
            }
            OpenPlan::Fail(reason) => async move { Err(TransportError::Other(reason)) }.boxed(),
            OpenPlan::Hang => futures::future::pending().boxed(),
        }
    }
}

// ── FakeChannelApi ──────────────────────────────────────────────

/// A backend call recorded by [`FakeChannelApi`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    StartChannel(String),
    StopChannel(String),
    LogAnalysisStart(String),
    SaveHistory(AnalysisSummary),
    Logout,
}

/// Backend stand-in. Canonical channel names are the last path segment of
/// the input, lowercased.
#[derive(Debug)]
pub struct FakeChannelApi {
    authenticated: AtomicBool,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    fail_audit: AtomicBool,
    start_gate: Mutex<Option<Arc<Notify>>>,
    calls: Mutex<Vec<ApiCall>>,
}

impl Default for FakeChannelApi {
    fn default() -> Self {
        Self {
            authenticated: AtomicBool::new(true),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            fail_audit: AtomicBool::new(false),
            start_gate: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeChannelApi {
    /// Logged in, every call succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_authenticated(&self, yes: bool) {
        self.authenticated.store(yes, Ordering::SeqCst);
    }

    pub fn fail_start(&self, yes: bool) {
        self.fail_start.store(yes, Ordering::SeqCst);
    }

    pub fn fail_stop(&self, yes: bool) {
        self.fail_stop.store(yes, Ordering::SeqCst);
    }

    pub fn fail_audit(&self, yes: bool) {
        self.fail_audit.store(yes, Ordering::SeqCst);
    }

    /// Make `start_channel` wait until the returned gate is notified.
    pub fn hold_starts(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.start_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: ApiCall) {
        self.calls.lock().push(call);
    }

    fn server_error(message: &str) -> ApiError {
        ApiError::Status {
            status: 500,
            message: message.to_string(),
        }
    }
}

impl ChannelApi for FakeChannelApi {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    async fn start_channel(&self, url: &str) -> Result<String, ApiError> {
        self.record(ApiCall::StartChannel(url.to_string()));
        let gate = self.start_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Self::server_error("bot failed to join"));
        }
        let name = url.trim_end_matches('/').rsplit('/').next().unwrap_or(url);
        Ok(name.to_lowercase())
    }

    async fn stop_channel(&self, channel: &str) -> Result<(), ApiError> {
        self.record(ApiCall::StopChannel(channel.to_string()));
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(Self::server_error("bot already gone"));
        }
        Ok(())
    }

    async fn log_analysis_start(&self, channel: &str) -> Result<(), ApiError> {
        self.record(ApiCall::LogAnalysisStart(channel.to_string()));
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(Self::server_error("Failed to log activity"));
        }
        Ok(())
    }

    async fn save_history(&self, summary: &AnalysisSummary) -> Result<String, ApiError> {
        self.record(ApiCall::SaveHistory(summary.clone()));
        Ok(format!("history-{}", summary.streamer_name))
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.record(ApiCall::Logout);
        self.authenticated.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn manual_scheduler_skips_cancelled_timers() {
        let sched = ManualScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = hits.clone();
        let first = sched.schedule(
            Duration::from_secs(1),
            Box::new(move || {
                h1.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let h2 = hits.clone();
        sched.schedule(
            Duration::from_secs(2),
            Box::new(move || {
                h2.fetch_add(10, Ordering::SeqCst);
            }),
        );
        first.cancel();
        assert_eq!(sched.pending_delays(), vec![Duration::from_secs(2)]);
        assert!(sched.fire_next());
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert!(!sched.fire_next());
        assert_eq!(sched.scheduled().len(), 2);
    }

    #[tokio::test]
    async fn scripted_transport_follows_plans() {
        let t = ScriptedTransport::new();
        t.push_plan(OpenPlan::Fail("refused".into()));
        assert!(t.open("a").await.is_err());

        let mut frames = t.open("a").await.unwrap();
        assert!(t.send_raw("x"));
        assert_eq!(frames.next().await.unwrap().unwrap(), "x");
        t.close_stream();
        assert!(frames.next().await.is_none());
        assert_eq!(t.open_count(), 2);
    }
}
