//! Reconnecting stream client.
//!
//! [`StreamClient`] keeps one subscription to a channel's chat stream alive.
//! It opens the connection through a [`Transport`], decodes frames into
//! [`InboundEvent`]s, hands `message` events to the subscriber and, when the
//! connection fails, retries with the backoff described by [`RetryPolicy`].
//! A `disconnect` event from the backend ends the subscription without a
//! retry.
//!
//! ## Generations
//!
//! Every physical connection attempt gets a new generation number. Reader
//! tasks and reconnect timers remember the generation they were started for
//! and do nothing once it is no longer current, so a late frame or timer from
//! a torn-down connection can never deliver a message or change state after
//! `disconnect()` / `connect()` returned.
//!
//! ## Callbacks
//!
//! The subscriber callback runs on the reader task while the client's state
//! lock is held. It must not call back into the same `StreamClient`
//! synchronously.

use std::fmt;
use std::sync::{Arc, Weak};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::{RetryPolicy, RetryState};
use crate::error::{StreamError, TransportError};
use crate::event::{ChatSentimentEvent, InboundEvent};
use crate::scheduler::{Scheduler, TimerHandle, TokioScheduler};
use crate::transport::Transport;

/// Connection lifecycle of a [`StreamClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retries exhausted. Needs an explicit `connect()` or `reconnect()`.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What consumers observe: the state plus the last error worth showing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<StreamError>,
}

/// Callback invoked for every `message` event.
pub type MessageHandler = Arc<dyn Fn(ChatSentimentEvent) + Send + Sync>;

/// Callback invoked once when the backend ends the subscription.
pub type EndHandler = Arc<dyn Fn() + Send + Sync>;

/// The channel to subscribe to and who receives its messages.
#[derive(Clone)]
pub struct SubscriptionTarget {
    pub channel: String,
    pub on_message: MessageHandler,
    pub on_ended: Option<EndHandler>,
}

impl SubscriptionTarget {
    pub fn new<F>(channel: &str, on_message: F) -> Self
    where
        F: Fn(ChatSentimentEvent) + Send + Sync + 'static,
    {
        Self {
            channel: channel.to_string(),
            on_message: Arc::new(on_message),
            on_ended: None,
        }
    }

    /// Also call `on_ended` when a `disconnect` event arrives for this
    /// channel. Runs under the client's lock, like `on_message`.
    pub fn on_ended<F>(mut self, on_ended: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_ended = Some(Arc::new(on_ended));
        self
    }
}

impl fmt::Debug for SubscriptionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionTarget")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Handle to the transport task started by [`StreamClient::connect`].
#[derive(Debug, Clone)]
pub struct StreamHandle {
    generation: u64,
    channel: String,
    task: AbortHandle,
}

impl StreamHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// True once this particular connection attempt has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// A reconnecting subscription to one channel's chat stream.
///
/// Cheap to clone; clones share the same connection. Dropping the last clone
/// cancels any pending timer and closes the transport. Must be used from
/// within a tokio runtime.
#[derive(Clone)]
pub struct StreamClient {
    shared: Arc<Shared>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    policy: RetryPolicy,
    status_tx: watch::Sender<ConnectionStatus>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    generation: u64,
    target: Option<SubscriptionTarget>,
    attempt: u32,
    timer: Option<TimerHandle>,
    task: Option<AbortHandle>,
}

impl Inner {
    /// Invalidate everything started for the current generation.
    fn teardown(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.inner.get_mut().teardown();
    }
}

impl StreamClient {
    /// Create a client with the default policy and the tokio scheduler.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_scheduler(transport, RetryPolicy::default(), Arc::new(TokioScheduler))
    }

    pub fn with_policy(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self::with_scheduler(transport, policy, Arc::new(TokioScheduler))
    }

    pub fn with_scheduler(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        Self {
            shared: Arc::new(Shared {
                transport,
                scheduler,
                policy,
                status_tx,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Subscribe to `target.channel`, replacing any previous subscription.
    pub fn connect(&self, target: SubscriptionTarget) -> StreamHandle {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        inner.teardown();
        inner.attempt = 0;
        inner.target = Some(target.clone());
        let generation = inner.generation;

        info!(channel = %target.channel, transport = shared.transport.name(), "Connecting to chat stream");
        shared.publish(ConnectionState::Connecting, None);

        let task = tokio::spawn(drive(Arc::downgrade(shared), generation, target.channel.clone()))
            .abort_handle();
        inner.task = Some(task.clone());
        StreamHandle {
            generation,
            channel: target.channel,
            task,
        }
    }

    /// Drop the subscription. Safe to call at any time.
    pub fn disconnect(&self) {
        let mut inner = self.shared.inner.lock();
        let was_active = inner.target.is_some() || inner.timer.is_some() || inner.task.is_some();
        inner.teardown();
        inner.target = None;
        inner.attempt = 0;
        self.shared.publish(ConnectionState::Disconnected, None);
        if was_active {
            info!("Disconnected from chat stream");
        }
    }

    /// Disconnect, then resubscribe to the same target after the grace delay.
    ///
    /// Does nothing when there is no subscription to restore.
    pub fn reconnect(&self) {
        let Some(target) = self.shared.inner.lock().target.clone() else {
            debug!("Reconnect requested with no subscription, ignoring");
            return;
        };
        self.disconnect();

        let mut inner = self.shared.inner.lock();
        let generation = inner.generation;
        let grace = self.shared.policy.reconnect_grace;
        let weak = Arc::downgrade(&self.shared);
        info!(channel = %target.channel, grace_ms = grace.as_millis() as u64, "Reconnect requested");
        inner.timer = Some(self.shared.scheduler.schedule(
            grace,
            Box::new(move || {
                let Some(shared) = weak.upgrade() else { return };
                if shared.inner.lock().generation != generation {
                    return;
                }
                StreamClient { shared }.connect(target);
            }),
        ));
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status_tx.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status_tx.borrow().state
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Channel of the current subscription, if any.
    pub fn channel(&self) -> Option<String> {
        self.shared.inner.lock().target.as_ref().map(|t| t.channel.clone())
    }

    pub fn retry_state(&self) -> RetryState {
        let inner = self.shared.inner.lock();
        RetryState {
            attempt: inner.attempt,
            max_attempts: self.shared.policy.max_attempts,
            base_delay: self.shared.policy.base_delay,
            max_delay: self.shared.policy.max_delay,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.shared.policy
    }
}

impl Shared {
    fn publish(&self, state: ConnectionState, last_error: Option<StreamError>) {
        self.status_tx.send_replace(ConnectionStatus { state, last_error });
    }

    /// Open succeeded. Returns false if the attempt is stale.
    fn on_open(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        inner.attempt = 0;
        if let Some(target) = &inner.target {
            info!(channel = %target.channel, "Chat stream connected");
        }
        self.publish(ConnectionState::Connected, None);
        true
    }

    /// Decode one frame and deliver it. Returns false if the attempt is stale
    /// or the subscription just ended.
    fn on_frame(&self, generation: u64, frame: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        let Some(target) = inner.target.as_ref() else {
            return false;
        };
        match InboundEvent::parse(frame) {
            Ok(InboundEvent::Message { data }) => (target.on_message)(data),
            Ok(InboundEvent::Connection { channel }) => {
                debug!(channel = ?channel, "Stream subscription confirmed");
            }
            Ok(InboundEvent::Heartbeat { .. }) => trace!(channel = %target.channel, "Heartbeat"),
            Ok(InboundEvent::Pong { .. }) => trace!(channel = %target.channel, "Pong"),
            Ok(InboundEvent::Disconnect { channel }) => {
                if channel.as_deref().is_some_and(|c| !c.eq_ignore_ascii_case(&target.channel)) {
                    debug!(channel = ?channel, "Ignoring disconnect for another channel");
                    return true;
                }
                info!(channel = %target.channel, "Backend stopped reading chat, ending subscription");
                let on_ended = target.on_ended.clone();
                // The reader task is the caller; it exits when we return false.
                inner.task = None;
                inner.teardown();
                inner.target = None;
                inner.attempt = 0;
                self.publish(ConnectionState::Disconnected, Some(StreamError::EndedByBackend));
                if let Some(on_ended) = on_ended {
                    on_ended();
                }
                return false;
            }
            Err(e) => {
                warn!(channel = %target.channel, error = %e, "Dropping malformed stream event");
            }
        }
        true
    }

    /// The attempt for `generation` failed; schedule a retry or give up.
    fn on_failure(self: &Arc<Self>, generation: u64, err: StreamError) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        inner.task = None;
        let Some(channel) = inner.target.as_ref().map(|t| t.channel.clone()) else {
            return;
        };

        if inner.attempt >= self.policy.max_attempts {
            error!(
                %channel,
                attempts = self.policy.max_attempts,
                error = %err,
                "Max reconnect attempts exceeded"
            );
            self.publish(
                ConnectionState::Failed,
                Some(StreamError::RetriesExhausted {
                    attempts: self.policy.max_attempts,
                }),
            );
            return;
        }

        let delay = self.policy.delay_for(inner.attempt);
        inner.attempt += 1;
        warn!(
            %channel,
            error = %err,
            attempt = inner.attempt,
            delay_ms = delay.as_millis() as u64,
            "Chat stream reconnecting after backoff"
        );
        self.publish(ConnectionState::Reconnecting, Some(err));

        let weak = Arc::downgrade(self);
        inner.timer = Some(self.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.retry(generation);
                }
            }),
        ));
    }

    /// Backoff timer fired: open a fresh connection for the same target.
    fn retry(self: &Arc<Self>, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        let Some(channel) = inner.target.as_ref().map(|t| t.channel.clone()) else {
            return;
        };
        inner.timer = None;
        inner.generation += 1;
        let generation = inner.generation;
        debug!(%channel, attempt = inner.attempt, "Retrying chat stream");
        // Keep the error visible while the retry is in flight.
        let last_error = self.status_tx.borrow().last_error.clone();
        self.publish(ConnectionState::Connecting, last_error);
        inner.task = Some(tokio::spawn(drive(Arc::downgrade(self), generation, channel)).abort_handle());
    }
}

/// One physical connection: open, pump frames, report how it ended.
async fn drive(weak: Weak<Shared>, generation: u64, channel: String) {
    let (open, open_timeout) = {
        let Some(shared) = weak.upgrade() else { return };
        (shared.transport.open(&channel), shared.policy.open_timeout)
    };

    let opened = match tokio::time::timeout(open_timeout, open).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(open_timeout)),
    };

    let mut frames = match opened {
        Ok(frames) => frames,
        Err(e) => {
            if let Some(shared) = weak.upgrade() {
                shared.on_failure(generation, StreamError::OpenFailed(e.to_string()));
            }
            return;
        }
    };

    match weak.upgrade() {
        Some(shared) if shared.on_open(generation) => {}
        _ => return,
    }

    let reason = loop {
        let item = frames.next().await;
        let Some(shared) = weak.upgrade() else { return };
        match item {
            Some(Ok(frame)) => {
                if !shared.on_frame(generation, &frame) {
                    return;
                }
            }
            Some(Err(e)) => break e.to_string(),
            None => break "stream closed by server".to_string(),
        }
    };

    if let Some(shared) = weak.upgrade() {
        shared.on_failure(generation, StreamError::ConnectionLost(reason));
    }
}
