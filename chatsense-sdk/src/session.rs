//! Sentiment analysis session.
//!
//! [`AnalysisSession`] ties one [`StreamClient`] to a [`SentimentTally`]:
//! starting a session asks the backend to begin reading the channel, then
//! subscribes to its stream and folds every delivered message into the
//! tally. The tally survives reconnects (so redelivered messages are
//! deduplicated) and is cleared when the session ends.
//!
//! Every start and end bumps an epoch. A start whose backend call returns
//! after the epoch moved on undoes itself instead of connecting, so
//! `end_session()` wins over a start that is still in flight.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::aggregate::{Contributor, SentimentCounts, SentimentTally, UserSentiments};
use crate::api::AnalysisSummary;
use crate::error::{ApiError, SessionError};
use crate::event::{ChatSentimentEvent, Sentiment};
use crate::stream::{ConnectionStatus, StreamClient, StreamHandle, SubscriptionTarget};

/// Contributors kept per sentiment in a saved summary.
pub const SUMMARY_TOP_N: usize = 5;

/// Backend calls the session needs.
///
/// [`ApiClient`](crate::api::ApiClient) is the production implementation.
pub trait ChannelApi: Send + Sync + 'static {
    /// Whether a user is logged in. Checked locally, no network.
    fn is_authenticated(&self) -> bool;

    /// Begin producing chat for a channel name or URL. Idempotent; returns
    /// the canonical channel name.
    fn start_channel(&self, url: &str) -> impl Future<Output = Result<String, ApiError>> + Send;

    fn stop_channel(&self, channel: &str) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn log_analysis_start(&self, channel: &str) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn save_history(
        &self,
        summary: &AnalysisSummary,
    ) -> impl Future<Output = Result<String, ApiError>> + Send;

    fn logout(&self) -> impl Future<Output = Result<(), ApiError>> + Send;
}

#[derive(Debug, Default)]
struct SessionState {
    tally: SentimentTally,
    channel: Option<String>,
    started_at: Option<DateTime<Utc>>,
    epoch: u64,
}

impl SessionState {
    fn reset(&mut self) {
        self.tally.reset();
        self.channel = None;
        self.started_at = None;
    }
}

/// One user's live analysis of one channel at a time.
pub struct AnalysisSession<A: ChannelApi> {
    api: Arc<A>,
    stream: StreamClient,
    state: Arc<Mutex<SessionState>>,
}

impl<A: ChannelApi> AnalysisSession<A> {
    pub fn new(api: Arc<A>, stream: StreamClient) -> Self {
        Self {
            api,
            stream,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    pub fn stream(&self) -> &StreamClient {
        &self.stream
    }

    /// Start analysing `channel` (a name or a Twitch URL).
    ///
    /// Ends the current session first if there is one. Backend errors are
    /// returned as-is and nothing is retried.
    pub async fn start_session(&self, channel: &str) -> Result<StreamHandle, SessionError> {
        if !self.api.is_authenticated() {
            return Err(SessionError::Unauthenticated);
        }
        if self.is_active() {
            self.end_session().await;
        }
        let epoch = {
            let mut state = self.state.lock();
            state.reset();
            state.epoch += 1;
            state.epoch
        };

        let channel = self.api.start_channel(channel).await?;
        let stale = {
            let mut state = self.state.lock();
            if state.epoch == epoch {
                state.channel = Some(channel.clone());
                state.started_at = Some(Utc::now());
                None
            } else {
                // A newer start owns the backend channel if it is the same one.
                Some(state.channel.as_deref() != Some(channel.as_str()))
            }
        };
        if let Some(stop_remote) = stale {
            info!(%channel, "Session ended while starting, not connecting");
            if stop_remote {
                self.stop_remote(&channel).await;
            }
            return Err(SessionError::Cancelled);
        }
        info!(%channel, "Analysis session started");

        let api = self.api.clone();
        let audit_channel = channel.clone();
        tokio::spawn(async move {
            if let Err(e) = api.log_analysis_start(&audit_channel).await {
                warn!(channel = %audit_channel, error = %e, "Failed to log analysis start");
            }
        });

        let state = self.state.clone();
        let ended = self.state.clone();
        let target = SubscriptionTarget::new(&channel, move |event| {
            ingest(&state, event);
        })
        .on_ended(move || {
            let mut state = ended.lock();
            if state.epoch == epoch {
                info!(channel = ?state.channel, "Backend ended the analysis session");
                state.reset();
                state.epoch += 1;
            }
        });
        let handle = self.stream.connect(target);

        // end_session() may have run between the check above and connect().
        if self.state.lock().epoch != epoch {
            self.stream.disconnect();
            return Err(SessionError::Cancelled);
        }
        Ok(handle)
    }

    /// Fold one message into the tally. Returns false for a duplicate.
    pub fn process_message(&self, event: ChatSentimentEvent) -> bool {
        ingest(&self.state, event)
    }

    /// Stop the stream and clear all aggregates. Never fails.
    ///
    /// Also cancels a `start_session()` that is still waiting on the backend.
    pub async fn end_session(&self) {
        let (channel, epoch) = {
            let mut state = self.state.lock();
            state.epoch += 1;
            (state.channel.clone(), state.epoch)
        };
        self.stream.disconnect();
        if let Some(channel) = &channel
            && self.stop_remote(channel).await
        {
            info!(%channel, "Analysis session ended");
        }
        let mut state = self.state.lock();
        if state.epoch == epoch {
            state.reset();
        }
    }

    /// Best-effort backend stop. Returns whether the backend acknowledged it.
    async fn stop_remote(&self, channel: &str) -> bool {
        match self.api.stop_channel(channel).await {
            Ok(()) => true,
            Err(e) => {
                warn!(%channel, error = %e, "Failed to stop channel on backend");
                false
            }
        }
    }

    /// Force the stream to reconnect. Aggregates are kept.
    pub fn reconnect(&self) {
        self.stream.reconnect();
    }

    /// End any active session, then log out.
    pub async fn logout(&self) -> Result<(), SessionError> {
        if self.is_active() {
            self.end_session().await;
        }
        self.api.logout().await?;
        Ok(())
    }

    /// Build the history payload for the current session.
    pub fn summary(&self) -> Option<AnalysisSummary> {
        let state = self.state.lock();
        let channel = state.channel.clone()?;
        let tally = &state.tally;
        Some(AnalysisSummary {
            streamer_name: channel,
            total_chats: tally.messages().len() as u64,
            sentiment_count: tally.counts(),
            top_positive: tally.top_contributors(Sentiment::Positive, SUMMARY_TOP_N),
            top_negative: tally.top_contributors(Sentiment::Negative, SUMMARY_TOP_N),
            top_neutral: tally.top_contributors(Sentiment::Neutral, SUMMARY_TOP_N),
            duration: state
                .started_at
                .map(|start| (Utc::now() - start).num_seconds().max(0)),
        })
    }

    /// Save the current session to the backend's history.
    pub async fn save_history(&self) -> Result<String, SessionError> {
        let summary = self.summary().ok_or(SessionError::NoSession)?;
        let id = self.api.save_history(&summary).await?;
        info!(channel = %summary.streamer_name, total = summary.total_chats, "Analysis saved");
        Ok(id)
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().channel.is_some()
    }

    pub fn channel(&self) -> Option<String> {
        self.state.lock().channel.clone()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().started_at
    }

    pub fn status(&self) -> ConnectionStatus {
        self.stream.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.stream.watch_status()
    }

    pub fn messages(&self) -> Vec<ChatSentimentEvent> {
        self.state.lock().tally.messages().to_vec()
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().tally.messages().len()
    }

    pub fn counts(&self) -> SentimentCounts {
        self.state.lock().tally.counts()
    }

    pub fn user_sentiments(&self) -> UserSentiments {
        self.state.lock().tally.users().clone()
    }

    pub fn top_contributor(&self, sentiment: Sentiment) -> (String, u64) {
        self.state.lock().tally.top_contributor(sentiment)
    }

    pub fn top_contributors(&self, sentiment: Sentiment, n: usize) -> Vec<Contributor> {
        self.state.lock().tally.top_contributors(sentiment, n)
    }

    /// Top contributor for each sentiment, in [`Sentiment::ALL`] order.
    pub fn top_users(&self) -> [(Sentiment, (String, u64)); 3] {
        let state = self.state.lock();
        Sentiment::ALL.map(|s| (s, state.tally.top_contributor(s)))
    }

    pub fn filtered_messages(&self, label: &str) -> Vec<ChatSentimentEvent> {
        self.state.lock().tally.filtered(label)
    }
}

fn ingest(state: &Mutex<SessionState>, event: ChatSentimentEvent) -> bool {
    let mut state = state.lock();
    let fresh = state.tally.ingest(event);
    if !fresh {
        debug!(channel = ?state.channel, "Skipping duplicate message");
    }
    fresh
}
