//! Client SDK for the chatsense live chat sentiment backend.
//!
//! The [`stream::StreamClient`] keeps one server-push subscription alive
//! across network failures (exponential backoff with jitter, bounded
//! retries). The [`session::AnalysisSession`] drives it for one channel and
//! folds delivered messages into deduplicated sentiment aggregates.

pub mod aggregate;
pub mod api;
pub mod backoff;
pub mod error;
pub mod event;
pub mod scheduler;
pub mod session;
pub mod stream;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use aggregate::{Contributor, SentimentCounts, SentimentTally, UserSentiments};
pub use api::{AnalysisSummary, ApiClient, HistoryEntry, User};
pub use backoff::{RetryPolicy, RetryState};
pub use error::{ApiError, SessionError, StreamError, TransportError};
pub use event::{ChatSentimentEvent, InboundEvent, Sentiment};
pub use session::{AnalysisSession, ChannelApi};
pub use stream::{ConnectionState, ConnectionStatus, StreamClient, StreamHandle, SubscriptionTarget};
pub use transport::{Transport, TransportKind};
