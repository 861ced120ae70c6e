//! Running sentiment aggregates for one analysis session.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::Serialize;

use crate::event::{ChatSentimentEvent, Sentiment};

/// Label that selects every message in [`SentimentTally::filtered`].
pub const ALL_LABEL: &str = "All";

/// Shown when a sentiment has no contributors yet.
pub const NO_CONTRIBUTOR: &str = "-";

/// Messages seen per sentiment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SentimentCounts {
    pub positive: u64,
    pub neutral: u64,
    pub negative: u64,
}

impl SentimentCounts {
    pub fn get(&self, sentiment: Sentiment) -> u64 {
        match sentiment {
            Sentiment::Positive => self.positive,
            Sentiment::Neutral => self.neutral,
            Sentiment::Negative => self.negative,
        }
    }

    pub fn total(&self) -> u64 {
        self.positive + self.neutral + self.negative
    }

    fn increment(&mut self, sentiment: Sentiment) {
        match sentiment {
            Sentiment::Positive => self.positive += 1,
            Sentiment::Neutral => self.neutral += 1,
            Sentiment::Negative => self.negative += 1,
        }
    }
}

/// Per-sentiment message counts for each user, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserSentiments {
    pub positive: IndexMap<String, u64>,
    pub neutral: IndexMap<String, u64>,
    pub negative: IndexMap<String, u64>,
}

impl UserSentiments {
    pub fn get(&self, sentiment: Sentiment) -> &IndexMap<String, u64> {
        match sentiment {
            Sentiment::Positive => &self.positive,
            Sentiment::Neutral => &self.neutral,
            Sentiment::Negative => &self.negative,
        }
    }

    fn get_mut(&mut self, sentiment: Sentiment) -> &mut IndexMap<String, u64> {
        match sentiment {
            Sentiment::Positive => &mut self.positive,
            Sentiment::Neutral => &mut self.neutral,
            Sentiment::Negative => &mut self.negative,
        }
    }

    /// Users with at least one message of `sentiment`.
    pub fn user_count(&self, sentiment: Sentiment) -> usize {
        self.get(sentiment).len()
    }
}

/// A user and how many messages they sent with a given sentiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contributor {
    pub username: String,
    pub count: u64,
}

/// Deduplicated message log plus the aggregates derived from it.
#[derive(Debug, Clone, Default)]
pub struct SentimentTally {
    messages: Vec<ChatSentimentEvent>,
    seen: HashSet<String>,
    counts: SentimentCounts,
    users: UserSentiments,
}

impl SentimentTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one message in. Returns false if it was already counted.
    pub fn ingest(&mut self, event: ChatSentimentEvent) -> bool {
        if !self.seen.insert(event.dedup_key()) {
            return false;
        }
        self.counts.increment(event.sentiment);
        *self
            .users
            .get_mut(event.sentiment)
            .entry(event.username.clone())
            .or_insert(0) += 1;
        self.messages.push(event);
        true
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[ChatSentimentEvent] {
        &self.messages
    }

    pub fn counts(&self) -> SentimentCounts {
        self.counts
    }

    pub fn users(&self) -> &UserSentiments {
        &self.users
    }

    /// The `n` users with the most `sentiment` messages, highest first.
    ///
    /// Equal counts keep first-seen order.
    pub fn top_contributors(&self, sentiment: Sentiment, n: usize) -> Vec<Contributor> {
        let mut ranked: Vec<(&String, &u64)> = self.users.get(sentiment).iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1));
        ranked
            .into_iter()
            .take(n)
            .map(|(username, count)| Contributor {
                username: username.clone(),
                count: *count,
            })
            .collect()
    }

    /// The user with the most `sentiment` messages, or `("-", 0)`.
    pub fn top_contributor(&self, sentiment: Sentiment) -> (String, u64) {
        self.top_contributors(sentiment, 1)
            .into_iter()
            .next()
            .map_or_else(|| (NO_CONTRIBUTOR.to_string(), 0), |c| (c.username, c.count))
    }

    /// Messages whose sentiment matches `label`, in arrival order.
    ///
    /// [`ALL_LABEL`] returns the whole log. Unknown labels match nothing.
    pub fn filtered(&self, label: &str) -> Vec<ChatSentimentEvent> {
        if label.trim().eq_ignore_ascii_case(ALL_LABEL) {
            return self.messages.clone();
        }
        let Ok(sentiment) = label.parse::<Sentiment>() else {
            return Vec::new();
        };
        self.messages
            .iter()
            .filter(|m| m.sentiment == sentiment)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(user: &str, text: &str, sentiment: Sentiment) -> ChatSentimentEvent {
        ChatSentimentEvent::new(user, text, sentiment)
    }

    #[test]
    fn duplicate_is_counted_once() {
        let mut t = SentimentTally::new();
        assert!(t.ingest(msg("a", "hi", Sentiment::Positive)));
        assert!(!t.ingest(msg("a", "hi", Sentiment::Positive)));
        assert_eq!(t.counts().positive, 1);
        assert_eq!(t.users().positive.get("a"), Some(&1));
        assert_eq!(t.messages().len(), 1);
    }

    #[test]
    fn top_contributor_defaults_and_ties() {
        let mut t = SentimentTally::new();
        assert_eq!(t.top_contributor(Sentiment::Neutral), ("-".to_string(), 0));

        t.ingest(msg("first", "x", Sentiment::Neutral));
        t.ingest(msg("second", "y", Sentiment::Neutral));
        assert_eq!(t.top_contributor(Sentiment::Neutral), ("first".to_string(), 1));

        t.ingest(msg("second", "z", Sentiment::Neutral));
        assert_eq!(t.top_contributor(Sentiment::Neutral), ("second".to_string(), 2));
    }

    #[test]
    fn top_contributors_limits_and_orders() {
        let mut t = SentimentTally::new();
        for (i, user) in ["a", "b", "b", "c", "c", "c"].iter().enumerate() {
            t.ingest(msg(user, &format!("m{i}"), Sentiment::Negative));
        }
        let top: Vec<_> = t
            .top_contributors(Sentiment::Negative, 2)
            .into_iter()
            .map(|c| (c.username, c.count))
            .collect();
        assert_eq!(top, vec![("c".to_string(), 3), ("b".to_string(), 2)]);
    }

    #[test]
    fn filter_by_label() {
        let mut t = SentimentTally::new();
        t.ingest(msg("a", "1", Sentiment::Negative));
        t.ingest(msg("b", "2", Sentiment::Positive));
        t.ingest(msg("c", "3", Sentiment::Negative));

        assert_eq!(t.filtered("All").len(), 3);
        assert_eq!(t.filtered("all").len(), 3);
        let neg: Vec<_> = t.filtered("NEGATIVE").into_iter().map(|m| m.username).collect();
        assert_eq!(neg, vec!["a", "c"]);
        assert!(t.filtered("angry").is_empty());
    }

    #[test]
    fn reset_clears_everything() {
        let mut t = SentimentTally::new();
        t.ingest(msg("a", "hi", Sentiment::Positive));
        t.reset();
        assert!(t.is_empty());
        assert_eq!(t.counts(), SentimentCounts::default());
        assert_eq!(t.users(), &UserSentiments::default());
        assert!(t.ingest(msg("a", "hi", Sentiment::Positive)));
    }
}
