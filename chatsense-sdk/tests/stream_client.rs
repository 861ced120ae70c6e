//! Stream client lifecycle tests.
//!
//! Tests cover:
//! - Delivery of message events and silent handling of control events
//! - Exponential backoff schedule and the bounded retry limit
//! - Retry counter reset after a successful open
//! - Cancellation: disconnect/connect invalidate timers and readers
//! - Forced reconnect after the grace delay
//! - Open timeout entering the backoff path
//! - Backend `disconnect` events ending the subscription
//! - Warn/error log events on the retry path

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Registry;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use chatsense_sdk::testing::{ManualScheduler, OpenPlan, ScriptedTransport, settle};
use chatsense_sdk::{
    ChatSentimentEvent, ConnectionState, RetryPolicy, Sentiment, StreamClient, StreamError,
    SubscriptionTarget,
};

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_jitter: Duration::ZERO,
        ..Default::default()
    }
}

fn make_client(policy: RetryPolicy) -> (StreamClient, ScriptedTransport, ManualScheduler) {
    let transport = ScriptedTransport::new();
    let scheduler = ManualScheduler::new();
    let client = StreamClient::with_scheduler(
        Arc::new(transport.clone()),
        policy,
        Arc::new(scheduler.clone()),
    );
    (client, transport, scheduler)
}

fn recording_target(channel: &str) -> (SubscriptionTarget, Arc<Mutex<Vec<ChatSentimentEvent>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let target = SubscriptionTarget::new(channel, move |event| sink.lock().push(event));
    (target, received)
}

async fn wait_state(client: &StreamClient, state: ConnectionState) {
    let mut rx = client.watch_status();
    tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .unwrap();
}

fn secs(list: &[u64]) -> Vec<Duration> {
    list.iter().map(|s| Duration::from_secs(*s)).collect()
}

#[tokio::test]
async fn delivers_messages_and_swallows_control_events() {
    let (client, transport, scheduler) = make_client(policy());
    let (target, received) = recording_target("shroud");

    let handle = client.connect(target);
    assert_eq!(handle.channel(), "shroud");
    wait_state(&client, ConnectionState::Connected).await;

    transport.send_json(json!({"type": "connection", "channel": "shroud"}));
    transport.send_json(json!({"type": "heartbeat", "timestamp": "2024-05-01T12:00:00"}));
    transport.send_json(json!({"type": "pong"}));
    transport.send_raw("this is not json");
    transport.send_json(json!({"type": "message", "data": {"username": "a", "message": "no label"}}));
    transport.send_message("a", "hi", Sentiment::Positive);
    transport.send_message("b", "meh", Sentiment::Neutral);
    settle().await;

    let got: Vec<_> = received.lock().iter().map(|e| e.username.clone()).collect();
    assert_eq!(got, vec!["a", "b"]);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(transport.opened_channels(), vec!["shroud"]);
}

#[tokio::test]
async fn backoff_doubles_then_gives_up() {
    let (client, transport, scheduler) = make_client(policy());
    transport.fail_next_opens(50, "connection refused");
    let (target, _) = recording_target("shroud");

    client.connect(target);
    for _ in 0..10 {
        settle().await;
        assert_eq!(client.state(), ConnectionState::Reconnecting);
        assert_eq!(scheduler.pending(), 1);
        assert!(scheduler.fire_next());
    }
    settle().await;

    assert_eq!(
        scheduler.scheduled(),
        secs(&[1, 2, 4, 8, 16, 30, 30, 30, 30, 30])
    );
    let status = client.status();
    assert_eq!(status.state, ConnectionState::Failed);
    assert_eq!(status.last_error, Some(StreamError::RetriesExhausted { attempts: 10 }));
    assert_eq!(scheduler.pending(), 0, "no timer after giving up");
    assert_eq!(transport.open_count(), 11);
    assert_eq!(client.retry_state().remaining(), 0);
}

#[tokio::test]
async fn reconnecting_status_carries_the_error() {
    let (client, transport, _scheduler) = make_client(policy());
    transport.fail_next_opens(1, "dns failure");
    let (target, _) = recording_target("shroud");

    client.connect(target);
    settle().await;

    let status = client.status();
    assert_eq!(status.state, ConnectionState::Reconnecting);
    let err = status.last_error.expect("error is reported");
    assert_eq!(err.kind(), "open-failed");
    assert!(err.to_string().contains("dns failure"));
    assert_eq!(client.retry_state().attempt, 1);
}

#[tokio::test]
async fn successful_open_resets_the_retry_counter() {
    let (client, transport, scheduler) = make_client(policy());
    let (target, _) = recording_target("shroud");

    client.connect(target);
    wait_state(&client, ConnectionState::Connected).await;

    transport.fail_stream("reset by peer");
    settle().await;
    assert_eq!(client.state(), ConnectionState::Reconnecting);
    assert_eq!(client.status().last_error.map(|e| e.kind()), Some("connection-lost"));

    assert!(scheduler.fire_next());
    wait_state(&client, ConnectionState::Connected).await;
    assert_eq!(client.retry_state().attempt, 0);
    assert_eq!(client.status().last_error, None);

    transport.fail_stream("reset again");
    settle().await;
    assert_eq!(scheduler.scheduled(), secs(&[1, 1]));
}

#[tokio::test]
async fn server_close_is_a_lost_connection() {
    let (client, transport, scheduler) = make_client(policy());
    let (target, _) = recording_target("shroud");

    client.connect(target);
    wait_state(&client, ConnectionState::Connected).await;
    transport.close_stream();
    settle().await;

    assert_eq!(client.state(), ConnectionState::Reconnecting);
    assert!(matches!(client.status().last_error, Some(StreamError::ConnectionLost(_))));
    assert_eq!(scheduler.pending(), 1);
}

#[tokio::test]
async fn disconnect_right_after_connect_delivers_nothing() {
    let (client, transport, scheduler) = make_client(policy());
    let (target, received) = recording_target("shroud");

    client.connect(target);
    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    settle().await;
    transport.send_message("a", "late", Sentiment::Positive);
    transport.fail_stream("late failure");
    settle().await;

    assert!(received.lock().is_empty());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(client.channel(), None);
}

#[tokio::test]
async fn disconnect_stops_an_open_connection() {
    let (client, transport, _scheduler) = make_client(policy());
    let (target, received) = recording_target("shroud");

    client.connect(target);
    wait_state(&client, ConnectionState::Connected).await;
    client.disconnect();
    settle().await;

    assert!(!transport.is_open());
    assert!(!transport.send_message("a", "after", Sentiment::Negative));
    assert!(received.lock().is_empty());

    // Second call is a no-op.
    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_cancels_the_pending_retry() {
    let (client, transport, scheduler) = make_client(policy());
    transport.fail_next_opens(1, "refused");
    let (target, _) = recording_target("shroud");

    client.connect(target);
    settle().await;
    assert_eq!(scheduler.pending(), 1);

    client.disconnect();
    assert_eq!(scheduler.pending(), 0);
    assert!(!scheduler.fire_next());
    settle().await;
    assert_eq!(transport.open_count(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.retry_state().attempt, 0);
}

#[tokio::test]
async fn connect_replaces_the_previous_subscription() {
    let (client, transport, scheduler) = make_client(policy());
    transport.fail_next_opens(1, "refused");
    let (first, first_rx) = recording_target("first");
    let (second, second_rx) = recording_target("second");

    client.connect(first);
    settle().await;
    assert_eq!(scheduler.pending(), 1);

    client.connect(second);
    assert_eq!(scheduler.pending(), 0, "old retry timer cancelled");
    wait_state(&client, ConnectionState::Connected).await;
    transport.send_message("a", "hi", Sentiment::Positive);
    settle().await;

    assert_eq!(transport.opened_channels(), vec!["first", "second"]);
    assert!(first_rx.lock().is_empty());
    assert_eq!(second_rx.lock().len(), 1);
    assert_eq!(client.channel().as_deref(), Some("second"));
}

#[tokio::test]
async fn reconnect_waits_for_the_grace_delay() {
    let (client, transport, scheduler) = make_client(policy());
    let (target, received) = recording_target("shroud");

    client.connect(target);
    wait_state(&client, ConnectionState::Connected).await;

    client.reconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(scheduler.pending_delays(), secs(&[1]));

    assert!(scheduler.fire_next());
    wait_state(&client, ConnectionState::Connected).await;
    transport.send_message("a", "back", Sentiment::Positive);
    settle().await;

    assert_eq!(transport.opened_channels(), vec!["shroud", "shroud"]);
    assert_eq!(received.lock().len(), 1, "same handler after reconnect");
}

#[tokio::test]
async fn reconnect_without_subscription_is_a_no_op() {
    let (client, transport, scheduler) = make_client(policy());
    client.reconnect();
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(transport.open_count(), 0);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_during_grace_cancels_reconnect() {
    let (client, transport, scheduler) = make_client(policy());
    let (target, _) = recording_target("shroud");

    client.connect(target);
    wait_state(&client, ConnectionState::Connected).await;
    client.reconnect();
    client.disconnect();

    assert!(!scheduler.fire_next());
    settle().await;
    assert_eq!(transport.open_count(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn reconnect_recovers_from_failed() {
    let (client, transport, scheduler) = make_client(RetryPolicy {
        max_attempts: 1,
        ..policy()
    });
    transport.fail_next_opens(2, "refused");
    let (target, _) = recording_target("shroud");

    client.connect(target);
    settle().await;
    assert!(scheduler.fire_next());
    settle().await;
    assert_eq!(client.state(), ConnectionState::Failed);
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(client.channel().as_deref(), Some("shroud"), "target kept while failed");

    client.reconnect();
    assert!(scheduler.fire_next());
    wait_state(&client, ConnectionState::Connected).await;
    assert_eq!(transport.open_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn hung_open_times_out_into_backoff() {
    let (client, transport, scheduler) = make_client(RetryPolicy {
        open_timeout: Duration::from_secs(5),
        ..policy()
    });
    transport.push_plan(OpenPlan::Hang);
    let (target, _) = recording_target("shroud");

    client.connect(target);
    wait_state(&client, ConnectionState::Reconnecting).await;

    let err = client.status().last_error.expect("timeout reported");
    assert_eq!(err.kind(), "open-failed");
    assert!(err.to_string().contains("timed out"));
    assert_eq!(scheduler.pending_delays(), secs(&[1]));
}

#[tokio::test]
async fn dropping_the_client_cancels_timers() {
    let (client, transport, scheduler) = make_client(policy());
    transport.fail_next_opens(1, "refused");
    let (target, _) = recording_target("shroud");

    client.connect(target);
    settle().await;
    assert_eq!(scheduler.pending(), 1);

    drop(client);
    assert_eq!(scheduler.pending(), 0);
}

#[tokio::test]
async fn clients_are_independent() {
    let (one, t1, _s1) = make_client(policy());
    let (two, t2, _s2) = make_client(policy());
    let (target1, rx1) = recording_target("one");
    let (target2, rx2) = recording_target("two");

    one.connect(target1);
    two.connect(target2);
    wait_state(&one, ConnectionState::Connected).await;
    wait_state(&two, ConnectionState::Connected).await;

    one.disconnect();
    t1.send_message("a", "x", Sentiment::Positive);
    t2.send_message("b", "y", Sentiment::Negative);
    settle().await;

    assert!(rx1.lock().is_empty());
    assert_eq!(rx2.lock().len(), 1);
    assert_eq!(two.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn backend_disconnect_ends_the_subscription() {
    let (client, transport, scheduler) = make_client(policy());
    let ended = Arc::new(AtomicUsize::new(0));
    let ended_hits = ended.clone();
    let (target, received) = recording_target("shroud");
    client.connect(target.on_ended(move || {
        ended_hits.fetch_add(1, Ordering::SeqCst);
    }));
    wait_state(&client, ConnectionState::Connected).await;

    transport.send_message("a", "hi", Sentiment::Positive);
    transport.send_json(json!({"type": "disconnect", "channel": "shroud"}));
    transport.send_message("b", "after", Sentiment::Negative);
    settle().await;

    let status = client.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.last_error, Some(StreamError::EndedByBackend));
    assert_eq!(ended.load(Ordering::SeqCst), 1);
    assert_eq!(received.lock().len(), 1);
    assert_eq!(client.channel(), None);
    assert_eq!(scheduler.pending(), 0, "no retry after the backend ended it");
    assert!(!transport.is_open());
    assert_eq!(transport.open_count(), 1);

    // Nothing to restore.
    client.reconnect();
    assert_eq!(scheduler.pending(), 0);
}

#[tokio::test]
async fn disconnect_for_another_channel_is_ignored() {
    let (client, transport, _scheduler) = make_client(policy());
    let (target, received) = recording_target("shroud");
    client.connect(target);
    wait_state(&client, ConnectionState::Connected).await;

    transport.send_json(json!({"type": "disconnect", "channel": "gorgc"}));
    transport.send_message("a", "still here", Sentiment::Positive);
    settle().await;

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(received.lock().len(), 1);
}

/// Records the level and message of every event.
#[derive(Clone, Default)]
struct CapturedEvents(Arc<Mutex<Vec<(Level, String)>>>);

impl CapturedEvents {
    fn contains(&self, level: Level, message: &str) -> bool {
        self.0.lock().iter().any(|(l, m)| *l == level && m == message)
    }
}

impl<S: Subscriber> Layer<S> for CapturedEvents {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        struct Message(String);
        impl Visit for Message {
            fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0 = format!("{value:?}");
                }
            }
        }
        let mut message = Message(String::new());
        event.record(&mut message);
        self.0.lock().push((*event.metadata().level(), message.0));
    }
}

#[tokio::test]
async fn retry_path_is_logged() {
    let events = CapturedEvents::default();
    let _guard = tracing::subscriber::set_default(Registry::default().with(events.clone()));

    let (client, transport, scheduler) = make_client(RetryPolicy {
        max_attempts: 1,
        ..policy()
    });
    transport.fail_next_opens(2, "connection refused");
    let (target, _) = recording_target("shroud");

    client.connect(target);
    settle().await;
    assert!(scheduler.fire_next());
    settle().await;

    assert_eq!(client.state(), ConnectionState::Failed);
    assert!(events.contains(Level::INFO, "Connecting to chat stream"));
    assert!(events.contains(Level::WARN, "Chat stream reconnecting after backoff"));
    assert!(events.contains(Level::ERROR, "Max reconnect attempts exceeded"));
}
