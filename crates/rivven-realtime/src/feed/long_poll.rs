//! Long-poll push-topic feed
//!
//! Holds one Bayeux session: handshake, subscribe to `/topic/{name}`, then a
//! background task long-polls and buffers every event. Sessions have a
//! bounded lifetime; the next `connect()` after expiry tears the session
//! down and opens a fresh one. A session the server drops underneath us may
//! have missed events, so that case buffers a gap notification.

use super::{
    topic_channel, ChangeFeed, ChangeFeedFactory, ChangeNotification, ChangePayload, ChangeType,
    NotificationBuffer,
};
use crate::config::RealTimeSettings;
use crate::error::{ReplicationError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A data message delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq)]
pub struct BayeuxMessage {
    pub channel: String,
    pub data: Value,
}

/// Result of one long-poll round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Messages(Vec<BayeuxMessage>),
    /// The server no longer knows the client; a new handshake is required
    Rehandshake,
}

/// Bayeux protocol operations used by [`LongPollFeed`].
#[async_trait]
pub trait BayeuxTransport: Send + Sync + 'static {
    /// Returns the client id for the new session.
    async fn handshake(&self) -> Result<String>;

    async fn subscribe(&self, client_id: &str, channel: &str) -> Result<()>;

    /// Block until the server delivers messages or the poll times out.
    async fn poll(&self, client_id: &str) -> Result<PollOutcome>;

    async fn disconnect(&self, client_id: &str) -> Result<()>;
}

/// Turn a push-topic event into a notification.
///
/// Push-topic events carry the full row under `sobject` and the event type
/// under `event.type`. Returns `None` when the envelope is not recognizable.
pub fn parse_push_topic_event(entity: &str, data: &Value) -> Option<ChangeNotification> {
    let sobject = data.get("sobject")?.as_object()?.clone();
    let event_type = data
        .get("event")
        .and_then(|e| e.get("type"))
        .and_then(|t| t.as_str())
        .unwrap_or("updated");

    let keys = sobject
        .get("Id")
        .and_then(|v| v.as_str())
        .map(|id| vec![id.to_string()])
        .unwrap_or_default();

    Some(ChangeNotification {
        change_type: ChangeType::from_push_topic(event_type),
        entity: entity.to_string(),
        keys,
        payload: ChangePayload::Full(sobject),
    })
}

struct Session {
    client_id: String,
    started: Instant,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    lost: Arc<AtomicBool>,
}

/// Push-topic feed over a [`BayeuxTransport`].
pub struct LongPollFeed<T: BayeuxTransport> {
    transport: Arc<T>,
    channel: String,
    entity: String,
    session_lifetime: Duration,
    buffer: NotificationBuffer,
    session: Option<Session>,
}

impl<T: BayeuxTransport> LongPollFeed<T> {
    pub fn new(transport: Arc<T>, channel_name: &str, entity: impl Into<String>) -> Self {
        Self {
            transport,
            channel: topic_channel(channel_name),
            entity: entity.into(),
            session_lifetime: Duration::from_secs(30 * 60),
            buffer: NotificationBuffer::new(),
            session: None,
        }
    }

    pub fn with_session_lifetime(mut self, lifetime: Duration) -> Self {
        self.session_lifetime = lifetime;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| !s.lost.load(Ordering::Acquire))
    }

    fn session_usable(&self) -> bool {
        self.session.as_ref().is_some_and(|s| {
            !s.lost.load(Ordering::Acquire) && s.started.elapsed() < self.session_lifetime
        })
    }

    async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            let _ = session.task.await;
            if !session.lost.load(Ordering::Acquire) {
                if let Err(e) = self.transport.disconnect(&session.client_id).await {
                    debug!(error = %e, "Bayeux disconnect failed");
                }
            }
        }
    }
}

#[async_trait]
impl<T: BayeuxTransport> ChangeFeed for LongPollFeed<T> {
    async fn connect(&mut self) -> Result<()> {
        if self.session_usable() {
            return Ok(());
        }
        if self.session.is_some() {
            info!(channel = %self.channel, "Push topic session expired, re-subscribing");
            self.teardown().await;
        }

        let client_id = self.transport.handshake().await?;
        self.transport.subscribe(&client_id, &self.channel).await?;
        info!(channel = %self.channel, "Subscribed to push topic");

        let cancel = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(poll_loop(
            self.transport.clone(),
            client_id.clone(),
            self.channel.clone(),
            self.entity.clone(),
            self.buffer.clone(),
            cancel.clone(),
            lost.clone(),
        ));

        self.session = Some(Session {
            client_id,
            started: Instant::now(),
            cancel,
            task,
            lost,
        });
        Ok(())
    }

    fn drain_pending(&mut self) -> Vec<ChangeNotification> {
        self.buffer.drain()
    }

    fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.teardown().await;
        info!(channel = %self.channel, "Disconnected from push topic");
        Ok(())
    }
}

async fn poll_loop<T: BayeuxTransport>(
    transport: Arc<T>,
    client_id: String,
    channel: String,
    entity: String,
    buffer: NotificationBuffer,
    cancel: CancellationToken,
    lost: Arc<AtomicBool>,
) {
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = transport.poll(&client_id) => outcome,
        };

        match outcome {
            Ok(PollOutcome::Messages(messages)) => {
                for message in messages.into_iter().filter(|m| m.channel == channel) {
                    match parse_push_topic_event(&entity, &message.data) {
                        Some(notification) => buffer.push(notification),
                        None => warn!(channel = %channel, "Ignoring unrecognized push topic event"),
                    }
                }
            }
            Ok(PollOutcome::Rehandshake) => {
                warn!(channel = %channel, "Push topic session dropped by server");
                lost.store(true, Ordering::Release);
                buffer.push(ChangeNotification::gap(entity));
                return;
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Push topic poll failed");
                lost.store(true, Ordering::Release);
                buffer.push(ChangeNotification::gap(entity));
                return;
            }
        }
    }
}

/// Creates [`LongPollFeed`]s sharing one transport.
pub struct LongPollFeedFactory<T: BayeuxTransport> {
    transport: Arc<T>,
}

impl<T: BayeuxTransport> LongPollFeedFactory<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }
}

impl<T: BayeuxTransport> ChangeFeedFactory for LongPollFeedFactory<T> {
    fn create(&self, settings: &RealTimeSettings, entity: &str) -> Result<Box<dyn ChangeFeed>> {
        if settings.channel_name.trim().is_empty() {
            return Err(ReplicationError::config("channel_name is required"));
        }
        Ok(Box::new(
            LongPollFeed::new(self.transport.clone(), &settings.channel_name, entity)
                .with_session_lifetime(settings.session_lifetime()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockBayeux {
        handshakes: AtomicUsize,
        disconnects: AtomicUsize,
        subscriptions: Mutex<Vec<String>>,
        polls: Mutex<VecDeque<PollOutcome>>,
    }

    impl MockBayeux {
        fn queue(&self, outcome: PollOutcome) {
            self.polls.lock().push_back(outcome);
        }
    }

    #[async_trait]
    impl BayeuxTransport for MockBayeux {
        async fn handshake(&self) -> Result<String> {
            let n = self.handshakes.fetch_add(1, Ordering::SeqCst);
            Ok(format!("client-{}", n))
        }

        async fn subscribe(&self, _client_id: &str, channel: &str) -> Result<()> {
            self.subscriptions.lock().push(channel.to_string());
            Ok(())
        }

        async fn poll(&self, _client_id: &str) -> Result<PollOutcome> {
            let next = self.polls.lock().pop_front();
            match next {
                Some(outcome) => Ok(outcome),
                None => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(PollOutcome::Messages(Vec::new()))
                }
            }
        }

        async fn disconnect(&self, _client_id: &str) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn event(event_type: &str, id: &str) -> BayeuxMessage {
        BayeuxMessage {
            channel: "/topic/AccountUpdates".into(),
            data: json!({
                "event": {"type": event_type, "createdDate": "2024-01-01T00:00:00.000Z", "replayId": 1},
                "sobject": {"Id": id, "Name": "Acme"}
            }),
        }
    }

    async fn wait_for_pending(feed: &LongPollFeed<MockBayeux>, n: usize) {
        for _ in 0..200 {
            if feed.buffer.len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {} notifications", n);
    }

    #[test]
    fn test_parse_push_topic_event() {
        let created = parse_push_topic_event("Account", &event("created", "001").data).unwrap();
        assert_eq!(created.change_type, ChangeType::Upsert);
        assert_eq!(created.keys, vec!["001".to_string()]);
        assert!(created.payload.is_full());

        let deleted = parse_push_topic_event("Account", &event("deleted", "002").data).unwrap();
        assert_eq!(deleted.change_type, ChangeType::Delete);

        assert!(parse_push_topic_event("Account", &json!({"foo": 1})).is_none());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let transport = Arc::new(MockBayeux::default());
        let mut feed = LongPollFeed::new(transport.clone(), "AccountUpdates", "Account");

        feed.connect().await.unwrap();
        feed.connect().await.unwrap();

        assert_eq!(transport.handshakes.load(Ordering::SeqCst), 1);
        assert_eq!(*transport.subscriptions.lock(), vec!["/topic/AccountUpdates".to_string()]);
        assert!(feed.is_connected());

        feed.disconnect().await.unwrap();
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
        assert!(!feed.is_connected());
    }

    #[tokio::test]
    async fn test_buffers_events_from_subscribed_channel() {
        let transport = Arc::new(MockBayeux::default());
        transport.queue(PollOutcome::Messages(vec![
            event("created", "001"),
            BayeuxMessage {
                channel: "/topic/Other".into(),
                data: json!({}),
            },
            event("deleted", "002"),
        ]));
        let mut feed = LongPollFeed::new(transport.clone(), "AccountUpdates", "Account");

        feed.connect().await.unwrap();
        wait_for_pending(&feed, 2).await;

        assert!(feed.has_pending());
        let drained = feed.drain_pending();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[1].change_type, ChangeType::Delete);
        assert!(!feed.has_pending());

        feed.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_session_resubscribes() {
        let transport = Arc::new(MockBayeux::default());
        let mut feed = LongPollFeed::new(transport.clone(), "AccountUpdates", "Account")
            .with_session_lifetime(Duration::from_millis(10));

        feed.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        feed.connect().await.unwrap();

        assert_eq!(transport.handshakes.load(Ordering::SeqCst), 2);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
        feed.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_session_reports_gap() {
        let transport = Arc::new(MockBayeux::default());
        transport.queue(PollOutcome::Rehandshake);
        let mut feed = LongPollFeed::new(transport.clone(), "AccountUpdates", "Account");

        feed.connect().await.unwrap();
        wait_for_pending(&feed, 1).await;

        let drained = feed.drain_pending();
        assert_eq!(drained[0].change_type, ChangeType::GapRecovery);
        assert!(!feed.is_connected());

        feed.connect().await.unwrap();
        assert_eq!(transport.handshakes.load(Ordering::SeqCst), 2);
        feed.disconnect().await.unwrap();
    }
}
