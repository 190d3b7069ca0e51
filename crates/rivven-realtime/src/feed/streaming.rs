//! Streaming pub/sub feed
//!
//! Change-data-capture events arrive over a bidirectional fetch stream.
//! The client grants credit with each [`FetchRequest`]; this adapter starts
//! with [`MAX_MESSAGES`] and tops the window back up whenever the remaining
//! credit falls below [`RESUBSCRIBE_THRESHOLD`]. The latest replay id is
//! remembered so a re-subscription after session expiry resumes where the
//! previous one stopped.
//!
//! Change events only carry changed fields, so notifications from this feed
//! are partial and the loop re-fetches the affected rows.

use super::{
    data_channel, ChangeFeed, ChangeFeedFactory, ChangeNotification, ChangePayload, ChangeType,
    NotificationBuffer,
};
use crate::config::RealTimeSettings;
use crate::error::{ReplicationError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Credit granted per fetch request.
pub const MAX_MESSAGES: u32 = 100;

/// Remaining credit below which more is requested.
pub const RESUBSCRIBE_THRESHOLD: u32 = 50;

/// Where a subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayPreset {
    Latest,
    Earliest,
    /// Resume after the given replay id
    Custom,
}

/// Flow-control request sent to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub topic_name: String,
    pub replay_preset: ReplayPreset,
    pub replay_id: Option<Bytes>,
    pub num_requested: u32,
}

impl FetchRequest {
    /// Initial request: resume from `replay_id` if known, else latest.
    pub fn initial(topic_name: &str, replay_id: Option<Bytes>) -> Self {
        Self {
            topic_name: topic_name.to_string(),
            replay_preset: if replay_id.is_some() {
                ReplayPreset::Custom
            } else {
                ReplayPreset::Latest
            },
            replay_id,
            num_requested: MAX_MESSAGES,
        }
    }

    /// Top-up request on an open stream.
    pub fn more(topic_name: &str) -> Self {
        Self {
            topic_name: topic_name.to_string(),
            replay_preset: ReplayPreset::Latest,
            replay_id: None,
            num_requested: MAX_MESSAGES,
        }
    }
}

/// One server response: zero or more decoded events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResponse {
    /// Event payloads decoded to JSON
    pub events: Vec<Value>,
    pub latest_replay_id: Option<Bytes>,
}

/// An open bidirectional fetch stream.
pub struct Subscription {
    pub requests: mpsc::Sender<FetchRequest>,
    pub responses: BoxStream<'static, Result<FetchResponse>>,
}

/// Opens fetch streams against the event bus.
///
/// Payload decoding (e.g. Avro against the topic schema) happens inside
/// the implementation; responses carry JSON.
#[async_trait]
pub trait EventSubscriber: Send + Sync + 'static {
    async fn subscribe(&self, topic_name: &str) -> Result<Subscription>;
}

/// Turn a decoded change event into a notification.
///
/// Returns `None` when the event has no `ChangeEventHeader`.
pub fn parse_change_event(event: &Value) -> Option<ChangeNotification> {
    let header = event.get("ChangeEventHeader")?;
    let entity = header.get("entityName")?.as_str()?.to_string();
    let raw_type = header.get("changeType").and_then(|t| t.as_str()).unwrap_or("UPDATE");
    let keys = header
        .get("recordIds")
        .and_then(|ids| ids.as_array())
        .map(|ids| {
            ids.iter()
                .filter_map(|id| id.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let change_type = ChangeType::from_change_event(raw_type).unwrap_or_else(|| {
        warn!(change_type = raw_type, "Unknown change type, treating as upsert");
        ChangeType::Upsert
    });

    let mut fields = event.as_object().cloned().unwrap_or_default();
    fields.remove("ChangeEventHeader");

    Some(ChangeNotification {
        change_type,
        entity,
        keys,
        payload: ChangePayload::Partial(fields),
    })
}

struct Session {
    started: Instant,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    ended: Arc<AtomicBool>,
}

/// Change-data-capture feed over an [`EventSubscriber`].
pub struct StreamingFeed<S: EventSubscriber> {
    subscriber: Arc<S>,
    topic: String,
    session_lifetime: Duration,
    buffer: NotificationBuffer,
    replay_id: Arc<Mutex<Option<Bytes>>>,
    session: Option<Session>,
}

impl<S: EventSubscriber> StreamingFeed<S> {
    pub fn new(subscriber: Arc<S>, channel_name: &str) -> Self {
        Self {
            subscriber,
            topic: data_channel(channel_name),
            session_lifetime: Duration::from_secs(30 * 60),
            buffer: NotificationBuffer::new(),
            replay_id: Arc::new(Mutex::new(None)),
            session: None,
        }
    }

    pub fn with_session_lifetime(mut self, lifetime: Duration) -> Self {
        self.session_lifetime = lifetime;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Replay id of the last received batch.
    pub fn replay_id(&self) -> Option<Bytes> {
        self.replay_id.lock().clone()
    }

    fn session_usable(&self) -> bool {
        self.session.as_ref().is_some_and(|s| {
            !s.ended.load(Ordering::Acquire) && s.started.elapsed() < self.session_lifetime
        })
    }

    async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            let _ = session.task.await;
        }
    }
}

#[async_trait]
impl<S: EventSubscriber> ChangeFeed for StreamingFeed<S> {
    async fn connect(&mut self) -> Result<()> {
        if self.session_usable() {
            return Ok(());
        }
        if self.session.is_some() {
            info!(topic = %self.topic, "Event stream session expired, re-subscribing");
            self.teardown().await;
        }

        let subscription = self.subscriber.subscribe(&self.topic).await?;
        let initial = FetchRequest::initial(&self.topic, self.replay_id());
        debug!(topic = %self.topic, preset = ?initial.replay_preset, "Subscribing to event stream");
        subscription
            .requests
            .send(initial)
            .await
            .map_err(|_| ReplicationError::feed("fetch stream closed before first request"))?;

        let cancel = CancellationToken::new();
        let ended = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(read_loop(
            subscription,
            self.topic.clone(),
            self.buffer.clone(),
            self.replay_id.clone(),
            cancel.clone(),
            ended.clone(),
        ));

        self.session = Some(Session {
            started: Instant::now(),
            cancel,
            task,
            ended,
        });
        info!(topic = %self.topic, "Subscribed to event stream");
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
        info!(topic = %self.topic, "Disconnected from event stream");
        Ok(())
    }
}

async fn read_loop(
    subscription: Subscription,
    topic: String,
    buffer: NotificationBuffer,
    replay_id: Arc<Mutex<Option<Bytes>>>,
    cancel: CancellationToken,
    ended: Arc<AtomicBool>,
) {
    let Subscription {
        requests,
        mut responses,
    } = subscription;
    let mut remaining = MAX_MESSAGES;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = responses.next() => next,
        };

        let response = match next {
            Some(Ok(response)) => response,
            Some(Err(e)) => {
                warn!(topic = %topic, error = %e, "Event stream failed, reporting gap");
                ended.store(true, Ordering::Release);
                buffer.push(ChangeNotification::gap(""));
                break;
            }
            None => {
                warn!(topic = %topic, "Event stream closed by server, reporting gap");
                ended.store(true, Ordering::Release);
                buffer.push(ChangeNotification::gap(""));
                break;
            }
        };

        // keepalives advance the replay id too
        if let Some(id) = response.latest_replay_id {
            *replay_id.lock() = Some(id);
        }
        if response.events.is_empty() {
            debug!(topic = %topic, "Event stream keepalive");
            continue;
        }
        debug!(topic = %topic, events = response.events.len(), "Received events");

        for event in &response.events {
            match parse_change_event(event) {
                Some(notification) => buffer.push(notification),
                None => warn!(topic = %topic, "Ignoring event without change header"),
            }

            remaining = remaining.saturating_sub(1);
            if remaining < RESUBSCRIBE_THRESHOLD {
                if requests.send(FetchRequest::more(&topic)).await.is_err() {
                    warn!(topic = %topic, "Could not request more events, reporting gap");
                    ended.store(true, Ordering::Release);
                    buffer.push(ChangeNotification::gap(""));
                    return;
                }
                remaining = MAX_MESSAGES;
            }
        }
    }

    ended.store(true, Ordering::Release);
}

/// Creates [`StreamingFeed`]s sharing one subscriber.
pub struct StreamingFeedFactory<S: EventSubscriber> {
    subscriber: Arc<S>,
}

impl<S: EventSubscriber> StreamingFeedFactory<S> {
    pub fn new(subscriber: Arc<S>) -> Self {
        Self { subscriber }
    }
}

impl<S: EventSubscriber> ChangeFeedFactory for StreamingFeedFactory<S> {
    fn create(&self, settings: &RealTimeSettings, _entity: &str) -> Result<Box<dyn ChangeFeed>> {
        if settings.channel_name.trim().is_empty() {
            return Err(ReplicationError::config("channel_name is required"));
        }
        Ok(Box::new(
            StreamingFeed::new(self.subscriber.clone(), &settings.channel_name)
                .with_session_lifetime(settings.session_lifetime()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel_stream(
        rx: mpsc::Receiver<Result<FetchResponse>>,
    ) -> BoxStream<'static, Result<FetchResponse>> {
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }

    /// Subscriber whose server side is driven by the test.
    #[derive(Default)]
    struct MockSubscriber {
        sessions: Mutex<Vec<(mpsc::Receiver<FetchRequest>, mpsc::Sender<Result<FetchResponse>>)>>,
    }

    #[async_trait]
    impl EventSubscriber for MockSubscriber {
        async fn subscribe(&self, _topic_name: &str) -> Result<Subscription> {
            let (req_tx, req_rx) = mpsc::channel(16);
            let (resp_tx, resp_rx) = mpsc::channel(16);
            self.sessions.lock().push((req_rx, resp_tx));
            Ok(Subscription {
                requests: req_tx,
                responses: channel_stream(resp_rx),
            })
        }
    }

    impl MockSubscriber {
        fn take_session(
            &self,
        ) -> (mpsc::Receiver<FetchRequest>, mpsc::Sender<Result<FetchResponse>>) {
            self.sessions.lock().remove(0)
        }
    }

    fn change_event(change_type: &str, ids: &[&str]) -> Value {
        json!({
            "ChangeEventHeader": {
                "entityName": "Account",
                "recordIds": ids,
                "changeType": change_type,
                "commitTimestamp": 1_700_000_000_000i64,
            },
            "Name": "Acme"
        })
    }

    async fn wait_for_pending(feed: &StreamingFeed<MockSubscriber>, n: usize) {
        for _ in 0..200 {
            if feed.buffer.len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {} notifications", n);
    }

    #[test]
    fn test_parse_change_event() {
        let n = parse_change_event(&change_event("UPDATE", &["001A", "001B"])).unwrap();
        assert_eq!(n.change_type, ChangeType::Upsert);
        assert_eq!(n.entity, "Account");
        assert_eq!(n.keys, vec!["001A".to_string(), "001B".to_string()]);
        match n.payload {
            ChangePayload::Partial(fields) => {
                assert!(fields.contains_key("Name"));
                assert!(!fields.contains_key("ChangeEventHeader"));
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let gap = parse_change_event(&change_event("GAP_OVERFLOW", &[])).unwrap();
        assert_eq!(gap.change_type, ChangeType::GapRecovery);

        let unknown = parse_change_event(&change_event("SOMETHING_NEW", &["1"])).unwrap();
        assert_eq!(unknown.change_type, ChangeType::Upsert);

        assert!(parse_change_event(&json!({"Name": "x"})).is_none());
    }

    #[test]
    fn test_fetch_request_presets() {
        let first = FetchRequest::initial("/data/AccountChangeEvent", None);
        assert_eq!(first.replay_preset, ReplayPreset::Latest);
        assert_eq!(first.num_requested, MAX_MESSAGES);

        let resumed = FetchRequest::initial("/data/AccountChangeEvent", Some(Bytes::from_static(b"\x01")));
        assert_eq!(resumed.replay_preset, ReplayPreset::Custom);
    }

    #[tokio::test]
    async fn test_initial_request_and_buffering() {
        let subscriber = Arc::new(MockSubscriber::default());
        let mut feed = StreamingFeed::new(subscriber.clone(), "AccountChangeEvent");

        feed.connect().await.unwrap();
        let (mut requests, responses) = subscriber.take_session();

        let initial = requests.recv().await.unwrap();
        assert_eq!(initial.topic_name, "/data/AccountChangeEvent");
        assert_eq!(initial.num_requested, MAX_MESSAGES);

        responses
            .send(Ok(FetchResponse {
                events: vec![change_event("CREATE", &["1"]), change_event("DELETE", &["2"])],
                latest_replay_id: Some(Bytes::from_static(b"r2")),
            }))
            .await
            .unwrap();

        wait_for_pending(&feed, 2).await;
        let drained = feed.drain_pending();
        assert_eq!(drained[0].change_type, ChangeType::Upsert);
        assert_eq!(drained[1].change_type, ChangeType::Delete);
        assert_eq!(feed.replay_id(), Some(Bytes::from_static(b"r2")));

        feed.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_credit_window_tops_up() {
        let subscriber = Arc::new(MockSubscriber::default());
        let mut feed = StreamingFeed::new(subscriber.clone(), "AccountChangeEvent");

        feed.connect().await.unwrap();
        let (mut requests, responses) = subscriber.take_session();
        requests.recv().await.unwrap();

        // 51 events leave 49 credits, under the threshold
        let events = (0..51)
            .map(|i| change_event("UPDATE", &[&format!("{}", i)]))
            .collect();
        responses
            .send(Ok(FetchResponse {
                events,
                latest_replay_id: None,
            }))
            .await
            .unwrap();

        let top_up = tokio::time::timeout(Duration::from_secs(2), requests.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(top_up.num_requested, MAX_MESSAGES);

        wait_for_pending(&feed, 51).await;
        feed.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_session_resumes_from_replay_id() {
        let subscriber = Arc::new(MockSubscriber::default());
        let mut feed = StreamingFeed::new(subscriber.clone(), "AccountChangeEvent")
            .with_session_lifetime(Duration::from_millis(20));

        feed.connect().await.unwrap();
        let (mut requests, responses) = subscriber.take_session();
        requests.recv().await.unwrap();
        responses
            .send(Ok(FetchResponse {
                events: vec![change_event("UPDATE", &["1"])],
                latest_replay_id: Some(Bytes::from_static(b"r9")),
            }))
            .await
            .unwrap();
        wait_for_pending(&feed, 1).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        feed.connect().await.unwrap();

        let (mut requests, _responses) = subscriber.take_session();
        let resumed = requests.recv().await.unwrap();
        assert_eq!(resumed.replay_preset, ReplayPreset::Custom);
        assert_eq!(resumed.replay_id, Some(Bytes::from_static(b"r9")));

        feed.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_failure_reports_gap() {
        let subscriber = Arc::new(MockSubscriber::default());
        let mut feed = StreamingFeed::new(subscriber.clone(), "AccountChangeEvent");

        feed.connect().await.unwrap();
        let (mut requests, responses) = subscriber.take_session();
        requests.recv().await.unwrap();
        responses
            .send(Err(ReplicationError::feed("stream reset")))
            .await
            .unwrap();

        wait_for_pending(&feed, 1).await;
        let drained = feed.drain_pending();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].change_type, ChangeType::GapRecovery);

        // the ended session is replaced on the next connect
        feed.connect().await.unwrap();
        let (mut requests, _responses) = subscriber.take_session();
        assert_eq!(requests.recv().await.unwrap().replay_preset, ReplayPreset::Latest);

        feed.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_close_reports_gap() {
        let subscriber = Arc::new(MockSubscriber::default());
        let mut feed = StreamingFeed::new(subscriber.clone(), "AccountChangeEvent");

        feed.connect().await.unwrap();
        let (mut requests, responses) = subscriber.take_session();
        requests.recv().await.unwrap();
        drop(responses);

        wait_for_pending(&feed, 1).await;
        assert_eq!(feed.drain_pending()[0].change_type, ChangeType::GapRecovery);
        feed.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_keepalive_replay_id_is_kept() {
        let subscriber = Arc::new(MockSubscriber::default());
        let mut feed = StreamingFeed::new(subscriber.clone(), "AccountChangeEvent")
            .with_session_lifetime(Duration::from_millis(20));

        feed.connect().await.unwrap();
        let (mut requests, responses) = subscriber.take_session();
        requests.recv().await.unwrap();
        responses
            .send(Ok(FetchResponse {
                events: Vec::new(),
                latest_replay_id: Some(Bytes::from_static(b"k1")),
            }))
            .await
            .unwrap();

        for _ in 0..200 {
            if feed.replay_id().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(feed.replay_id(), Some(Bytes::from_static(b"k1")));
        assert!(!feed.has_pending());

        tokio::time::sleep(Duration::from_millis(30)).await;
        feed.connect().await.unwrap();
        let (mut requests, _responses) = subscriber.take_session();
        let resumed = requests.recv().await.unwrap();
        assert_eq!(resumed.replay_preset, ReplayPreset::Custom);
        assert_eq!(resumed.replay_id, Some(Bytes::from_static(b"k1")));

        feed.disconnect().await.unwrap();
    }
}
