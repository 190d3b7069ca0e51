//! Change feeds
//!
//! A change feed is a live subscription that buffers change notifications
//! in the background. The incremental loop only ever drains that buffer;
//! transport details stay inside the adapters.
//!
//! - [`LongPollFeed`]: push-topic channel over a Bayeux long-poll session
//!   (HTTP client in [`CometdTransport`])
//! - [`StreamingFeed`]: pub/sub event stream with a credit window, driven
//!   through an [`EventSubscriber`]
//! - [`MemoryChangeFeed`]: scripted feed for tests
//!
//! Feed-reported gaps arrive as [`ChangeType::GapRecovery`] notifications so
//! the loop handles them like any other change.

mod cometd;
mod long_poll;
mod memory;
mod streaming;

pub use cometd::CometdTransport;
pub use long_poll::{
    parse_push_topic_event, BayeuxMessage, BayeuxTransport, LongPollFeed, LongPollFeedFactory,
    PollOutcome,
};
pub use memory::MemoryChangeFeed;
pub use streaming::{
    parse_change_event, EventSubscriber, FetchRequest, FetchResponse, ReplayPreset,
    StreamingFeed, StreamingFeedFactory, Subscription, MAX_MESSAGES, RESUBSCRIBE_THRESHOLD,
};

use crate::config::RealTimeSettings;
use crate::error::Result;
use crate::record::RawRow;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What a notification asks the loop to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Upsert,
    Delete,
    /// The feed may have lost notifications; resynchronize fully
    GapRecovery,
}

impl ChangeType {
    /// Map a change-data-capture header type (`CREATE`, `GAP_UPDATE`, ...).
    ///
    /// Returns `None` for types this crate does not know.
    pub fn from_change_event(change_type: &str) -> Option<Self> {
        match change_type.to_ascii_uppercase().as_str() {
            "CREATE" | "UPDATE" | "UNDELETE" => Some(Self::Upsert),
            "DELETE" => Some(Self::Delete),
            "GAP_OVERFLOW" | "GAP_CREATE" | "GAP_UPDATE" | "GAP_DELETE" | "GAP_UNDELETE" => {
                Some(Self::GapRecovery)
            }
            _ => None,
        }
    }

    /// Map a push-topic event type (`created`, `updated`, `deleted`, ...).
    pub fn from_push_topic(event_type: &str) -> Self {
        if event_type.eq_ignore_ascii_case("deleted") {
            Self::Delete
        } else {
            Self::Upsert
        }
    }
}

/// Row data carried by a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangePayload {
    /// Every field of the row; no re-fetch needed
    Full(RawRow),
    /// Only changed fields; the loop re-fetches affected rows by id
    Partial(RawRow),
    /// Nothing beyond the affected keys
    None,
}

impl ChangePayload {
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

/// A single change reported by a feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    pub change_type: ChangeType,
    /// Source entity (e.g. `Account`); empty when the change is not tied to one
    pub entity: String,
    /// Affected record ids, in the order the source reported them
    pub keys: Vec<String>,
    pub payload: ChangePayload,
}

impl ChangeNotification {
    pub fn upsert(entity: impl Into<String>, row: RawRow) -> Self {
        let keys = row
            .get("Id")
            .and_then(|v| v.as_str())
            .map(|id| vec![id.to_string()])
            .unwrap_or_default();
        Self {
            change_type: ChangeType::Upsert,
            entity: entity.into(),
            keys,
            payload: ChangePayload::Full(row),
        }
    }

    pub fn delete(entity: impl Into<String>, ids: Vec<String>) -> Self {
        Self {
            change_type: ChangeType::Delete,
            entity: entity.into(),
            keys: ids,
            payload: ChangePayload::None,
        }
    }

    /// Upsert that only names the changed records.
    pub fn changed(entity: impl Into<String>, ids: Vec<String>) -> Self {
        Self {
            change_type: ChangeType::Upsert,
            entity: entity.into(),
            keys: ids,
            payload: ChangePayload::None,
        }
    }

    pub fn gap(entity: impl Into<String>) -> Self {
        Self {
            change_type: ChangeType::GapRecovery,
            entity: entity.into(),
            keys: Vec::new(),
            payload: ChangePayload::None,
        }
    }
}

/// Shared buffer between a feed's background reader and the loop.
///
/// The reader appends; [`drain`](Self::drain) swaps the whole buffer out.
#[derive(Debug, Clone, Default)]
pub struct NotificationBuffer {
    inner: Arc<Mutex<Vec<ChangeNotification>>>,
}

impl NotificationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, notification: ChangeNotification) {
        self.inner.lock().push(notification);
    }

    pub fn extend(&self, notifications: impl IntoIterator<Item = ChangeNotification>) {
        self.inner.lock().extend(notifications);
    }

    pub fn drain(&self) -> Vec<ChangeNotification> {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Live change subscription.
#[async_trait]
pub trait ChangeFeed: Send {
    /// Establish the subscription.
    ///
    /// Safe to call while connected; adapters with a bounded session
    /// lifetime re-subscribe here once the session has expired.
    async fn connect(&mut self) -> Result<()>;

    /// Everything buffered since the last drain. Never blocks.
    fn drain_pending(&mut self) -> Vec<ChangeNotification>;

    fn has_pending(&self) -> bool;

    /// Tear down the subscription.
    async fn disconnect(&mut self) -> Result<()>;
}

#[async_trait]
impl<F: ChangeFeed + ?Sized> ChangeFeed for Box<F> {
    async fn connect(&mut self) -> Result<()> {
        (**self).connect().await
    }

    fn drain_pending(&mut self) -> Vec<ChangeNotification> {
        (**self).drain_pending()
    }

    fn has_pending(&self) -> bool {
        (**self).has_pending()
    }

    async fn disconnect(&mut self) -> Result<()> {
        (**self).disconnect().await
    }
}

/// Builds the feed for a job.
pub trait ChangeFeedFactory: Send + Sync {
    fn create(&self, settings: &RealTimeSettings, entity: &str) -> Result<Box<dyn ChangeFeed>>;
}

/// Push-topic channel name: `/topic/{name}` unless already prefixed.
pub fn topic_channel(name: &str) -> String {
    if name.starts_with("/topic/") {
        name.to_string()
    } else {
        format!("/topic/{}", name.trim_start_matches('/'))
    }
}

/// Change-data-capture channel name: `/data/{name}` unless already prefixed.
pub fn data_channel(name: &str) -> String {
    if name.starts_with("/data/") {
        name.to_string()
    } else {
        format!("/data/{}", name.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_event_types() {
        assert_eq!(ChangeType::from_change_event("CREATE"), Some(ChangeType::Upsert));
        assert_eq!(ChangeType::from_change_event("update"), Some(ChangeType::Upsert));
        assert_eq!(ChangeType::from_change_event("UNDELETE"), Some(ChangeType::Upsert));
        assert_eq!(ChangeType::from_change_event("DELETE"), Some(ChangeType::Delete));
        for gap in ["GAP_OVERFLOW", "GAP_CREATE", "GAP_UPDATE", "GAP_DELETE", "GAP_UNDELETE"] {
            assert_eq!(ChangeType::from_change_event(gap), Some(ChangeType::GapRecovery));
        }
        assert_eq!(ChangeType::from_change_event("MERGE"), None);
    }

    #[test]
    fn test_push_topic_types() {
        assert_eq!(ChangeType::from_push_topic("deleted"), ChangeType::Delete);
        assert_eq!(ChangeType::from_push_topic("created"), ChangeType::Upsert);
        assert_eq!(ChangeType::from_push_topic("undeleted"), ChangeType::Upsert);
    }

    #[test]
    fn test_buffer_drain_swaps_out() {
        let buffer = NotificationBuffer::new();
        let producer = buffer.clone();

        producer.push(ChangeNotification::gap("Account"));
        producer.push(ChangeNotification::delete("Account", vec!["1".into()]));
        assert_eq!(buffer.len(), 2);

        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].change_type, ChangeType::GapRecovery);
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn test_upsert_takes_id_from_row() {
        let row = json!({"Id": "001A", "Name": "Acme"}).as_object().cloned().unwrap();
        let n = ChangeNotification::upsert("Account", row);
        assert_eq!(n.keys, vec!["001A".to_string()]);
        assert!(n.payload.is_full());
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(topic_channel("AccountUpdates"), "/topic/AccountUpdates");
        assert_eq!(topic_channel("/topic/AccountUpdates"), "/topic/AccountUpdates");
        assert_eq!(data_channel("AccountChangeEvent"), "/data/AccountChangeEvent");
        assert_eq!(data_channel("/data/AccountChangeEvent"), "/data/AccountChangeEvent");
    }
}
