//! Emitted records
//!
//! The engine writes [`OutputRecord`]s to a [`RecordSink`] in the order it
//! produces them. A `CheckpointCommit` is a progress marker: everything
//! emitted before it is covered by the state it carries.

use crate::checkpoint::RealTimeState;
use crate::error::{ReplicationError, Result};
use crate::record::Record;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputAction {
    Upsert,
    Delete,
    CheckpointCommit,
}

/// One item of the output stream.
///
/// Serializes as `{"action": "...", "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum OutputRecord {
    /// Full projected record
    Upsert(Record),
    /// Key values of the removed record
    Delete(Record),
    CheckpointCommit(RealTimeState),
}

impl OutputRecord {
    pub fn action(&self) -> OutputAction {
        match self {
            Self::Upsert(_) => OutputAction::Upsert,
            Self::Delete(_) => OutputAction::Delete,
            Self::CheckpointCommit(_) => OutputAction::CheckpointCommit,
        }
    }

    /// Upserts and deletes count toward the run total; commits do not.
    pub fn is_data(&self) -> bool {
        !matches!(self, Self::CheckpointCommit(_))
    }

    pub fn record(&self) -> Option<&Record> {
        match self {
            Self::Upsert(record) | Self::Delete(record) => Some(record),
            Self::CheckpointCommit(_) => None,
        }
    }

    pub fn checkpoint(&self) -> Option<&RealTimeState> {
        match self {
            Self::CheckpointCommit(state) => Some(state),
            _ => None,
        }
    }
}

/// Receives the output stream.
#[async_trait]
pub trait RecordSink: Send {
    async fn emit(&mut self, record: OutputRecord) -> Result<()>;
}

#[async_trait]
impl RecordSink for mpsc::Sender<OutputRecord> {
    async fn emit(&mut self, record: OutputRecord) -> Result<()> {
        self.send(record)
            .await
            .map_err(|_| ReplicationError::OutputClosed)
    }
}

#[async_trait]
impl RecordSink for Vec<OutputRecord> {
    async fn emit(&mut self, record: OutputRecord) -> Result<()> {
        self.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_serialized_shape() {
        let upsert = OutputRecord::Upsert(Record::new().with("Id", "1").with("Name", "A"));
        assert_eq!(
            serde_json::to_value(&upsert).unwrap(),
            json!({"action": "upsert", "payload": {"Id": "1", "Name": "A"}})
        );

        let commit = OutputRecord::CheckpointCommit(RealTimeState {
            job_version: 1,
            shape_version: 2,
            last_read_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        });
        assert_eq!(
            serde_json::to_value(&commit).unwrap(),
            json!({
                "action": "checkpoint_commit",
                "payload": {
                    "JobVersion": 1,
                    "ShapeVersion": 2,
                    "LastReadTime": "2024-01-01T00:00:00Z"
                }
            })
        );
        assert!(!commit.is_data());
        assert_eq!(commit.action(), OutputAction::CheckpointCommit);
    }

    #[tokio::test]
    async fn test_channel_sink_reports_closed() {
        let (mut tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = tx
            .emit(OutputRecord::Delete(Record::new().with("Id", "1")))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::OutputClosed));
    }
}
