//! # rivven-realtime - Real-time replication from SaaS record APIs
//!
//! Turns a queryable record API plus a push-based change feed into a
//! deduplicated, deletion-aware stream of upserts and deletes with
//! crash-resumable checkpoints.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │ Change Feed  │   │ Query Pager  │◀── AuthenticatedTransport
//! │ (long-poll / │   │ (cursors,    │
//! │  streaming)  │   │  offsets)    │
//! └──────┬───────┘   └──────┬───────┘
//!        │ drain            │ rows
//!        ▼                  ▼
//! ┌──────────────────────────────────┐    ┌───────────────────┐
//! │ ReplicationEngine                │───▶│ Fingerprint Store │
//! │  reconcile ▸ tick ▸ commit       │◀───│ (redb)            │
//! └──────────────┬───────────────────┘    └───────────────────┘
//!                ▼
//!   Upsert / Delete / CheckpointCommit ──▶ RecordSink
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> rivven_realtime::Result<()> {
//! use rivven_realtime::{
//!     DataVersions, MemoryChangeFeed, MemoryTransport, OutputRecord, RealTimeState,
//!     RedbFingerprintStore, ReplicationEngine, Schema, Property, PropertyType,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let schema = Schema::new("Account")
//!     .with_property(Property::new("Id", PropertyType::String).key())
//!     .with_property(Property::new("Name", PropertyType::String));
//!
//! let mut engine = ReplicationEngine::new(
//!     Arc::new(MemoryTransport::new()),
//!     Box::new(MemoryChangeFeed::new()),
//!     Box::new(RedbFingerprintStore::open_for_job("./data", "accounts")?),
//! );
//!
//! let mut out: Vec<OutputRecord> = Vec::new();
//! let emitted = engine
//!     .run(&schema, DataVersions::new(1, 1), RealTimeState::default(), CancellationToken::new(), &mut out)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod fingerprint;
pub mod output;
pub mod query;
pub mod reconcile;
pub mod record;
pub mod schema;
pub mod transport;
pub mod types;

pub use checkpoint::{CheckpointFile, DataVersions, RealTimeState};
pub use config::{EngineConfig, FeedKind, RealTimeSettings};
pub use engine::{EngineStats, EngineStatsSnapshot, LoopState, ReplicationEngine};
pub use error::{ErrorCategory, ReplicationError, Result};
pub use feed::{
    ChangeFeed, ChangeFeedFactory, ChangeNotification, ChangePayload, ChangeType,
    MemoryChangeFeed,
};
pub use fingerprint::{
    FingerprintRecord, FingerprintStore, MemoryFingerprintStore, RedbFingerprintStore,
};
pub use output::{OutputAction, OutputRecord, RecordSink};
pub use query::QueryPager;
pub use reconcile::{ReconcileSummary, Reconciler};
pub use record::{FieldValue, Projection, Projector, RawRow, Record};
pub use schema::{KeyPolicy, Property, PropertyType, Schema, SchemaCatalog};
pub use transport::{AuthenticatedTransport, HttpTransport, MemoryTransport};
pub use types::SensitiveString;
