//! Incremental replication loop
//!
//! One [`ReplicationEngine`] serves one job. [`run`](ReplicationEngine::run)
//! connects the change feed, reconciles once, then ticks every batch window:
//! drain the feed, apply each notification in order, commit a checkpoint.
//!
//! ```text
//! Initializing ──connect + reconcile──▶ Running ──tick──▶ Draining
//!                                          ▲                 │
//!                                          └──── commit ─────┘
//!                        cancel / error ──▶ Stopped (feed disconnected)
//! ```

use crate::checkpoint::{DataVersions, RealTimeState};
use crate::error::Result;
use crate::feed::{ChangeFeed, ChangeNotification, ChangePayload, ChangeType};
use crate::fingerprint::{composite_id, FingerprintStore};
use crate::output::{OutputRecord, RecordSink};
use crate::query::{records_by_id_query, QueryPager};
use crate::reconcile::{ReconcileSummary, Reconciler};
use crate::record::{Projector, RawRow, Record};
use crate::schema::{Schema, SchemaCatalog};
use crate::transport::AuthenticatedTransport;
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default time between feed drains.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_secs(5);

/// Loop state, observable while the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Initializing,
    Running,
    Draining,
    Stopped,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Engine statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    pub upserts: u64,
    pub deletes: u64,
    /// Upserts suppressed because content did not change
    pub unchanged: u64,
    /// Deletes of unknown ids and re-fetches that found nothing
    pub missing: u64,
    pub notifications: u64,
    pub reconciliations: u64,
    pub malformed: u64,
    pub ticks: u64,
}

/// Atomic engine statistics
#[derive(Debug, Default)]
pub struct EngineStats {
    upserts: AtomicU64,
    deletes: AtomicU64,
    unchanged: AtomicU64,
    missing: AtomicU64,
    notifications: AtomicU64,
    reconciliations: AtomicU64,
    malformed: AtomicU64,
    ticks: AtomicU64,
}

impl EngineStats {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn record_reconcile(&self, summary: &ReconcileSummary) {
        Self::add(&self.upserts, summary.upserts);
        Self::add(&self.deletes, summary.deletes);
        Self::add(&self.unchanged, summary.unchanged);
        Self::add(&self.malformed, summary.malformed);
        if summary.completed {
            Self::add(&self.reconciliations, 1);
        }
    }

    /// Get a snapshot
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            upserts: self.upserts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            missing: self.missing.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            reconciliations: self.reconciliations.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
        }
    }
}

/// Forwards to the caller's sink and counts upserts and deletes.
struct CountingSink<'a> {
    inner: &'a mut dyn RecordSink,
    emitted: u64,
}

#[async_trait]
impl<'a> RecordSink for CountingSink<'a> {
    async fn emit(&mut self, record: OutputRecord) -> Result<()> {
        let is_data = record.is_data();
        self.inner.emit(record).await?;
        if is_data {
            self.emitted += 1;
        }
        Ok(())
    }
}

/// Real-time replication engine for one job.
pub struct ReplicationEngine {
    pager: QueryPager,
    feed: Box<dyn ChangeFeed>,
    store: Box<dyn FingerprintStore>,
    batch_window: Duration,
    state: Arc<RwLock<LoopState>>,
    stats: Arc<EngineStats>,
}

impl ReplicationEngine {
    pub fn new(
        transport: Arc<dyn AuthenticatedTransport>,
        feed: Box<dyn ChangeFeed>,
        store: Box<dyn FingerprintStore>,
    ) -> Self {
        Self {
            pager: QueryPager::new(transport),
            feed,
            store,
            batch_window: DEFAULT_BATCH_WINDOW,
            state: Arc::new(RwLock::new(LoopState::Initializing)),
            stats: Arc::new(EngineStats::default()),
        }
    }

    pub fn with_batch_window(mut self, batch_window: Duration) -> Self {
        self.batch_window = batch_window;
        self
    }

    pub fn state(&self) -> LoopState {
        *self.state.read()
    }

    /// Shared handle to the loop state, for observers on other tasks.
    pub fn state_handle(&self) -> Arc<RwLock<LoopState>> {
        self.state.clone()
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    pub fn store(&self) -> &dyn FingerprintStore {
        self.store.as_ref()
    }

    fn set_state(&self, state: LoopState) {
        *self.state.write() = state;
    }

    /// Replicate until `cancel` fires or a fatal error occurs.
    ///
    /// Returns the number of upserts and deletes emitted. Cancellation is
    /// not an error. The feed is disconnected on every exit path once the
    /// schema has been accepted.
    pub async fn run(
        &mut self,
        catalog: &dyn SchemaCatalog,
        versions: DataVersions,
        checkpoint: RealTimeState,
        cancel: CancellationToken,
        sink: &mut dyn RecordSink,
    ) -> Result<u64> {
        let schema = catalog.schema();
        schema.validate()?;
        self.set_state(LoopState::Initializing);
        info!(entity = %schema.id, job_version = versions.job_version, shape_version = versions.shape_version, "Starting replication");

        let mut sink = CountingSink {
            inner: sink,
            emitted: 0,
        };
        let result = self
            .replicate(schema, versions, checkpoint, &cancel, &mut sink)
            .await;

        if let Err(e) = self.feed.disconnect().await {
            warn!(entity = %schema.id, error = %e, "Change feed disconnect failed");
        }
        self.set_state(LoopState::Stopped);

        let stats = self.stats.snapshot();
        match result {
            Ok(()) => {
                info!(
                    entity = %schema.id,
                    emitted = sink.emitted,
                    upserts = stats.upserts,
                    deletes = stats.deletes,
                    unchanged = stats.unchanged,
                    reconciliations = stats.reconciliations,
                    ticks = stats.ticks,
                    "Replication stopped"
                );
                Ok(sink.emitted)
            }
            Err(e) => {
                error!(
                    entity = %schema.id,
                    error = %e,
                    code = e.error_code(),
                    emitted = sink.emitted,
                    "Replication failed"
                );
                Err(e)
            }
        }
    }

    /// Run on a new task, streaming output through a bounded channel.
    pub fn spawn<C: SchemaCatalog + 'static>(
        mut self,
        catalog: C,
        versions: DataVersions,
        checkpoint: RealTimeState,
        cancel: CancellationToken,
        buffer: usize,
    ) -> (mpsc::Receiver<OutputRecord>, JoinHandle<Result<u64>>) {
        let (mut tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(async move {
            self.run(&catalog, versions, checkpoint, cancel, &mut tx)
                .await
        });
        (rx, handle)
    }

    async fn replicate(
        &mut self,
        schema: &Schema,
        versions: DataVersions,
        checkpoint: RealTimeState,
        cancel: &CancellationToken,
        sink: &mut CountingSink<'_>,
    ) -> Result<()> {
        let mut state = checkpoint;
        if state.needs_full_reset(versions) {
            info!(
                entity = %schema.id,
                from_job_version = state.job_version,
                to_job_version = versions.job_version,
                from_shape_version = state.shape_version,
                to_shape_version = versions.shape_version,
                "Data versions advanced, discarding fingerprints"
            );
            state = RealTimeState::for_versions(versions);
            self.store.clear()?;
        }

        if cancel.is_cancelled() {
            return Ok(());
        }

        self.feed.connect().await?;
        state.last_read_time = Utc::now();

        let reconciler = Reconciler::new(self.pager.clone(), schema);
        let Some(mut run_id) = self.reconcile(&reconciler, &state, cancel, sink).await? else {
            return Ok(());
        };

        self.set_state(LoopState::Running);
        info!(
            entity = %schema.id,
            batch_window_ms = self.batch_window.as_millis() as u64,
            "Listening for changes"
        );

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let batch_window = self.batch_window;
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(batch_window) => {}
            }

            // re-subscribes sessions past their lifetime
            self.feed.connect().await?;

            self.set_state(LoopState::Draining);
            let notifications = self.feed.drain_pending();
            EngineStats::add(&self.stats.ticks, 1);
            EngineStats::add(&self.stats.notifications, notifications.len() as u64);
            debug!(entity = %schema.id, pending = notifications.len(), "Draining change feed");

            for notification in notifications {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                let keep_going = self
                    .apply(&reconciler, &mut run_id, notification, &state, cancel, sink)
                    .await?;
                if !keep_going {
                    return Ok(());
                }
            }

            state.last_read_time = Utc::now();
            sink.emit(OutputRecord::CheckpointCommit(state)).await?;
            self.set_state(LoopState::Running);
        }
    }

    /// Returns the run id of a completed pass, `None` if it was cancelled.
    async fn reconcile(
        &mut self,
        reconciler: &Reconciler,
        state: &RealTimeState,
        cancel: &CancellationToken,
        sink: &mut CountingSink<'_>,
    ) -> Result<Option<String>> {
        let summary = reconciler
            .run(self.store.as_mut(), state, cancel, sink)
            .await?;
        self.stats.record_reconcile(&summary);
        Ok(summary.completed.then_some(summary.run_id))
    }

    /// Apply one notification. Returns `false` if cancellation interrupted a
    /// reconciliation it triggered.
    async fn apply(
        &mut self,
        reconciler: &Reconciler,
        run_id: &mut String,
        notification: ChangeNotification,
        state: &RealTimeState,
        cancel: &CancellationToken,
        sink: &mut CountingSink<'_>,
    ) -> Result<bool> {
        let schema = reconciler.schema();
        if !notification.entity.is_empty() && !notification.entity.eq_ignore_ascii_case(&schema.id) {
            debug!(entity = %notification.entity, "Ignoring notification for another entity");
            return Ok(true);
        }

        match notification.change_type {
            ChangeType::Delete => {
                for keys in delete_keys(reconciler.projector(), &notification) {
                    self.apply_delete(&keys, sink).await?;
                }
            }
            ChangeType::Upsert => {
                let rows = match notification.payload {
                    ChangePayload::Full(row) => vec![row],
                    ChangePayload::Partial(_) | ChangePayload::None => {
                        let rows = refetch(self.pager.clone(), &schema.id, &notification.keys).await?;
                        let missing = notification.keys.len().saturating_sub(rows.len());
                        if missing > 0 {
                            debug!(missing, "Changed records no longer at source");
                            EngineStats::add(&self.stats.missing, missing as u64);
                        }
                        rows
                    }
                };
                for row in rows {
                    self.apply_upsert(reconciler.projector(), run_id, &row, sink)
                        .await?;
                }
            }
            ChangeType::GapRecovery => {
                warn!(entity = %schema.id, "Change feed reported a gap, reconciling");
                match self.reconcile(reconciler, state, cancel, sink).await? {
                    Some(id) => *run_id = id,
                    None => return Ok(false),
                }
            }
        }
        Ok(true)
    }

    async fn apply_delete(&mut self, keys: &Record, sink: &mut CountingSink<'_>) -> Result<()> {
        let id = composite_id(keys);
        if self.store.find_by_id(&id)?.is_none() {
            debug!(id = %id, "Delete for unknown record ignored");
            EngineStats::add(&self.stats.missing, 1);
            return Ok(());
        }

        let removed = self.store.remove(&id)?;
        if let Some(fingerprint) = removed {
            sink.emit(OutputRecord::Delete(fingerprint.keys())).await?;
            EngineStats::add(&self.stats.deletes, 1);
        }
        Ok(())
    }

    async fn apply_upsert(
        &mut self,
        projector: &Projector,
        run_id: &str,
        row: &RawRow,
        sink: &mut CountingSink<'_>,
    ) -> Result<()> {
        let projection = projector.project(row);
        EngineStats::add(&self.stats.malformed, projection.malformed as u64);

        let changed = self
            .store
            .upsert(run_id, &projection.keys, &projection.record)?;
        if changed {
            sink.emit(OutputRecord::Upsert(projection.record)).await?;
            EngineStats::add(&self.stats.upserts, 1);
        } else {
            debug!(id = %composite_id(&projection.keys), "Unchanged record suppressed");
            EngineStats::add(&self.stats.unchanged, 1);
        }
        Ok(())
    }
}

/// Re-fetch rows named by a notification that carried no full payload.
async fn refetch(pager: QueryPager, entity: &str, ids: &[String]) -> Result<Vec<RawRow>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = pager.fetch(&records_by_id_query(entity, ids));
    rows.try_collect().await
}

/// Key records named by a delete notification.
///
/// A full payload is projected as is. Otherwise each id maps onto the first
/// key property, with the remaining key columns taken from a partial payload.
fn delete_keys(projector: &Projector, notification: &ChangeNotification) -> Vec<Record> {
    let fields = match &notification.payload {
        ChangePayload::Full(row) => return vec![projector.project(row).keys],
        ChangePayload::Partial(fields) => fields.clone(),
        ChangePayload::None => RawRow::new(),
    };
    let Some(key) = projector.key_names().next() else {
        return Vec::new();
    };
    notification
        .keys
        .iter()
        .map(|id| {
            let mut row = fields.clone();
            row.insert(key.to_string(), Value::String(id.clone()));
            projector.project(&row).keys
        })
        .collect()
}
