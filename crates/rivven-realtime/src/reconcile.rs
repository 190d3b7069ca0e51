//! Full reconciliation
//!
//! One pass loads every row of the job's base query, stamps each fingerprint
//! with a fresh run id and emits only rows whose content changed. Whatever
//! the pass did not stamp no longer exists at the source: it is swept from
//! the store and emitted as a delete. The pass ends with a checkpoint commit,
//! after the deletes.
//!
//! A pass interrupted by cancellation skips the sweep and the commit. The
//! store then holds a mix of run ids, which the next completed pass settles.

use crate::checkpoint::RealTimeState;
use crate::error::Result;
use crate::fingerprint::FingerprintStore;
use crate::output::{OutputRecord, RecordSink};
use crate::query::QueryPager;
use crate::record::Projector;
use crate::schema::Schema;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub run_id: String,
    /// Rows read from the source
    pub rows: u64,
    pub upserts: u64,
    pub unchanged: u64,
    pub deletes: u64,
    /// Properties nulled during projection
    pub malformed: u64,
    /// False if cancellation cut the pass short
    pub completed: bool,
}

impl ReconcileSummary {
    /// Upserts plus deletes emitted.
    pub fn emitted(&self) -> u64 {
        self.upserts + self.deletes
    }
}

/// Runs reconciliation passes for one schema.
pub struct Reconciler {
    pager: QueryPager,
    projector: Projector,
    schema: Schema,
}

impl Reconciler {
    pub fn new(pager: QueryPager, schema: &Schema) -> Self {
        Self {
            pager,
            projector: Projector::new(schema),
            schema: schema.clone(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn projector(&self) -> &Projector {
        &self.projector
    }

    /// Run one pass against `store`, emitting to `sink`.
    ///
    /// `state` is the checkpoint carried by the closing commit.
    pub async fn run(
        &self,
        store: &mut dyn FingerprintStore,
        state: &RealTimeState,
        cancel: &CancellationToken,
        sink: &mut dyn RecordSink,
    ) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary {
            run_id: Uuid::new_v4().to_string(),
            ..Default::default()
        };
        info!(entity = %self.schema.id, run_id = %summary.run_id, "Starting reconciliation");

        let mut rows = self.pager.fetch_schema(&self.schema);
        while let Some(row) = rows.next().await {
            if cancel.is_cancelled() {
                info!(run_id = %summary.run_id, rows = summary.rows, "Reconciliation cancelled");
                return Ok(summary);
            }

            let projection = self.projector.project(&row?);
            summary.rows += 1;
            summary.malformed += projection.malformed as u64;

            let changed = store.upsert(&summary.run_id, &projection.keys, &projection.record)?;
            if changed {
                sink.emit(OutputRecord::Upsert(projection.record)).await?;
                summary.upserts += 1;
            } else {
                summary.unchanged += 1;
            }
        }

        let removed = store.sweep_delete(&summary.run_id)?;
        for fingerprint in removed {
            debug!(id = %fingerprint.id, "Record no longer at source");
            sink.emit(OutputRecord::Delete(fingerprint.keys())).await?;
            summary.deletes += 1;
        }

        sink.emit(OutputRecord::CheckpointCommit(*state)).await?;
        summary.completed = true;

        info!(
            entity = %self.schema.id,
            run_id = %summary.run_id,
            rows = summary.rows,
            upserts = summary.upserts,
            unchanged = summary.unchanged,
            deletes = summary.deletes,
            "Reconciliation complete"
        );
        Ok(summary)
    }
}
