//! In-memory fingerprint store

use super::{FingerprintRecord, FingerprintStore};
use crate::error::Result;
use crate::record::Record;
use std::collections::BTreeMap;

/// Fingerprints held in a `BTreeMap`. Not durable.
#[derive(Debug, Default, Clone)]
pub struct MemoryFingerprintStore {
    records: BTreeMap<String, FingerprintRecord>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a fingerprint directly, e.g. to simulate state left by an
    /// earlier run.
    pub fn insert(&mut self, record: FingerprintRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn ids(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }
}

impl FingerprintStore for MemoryFingerprintStore {
    fn upsert(&mut self, run_id: &str, keys: &Record, record: &Record) -> Result<bool> {
        let fingerprint = FingerprintRecord::new(run_id, keys, record)?;
        let changed = self
            .records
            .get(&fingerprint.id)
            .map_or(true, |previous| previous.content_hash != fingerprint.content_hash);
        self.records.insert(fingerprint.id.clone(), fingerprint);
        Ok(changed)
    }

    fn sweep_delete(&mut self, run_id: &str) -> Result<Vec<FingerprintRecord>> {
        let (kept, removed): (BTreeMap<_, _>, BTreeMap<_, _>) =
            std::mem::take(&mut self.records)
                .into_iter()
                .partition(|(_, r)| r.run_id == run_id);
        self.records = kept;
        Ok(removed.into_values().collect())
    }

    fn find_by_id(&self, id: &str) -> Result<Option<FingerprintRecord>> {
        Ok(self.records.get(id).cloned())
    }

    fn remove(&mut self, id: &str) -> Result<Option<FingerprintRecord>> {
        Ok(self.records.remove(id))
    }

    fn clear(&mut self) -> Result<()> {
        self.records.clear();
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.records.len())
    }
}
