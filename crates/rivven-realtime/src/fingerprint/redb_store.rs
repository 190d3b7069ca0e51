//! redb-backed fingerprint store
//!
//! One database file per job under `{data_dir}/realtime/{job_id}/`.
//! Values are postcard-encoded [`FingerprintRecord`]s keyed by composite id.

use super::{FingerprintRecord, FingerprintStore};
use crate::error::{ReplicationError, Result};
use crate::record::Record;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Table of fingerprints (key: composite id, value: serialized record)
const FINGERPRINTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("fingerprints");

/// Durable fingerprint store on redb.
pub struct RedbFingerprintStore {
    db: Database,
    path: PathBuf,
}

impl std::fmt::Debug for RedbFingerprintStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbFingerprintStore")
            .field("path", &self.path)
            .finish()
    }
}

impl RedbFingerprintStore {
    /// Open or create the store at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ReplicationError::store(format!("Failed to create {:?}: {}", parent, e))
            })?;
        }

        let db = Database::create(&path)
            .map_err(|e| ReplicationError::store(format!("Failed to open redb: {}", e)))?;

        {
            let write_txn = db.begin_write().map_err(store_err)?;
            {
                let _ = write_txn.open_table(FINGERPRINTS_TABLE).map_err(store_err)?;
            }
            write_txn.commit().map_err(store_err)?;
        }

        let store = Self { db, path };
        info!(path = ?store.path, fingerprints = store.len()?, "Opened fingerprint store");
        Ok(store)
    }

    /// Open the store for a job below `data_dir`.
    pub fn open_for_job(data_dir: impl AsRef<Path>, job_id: &str) -> Result<Self> {
        Self::open(Self::job_path(data_dir, job_id)?)
    }

    /// `{data_dir}/realtime/{job_id}/{job_id}_fingerprints.redb`
    pub fn job_path(data_dir: impl AsRef<Path>, job_id: &str) -> Result<PathBuf> {
        validate_job_id(job_id)?;
        Ok(data_dir
            .as_ref()
            .join("realtime")
            .join(job_id)
            .join(format!("{}_fingerprints.redb", job_id)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(record: &FingerprintRecord) -> Result<Vec<u8>> {
        postcard::to_allocvec(record)
            .map_err(|e| ReplicationError::store(format!("Failed to encode fingerprint: {}", e)))
    }

    fn decode(bytes: &[u8]) -> Result<FingerprintRecord> {
        postcard::from_bytes(bytes)
            .map_err(|e| ReplicationError::store(format!("Failed to decode fingerprint: {}", e)))
    }
}

impl FingerprintStore for RedbFingerprintStore {
    fn upsert(&mut self, run_id: &str, keys: &Record, record: &Record) -> Result<bool> {
        let fingerprint = FingerprintRecord::new(run_id, keys, record)?;
        let bytes = Self::encode(&fingerprint)?;

        let write_txn = self.db.begin_write().map_err(store_err)?;
        let changed = {
            let mut table = write_txn.open_table(FINGERPRINTS_TABLE).map_err(store_err)?;
            let previous = match table.get(fingerprint.id.as_str()).map_err(store_err)? {
                Some(value) => Some(Self::decode(value.value())?),
                None => None,
            };
            table
                .insert(fingerprint.id.as_str(), bytes.as_slice())
                .map_err(store_err)?;
            previous.map_or(true, |p| p.content_hash != fingerprint.content_hash)
        };
        write_txn.commit().map_err(store_err)?;

        Ok(changed)
    }

    fn sweep_delete(&mut self, run_id: &str) -> Result<Vec<FingerprintRecord>> {
        let write_txn = self.db.begin_write().map_err(store_err)?;
        let removed = {
            let mut table = write_txn.open_table(FINGERPRINTS_TABLE).map_err(store_err)?;

            let mut stale = Vec::new();
            for entry in table.iter().map_err(store_err)? {
                let (_, value) = entry.map_err(store_err)?;
                let fingerprint = Self::decode(value.value())?;
                if fingerprint.run_id != run_id {
                    stale.push(fingerprint);
                }
            }

            for fingerprint in &stale {
                table.remove(fingerprint.id.as_str()).map_err(store_err)?;
            }
            stale
        };
        write_txn.commit().map_err(store_err)?;

        debug!(run_id, removed = removed.len(), "Swept stale fingerprints");
        Ok(removed)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<FingerprintRecord>> {
        let read_txn = self.db.begin_read().map_err(store_err)?;
        let table = read_txn.open_table(FINGERPRINTS_TABLE).map_err(store_err)?;
        match table.get(id).map_err(store_err)? {
            Some(value) => Ok(Some(Self::decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn remove(&mut self, id: &str) -> Result<Option<FingerprintRecord>> {
        let write_txn = self.db.begin_write().map_err(store_err)?;
        let removed = {
            let mut table = write_txn.open_table(FINGERPRINTS_TABLE).map_err(store_err)?;
            let removed = table.remove(id).map_err(store_err)?;
            match removed {
                Some(value) => Some(Self::decode(value.value())?),
                None => None,
            }
        };
        write_txn.commit().map_err(store_err)?;
        Ok(removed)
    }

    fn clear(&mut self) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(store_err)?;
        {
            write_txn.delete_table(FINGERPRINTS_TABLE).map_err(store_err)?;
            let _ = write_txn.open_table(FINGERPRINTS_TABLE).map_err(store_err)?;
        }
        write_txn.commit().map_err(store_err)?;
        info!(path = ?self.path, "Cleared fingerprint store");
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        let read_txn = self.db.begin_read().map_err(store_err)?;
        let table = read_txn.open_table(FINGERPRINTS_TABLE).map_err(store_err)?;
        Ok(table.len().map_err(store_err)? as usize)
    }
}

fn store_err(e: impl std::fmt::Display) -> ReplicationError {
    ReplicationError::store(e.to_string())
}

/// Job ids become path components.
fn validate_job_id(job_id: &str) -> Result<()> {
    if job_id.is_empty() {
        return Err(ReplicationError::config("job id cannot be empty"));
    }
    if job_id.contains('/') || job_id.contains('\\') || job_id == "." || job_id == ".." {
        return Err(ReplicationError::config(format!(
            "job id '{}' is not a valid path component",
            job_id
        )));
    }
    Ok(())
}
