//! Fingerprint store
//!
//! A durable, job-local map from composite record id to the last observed
//! content hash, key values and the reconciliation run that last saw the
//! record. It is a cache of observed state: discarding it only costs a full
//! re-emit on the next reconciliation.
//!
//! - [`RedbFingerprintStore`]: embedded on-disk store (redb)
//! - [`MemoryFingerprintStore`]: in-memory store for tests
//!
//! Single writer per job. Stores are driven from the replication task only.

mod memory;
mod redb_store;

pub use memory::MemoryFingerprintStore;
pub use redb_store::RedbFingerprintStore;

use crate::error::Result;
use crate::record::{FieldValue, Record};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 of a projected record.
pub type ContentHash = [u8; 32];

/// Last known state of one logical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    /// Composite id, see [`composite_id`]
    pub id: String,
    /// Reconciliation run that last stamped this record
    pub run_id: String,
    /// Key property values, in schema order
    pub key_values: Vec<(String, FieldValue)>,
    pub content_hash: ContentHash,
}

impl FingerprintRecord {
    pub fn new(run_id: impl Into<String>, keys: &Record, record: &Record) -> Result<Self> {
        Ok(Self {
            id: composite_id(keys),
            run_id: run_id.into(),
            key_values: keys.clone().into_fields(),
            content_hash: content_hash(record)?,
        })
    }

    pub fn keys(&self) -> Record {
        Record::from(self.key_values.clone())
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.content_hash)
    }
}

/// Build the composite id from key values: each key becomes
/// `"{name}_{value}"` and the parts are joined with `_`.
pub fn composite_id(keys: &Record) -> String {
    keys.iter()
        .map(|(name, value)| format!("{}_{}", name, value.to_key_string()))
        .collect::<Vec<_>>()
        .join("_")
}

/// Hash the projected record as serialized JSON.
pub fn content_hash(record: &Record) -> Result<ContentHash> {
    let bytes = serde_json::to_vec(record)?;
    let digest = Sha256::digest(&bytes);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&digest);
    Ok(hash)
}

/// Durable fingerprint storage.
pub trait FingerprintStore: Send {
    /// Write the fingerprint of `record` stamped with `run_id`.
    ///
    /// Returns `true` if the id was unknown or its content hash changed.
    fn upsert(&mut self, run_id: &str, keys: &Record, record: &Record) -> Result<bool>;

    /// Remove and return every fingerprint not stamped with `run_id`.
    fn sweep_delete(&mut self, run_id: &str) -> Result<Vec<FingerprintRecord>>;

    fn find_by_id(&self, id: &str) -> Result<Option<FingerprintRecord>>;

    /// Remove a single fingerprint, returning it if it existed.
    fn remove(&mut self, id: &str) -> Result<Option<FingerprintRecord>>;

    /// Drop every fingerprint.
    fn clear(&mut self) -> Result<()>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl<S: FingerprintStore + ?Sized> FingerprintStore for Box<S> {
    fn upsert(&mut self, run_id: &str, keys: &Record, record: &Record) -> Result<bool> {
        (**self).upsert(run_id, keys, record)
    }

    fn sweep_delete(&mut self, run_id: &str) -> Result<Vec<FingerprintRecord>> {
        (**self).sweep_delete(run_id)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<FingerprintRecord>> {
        (**self).find_by_id(id)
    }

    fn remove(&mut self, id: &str) -> Result<Option<FingerprintRecord>> {
        (**self).remove(id)
    }

    fn clear(&mut self) -> Result<()> {
        (**self).clear()
    }

    fn len(&self) -> Result<usize> {
        (**self).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_id() {
        let keys = Record::new().with("Id", "001A");
        assert_eq!(composite_id(&keys), "Id_001A");

        let keys = Record::new().with("Region", "EU").with("Number", 42i64);
        assert_eq!(composite_id(&keys), "Region_EU_Number_42");

        let keys = Record::new().with("Id", FieldValue::Null);
        assert_eq!(composite_id(&keys), "Id_");
    }

    #[test]
    fn test_content_hash_is_stable_and_sensitive() {
        let a = Record::new().with("Id", "1").with("Name", "A");
        let same = Record::new().with("Id", "1").with("Name", "A");
        let other = Record::new().with("Id", "1").with("Name", "B");

        assert_eq!(content_hash(&a).unwrap(), content_hash(&same).unwrap());
        assert_ne!(content_hash(&a).unwrap(), content_hash(&other).unwrap());
    }

    #[test]
    fn test_hash_covers_projected_form() {
        use crate::record::Projector;
        use crate::schema::{Property, PropertyType, Schema};

        let schema = Schema::new("Opportunity")
            .with_property(Property::new("Id", PropertyType::String).key())
            .with_property(Property::new("Amount", PropertyType::Decimal));
        let projector = Projector::new(&schema);

        let as_number = serde_json::json!({"Id": "1", "Amount": 100});
        let as_string = serde_json::json!({"Id": "1", "Amount": "100"});
        let a = projector.project(as_number.as_object().unwrap());
        let b = projector.project(as_string.as_object().unwrap());

        assert_eq!(
            content_hash(&a.record).unwrap(),
            content_hash(&b.record).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_record() {
        let keys = Record::new().with("Id", "1");
        let record = Record::new().with("Id", "1").with("Name", "A");
        let fp = FingerprintRecord::new("run-1", &keys, &record).unwrap();

        assert_eq!(fp.id, "Id_1");
        assert_eq!(fp.keys(), keys);
        assert_eq!(fp.hash_hex().len(), 64);
    }
}
