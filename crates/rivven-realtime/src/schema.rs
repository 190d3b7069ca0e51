//! Job schema
//!
//! A [`Schema`] names the source entity, an optional explicit query and the
//! ordered list of properties to replicate. It is supplied by the caller and
//! stays fixed for the duration of a run.

use crate::error::{ReplicationError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declared type of a schema property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    #[default]
    String,
    Text,
    Decimal,
    Integer,
    Float,
    Bool,
    Date,
    Time,
    Datetime,
    Blob,
    Json,
}

impl PropertyType {
    /// Types whose values are always carried as their string form.
    pub fn is_stringly(&self) -> bool {
        matches!(self, Self::String | Self::Text | Self::Decimal)
    }
}

/// A single replicated column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Property {
    /// Column name as returned by the source API
    pub id: String,
    #[serde(rename = "type", default)]
    pub property_type: PropertyType,
    #[serde(default)]
    pub is_key: bool,
    #[serde(default)]
    pub is_update_counter: bool,
}

impl Property {
    pub fn new(id: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            id: id.into(),
            property_type,
            is_key: false,
            is_update_counter: false,
        }
    }

    pub fn key(mut self) -> Self {
        self.is_key = true;
        self
    }

    pub fn update_counter(mut self) -> Self {
        self.is_update_counter = true;
        self
    }
}

/// How key properties are identified.
///
/// Sources disagree on whether key metadata is explicit, so the choice is
/// part of the schema rather than hardcoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// Use the `is_key` flag on each property
    #[default]
    Explicit,
    /// Any property named `id` (case-insensitive) is the key
    IdName,
}

impl KeyPolicy {
    pub fn is_key(&self, property: &Property) -> bool {
        match self {
            Self::Explicit => property.is_key,
            Self::IdName => property.id.eq_ignore_ascii_case("id"),
        }
    }
}

/// Replication schema for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Schema {
    /// Source entity name (e.g. `Account`)
    pub id: String,
    /// Explicit base query; the default full-table query is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub key_policy: KeyPolicy,
    pub properties: Vec<Property>,
}

impl Schema {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query: None,
            key_policy: KeyPolicy::default(),
            properties: Vec::new(),
        }
    }

    pub fn with_property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_key_policy(mut self, policy: KeyPolicy) -> Self {
        self.key_policy = policy;
        self
    }

    /// The explicit query, ignoring blank strings.
    pub fn explicit_query(&self) -> Option<&str> {
        self.query.as_deref().filter(|q| !q.trim().is_empty())
    }

    /// Key properties in schema order, as selected by the key policy.
    pub fn key_properties(&self) -> impl Iterator<Item = &Property> {
        self.properties
            .iter()
            .filter(move |p| self.key_policy.is_key(p))
    }

    pub fn key_names(&self) -> Vec<String> {
        self.key_properties().map(|p| p.id.clone()).collect()
    }

    /// Check that the schema can drive replication.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ReplicationError::invalid_schema("entity id is empty"));
        }
        if self.properties.is_empty() {
            return Err(ReplicationError::invalid_schema(format!(
                "schema '{}' has no properties",
                self.id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for property in &self.properties {
            if !seen.insert(property.id.as_str()) {
                return Err(ReplicationError::invalid_schema(format!(
                    "duplicate property '{}'",
                    property.id
                )));
            }
        }
        if self.key_properties().next().is_none() {
            return Err(ReplicationError::invalid_schema(format!(
                "schema '{}' has no key property under the {:?} key policy",
                self.id, self.key_policy
            )));
        }
        Ok(())
    }
}

/// Read-only source of the job schema.
pub trait SchemaCatalog: Send + Sync {
    fn schema(&self) -> &Schema;
}

impl SchemaCatalog for Schema {
    fn schema(&self) -> &Schema {
        self
    }
}
