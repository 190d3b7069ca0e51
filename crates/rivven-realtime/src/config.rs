//! Job configuration
//!
//! ```yaml
//! job:
//!   id: accounts
//!   job_version: 1
//!   shape_version: 3
//!   schema:
//!     id: Account
//!     properties:
//!       - { id: Id, type: string, is_key: true }
//!       - { id: Name, type: string }
//! connection:
//!   instance_url: https://acme.my.salesforce.com
//!   access_token: ${SF_ACCESS_TOKEN}
//! realtime:
//!   channel_name: AccountUpdates
//!   batch_window_seconds: 5
//! storage:
//!   data_dir: ./data
//! ```

use crate::error::{ReplicationError, Result};
use crate::schema::Schema;
use crate::transport::DEFAULT_API_VERSION;
use crate::types::SensitiveString;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Which change feed adapter to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    /// Push topic over Bayeux long-polling
    #[default]
    LongPoll,
    /// Change-data-capture pub/sub stream
    Streaming,
}

/// Real-time settings of a job.
///
/// Accepts both snake_case and the PascalCase keys used by stored job
/// settings (`ChannelName`, `BatchWindowSeconds`, `OrganizationId`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, JsonSchema)]
pub struct RealTimeSettings {
    /// Topic or channel to subscribe to
    #[serde(alias = "ChannelName")]
    #[validate(length(min = 1))]
    pub channel_name: String,

    /// Seconds to wait between drains of the change feed
    #[serde(default = "default_batch_window", alias = "BatchWindowSeconds")]
    #[validate(range(min = 1, max = 3600))]
    pub batch_window_seconds: u64,

    #[serde(default, alias = "OrganizationId")]
    pub organization_id: Option<String>,

    #[serde(default)]
    pub feed: FeedKind,

    /// Feed sessions older than this are re-subscribed on the next tick
    #[serde(default = "default_session_lifetime")]
    #[validate(range(min = 1))]
    pub session_lifetime_secs: u64,
}

fn default_batch_window() -> u64 {
    5
}

fn default_session_lifetime() -> u64 {
    30 * 60
}

impl RealTimeSettings {
    pub fn new(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            batch_window_seconds: default_batch_window(),
            organization_id: None,
            feed: FeedKind::default(),
            session_lifetime_secs: default_session_lifetime(),
        }
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_secs(self.batch_window_seconds)
    }

    pub fn session_lifetime(&self) -> Duration {
        Duration::from_secs(self.session_lifetime_secs)
    }
}

/// Source API connection.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct ConnectionConfig {
    /// Instance base URL, e.g. `https://acme.my.salesforce.com`
    #[validate(url)]
    pub instance_url: String,

    /// OAuth bearer token (redacted in logs)
    pub access_token: SensitiveString,

    #[serde(default = "default_api_version")]
    #[validate(length(min = 1))]
    pub api_version: String,

    #[serde(default = "default_request_timeout")]
    #[validate(range(min = 1, max = 600))]
    pub request_timeout_secs: u64,
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl ConnectionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Job identity and shape.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct JobConfig {
    #[validate(length(min = 1, max = 128))]
    pub id: String,

    /// Bump to force a full resynchronization
    #[serde(default)]
    pub job_version: i64,

    /// Bump when the schema changes shape
    #[serde(default)]
    pub shape_version: i64,

    pub schema: Schema,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StorageConfig {
    /// Root directory for fingerprint stores and checkpoints
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Defaults to `{data_dir}/realtime/{job_id}/checkpoint.json`
    #[serde(default)]
    pub checkpoint_file: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            checkpoint_file: None,
        }
    }
}

impl StorageConfig {
    pub fn checkpoint_path(&self, job_id: &str) -> PathBuf {
        self.checkpoint_file.clone().unwrap_or_else(|| {
            self.data_dir
                .join("realtime")
                .join(job_id)
                .join("checkpoint.json")
        })
    }
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct EngineConfig {
    #[validate(nested)]
    pub job: JobConfig,

    #[validate(nested)]
    pub connection: ConnectionConfig,

    #[validate(nested)]
    pub realtime: RealTimeSettings,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate YAML, expanding environment variables first.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| ReplicationError::config(format!("Failed to parse config: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Field validation plus the schema checks that need the whole job.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| ReplicationError::config(format!("Config validation failed: {}", e)))?;
        if self.connection.access_token.is_empty() {
            return Err(ReplicationError::config("connection.access_token is empty"));
        }
        self.job.schema.validate()?;
        Ok(())
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.storage.checkpoint_path(&self.job.id)
    }

    /// JSON Schema of the configuration file.
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(EngineConfig)).unwrap_or_default()
    }
}

/// Expand environment variables in the format ${VAR} or ${VAR:-default}
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}
