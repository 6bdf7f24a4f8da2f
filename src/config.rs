//! Configuration for the pipeline and its remote store
//!
//! Configuration is loaded once at startup from an optional YAML file, then
//! overlaid with the environment variables the service has always honored
//! (`AWS_REGION`, `S3_BUCKET_NAME`, `AWS_ACCESS_KEY_ID`,
//! `AWS_SECRET_ACCESS_KEY`) plus a few of its own. The same variables may also
//! come from a `.env` file; the real environment wins over it. Anything missing
//! or inconsistent is a [`Error::Configuration`] and the process does not serve.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How the flush cycle picks the segment a record is filed into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilingPolicy {
    /// File every record of a batch under the minute the batch was flushed in
    ///
    /// Late or out-of-order records land in the segment of their arrival
    /// minute, not the minute of their own timestamp.
    #[default]
    ArrivalTime,
    /// File each record under the minute of its own timestamp
    EventTime,
}

/// Tuning for the ingestion, flush, upload and query paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding local segment files
    pub data_dir: PathBuf,
    /// Prefix prepended to every remote segment key
    pub namespace: String,
    /// Maximum number of records waiting in the ingestion buffer
    pub ingest_capacity: usize,
    /// Interval between flush ticks in milliseconds
    pub flush_interval_ms: u64,
    /// Interval between upload scans in milliseconds
    pub upload_interval_ms: u64,
    /// Idle time after the last write before a segment is sealed, in milliseconds
    pub seal_delay_ms: u64,
    /// Widest time range a single query may span, in seconds
    pub max_query_span_secs: i64,
    /// Segment selection for flushed records
    pub filing_policy: FilingPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./logs"),
            namespace: "segments/".to_string(),
            ingest_capacity: 100_000,
            flush_interval_ms: 500,
            upload_interval_ms: 1_000,
            seal_delay_ms: 5_000,
            max_query_span_secs: 7 * 24 * 3600,
            filing_policy: FilingPolicy::ArrivalTime,
        }
    }
}

impl PipelineConfig {
    /// Flush tick interval
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Upload scan interval
    pub fn upload_interval(&self) -> Duration {
        Duration::from_millis(self.upload_interval_ms)
    }

    /// Idle time before a segment is considered closed
    pub fn seal_delay(&self) -> Duration {
        Duration::from_millis(self.seal_delay_ms)
    }

    /// Check invariants the pipeline relies on
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::Configuration("namespace must not be empty".into()));
        }
        if self.ingest_capacity == 0 {
            return Err(Error::Configuration("ingest_capacity must be positive".into()));
        }
        if self.flush_interval_ms == 0 || self.upload_interval_ms == 0 {
            return Err(Error::Configuration("cycle intervals must be positive".into()));
        }
        if self.max_query_span_secs <= 0 {
            return Err(Error::Configuration("max_query_span_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Object store provider configuration
#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ObjectStoreConfig {
    /// In-memory object store (useful for testing and development)
    #[default]
    InMemory,

    /// Local filesystem object store
    Local(LocalObjectStoreConfig),

    /// AWS S3 object store
    Aws(AwsObjectStoreConfig),
}

/// Local filesystem object store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalObjectStoreConfig {
    /// Root directory of the store
    pub path: PathBuf,
}

/// AWS S3 object store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AwsObjectStoreConfig {
    /// AWS region (e.g. "us-west-2")
    pub region: String,

    /// S3 bucket name
    pub bucket: String,

    /// Static access key; the default credential chain is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,

    /// Static secret key paired with `access_key_id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
}

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pipeline tuning
    pub pipeline: PipelineConfig,
    /// Remote segment store
    pub object_store: ObjectStoreConfig,
}

impl Config {
    /// Parse a YAML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Parse a YAML configuration document
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Configuration(format!("invalid config: {}", e)))
    }

    /// Load the file (if any), apply the environment, and validate
    ///
    /// `env_file` is read as a dotenv file when it exists; a missing file is
    /// not an error.
    pub fn load(path: Option<&Path>, env_file: &Path) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let dotenv = read_env_file(env_file)?;
        config.apply_overrides(|name| std::env::var(name).ok().or_else(|| dotenv.get(name).cloned()));
        config.validate()?;
        Ok(config)
    }

    /// Overlay values found through `lookup`, keyed by environment variable name
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|value| !value.is_empty());

        if let Some(namespace) = lookup("SEGMENT_LOG_NAMESPACE") {
            self.pipeline.namespace = namespace;
        }
        if let Some(dir) = lookup("SEGMENT_LOG_DATA_DIR") {
            self.pipeline.data_dir = PathBuf::from(dir);
        }

        let bucket = lookup("S3_BUCKET_NAME");
        let region = lookup("AWS_REGION");
        if bucket.is_none() && !matches!(self.object_store, ObjectStoreConfig::Aws(_)) {
            return;
        }

        let mut aws = match std::mem::take(&mut self.object_store) {
            ObjectStoreConfig::Aws(aws) => aws,
            _ => AwsObjectStoreConfig {
                region: String::new(),
                bucket: String::new(),
                access_key_id: None,
                secret_access_key: None,
            },
        };
        if let Some(bucket) = bucket {
            aws.bucket = bucket;
        }
        if let Some(region) = region {
            aws.region = region;
        }
        if let Some(key) = lookup("AWS_ACCESS_KEY_ID") {
            aws.access_key_id = Some(key);
        }
        if let Some(secret) = lookup("AWS_SECRET_ACCESS_KEY") {
            aws.secret_access_key = Some(secret);
        }
        self.object_store = ObjectStoreConfig::Aws(aws);
    }

    /// Check the whole configuration
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        if let ObjectStoreConfig::Aws(aws) = &self.object_store {
            if aws.bucket.is_empty() {
                return Err(Error::Configuration("S3 bucket name is missing".into()));
            }
            if aws.region.is_empty() {
                return Err(Error::Configuration("AWS region is missing".into()));
            }
            if aws.access_key_id.is_some() != aws.secret_access_key.is_some() {
                return Err(Error::Configuration(
                    "access key id and secret access key must be given together".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Variables defined in a dotenv file, empty if the file does not exist
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let entries = match dotenvy::from_path_iter(path) {
        Ok(entries) => entries,
        Err(e) if e.not_found() => return Ok(HashMap::new()),
        Err(e) => {
            return Err(Error::Configuration(format!(
                "failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    entries
        .map(|entry| {
            entry.map_err(|e| {
                Error::Configuration(format!("invalid env file {}: {}", path.display(), e))
            })
        })
        .collect()
}
