use std::path::{Path, PathBuf};

use eln_types::DocumentType;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Default number of concurrent blocking filesystem calls.
pub const DEFAULT_BLOCKING_WORKERS: usize = 4;

/// Default short-id retry budget handed to the identity generator.
pub const DEFAULT_MAX_ID_ATTEMPTS: u32 = 10;

/// Which backend implementation to open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Local,
    ObjectStore,
}

/// Bucket (or root directory) name per document type.
///
/// A missing entry is a configuration error at the time the type is used.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketMap {
    #[serde(default)]
    pub drafts: Option<String>,
    #[serde(default)]
    pub submissions: Option<String>,
    #[serde(default)]
    pub sops: Option<String>,
}

impl BucketMap {
    pub fn new(
        drafts: impl Into<String>,
        submissions: impl Into<String>,
        sops: impl Into<String>,
    ) -> Self {
        Self {
            drafts: Some(drafts.into()),
            submissions: Some(submissions.into()),
            sops: Some(sops.into()),
        }
    }

    /// The bucket names used by test fixtures.
    pub fn for_tests() -> Self {
        Self::new("eln-drafts", "eln", "forms")
    }

    /// Resolve the bucket for a document type.
    pub fn bucket_for(&self, doc_type: DocumentType) -> StoreResult<&str> {
        let bucket = match doc_type {
            DocumentType::Drafts => self.drafts.as_deref(),
            DocumentType::Submissions => self.submissions.as_deref(),
            DocumentType::Sops => self.sops.as_deref(),
        };
        match bucket {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(StoreError::BucketNotConfigured(doc_type)),
        }
    }
}

/// Connection settings for an S3-compatible object store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    /// Base URL, e.g. `https://s3.us-east-1.amazonaws.com` or `http://localhost:9000`.
    pub endpoint: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_blocking_workers() -> usize {
    DEFAULT_BLOCKING_WORKERS
}

fn default_max_id_attempts() -> u32 {
    DEFAULT_MAX_ID_ATTEMPTS
}

/// Storage configuration, built once at process start and passed down.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Root directory for the local backend. Defaults to `<project root>/.local/s3`.
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub buckets: BucketMap,
    #[serde(default = "default_blocking_workers")]
    pub blocking_workers: usize,
    #[serde(default = "default_max_id_attempts")]
    pub max_id_attempts: u32,
    #[serde(default)]
    pub s3: Option<S3Config>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            local_path: None,
            buckets: BucketMap::default(),
            blocking_workers: DEFAULT_BLOCKING_WORKERS,
            max_id_attempts: DEFAULT_MAX_ID_ATTEMPTS,
            s3: None,
        }
    }
}

impl StorageConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> StoreResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> StoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| StoreError::Config(e.to_string()))
    }

    /// Check settings that do not depend on which document type is used.
    pub fn validate(&self) -> StoreResult<()> {
        if self.blocking_workers == 0 {
            return Err(StoreError::Config("blocking_workers must be at least 1".into()));
        }
        if self.max_id_attempts == 0 {
            return Err(StoreError::Config("max_id_attempts must be at least 1".into()));
        }
        if self.backend == BackendKind::ObjectStore && self.s3.is_none() {
            return Err(StoreError::Config(
                "backend = \"object_store\" requires an [s3] section".into(),
            ));
        }
        Ok(())
    }
}
