use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::taxonomy::DEFAULT_IDENTITY_COLUMN;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database file; defaults to `photo_metadata.db` inside the ingested folder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,

    /// Taxonomy document; the built-in taxonomy is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taxonomy_path: Option<PathBuf>,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub extractor: ExtractorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_identity_column")]
    pub identity_column: String,

    /// Create the table as STRICT so type mismatches are rejected per column.
    #[serde(default)]
    pub strict: bool,

    /// Add a UNIQUE constraint on the identity column.
    #[serde(default)]
    pub unique_identity: bool,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_table() -> String {
    "photo_metadata".to_string()
}

fn default_identity_column() -> String {
    DEFAULT_IDENTITY_COLUMN.to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            identity_column: default_identity_column(),
            strict: false,
            unique_identity: false,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// What to do with raw keys that match no taxonomy tag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnmappedKeyPolicy {
    /// Drop silently.
    Drop,
    /// Drop and record a diagnostic per key.
    #[default]
    Diagnose,
    /// Treat the whole record as invalid.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Records per transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Normalization threads; 0 uses the rayon default, 1 disables parallelism.
    #[serde(default)]
    pub workers: usize,

    #[serde(default)]
    pub unmapped_keys: UnmappedKeyPolicy,

    /// Retry a record once when column diagnosis finds nothing wrong.
    #[serde(default = "default_retry_transient")]
    pub retry_transient: bool,
}

fn default_batch_size() -> usize {
    500
}

fn default_retry_transient() -> bool {
    true
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: 0,
            unmapped_keys: UnmappedKeyPolicy::default(),
            retry_transient: default_retry_transient(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    #[default]
    ExifTool,
    Native,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    #[serde(default)]
    pub kind: ExtractorKind,

    #[serde(default = "default_exiftool_path")]
    pub exiftool_path: PathBuf,

    #[serde(default = "default_exclude_extensions")]
    pub exclude_extensions: Vec<String>,

    /// Files per exiftool invocation.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_exiftool_path() -> PathBuf {
    PathBuf::from("exiftool")
}

fn default_exclude_extensions() -> Vec<String> {
    vec![
        "txt".to_string(),
        "csv".to_string(),
        "db".to_string(),
        "args".to_string(),
        "json".to_string(),
    ]
}

fn default_chunk_size() -> usize {
    200
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            kind: ExtractorKind::default(),
            exiftool_path: default_exiftool_path(),
            exclude_extensions: default_exclude_extensions(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            taxonomy_path: None,
            store: StoreConfig::default(),
            ingest: IngestConfig::default(),
            extractor: ExtractorConfig::default(),
        }
    }
}

impl Config {
    /// Load from `path`, or from the default location, writing defaults
    /// there on first use.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::config_path);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config {}", config_path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Invalid config {}", config_path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&config_path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Database location for a run over `folder`.
    pub fn db_path_for(&self, folder: &Path) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| folder.join("photo_metadata.db"))
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("PHOTOMETA_CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photometa")
            .join("config.toml")
    }
}
