//! Engine configuration via `magnetite.toml`
//!
//! Settings live in a config file in the data directory. On first open a
//! commented default file is written; to change settings, edit the file
//! and restart.

use magnetite_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name placed in the data directory.
pub const CONFIG_FILE_NAME: &str = "magnetite.toml";

/// Engine configuration, mirrored by `magnetite.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root data directory.
    pub data_path: PathBuf,
    /// Write-ahead log master switch.
    #[serde(default = "default_true")]
    pub wal_enable: bool,
    /// WAL file rotation size in megabytes.
    #[serde(default = "default_wal_buffer_size_mb")]
    pub wal_buffer_size_mb: u64,
    /// Group-commit fsync window in milliseconds; zero syncs every append.
    #[serde(default)]
    pub wal_sync_window_ms: u64,
    /// Retention of tombstoned catalog rows and their blobs, seconds.
    #[serde(default = "default_wal_retention_ttl_sec")]
    pub wal_retention_ttl_sec: u64,
    /// In-memory buffer high watermark in megabytes; crossing it triggers
    /// a flush of the collection being written.
    #[serde(default = "default_insert_buffer_size_mb")]
    pub insert_buffer_size_mb: u64,
    /// Background auto-flush cadence in seconds.
    #[serde(default = "default_auto_flush_interval_sec")]
    pub auto_flush_interval_sec: u64,
    /// Default merge target for new collections, megabytes.
    #[serde(default = "default_target_segment_size_mb")]
    pub target_segment_size_mb: u64,
    /// Worker threads for merge and compaction.
    #[serde(default = "default_two")]
    pub merge_concurrency: usize,
    /// Worker threads for index builds.
    #[serde(default = "default_two")]
    pub index_concurrency: usize,
    /// Archive segments older than this many days; zero disables.
    #[serde(default)]
    pub archive_days: u64,
    /// Archive oldest segments once total size passes this many
    /// gigabytes; zero disables.
    #[serde(default)]
    pub archive_disk_gb: u64,
    /// Grace period before tombstoned segments are physically erased,
    /// seconds.
    #[serde(default = "default_ongoing_ttl_sec")]
    pub ongoing_ttl_sec: u64,
    /// Byte budget of the decoded-segment cache, megabytes.
    #[serde(default = "default_cache_size_mb")]
    pub cache_size_mb: u64,
}

fn default_true() -> bool {
    true
}
fn default_wal_buffer_size_mb() -> u64 {
    64
}
fn default_wal_retention_ttl_sec() -> u64 {
    86_400
}
fn default_insert_buffer_size_mb() -> u64 {
    256
}
fn default_auto_flush_interval_sec() -> u64 {
    1
}
fn default_target_segment_size_mb() -> u64 {
    1024
}
fn default_two() -> usize {
    2
}
fn default_ongoing_ttl_sec() -> u64 {
    60
}
fn default_cache_size_mb() -> u64 {
    512
}

impl EngineConfig {
    /// A config rooted at `data_path` with defaults everywhere else.
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            wal_enable: default_true(),
            wal_buffer_size_mb: default_wal_buffer_size_mb(),
            wal_sync_window_ms: 0,
            wal_retention_ttl_sec: default_wal_retention_ttl_sec(),
            insert_buffer_size_mb: default_insert_buffer_size_mb(),
            auto_flush_interval_sec: default_auto_flush_interval_sec(),
            target_segment_size_mb: default_target_segment_size_mb(),
            merge_concurrency: default_two(),
            index_concurrency: default_two(),
            archive_days: 0,
            archive_disk_gb: 0,
            ongoing_ttl_sec: default_ongoing_ttl_sec(),
            cache_size_mb: default_cache_size_mb(),
        }
    }

    /// Validate ranges that would otherwise fail far from their cause.
    pub fn validate(&self) -> Result<()> {
        if self.merge_concurrency == 0 || self.index_concurrency == 0 {
            return Err(Error::invalid_argument(
                "merge_concurrency and index_concurrency must be positive",
            ));
        }
        if self.target_segment_size_mb == 0 {
            return Err(Error::invalid_argument(
                "target_segment_size_mb must be positive",
            ));
        }
        if self.insert_buffer_size_mb == 0 {
            return Err(Error::invalid_argument(
                "insert_buffer_size_mb must be positive",
            ));
        }
        Ok(())
    }

    /// WAL rotation size in bytes.
    pub fn wal_file_size_limit(&self) -> u64 {
        self.wal_buffer_size_mb * 1024 * 1024
    }

    /// Group-commit window as a duration.
    pub fn wal_sync_window(&self) -> Duration {
        Duration::from_millis(self.wal_sync_window_ms)
    }

    /// Buffer high watermark in bytes.
    pub fn insert_buffer_size(&self) -> u64 {
        self.insert_buffer_size_mb * 1024 * 1024
    }

    /// Default merge target in bytes.
    pub fn target_segment_size(&self) -> u64 {
        self.target_segment_size_mb * 1024 * 1024
    }

    /// Cache budget in bytes.
    pub fn cache_size(&self) -> u64 {
        self.cache_size_mb * 1024 * 1024
    }

    /// Auto-flush cadence as a duration.
    pub fn auto_flush_interval(&self) -> Duration {
        Duration::from_secs(self.auto_flush_interval_sec.max(1))
    }

    /// Archive disk quota in bytes; zero when disabled.
    pub fn archive_disk_quota(&self) -> u64 {
        self.archive_disk_gb * 1024 * 1024 * 1024
    }

    /// Read config from `<data_path>/magnetite.toml`, writing a commented
    /// default file first if none exists.
    pub fn load_or_default(data_path: impl Into<PathBuf>) -> Result<Self> {
        let data_path = data_path.into();
        std::fs::create_dir_all(&data_path)?;
        let path = data_path.join(CONFIG_FILE_NAME);
        if !path.exists() {
            std::fs::write(&path, Self::default_toml())?;
        }
        let mut config = Self::from_file(&path)?;
        config.data_path = data_path;
        Ok(config)
    }

    /// Read and parse a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content).map_err(|e| {
            Error::invalid_argument(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// The default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Magnetite engine configuration
#
# Root data directory. Relative paths resolve against the working
# directory of the process.
data_path = "."

# Write-ahead log. Disabling trades crash safety for insert latency.
wal_enable = true
wal_buffer_size_mb = 64
# fsync group-commit window in milliseconds; 0 syncs every append.
wal_sync_window_ms = 0
# Grace period for tombstoned segments and their blobs, seconds.
wal_retention_ttl_sec = 86400

# In-memory insert buffer high watermark, megabytes.
insert_buffer_size_mb = 256
# Background auto-flush cadence, seconds.
auto_flush_interval_sec = 1

# Merge target for new collections, megabytes.
target_segment_size_mb = 1024

# Background worker threads.
merge_concurrency = 2
index_concurrency = 2

# Archival; 0 disables.
archive_days = 0
archive_disk_gb = 0

# Grace period before tombstoned segments are erased, seconds.
ongoing_ttl_sec = 60

# Decoded-segment cache budget, megabytes.
cache_size_mb = 512
"#
    }
}
