//! Tunables for capture, storage and synchronization.
//!
//! Every field has a default so an empty JSON object (or no file at all) yields a usable
//! configuration. The batch and page ceilings mirror limits of mobile storage back ends
//! and should only be lowered.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum combined sample count of one `DataCaptured` message
pub const DEFAULT_CHUNK_SIZE: usize = 400;
/// Maximum rows written in one transaction
pub const MAX_SIMULTANEOUS_OPERATIONS: usize = 550;
/// Maximum rows returned by one page query
pub const DATABASE_QUERY_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub capture: CaptureConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
}

impl AppConfig {
    /// Load from a JSON file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub chunk_size: usize,
    /// Buffered samples (all kinds) that force a flush
    pub flush_threshold: usize,
    pub flush_interval_ms: u64,
    pub pause_resume_timeout_ms: u64,
    pub observer_send_timeout_ms: u64,
    pub min_satellites_for_fix: u32,
    pub location_fix_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            flush_threshold: 1_000,
            flush_interval_ms: 1_000,
            pause_resume_timeout_ms: 10_000,
            observer_send_timeout_ms: 100,
            min_satellites_for_fix: 4,
            location_fix_timeout_ms: 2_000,
        }
    }
}

impl CaptureConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn pause_resume_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_resume_timeout_ms)
    }

    pub fn observer_send_timeout(&self) -> Duration {
        Duration::from_millis(self.observer_send_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub max_batch_operations: usize,
    pub query_limit: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("measurements.db"),
            max_batch_operations: MAX_SIMULTANEOUS_OPERATIONS,
            query_limit: DATABASE_QUERY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub credential_timeout_ms: u64,
    pub upload_timeout_secs: u64,
    /// Bytes per upload body chunk; progress is reported once per chunk
    pub upload_chunk_bytes: usize,
    pub cycle_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            credential_timeout_ms: 1_000,
            upload_timeout_secs: 60,
            upload_chunk_bytes: 64 * 1024,
            cycle_interval_secs: 15 * 60,
        }
    }
}

impl SyncConfig {
    pub fn credential_timeout(&self) -> Duration {
        Duration::from_millis(self.credential_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }
}
