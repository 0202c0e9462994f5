//! Configuration types for the TapeIO offer
//!
//! This module defines configuration structures used across components.
//! Every structure has sensible defaults so a partial TOML file is enough.

use crate::error::{Error, Result};
use crate::types::is_safe_path_segment;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Size of an archive header block plus the two footer blocks
const ARCHIVE_FIXED_OVERHEAD: u64 = 512 + 1024;

/// Root configuration for the offer
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OfferConfig {
    /// On-disk locations
    pub storage: StorageConfig,
    /// Archive building
    pub archive: ArchiveConfig,
    /// Disk cache of archives staged from tape
    pub cache: CacheConfig,
    /// Access request lifecycle
    pub access_request: AccessRequestConfig,
    /// Metadata store tuning
    pub store: StoreConfig,
    /// Buckets, partitions and containers
    pub topology: TopologyConfig,
}

impl OfferConfig {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.archive.validate()?;
        self.cache.validate()?;
        self.access_request.validate()?;
        self.store.validate()?;
        self.topology.validate()
    }
}

/// On-disk locations
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Loose object files: `{input_files_dir}/{container}/{storageId}`
    pub input_files_dir: PathBuf,
    /// Archives being built or waiting for tape: `{input_tars_dir}/{partition}/{archiveId}`
    pub input_tars_dir: PathBuf,
    /// Archives staged from tape: `{cache_dir}/{partition}/{archiveId}`
    pub cache_dir: PathBuf,
    /// Embedded metadata database file
    pub meta_db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = PathBuf::from("/var/lib/tapeio");
        Self {
            input_files_dir: root.join("inputFiles"),
            input_tars_dir: root.join("inputTars"),
            cache_dir: root.join("tarCache"),
            meta_db_path: root.join("meta.redb"),
        }
    }
}

/// Archive building configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Maximum size of an archive file in bytes
    pub max_archive_size: u64,
    /// Maximum size of a single archive entry; larger objects are split
    pub max_entry_size: u64,
    /// An open archive is sealed after this many seconds even if not full
    pub buffering_timeout_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_archive_size: 10 * 1024 * 1024 * 1024, // 10GB
            max_entry_size: 1024 * 1024 * 1024,        // 1GB
            buffering_timeout_secs: 60,
        }
    }
}

impl ArchiveConfig {
    fn validate(&self) -> Result<()> {
        if self.max_entry_size == 0 {
            return Err(Error::config("archive.max_entry_size must be positive"));
        }
        let padded_entry = self.max_entry_size.div_ceil(512) * 512;
        if padded_entry + ARCHIVE_FIXED_OVERHEAD >= self.max_archive_size {
            return Err(Error::config(
                "archive.max_archive_size must hold at least one maximal entry",
            ));
        }
        if self.buffering_timeout_secs == 0 {
            return Err(Error::config("archive.buffering_timeout_secs must be positive"));
        }
        Ok(())
    }

    #[must_use]
    pub const fn buffering_timeout(&self) -> Duration {
        Duration::from_secs(self.buffering_timeout_secs)
    }
}

/// Disk cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Hard capacity limit in bytes
    pub max_capacity_bytes: u64,
    /// Eviction starts when usage reaches this many bytes
    pub eviction_threshold_bytes: u64,
    /// Eviction stops once usage falls below this many bytes
    pub safe_threshold_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity_bytes: 100 * 1024 * 1024 * 1024, // 100GB
            eviction_threshold_bytes: 80 * 1024 * 1024 * 1024,
            safe_threshold_bytes: 60 * 1024 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Check `max > eviction > safe > 0`
    pub fn validate(&self) -> Result<()> {
        if !(self.max_capacity_bytes > self.eviction_threshold_bytes
            && self.eviction_threshold_bytes > self.safe_threshold_bytes
            && self.safe_threshold_bytes > 0)
        {
            return Err(Error::config(format!(
                "cache thresholds must satisfy max > eviction > safe > 0, got {} / {} / {}",
                self.max_capacity_bytes, self.eviction_threshold_bytes, self.safe_threshold_bytes
            )));
        }
        Ok(())
    }
}

/// Access request lifecycle configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessRequestConfig {
    /// Maximum number of objects in one request
    pub max_objects_per_request: usize,
    /// How long a ready request stays valid
    pub expiration_delay_secs: u64,
    /// How long after becoming ready a request is deleted
    pub purge_delay_secs: u64,
    /// Period of the maintenance task
    pub cleanup_interval_secs: u64,
    /// Tenant allowed to see requests of other tenants
    pub admin_tenant: u32,
    /// Whether the admin tenant may bypass tenant isolation at all
    pub allow_admin_cross_tenant: bool,
    /// Attempts of a version-checked update before giving up
    pub max_update_attempts: u32,
    /// Lower bound of the random pause between update attempts
    pub retry_min_backoff_ms: u64,
    /// Upper bound of the random pause between update attempts
    pub retry_max_backoff_ms: u64,
}

impl Default for AccessRequestConfig {
    fn default() -> Self {
        Self {
            max_objects_per_request: 100_000,
            expiration_delay_secs: 60 * 60,
            purge_delay_secs: 24 * 60 * 60,
            cleanup_interval_secs: 60,
            admin_tenant: 1,
            allow_admin_cross_tenant: false,
            max_update_attempts: 3,
            retry_min_backoff_ms: 10,
            retry_max_backoff_ms: 1000,
        }
    }
}

impl AccessRequestConfig {
    fn validate(&self) -> Result<()> {
        if self.max_objects_per_request == 0 {
            return Err(Error::config("access_request.max_objects_per_request must be positive"));
        }
        if self.expiration_delay_secs == 0 {
            return Err(Error::config("access_request.expiration_delay_secs must be positive"));
        }
        if self.purge_delay_secs < self.expiration_delay_secs {
            return Err(Error::config(
                "access_request.purge_delay_secs must not be lower than expiration_delay_secs",
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(Error::config("access_request.cleanup_interval_secs must be positive"));
        }
        if self.max_update_attempts == 0 {
            return Err(Error::config("access_request.max_update_attempts must be positive"));
        }
        if self.retry_min_backoff_ms > self.retry_max_backoff_ms {
            return Err(Error::config("access_request retry backoff bounds are inverted"));
        }
        Ok(())
    }

    #[must_use]
    pub const fn expiration_delay(&self) -> Duration {
        Duration::from_secs(self.expiration_delay_secs)
    }

    #[must_use]
    pub const fn purge_delay(&self) -> Duration {
        Duration::from_secs(self.purge_delay_secs)
    }

    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Metadata store tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Keys per bulk lookup round-trip
    pub bulk_batch_size: usize,
    /// Archive entries checked per verification batch
    pub verify_batch_size: usize,
    /// Expired access requests purged per batch
    pub cleanup_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bulk_batch_size: 1000,
            verify_batch_size: 10_000,
            cleanup_batch_size: 1000,
        }
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<()> {
        if self.bulk_batch_size == 0 || self.verify_batch_size == 0 || self.cleanup_batch_size == 0
        {
            return Err(Error::config("store batch sizes must be positive"));
        }
        Ok(())
    }
}

/// Buckets, partitions (file buckets) and the containers they hold
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub buckets: Vec<BucketConfig>,
}

/// One tape bucket
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    pub id: String,
    /// Archives of this bucket are never evicted from the disk cache
    pub keep_forever_in_cache: bool,
    pub partitions: Vec<PartitionConfig>,
}

/// One partition: a group of containers sharing an archive builder
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    pub id: String,
    pub containers: Vec<String>,
}

impl TopologyConfig {
    fn validate(&self) -> Result<()> {
        let mut partitions = HashSet::new();
        let mut containers = HashSet::new();
        for bucket in &self.buckets {
            if bucket.id.is_empty() {
                return Err(Error::config("bucket id must not be empty"));
            }
            for partition in &bucket.partitions {
                if !is_safe_path_segment(&partition.id) {
                    return Err(Error::config(format!("invalid partition id: {:?}", partition.id)));
                }
                if !partitions.insert(partition.id.as_str()) {
                    return Err(Error::config(format!("duplicate partition: {}", partition.id)));
                }
                for container in &partition.containers {
                    if !is_safe_path_segment(container) {
                        return Err(Error::config(format!("invalid container name: {container:?}")));
                    }
                    if !containers.insert(container.as_str()) {
                        return Err(Error::config(format!(
                            "container {container} is mapped to more than one partition"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
