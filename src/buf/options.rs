//! Pool configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::checksum::ChecksumAlgorithm;
use crate::types::page::{PAGE_SIZE_MAX, PAGE_SIZE_MIN};

use super::lru::{NON_OLD_MIN_LEN, OLD_TOLERANCE};

/// Tunables of a [`BufferPool`](super::BufferPool).
///
/// Every field has a default, so a TOML file only needs the keys it
/// changes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolOptions {
    /// Uncompressed page size in bytes.
    pub page_size: usize,
    /// Total pages across all instances. Rounded up to whole chunks.
    pub pool_pages: usize,
    /// Number of independent pool instances.
    pub instances: usize,
    /// Pages per chunk; the unit of online resizing.
    pub chunk_pages: usize,
    /// Page-hash bucket locks per instance.
    pub page_hash_locks: usize,
    /// Share of the LRU kept as the old sublist, in percent.
    pub lru_old_pct: u32,
    /// Minimum dwell time in the old sublist before promotion.
    pub lru_old_threshold_ms: u64,
    /// LRU length from which the old sublist exists.
    pub lru_old_min_len: usize,
    /// How deep an LRU flush batch scans from the tail.
    pub lru_scan_depth: usize,
    /// Depth of the first, non-exhaustive eviction scan.
    pub lru_search_threshold: usize,
    /// Rounds without a free block before a stall warning.
    pub free_block_warn_iterations: usize,
    /// Rounds without a free block before giving up with `OutOfMemory`.
    pub free_block_max_iterations: usize,
    /// Watch sentinels per instance.
    pub watch_slots: usize,
    /// Checksum stamped on outgoing non-full_crc32 pages.
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Verify checksums of pages read from disk.
    pub verify_checksums: bool,
    /// Pause between withdraw attempts of a shrinking resize.
    pub resize_retry_ms: u64,
    /// Withdraw attempts before a shrink is aborted.
    pub resize_max_attempts: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            page_size: 16384,
            pool_pages: 8192,
            instances: 1,
            chunk_pages: 1024,
            page_hash_locks: 16,
            lru_old_pct: 37,
            lru_old_threshold_ms: 1000,
            lru_old_min_len: 512,
            lru_scan_depth: 1024,
            lru_search_threshold: 100,
            free_block_warn_iterations: 20,
            free_block_max_iterations: 200,
            watch_slots: 8,
            checksum_algorithm: ChecksumAlgorithm::Crc32,
            verify_checksums: true,
            resize_retry_ms: 10,
            resize_max_attempts: 100,
        }
    }
}

/// Errors from loading or validating [`PoolOptions`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read pool config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse pool config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid pool option {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl PoolOptions {
    /// Parses and validates TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let options: PoolOptions = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        options.validate()?;
        Ok(options)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let options: PoolOptions = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        options.validate()?;
        Ok(options)
    }

    /// Checks ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two()
            || !(PAGE_SIZE_MIN..=PAGE_SIZE_MAX).contains(&self.page_size)
        {
            return Err(invalid(
                "page_size",
                format!("{} is not a power of two in {PAGE_SIZE_MIN}..={PAGE_SIZE_MAX}", self.page_size),
            ));
        }
        if !(1..=64).contains(&self.instances) {
            return Err(invalid("instances", "must be in 1..=64"));
        }
        if self.chunk_pages == 0 {
            return Err(invalid("chunk_pages", "must be positive"));
        }
        if self.pool_pages < self.instances * 16 {
            return Err(invalid("pool_pages", "need at least 16 pages per instance"));
        }
        if self.page_hash_locks == 0 || self.page_hash_locks > 1024 {
            return Err(invalid("page_hash_locks", "must be in 1..=1024"));
        }
        if !(5..=95).contains(&self.lru_old_pct) {
            return Err(invalid("lru_old_pct", "must be in 5..=95"));
        }
        if self.lru_old_min_len <= OLD_TOLERANCE + NON_OLD_MIN_LEN {
            return Err(invalid(
                "lru_old_min_len",
                format!("must exceed {}", OLD_TOLERANCE + NON_OLD_MIN_LEN),
            ));
        }
        if self.lru_scan_depth == 0 || self.lru_search_threshold == 0 {
            return Err(invalid("lru_scan_depth", "scan depths must be positive"));
        }
        if self.free_block_max_iterations == 0 {
            return Err(invalid("free_block_max_iterations", "must be positive"));
        }
        if self.watch_slots == 0 {
            return Err(invalid("watch_slots", "must be positive"));
        }
        if self.checksum_algorithm == ChecksumAlgorithm::FullCrc32 {
            return Err(invalid(
                "checksum_algorithm",
                "full_crc32 is a tablespace format, not a stamping choice",
            ));
        }
        if self.resize_max_attempts == 0 {
            return Err(invalid("resize_max_attempts", "must be positive"));
        }
        Ok(())
    }

    /// Chunks each instance starts with.
    pub fn chunks_per_instance(&self) -> usize {
        self.chunks_for(self.pool_pages)
    }

    pub(crate) fn chunks_for(&self, total_pages: usize) -> usize {
        let per_instance = total_pages.div_ceil(self.instances);
        per_instance.div_ceil(self.chunk_pages).max(1)
    }
}
