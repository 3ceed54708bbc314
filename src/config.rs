//! Configuration management for upstamp

use crate::error::{Error, Result};
use crate::types::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

/// Default number of simultaneous transfers
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Default chunk size for hashing and transfer bodies (64KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Minimum chunk size (4KB)
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// Maximum chunk size (16MB)
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Public OpenTimestamps calendar servers
pub const DEFAULT_CALENDARS: &[&str] = &[
    "https://a.pool.opentimestamps.org",
    "https://b.pool.opentimestamps.org",
    "https://a.pool.eternitywall.com",
];

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // ==================== Server ====================

    /// Base URL of the file server
    pub server_url: Option<String>,

    /// Remote directory prepended to every uploaded file name
    pub remote_dir: String,

    /// HTTP basic auth user name
    pub username: Option<String>,

    /// HTTP basic auth password
    pub password: Option<String>,

    // ==================== Transfer ====================

    /// Maximum number of simultaneous transfers
    pub concurrency: usize,

    /// Chunk size for hashing and transfer bodies (bytes)
    pub chunk_size: usize,

    /// Fingerprint digest
    pub hash_algorithm: HashAlgorithm,

    // ==================== Proofs ====================

    /// Request timestamp proofs for uploaded files
    pub proofs: bool,

    /// Calendar servers that accept digests
    pub calendars: Vec<String>,

    /// Esplora-compatible API used to look up block times
    pub block_explorer: Option<String>,

    /// Timeout for a single calendar request in seconds
    pub proof_timeout_secs: u64,

    // ==================== Retry ====================

    /// Maximum retries for failed transfers and calendar requests
    pub max_retries: u32,

    /// Retry delay base in milliseconds
    pub retry_delay_ms: u64,

    // ==================== Output ====================

    /// Capacity of the upload event bus
    pub event_capacity: usize,

    /// Show progress bars
    pub progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            server_url: None,
            remote_dir: String::new(),
            username: None,
            password: None,

            // Transfer
            concurrency: DEFAULT_CONCURRENCY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            hash_algorithm: HashAlgorithm::Sha256,

            // Proofs
            proofs: true,
            calendars: DEFAULT_CALENDARS.iter().map(|s| s.to_string()).collect(),
            block_explorer: None,
            proof_timeout_secs: 10,

            // Retry
            max_retries: 3,
            retry_delay_ms: 1000,

            // Output
            event_capacity: 1024,
            progress: true,
        }
    }
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::io("reading config", e))?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to the default config file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path()?;
        self.save_to(&config_path)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io("creating config dir", e))?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("serializing config: {}", e)))?;
        std::fs::write(path, contents).map_err(|e| Error::io("writing config", e))?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("upstamp").join("config.toml"))
            .ok_or_else(|| Error::config("could not determine config directory"))
    }

    /// Parsed server URL
    pub fn server_url(&self) -> Result<Url> {
        let raw = self
            .server_url
            .as_deref()
            .ok_or_else(|| Error::config("no server URL configured"))?;
        let url = Url::parse(raw)?;
        if url.cannot_be_a_base() {
            return Err(Error::config(format!("server URL cannot be a base: {}", raw)));
        }
        Ok(url)
    }

    /// Check values that would otherwise fail deep inside the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::config("concurrency must be at least 1"));
        }
        Self::check_chunk_size(self.chunk_size)?;
        if self.event_capacity == 0 {
            return Err(Error::config("event capacity must be positive"));
        }
        if self.proofs && self.calendars.is_empty() {
            return Err(Error::config("proofs enabled but no calendars configured"));
        }
        for calendar in &self.calendars {
            Url::parse(calendar)?;
        }
        Ok(())
    }

    /// Reject chunk sizes outside `MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE`
    pub fn check_chunk_size(chunk_size: usize) -> Result<()> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(Error::config(format!(
                "chunk size {} outside {}..={}",
                chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }
        Ok(())
    }

    /// Parse a size string like "100", "64K", "1M" into bytes
    pub fn parse_size(s: &str) -> Result<u64> {
        let s = s.trim().to_uppercase();
        if s.is_empty() {
            return Ok(0);
        }

        let (num_part, suffix) = if let Some(n) = s.strip_suffix("KB") {
            (n, 1024u64)
        } else if let Some(n) = s.strip_suffix("MB") {
            (n, 1024u64 * 1024)
        } else if let Some(n) = s.strip_suffix("GB") {
            (n, 1024u64 * 1024 * 1024)
        } else if let Some(n) = s.strip_suffix('K') {
            (n, 1024u64)
        } else if let Some(n) = s.strip_suffix('M') {
            (n, 1024u64 * 1024)
        } else if let Some(n) = s.strip_suffix('G') {
            (n, 1024u64 * 1024 * 1024)
        } else {
            (s.as_str(), 1u64)
        };

        let num: u64 = num_part
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("invalid size value: {}", s)))?;

        num.checked_mul(suffix)
            .ok_or_else(|| Error::config(format!("size value too large: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.chunk_size, 64 * 1024);
        assert_eq!(config.hash_algorithm, HashAlgorithm::Sha256);
        assert!(config.proofs);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = Config {
            concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chunk_size_bounds() {
        assert!(Config::check_chunk_size(MIN_CHUNK_SIZE).is_ok());
        assert!(Config::check_chunk_size(MAX_CHUNK_SIZE).is_ok());
        assert!(Config::check_chunk_size(MIN_CHUNK_SIZE - 1).is_err());

        let huge = Config::parse_size("64G").unwrap() as usize;
        assert!(Config::check_chunk_size(huge).is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(Config::parse_size("100").unwrap(), 100);
        assert_eq!(Config::parse_size("64K").unwrap(), 64 * 1024);
        assert_eq!(Config::parse_size("64kb").unwrap(), 64 * 1024);
        assert_eq!(Config::parse_size("1M").unwrap(), 1024 * 1024);
        assert!(Config::parse_size("lots").is_err());
    }

    #[test]
    fn test_toml_roundtrip_keeps_defaults() {
        let config: Config = toml::from_str("server_url = \"https://files.example\"\n").unwrap();
        assert_eq!(config.server_url().unwrap().as_str(), "https://files.example/");
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.calendars.len(), DEFAULT_CALENDARS.len());
    }

    #[test]
    fn test_missing_server_url() {
        assert!(Config::default().server_url().is_err());
    }
}
