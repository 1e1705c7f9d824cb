//! Configuration loading and types for blobstream.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! client: the target storage account, chunk sizing for uploads, and
//! logging.
//!
//! Credentials are never stored in the file; they are resolved from the
//! environment by the Azure sink (`AZURE_STORAGE_KEY`,
//! `AZURE_STORAGE_CONNECTION_STRING`, or `AZURE_STORAGE_SAS_TOKEN`).

use serde::Deserialize;
use std::path::Path;

/// Page blobs are written in 512-byte pages; every dispatched page
/// chunk must be a multiple of this.
pub const PAGE_SIZE: u64 = 512;

/// Largest chunk the service accepts for a single Put Block.
pub const MAX_BLOCK_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

/// Largest chunk the service accepts for a single Append Block.
pub const MAX_APPEND_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Target storage account / container.
    #[serde(default)]
    pub account: AccountConfig,

    /// Chunk sizing for upload sessions.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Target Azure storage account configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Azure storage account name.
    #[serde(default)]
    pub account: String,

    /// Container name within the account.
    #[serde(default)]
    pub container: String,

    /// Key prefix applied to every blob name.
    #[serde(default)]
    pub prefix: String,

    /// Custom service endpoint (e.g. Azurite).  Empty means
    /// `https://{account}.blob.core.windows.net`.
    #[serde(default)]
    pub endpoint_url: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            account: String::new(),
            container: String::new(),
            prefix: String::new(),
            endpoint_url: String::new(),
        }
    }
}

/// Chunk sizing configuration for upload sessions.
///
/// Each field is the buffer threshold at which a chunk is dispatched
/// for the corresponding blob kind.  Session constructors validate the
/// service limits (`block <= 100 MiB`, `append <= 4 MiB`, `page` a
/// multiple of 512).
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Chunk threshold for block blobs, in bytes.
    #[serde(default = "default_chunk_size")]
    pub block_chunk_size: u64,

    /// Chunk threshold for append blobs, in bytes.
    #[serde(default = "default_chunk_size")]
    pub append_chunk_size: u64,

    /// Chunk threshold for page blobs, in bytes.  Clamped to the total
    /// upload length at construction.
    #[serde(default = "default_chunk_size")]
    pub page_chunk_size: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            block_chunk_size: default_chunk_size(),
            append_chunk_size: default_chunk_size(),
            page_chunk_size: default_chunk_size(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_chunk_size() -> u64 {
    4 * 1024 * 1024 // 4 MiB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_four_mebibytes() {
        let cfg = UploadConfig::default();
        assert_eq!(cfg.block_chunk_size, 4 * 1024 * 1024);
        assert_eq!(cfg.append_chunk_size, 4 * 1024 * 1024);
        assert_eq!(cfg.page_chunk_size, 4 * 1024 * 1024);
    }

    #[test]
    fn default_chunk_sizes_respect_service_limits() {
        let cfg = UploadConfig::default();
        assert!(cfg.block_chunk_size <= MAX_BLOCK_CHUNK_SIZE);
        assert!(cfg.append_chunk_size <= MAX_APPEND_CHUNK_SIZE);
        assert_eq!(cfg.page_chunk_size % PAGE_SIZE, 0);
    }

    #[test]
    fn parses_partial_yaml() {
        let yaml = r#"
account:
  account: devstore
  container: uploads
upload:
  block_chunk_size: 8388608
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.account.account, "devstore");
        assert_eq!(cfg.account.container, "uploads");
        assert_eq!(cfg.upload.block_chunk_size, 8 * 1024 * 1024);
        // Unspecified sections fall back to defaults.
        assert_eq!(cfg.upload.append_chunk_size, 4 * 1024 * 1024);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn empty_yaml_uses_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert!(cfg.account.account.is_empty());
        assert_eq!(cfg.upload.page_chunk_size, 4 * 1024 * 1024);
    }
}
