//! Configuration loading and types for silovault.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, blob storage, signed-URL auth, metadata
//! persistence, logging, and observability.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Blob storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Signed-URL authorization settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metadata store settings.
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Debug mode: in-memory single-connection store plus a seeded
    /// fixture bucket and keys.
    #[serde(default)]
    pub debug_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug_mode: false,
        }
    }
}

/// Blob storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory where bucket blob directories live.
    #[serde(default = "default_data_directory")]
    pub data_directory: String,

    /// Size of the receive-to-disk streaming buffer.
    #[serde(default = "default_upload_chunk_bytes")]
    pub upload_chunk_bytes: u32,

    /// Send chunk size for downloads.
    #[serde(default = "default_download_chunk_bytes")]
    pub download_chunk_bytes: u32,

    /// Uploads over this many bytes are rejected with 413.
    #[serde(default = "default_max_single_part_bytes")]
    pub max_single_part_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: default_data_directory(),
            upload_chunk_bytes: default_upload_chunk_bytes(),
            download_chunk_bytes: default_download_chunk_bytes(),
            max_single_part_bytes: default_max_single_part_bytes(),
        }
    }
}

/// Signed-URL authorization configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Tolerance in milliseconds applied to signed-URL expiry timestamps.
    #[serde(default = "default_signature_clock_skew_ms")]
    pub signature_clock_skew_ms: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            signature_clock_skew_ms: default_signature_clock_skew_ms(),
        }
    }
}

/// Metadata store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    /// Path to the SQLite database file. Ignored in debug mode.
    #[serde(default = "default_metadata_path")]
    pub path: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults -----------------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_data_directory() -> String {
    "./data".to_string()
}

fn default_upload_chunk_bytes() -> u32 {
    2 * 1024 * 1024
}

fn default_download_chunk_bytes() -> u32 {
    2 * 1024 * 1024
}

fn default_max_single_part_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_signature_clock_skew_ms() -> i64 {
    30_000
}

fn default_metadata_path() -> String {
    "./silovault.sqlite".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

// -- Loading ------------------------------------------------------------------

/// Load configuration from a YAML file at `path`.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
    let config: Config = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert!(!config.server.debug_mode);
        assert_eq!(config.storage.upload_chunk_bytes, 2 * 1024 * 1024);
        assert_eq!(config.storage.max_single_part_bytes, 100 * 1024 * 1024);
        assert_eq!(config.auth.signature_clock_skew_ms, 30_000);
        assert!(config.observability.metrics);
    }

    #[test]
    fn test_partial_section_keeps_sibling_defaults() {
        let config: Config = serde_yaml::from_str("server:\n  port: 8080\n").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.storage.data_directory, "./data");
    }

    #[test]
    fn test_debug_mode_parses() {
        let config: Config =
            serde_yaml::from_str("server:\n  debug_mode: true\n").unwrap();
        assert!(config.server.debug_mode);
    }
}
