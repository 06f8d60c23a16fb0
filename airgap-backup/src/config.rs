//! Configuration management for the backup pipeline.
//!
//! Loaded once at the entry point from an optional TOML file, then
//! overridden by `AIRGAP_BACKUP_*` environment variables and CLI flags.
//! Components receive it by reference.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::backup_set::Compression;
use crate::utils::{PipelineError, Result};

/// Prefix of environment variables recognised by [`Config::apply_env`].
pub const ENV_PREFIX: &str = "AIRGAP_BACKUP_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Compress the payload
    #[serde(default)]
    pub compress: bool,

    /// Compressor used when `compress` is set (gzip, xz, zstd)
    #[serde(default = "default_compression")]
    pub compression: Compression,

    /// Split VM payloads into fixed-size parts
    #[serde(default)]
    pub split: bool,

    /// Size of each split part in bytes (default: 4000 MiB, under the FAT32 limit)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Run the verifier after a successful backup
    #[serde(default = "default_true")]
    pub verify_after: bool,

    /// Skip read-only filesystem checks before disk backups
    #[serde(default)]
    pub skip_filesystem_check: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Do not reinstall the bootloader after a disk restore
    #[serde(default)]
    pub skip_bootloader: bool,

    /// Do not restore the captured partition table
    #[serde(default)]
    pub skip_partition_table: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Read buffer size for streaming copies (default: 4 MiB)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Seconds between progress log lines
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_compression() -> Compression {
    Compression::Gzip
}

fn default_chunk_size() -> u64 {
    4000 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_buffer_size() -> usize {
    4 * 1024 * 1024
}

fn default_progress_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            compress: false,
            compression: default_compression(),
            split: false,
            chunk_size: default_chunk_size(),
            verify_after: default_true(),
            skip_filesystem_check: false,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            progress_interval_secs: default_progress_interval(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(PipelineError::Config(format!(
            "{}{} must be a boolean, got {:?}",
            ENV_PREFIX, key, other
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        PipelineError::Config(format!("{}{} must be a number, got {:?}", ENV_PREFIX, key, value))
    })
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `AIRGAP_BACKUP_*` overrides from the given variables.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match key {
                "COMPRESS" => self.backup.compress = parse_bool(key, &value)?,
                "COMPRESSION" => {
                    self.backup.compression = value.parse().map_err(PipelineError::Config)?
                }
                "SPLIT" => self.backup.split = parse_bool(key, &value)?,
                "CHUNK_SIZE" => self.backup.chunk_size = parse_number(key, &value)?,
                "VERIFY" => self.backup.verify_after = parse_bool(key, &value)?,
                "SKIP_FSCK" => self.backup.skip_filesystem_check = parse_bool(key, &value)?,
                "SKIP_BOOTLOADER" => self.restore.skip_bootloader = parse_bool(key, &value)?,
                "BUFFER_SIZE" => self.stream.buffer_size = parse_number(key, &value)?,
                "LOG_LEVEL" => self.log.level = value,
                _ => {}
            }
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.backup.chunk_size == 0 {
            return Err(PipelineError::Config(
                "backup.chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.stream.buffer_size == 0 {
            return Err(PipelineError::Config(
                "stream.buffer_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.backup.compress);
        assert_eq!(config.backup.compression, Compression::Gzip);
        assert_eq!(config.backup.chunk_size, 4000 * 1024 * 1024);
        assert!(config.backup.verify_after);
        assert_eq!(config.stream.buffer_size, 4 * 1024 * 1024);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [backup]
            compress = true
            compression = "xz"

            [log]
            level = "debug"
            "#,
        )
        .unwrap();
        assert!(config.backup.compress);
        assert_eq!(config.backup.compression, Compression::Xz);
        assert!(config.backup.verify_after);
        assert_eq!(config.stream.progress_interval_secs, 5);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            Config::from_toml("[backup]\ncompression = \"rar\"\n"),
            Err(PipelineError::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("[backup]\nchunk_size = 0\n"),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(vars(&[
                ("AIRGAP_BACKUP_COMPRESS", "yes"),
                ("AIRGAP_BACKUP_COMPRESSION", "zstd"),
                ("AIRGAP_BACKUP_SPLIT", "1"),
                ("AIRGAP_BACKUP_CHUNK_SIZE", "1048576"),
                ("AIRGAP_BACKUP_VERIFY", "false"),
                ("HOME", "/root"),
            ]))
            .unwrap();
        assert!(config.backup.compress);
        assert_eq!(config.backup.compression, Compression::Zstd);
        assert!(config.backup.split);
        assert_eq!(config.backup.chunk_size, 1048576);
        assert!(!config.backup.verify_after);
    }

    #[test]
    fn test_env_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config
            .apply_env(vars(&[("AIRGAP_BACKUP_COMPRESS", "maybe")]))
            .is_err());
        assert!(config
            .apply_env(vars(&[("AIRGAP_BACKUP_CHUNK_SIZE", "0")]))
            .is_err());
    }
}
