//! `backup-metadata.json`: the descriptive record of a backup set.
//!
//! Parsing is lenient: only the fields needed to restore are mandatory, so
//! sets whose producer was interrupted after a partial write still load.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::BackupKind;
use crate::utils::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// RFC 3339 timestamp of the backup start
    pub backup_date: String,

    #[serde(default = "default_kind")]
    pub backup_kind: BackupKind,

    /// Identity of a physical-disk backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Identity of a VM backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_name: Option<String>,

    /// Device or disk file that was backed up
    #[serde(default)]
    pub source_disk: String,

    pub source_size_bytes: u64,

    #[serde(default)]
    pub source_size_human: String,

    #[serde(default)]
    pub compressed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_type: Option<String>,

    #[serde(default)]
    pub split: bool,

    #[serde(default)]
    pub split_parts: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size_bytes: Option<u64>,

    /// Payload file name (first part for split backups)
    #[serde(default)]
    pub backup_file: String,

    /// Bytes on disk across all payload files
    #[serde(default)]
    pub backup_size_bytes: u64,

    #[serde(default)]
    pub backup_size_human: String,

    #[serde(default)]
    pub host_system: String,

    #[serde(default)]
    pub tool_version: String,

    /// False when the producer stopped before the payload was complete
    #[serde(default = "default_complete")]
    pub complete: bool,
}

fn default_kind() -> BackupKind {
    BackupKind::Disk
}

fn default_complete() -> bool {
    true
}

impl BackupMetadata {
    /// Skeleton record for a run starting at `started`.
    pub fn new(kind: BackupKind, identity: &str, source: &Path, started: DateTime<Local>) -> Self {
        let (hostname, vm_name) = match kind {
            BackupKind::Disk => (Some(identity.to_string()), None),
            BackupKind::Vm => (None, Some(identity.to_string())),
        };
        Self {
            backup_date: started.to_rfc3339(),
            backup_kind: kind,
            hostname,
            vm_name,
            source_disk: source.display().to_string(),
            source_size_bytes: 0,
            source_size_human: String::new(),
            compressed: false,
            compression_type: None,
            split: false,
            split_parts: 0,
            chunk_size_bytes: None,
            backup_file: String::new(),
            backup_size_bytes: 0,
            backup_size_human: String::new(),
            host_system: String::new(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            complete: false,
        }
    }

    /// Hostname or VM name, whichever identifies this set.
    pub fn identity(&self) -> &str {
        self.hostname
            .as_deref()
            .or(self.vm_name.as_deref())
            .unwrap_or("unknown")
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::InvalidMetadata(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| PipelineError::InvalidMetadata(e.to_string()))
    }

    pub async fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, format!("{}\n", json)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_identity_field_per_kind() {
        let at = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let disk = BackupMetadata::new(BackupKind::Disk, "devbox", Path::new("/dev/sda"), at);
        let json = serde_json::to_value(&disk).unwrap();
        assert_eq!(json["hostname"], "devbox");
        assert!(json.get("vm_name").is_none());
        assert_eq!(json["backup_kind"], "disk");

        let vm = BackupMetadata::new(BackupKind::Vm, "ubuntu-dev", Path::new("/vms/u.qcow2"), at);
        let json = serde_json::to_value(&vm).unwrap();
        assert_eq!(json["vm_name"], "ubuntu-dev");
        assert!(json.get("hostname").is_none());
        assert_eq!(vm.identity(), "ubuntu-dev");
    }

    #[test]
    fn test_parses_minimal_record() {
        let json = r#"{
            "backup_date": "2024-01-02T03:04:05+00:00",
            "vm_name": "legacy",
            "source_size_bytes": 1048576,
            "compressed": true,
            "compression_type": "gzip",
            "backup_file": "vm-disk.qcow2.gz"
        }"#;
        let meta = BackupMetadata::from_json(json).unwrap();
        assert_eq!(meta.identity(), "legacy");
        assert_eq!(meta.source_size_bytes, 1048576);
        assert!(meta.complete);
        assert!(!meta.split);
    }

    #[test]
    fn test_rejects_malformed_record() {
        let err = BackupMetadata::from_json(r#"{"backup_date": 5}"#).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidMetadata(_)));
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("backup-metadata.json");
        let mut meta = BackupMetadata::new(
            BackupKind::Vm,
            "vm1",
            Path::new("/vms/vm1.qcow2"),
            Local::now(),
        );
        meta.source_size_bytes = 42;
        meta.write_to(&path).await.unwrap();

        let loaded = BackupMetadata::from_path(&path).unwrap();
        assert_eq!(loaded, meta);
    }
}
