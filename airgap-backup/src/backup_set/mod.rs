//! On-disk layout of a backup set.
//!
//! ```text
//! <name>-backup-<YYYYMMDD-HHMMSS>/
//!   backup-metadata.json
//!   checksums.sha256
//!   partition-table.bin      (disk backups)
//!   partition-table.txt      (disk backups)
//!   <payload>                vm-disk.<ext>[.gz|.xz|.zst], system-disk.img[...], or <payload>.partNNN
//!   vm-config/<file>         (VM backups with a copied config)
//!   backup.log
//! ```

pub mod checksums;
pub mod metadata;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

use crate::utils::{PipelineError, Result};
use metadata::BackupMetadata;

pub const METADATA_FILE: &str = "backup-metadata.json";
pub const CHECKSUM_FILE: &str = "checksums.sha256";
pub const PARTITION_TABLE_BIN: &str = "partition-table.bin";
pub const PARTITION_TABLE_TXT: &str = "partition-table.txt";
pub const LOG_FILE: &str = "backup.log";
pub const VM_CONFIG_DIR: &str = "vm-config";

/// Suffix of a set directory whose producer has not finished.
pub const STAGING_SUFFIX: &str = ".partial";

pub const DISK_PAYLOAD: &str = "system-disk.img";
pub const VM_PAYLOAD_PREFIX: &str = "vm-disk";

/// Sectors captured in `partition-table.bin` (MBR/GPT plus the embedding gap).
pub const PARTITION_TABLE_SECTORS: u64 = 2048;
pub const SECTOR_SIZE: u64 = 512;

/// What was backed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Physical block device.
    Disk,
    /// Virtual machine disk file.
    Vm,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Disk => "disk",
            BackupKind::Vm => "vm",
        }
    }

    /// Uncompressed payload file name for a given source.
    ///
    /// The VM source extension is kept unless it would make the raw payload
    /// look compressed or split (`guest.gz`, `disk.part001`), in which case
    /// the neutral `img` is used.
    pub fn payload_base(&self, source: &Path) -> String {
        match self {
            BackupKind::Disk => DISK_PAYLOAD.to_string(),
            BackupKind::Vm => {
                let ext = source
                    .extension()
                    .and_then(|e| e.to_str())
                    .filter(|e| !e.is_empty())
                    .unwrap_or("qcow2");
                let name = format!("{}.{}", VM_PAYLOAD_PREFIX, ext);
                if PayloadEncoding::of_file(&name) == PayloadEncoding::Raw {
                    name
                } else {
                    format!("{}.img", VM_PAYLOAD_PREFIX)
                }
            }
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream compressor applied to the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::Gzip => "gz",
            Compression::Xz => "xz",
            Compression::Zstd => "zst",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gzip" | "gz" | "pigz" => Ok(Compression::Gzip),
            "xz" => Ok(Compression::Xz),
            "zstd" | "zst" => Ok(Compression::Zstd),
            other => Err(format!(
                "unknown compression '{}' (expected gzip, xz or zstd)",
                other
            )),
        }
    }
}

/// How the payload is stored, detected from the files present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    Raw,
    Gzip,
    Xz,
    Zstd,
    SplitParts,
}

impl PayloadEncoding {
    pub fn from_compression(compression: Option<Compression>) -> Self {
        match compression {
            None => PayloadEncoding::Raw,
            Some(Compression::Gzip) => PayloadEncoding::Gzip,
            Some(Compression::Xz) => PayloadEncoding::Xz,
            Some(Compression::Zstd) => PayloadEncoding::Zstd,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(
            self,
            PayloadEncoding::Gzip | PayloadEncoding::Xz | PayloadEncoding::Zstd
        )
    }

    fn of_file(name: &str) -> Self {
        if split_index(name).is_some() {
            return PayloadEncoding::SplitParts;
        }
        match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some("gz") => PayloadEncoding::Gzip,
            Some("xz") => PayloadEncoding::Xz,
            Some("zst") => PayloadEncoding::Zstd,
            _ => PayloadEncoding::Raw,
        }
    }
}

impl fmt::Display for PayloadEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PayloadEncoding::Raw => "raw",
            PayloadEncoding::Gzip => "gzip",
            PayloadEncoding::Xz => "xz",
            PayloadEncoding::Zstd => "zstd",
            PayloadEncoding::SplitParts => "split parts",
        };
        f.write_str(s)
    }
}

/// Payload files of a set, in restore order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub encoding: PayloadEncoding,
    /// File names relative to the set directory.
    pub files: Vec<String>,
}

/// Index of a `<name>.partNNN` file.
fn split_index(name: &str) -> Option<usize> {
    let (_, suffix) = name.rsplit_once(".part")?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

fn is_payload_name(name: &str) -> bool {
    name.starts_with(DISK_PAYLOAD) || name.starts_with(&format!("{}.", VM_PAYLOAD_PREFIX))
}

/// Detect the payload encoding from the files present in `dir`.
pub fn detect_payload(dir: &Path) -> Result<Payload> {
    let mut names = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            PipelineError::InvalidBackupSet(format!("cannot read {}: {}", dir.display(), e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_payload_name(name) {
                names.push(name.to_string());
            }
        }
    }

    if names.is_empty() {
        return Err(PipelineError::InvalidBackupSet(format!(
            "no payload file found in {}",
            dir.display()
        )));
    }

    let encoding = PayloadEncoding::of_file(&names[0]);
    if let Some(other) = names.iter().find(|n| PayloadEncoding::of_file(n) != encoding) {
        return Err(PipelineError::InvalidBackupSet(format!(
            "mixed payload encodings: {} and {}",
            names[0], other
        )));
    }

    if encoding == PayloadEncoding::SplitParts {
        names.sort_by_key(|n| split_index(n).unwrap_or(usize::MAX));
        for (expected, name) in names.iter().enumerate() {
            if split_index(name) != Some(expected) {
                return Err(PipelineError::InvalidBackupSet(format!(
                    "split parts are not contiguous: expected part {:03}, found {}",
                    expected, name
                )));
            }
        }
    } else if names.len() > 1 {
        return Err(PipelineError::InvalidBackupSet(format!(
            "multiple payload files: {}",
            names.join(", ")
        )));
    }

    Ok(Payload {
        encoding,
        files: names,
    })
}

/// Replace characters that do not belong in a directory name.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        "backup".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `<name>-backup-<YYYYMMDD-HHMMSS>`
pub fn backup_set_id(name: &str, at: DateTime<Local>) -> String {
    format!("{}-backup-{}", sanitize_name(name), at.format("%Y%m%d-%H%M%S"))
}

pub fn is_staging_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(STAGING_SUFFIX))
}

/// One entry of [`list_backup_sets`].
#[derive(Debug, Clone)]
pub struct BackupSetSummary {
    pub path: PathBuf,
    pub id: String,
    pub complete: bool,
    pub metadata: Option<BackupMetadata>,
}

/// Backup sets (and interrupted staging directories) directly under `root`.
pub fn list_backup_sets(root: &Path) -> Result<Vec<BackupSetSummary>> {
    let mut sets = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            PipelineError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            )
        })?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let path = entry.path().to_path_buf();
        let staging = is_staging_dir(&path);
        if !staging && !path.join(METADATA_FILE).is_file() {
            continue;
        }
        sets.push(BackupSetSummary {
            id: entry.file_name().to_string_lossy().into_owned(),
            complete: !staging && path.join(CHECKSUM_FILE).is_file(),
            metadata: BackupMetadata::from_path(&path.join(METADATA_FILE)).ok(),
            path,
        });
    }
    Ok(sets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_backup_set_id_format() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(backup_set_id("dev-box", at), "dev-box-backup-20240309-140507");
        assert_eq!(backup_set_id("my vm/1", at), "my-vm-1-backup-20240309-140507");
        assert_eq!(backup_set_id("///", at), "backup-backup-20240309-140507");
    }

    #[test]
    fn test_payload_base_names() {
        assert_eq!(
            BackupKind::Disk.payload_base(Path::new("/dev/sda")),
            "system-disk.img"
        );
        assert_eq!(
            BackupKind::Vm.payload_base(Path::new("/vms/dev.qcow2")),
            "vm-disk.qcow2"
        );
        assert_eq!(BackupKind::Vm.payload_base(Path::new("/vms/disk")), "vm-disk.qcow2");
        assert_eq!(BackupKind::Vm.payload_base(Path::new("/vms/win.raw")), "vm-disk.raw");
    }

    #[test]
    fn test_payload_base_never_looks_encoded() {
        for source in ["guest.gz", "guest.xz", "guest.zst", "guest.part001"] {
            let base = BackupKind::Vm.payload_base(Path::new(source));
            assert_eq!(base, "vm-disk.img", "{}", source);
            assert_eq!(PayloadEncoding::of_file(&base), PayloadEncoding::Raw);
        }
    }

    #[test]
    fn test_compression_parse() {
        assert_eq!("gzip".parse::<Compression>().unwrap(), Compression::Gzip);
        assert_eq!("PIGZ".parse::<Compression>().unwrap(), Compression::Gzip);
        assert_eq!("xz".parse::<Compression>().unwrap(), Compression::Xz);
        assert_eq!("zstd".parse::<Compression>().unwrap(), Compression::Zstd);
        assert!("bzip2".parse::<Compression>().is_err());
    }

    #[test]
    fn test_detect_each_encoding() {
        let cases = [
            ("system-disk.img", PayloadEncoding::Raw),
            ("system-disk.img.gz", PayloadEncoding::Gzip),
            ("system-disk.img.xz", PayloadEncoding::Xz),
            ("vm-disk.qcow2.zst", PayloadEncoding::Zstd),
            ("vm-disk.qcow2", PayloadEncoding::Raw),
        ];
        for (name, expected) in cases {
            let dir = TempDir::new().unwrap();
            fs::write(dir.path().join(name), b"x").unwrap();
            fs::write(dir.path().join(METADATA_FILE), b"{}").unwrap();
            fs::write(dir.path().join(PARTITION_TABLE_BIN), b"x").unwrap();
            let payload = detect_payload(dir.path()).unwrap();
            assert_eq!(payload.encoding, expected, "{}", name);
            assert_eq!(payload.files, vec![name.to_string()]);
        }
    }

    #[test]
    fn test_detect_split_parts_in_numeric_order() {
        let dir = TempDir::new().unwrap();
        for i in [2, 0, 10, 1, 3, 4, 5, 6, 7, 8, 9] {
            fs::write(dir.path().join(format!("vm-disk.qcow2.part{:03}", i)), b"x").unwrap();
        }
        let payload = detect_payload(dir.path()).unwrap();
        assert_eq!(payload.encoding, PayloadEncoding::SplitParts);
        assert_eq!(payload.files.len(), 11);
        assert_eq!(payload.files[0], "vm-disk.qcow2.part000");
        assert_eq!(payload.files[10], "vm-disk.qcow2.part010");
    }

    #[test]
    fn test_detect_rejects_missing_part() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("vm-disk.img.part000"), b"x").unwrap();
        fs::write(dir.path().join("vm-disk.img.part002"), b"x").unwrap();
        let err = detect_payload(dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidBackupSet(_)));
    }

    #[test]
    fn test_detect_rejects_mixed_or_missing_payload() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            detect_payload(dir.path()),
            Err(PipelineError::InvalidBackupSet(_))
        ));

        fs::write(dir.path().join("system-disk.img"), b"x").unwrap();
        fs::write(dir.path().join("system-disk.img.gz"), b"x").unwrap();
        assert!(matches!(
            detect_payload(dir.path()),
            Err(PipelineError::InvalidBackupSet(_))
        ));
    }

    #[test]
    fn test_list_backup_sets() {
        let root = TempDir::new().unwrap();
        let done = root.path().join("host-backup-20240101-000000");
        fs::create_dir(&done).unwrap();
        fs::write(done.join(METADATA_FILE), b"not json").unwrap();
        fs::write(done.join(CHECKSUM_FILE), b"").unwrap();

        let partial = root.path().join("host-backup-20240102-000000.partial");
        fs::create_dir(&partial).unwrap();

        fs::create_dir(root.path().join("unrelated")).unwrap();

        let sets = list_backup_sets(root.path()).unwrap();
        assert_eq!(sets.len(), 2);
        assert!(sets[0].complete);
        assert!(sets[0].metadata.is_none());
        assert!(!sets[1].complete);
    }
}
