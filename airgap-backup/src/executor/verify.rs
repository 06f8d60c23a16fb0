//! Backup set verification.
//!
//! Read-only: safe to run repeatedly and concurrently against the same set.

use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{WarningKind, Warnings};
use crate::backup_set::checksums::ChecksumManifest;
use crate::backup_set::metadata::BackupMetadata;
use crate::backup_set::{
    detect_payload, is_staging_dir, Payload, CHECKSUM_FILE, METADATA_FILE, PARTITION_TABLE_BIN,
    PARTITION_TABLE_TXT,
};
use crate::transfer::progress::format_bytes;
use crate::transfer::stream::total_size;
use crate::utils::{PipelineError, Result};

/// Result of a passed verification.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub set_dir: PathBuf,
    pub payload: Payload,
    /// Bytes on disk across all payload files
    pub payload_bytes: u64,
    /// `None` when the metadata file could not be parsed
    pub metadata: Option<BackupMetadata>,
    pub checked_files: usize,
    pub has_partition_table: bool,
    pub warnings: Warnings,
}

/// Verify a backup set. `Ok` means the set passed.
///
/// Missing metadata or manifest is [`PipelineError::InvalidBackupSet`]; any
/// digest mismatch, missing file or uncovered payload file is
/// [`PipelineError::ChecksumMismatch`]. Unparseable metadata is only a warning.
pub async fn verify_backup_set(dir: &Path) -> Result<VerifyReport> {
    if !dir.is_dir() {
        return Err(PipelineError::InvalidBackupSet(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    if is_staging_dir(dir) {
        return Err(PipelineError::InvalidBackupSet(format!(
            "{} is an unfinished backup (staging directory)",
            dir.display()
        )));
    }

    let metadata_path = dir.join(METADATA_FILE);
    if !metadata_path.is_file() {
        return Err(PipelineError::InvalidBackupSet(format!(
            "missing {}",
            METADATA_FILE
        )));
    }
    let manifest_path = dir.join(CHECKSUM_FILE);
    if !manifest_path.is_file() {
        return Err(PipelineError::InvalidBackupSet(format!(
            "missing {}",
            CHECKSUM_FILE
        )));
    }

    let manifest = ChecksumManifest::read_from(&manifest_path).await?;
    if manifest.entries.is_empty() {
        return Err(PipelineError::InvalidBackupSet(format!(
            "{} is empty",
            CHECKSUM_FILE
        )));
    }

    info!(
        "Verifying {} checksums in {}",
        manifest.entries.len(),
        dir.display()
    );
    let mut failures = manifest.verify(dir).await;
    if !failures.is_empty() {
        return Err(PipelineError::ChecksumMismatch(failures));
    }

    let payload = detect_payload(dir)?;
    for file in &payload.files {
        if !manifest.covers(file) {
            failures.push(format!("{}: not covered by {}", file, CHECKSUM_FILE));
        }
    }
    for file in [PARTITION_TABLE_BIN, PARTITION_TABLE_TXT] {
        if dir.join(file).is_file() && !manifest.covers(file) {
            failures.push(format!("{}: not covered by {}", file, CHECKSUM_FILE));
        }
    }

    if !failures.is_empty() {
        return Err(PipelineError::ChecksumMismatch(failures));
    }

    let mut warnings = Warnings::new();
    if !manifest.covers(METADATA_FILE) {
        warnings.push(
            WarningKind::MetadataMismatch,
            format!("{} is not covered by {}", METADATA_FILE, CHECKSUM_FILE),
        );
    }

    let payload_bytes = total_size(dir, &payload.files).await?;

    let metadata = match BackupMetadata::from_path(&metadata_path) {
        Ok(meta) => {
            check_metadata(&meta, &payload, payload_bytes, &mut warnings);
            Some(meta)
        }
        Err(e) => {
            warnings.push(WarningKind::InvalidMetadata, e.to_string());
            None
        }
    };

    let has_partition_table =
        dir.join(PARTITION_TABLE_BIN).is_file() || dir.join(PARTITION_TABLE_TXT).is_file();

    Ok(VerifyReport {
        set_dir: dir.to_path_buf(),
        payload,
        payload_bytes,
        metadata,
        checked_files: manifest.entries.len(),
        has_partition_table,
        warnings,
    })
}

/// Cross-check the metadata record against the files actually present.
fn check_metadata(
    meta: &BackupMetadata,
    payload: &Payload,
    payload_bytes: u64,
    warnings: &mut Warnings,
) {
    if !meta.complete {
        warnings.push(
            WarningKind::MetadataMismatch,
            "metadata marks this backup as incomplete",
        );
    }
    if meta.compressed != payload.encoding.is_compressed() {
        warnings.push(
            WarningKind::MetadataMismatch,
            format!(
                "metadata says compressed={}, payload is {}",
                meta.compressed, payload.encoding
            ),
        );
    }
    if meta.backup_size_bytes != 0 && meta.backup_size_bytes != payload_bytes {
        warnings.push(
            WarningKind::MetadataMismatch,
            format!(
                "metadata records {} payload bytes, found {}",
                meta.backup_size_bytes, payload_bytes
            ),
        );
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Backup set:   {}", self.set_dir.display())?;
        writeln!(f, "Status:       PASSED")?;
        if let Some(meta) = &self.metadata {
            writeln!(f, "Kind:         {}", meta.backup_kind)?;
            writeln!(f, "Identity:     {}", meta.identity())?;
            writeln!(f, "Backup date:  {}", meta.backup_date)?;
            writeln!(
                f,
                "Source:       {} ({})",
                meta.source_disk,
                format_bytes(meta.source_size_bytes)
            )?;
            if !meta.host_system.is_empty() {
                writeln!(f, "Host system:  {}", meta.host_system)?;
            }
        } else {
            writeln!(f, "Metadata:     unreadable")?;
        }
        writeln!(
            f,
            "Payload:      {} ({} file{}, {})",
            self.payload.encoding,
            self.payload.files.len(),
            if self.payload.files.len() == 1 { "" } else { "s" },
            format_bytes(self.payload_bytes)
        )?;
        if let Some(ratio) = self
            .metadata
            .as_ref()
            .filter(|m| m.source_size_bytes > 0 && self.payload.encoding.is_compressed())
            .map(|m| self.payload_bytes as f64 / m.source_size_bytes as f64 * 100.0)
        {
            writeln!(f, "Compression:  {:.1}% of source size", ratio)?;
        }
        writeln!(
            f,
            "Partition table: {}",
            if self.has_partition_table { "captured" } else { "none" }
        )?;
        writeln!(f, "Checksums:    {} files verified", self.checked_files)?;
        for warning in self.warnings.iter() {
            writeln!(f, "Warning:      {}", warning.message)?;
        }
        Ok(())
    }
}
