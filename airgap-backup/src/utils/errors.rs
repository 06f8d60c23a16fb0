//! Error types for the backup pipeline.
//!
//! Every fatal condition maps onto a closed [`ErrorKind`] so callers (and the
//! CLI exit status) can branch on the failure without parsing messages.

use std::path::PathBuf;
use thiserror::Error;

use crate::tools::ToolError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Source is not a block device: {}", .0.display())]
    SourceNotBlockDevice(PathBuf),

    #[error("Source {} has mounted partitions: {}", .device.display(), .mountpoints.join(", "))]
    SourceMounted {
        device: PathBuf,
        mountpoints: Vec<String>,
    },

    #[error("Destination not writable: {}: {reason}", .path.display())]
    DestinationNotWritable { path: PathBuf, reason: String },

    #[error("Destination not found: {}", .0.display())]
    DestinationNotFound(PathBuf),

    #[error("Backup set already exists: {}", .0.display())]
    DestinationExists(PathBuf),

    #[error("Insufficient space: {required} bytes required, {available} bytes available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("Streaming failed while {stage}: {source}")]
    StreamingFailed {
        stage: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid backup set: {0}")]
    InvalidBackupSet(String),

    #[error("Checksum mismatch: {}", .0.join("; "))]
    ChecksumMismatch(Vec<String>),

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Backup failed verification, refusing to restore: {0}")]
    BackupInvalid(String),

    #[error("Destination too small: {required} bytes required, {capacity} bytes available")]
    DestinationTooSmall { required: u64, capacity: u64 },

    #[error("Destination {} still has mounted partitions: {}", .device.display(), .mountpoints.join(", "))]
    DestinationMounted {
        device: PathBuf,
        mountpoints: Vec<String>,
    },

    #[error("Post-backup verification failed: {0}")]
    VerificationFailed(String),

    #[error("Operation aborted: {0}")]
    Aborted(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Machine-readable classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SourceNotFound,
    SourceNotBlockDevice,
    SourceMounted,
    DestinationNotWritable,
    DestinationNotFound,
    DestinationExists,
    InsufficientSpace,
    StreamingFailed,
    InvalidBackupSet,
    ChecksumMismatch,
    InvalidMetadata,
    BackupInvalid,
    DestinationTooSmall,
    DestinationMounted,
    VerificationFailed,
    Aborted,
    Config,
    Tool,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SourceNotFound => "source_not_found",
            ErrorKind::SourceNotBlockDevice => "source_not_block_device",
            ErrorKind::SourceMounted => "source_mounted",
            ErrorKind::DestinationNotWritable => "destination_not_writable",
            ErrorKind::DestinationNotFound => "destination_not_found",
            ErrorKind::DestinationExists => "destination_exists",
            ErrorKind::InsufficientSpace => "insufficient_space",
            ErrorKind::StreamingFailed => "streaming_failed",
            ErrorKind::InvalidBackupSet => "invalid_backup_set",
            ErrorKind::ChecksumMismatch => "checksum_mismatch",
            ErrorKind::InvalidMetadata => "invalid_metadata",
            ErrorKind::BackupInvalid => "backup_invalid",
            ErrorKind::DestinationTooSmall => "destination_too_small",
            ErrorKind::DestinationMounted => "destination_mounted",
            ErrorKind::VerificationFailed => "verification_failed",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Config => "config",
            ErrorKind::Tool => "tool",
            ErrorKind::Io => "io",
        }
    }

    /// Process exit status used by the CLI.
    ///
    /// 1 is left to anyhow-level failures that never became a `PipelineError`.
    pub fn exit_code(&self) -> u8 {
        match self {
            ErrorKind::Config => 2,
            ErrorKind::SourceNotFound => 10,
            ErrorKind::SourceNotBlockDevice => 11,
            ErrorKind::SourceMounted => 12,
            ErrorKind::DestinationNotWritable => 13,
            ErrorKind::DestinationNotFound => 14,
            ErrorKind::DestinationExists => 15,
            ErrorKind::InsufficientSpace => 16,
            ErrorKind::DestinationTooSmall => 17,
            ErrorKind::DestinationMounted => 18,
            ErrorKind::InvalidBackupSet => 20,
            ErrorKind::ChecksumMismatch => 21,
            ErrorKind::InvalidMetadata => 22,
            ErrorKind::BackupInvalid => 23,
            ErrorKind::VerificationFailed => 24,
            ErrorKind::StreamingFailed => 30,
            ErrorKind::Tool => 31,
            ErrorKind::Io => 32,
            ErrorKind::Aborted => 40,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::SourceNotFound(_) => ErrorKind::SourceNotFound,
            PipelineError::SourceNotBlockDevice(_) => ErrorKind::SourceNotBlockDevice,
            PipelineError::SourceMounted { .. } => ErrorKind::SourceMounted,
            PipelineError::DestinationNotWritable { .. } => ErrorKind::DestinationNotWritable,
            PipelineError::DestinationNotFound(_) => ErrorKind::DestinationNotFound,
            PipelineError::DestinationExists(_) => ErrorKind::DestinationExists,
            PipelineError::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
            PipelineError::StreamingFailed { .. } => ErrorKind::StreamingFailed,
            PipelineError::InvalidBackupSet(_) => ErrorKind::InvalidBackupSet,
            PipelineError::ChecksumMismatch(_) => ErrorKind::ChecksumMismatch,
            PipelineError::InvalidMetadata(_) => ErrorKind::InvalidMetadata,
            PipelineError::BackupInvalid(_) => ErrorKind::BackupInvalid,
            PipelineError::DestinationTooSmall { .. } => ErrorKind::DestinationTooSmall,
            PipelineError::DestinationMounted { .. } => ErrorKind::DestinationMounted,
            PipelineError::VerificationFailed(_) => ErrorKind::VerificationFailed,
            PipelineError::Aborted(_) => ErrorKind::Aborted,
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Tool(_) => ErrorKind::Tool,
            PipelineError::Io(_) => ErrorKind::Io,
            PipelineError::Serialization(_) => ErrorKind::InvalidMetadata,
        }
    }

    pub(crate) fn streaming(stage: impl Into<String>, source: std::io::Error) -> Self {
        PipelineError::StreamingFailed {
            stage: stage.into(),
            source,
        }
    }

    pub(crate) fn not_writable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        PipelineError::DestinationNotWritable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let kinds = [
            ErrorKind::SourceNotFound,
            ErrorKind::SourceNotBlockDevice,
            ErrorKind::SourceMounted,
            ErrorKind::DestinationNotWritable,
            ErrorKind::DestinationNotFound,
            ErrorKind::DestinationExists,
            ErrorKind::InsufficientSpace,
            ErrorKind::StreamingFailed,
            ErrorKind::InvalidBackupSet,
            ErrorKind::ChecksumMismatch,
            ErrorKind::InvalidMetadata,
            ErrorKind::BackupInvalid,
            ErrorKind::DestinationTooSmall,
            ErrorKind::DestinationMounted,
            ErrorKind::VerificationFailed,
            ErrorKind::Aborted,
            ErrorKind::Config,
            ErrorKind::Tool,
            ErrorKind::Io,
        ];
        let codes: std::collections::HashSet<u8> = kinds.iter().map(|k| k.exit_code()).collect();
        assert_eq!(codes.len(), kinds.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_checksum_mismatch_message() {
        let err = PipelineError::ChecksumMismatch(vec![
            "a.img: digest mismatch".to_string(),
            "b.img: missing".to_string(),
        ]);
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
        assert_eq!(
            err.to_string(),
            "Checksum mismatch: a.img: digest mismatch; b.img: missing"
        );
    }
}
