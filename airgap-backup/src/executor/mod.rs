//! Backup pipeline executors.
//!
//! - [`backup::BackupProducer`] streams a source into a new backup set
//! - [`verify::verify_backup_set`] checks a set without touching it
//! - [`restore::RestoreConsumer`] writes a verified set back onto a device or file
//!
//! Each executor separates its critical path, which returns a hard
//! `Result`, from best-effort steps whose failures land in [`Warnings`].

pub mod backup;
pub mod journal;
pub mod restore;
pub mod verify;

pub use backup::{BackupOptions, BackupOutcome, BackupProducer, BackupRequest};
pub use journal::Journal;
pub use restore::{RestoreConsumer, RestoreOptions, RestoreOutcome, RestoreRequest};
pub use verify::{verify_backup_set, VerifyReport};

use std::fmt;
use tracing::warn;

/// Category of a non-fatal problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// Compressed backup started with less free space than the source size
    SpaceAdvisory,
    /// Source partitions were mounted and the operator allowed it
    MountedSource,
    FilesystemCheck,
    PartitionTable,
    PartitionReread,
    ConfigCopy,
    Unmount,
    MountedDestination,
    InvalidMetadata,
    MetadataMismatch,
    /// Verification failure overridden by the operator
    RiskAcknowledged,
    OptionIgnored,
    BootloaderRestoreFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Non-fatal problems collected during a run.
#[derive(Debug, Clone, Default)]
pub struct Warnings(Vec<Warning>);

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and log a warning.
    pub fn push(&mut self, kind: WarningKind, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.0.push(Warning { kind, message });
    }

    pub fn contains(&self, kind: WarningKind) -> bool {
        self.0.iter().any(|w| w.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Warning> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures for executor tests.

    use std::path::{Path, PathBuf};

    use crate::config::StreamConfig;

    pub fn stream_config() -> StreamConfig {
        StreamConfig {
            buffer_size: 64 * 1024,
            progress_interval_secs: 3600,
        }
    }

    /// Deterministic non-repeating-ish content of `len` bytes.
    pub fn pattern(len: usize) -> Vec<u8> {
        let mut state: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 24) as u8
            })
            .collect()
    }

    /// Sparse file of `len` bytes with a known pattern written at a few offsets.
    pub fn sparse_source(dir: &Path, name: &str, len: u64) -> (PathBuf, Vec<u8>) {
        use std::io::{Seek, SeekFrom, Write};

        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.set_len(len).unwrap();

        let mut expected = vec![0u8; len as usize];
        let chunk = pattern(64 * 1024);
        for offset in [0, len / 3, len - chunk.len() as u64] {
            file.seek(SeekFrom::Start(offset)).unwrap();
            file.write_all(&chunk).unwrap();
            expected[offset as usize..offset as usize + chunk.len()].copy_from_slice(&chunk);
        }
        file.sync_all().unwrap();
        (path, expected)
    }
}
