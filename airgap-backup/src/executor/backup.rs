//! Backup producer: source device or VM disk file to a new backup set.
//!
//! The set is assembled in `<id>.partial` and renamed to `<id>` only after
//! the checksum manifest has been written, so an interrupted run can never be
//! mistaken for a complete one.

use chrono::Local;
use std::path::{Path, PathBuf};

use super::journal::Journal;
use super::verify::{verify_backup_set, VerifyReport};
use super::{WarningKind, Warnings};
use crate::backup_set::checksums::ChecksumManifest;
use crate::backup_set::metadata::BackupMetadata;
use crate::backup_set::{
    backup_set_id, BackupKind, Compression, Payload, PayloadEncoding, CHECKSUM_FILE, LOG_FILE,
    METADATA_FILE, PARTITION_TABLE_BIN, PARTITION_TABLE_SECTORS, PARTITION_TABLE_TXT,
    SECTOR_SIZE, STAGING_SUFFIX, VM_CONFIG_DIR,
};
use crate::config::{BackupConfig, StreamConfig};
use crate::tools::{devices, SystemTools};
use crate::transfer::progress::format_bytes;
use crate::transfer::stream;
use crate::utils::{PipelineError, Result};

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub compress: bool,
    pub compression: Compression,
    /// VM backups only
    pub split: bool,
    pub chunk_size: u64,
    pub verify_after: bool,
    /// VM configuration file copied into the set (VM backups only)
    pub include_config: Option<PathBuf>,
    /// Disk backups only
    pub skip_filesystem_check: bool,
    /// Back up a disk even though some of its partitions are mounted
    pub allow_mounted: bool,
    /// Identity used in the set id; defaults to the hostname or VM file stem
    pub name: Option<String>,
}

impl BackupOptions {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            compress: config.compress,
            compression: config.compression,
            split: config.split,
            chunk_size: config.chunk_size,
            verify_after: config.verify_after,
            include_config: None,
            skip_filesystem_check: config.skip_filesystem_check,
            allow_mounted: false,
            name: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub kind: BackupKind,
    pub source: PathBuf,
    /// Directory that will contain the new set
    pub destination: PathBuf,
    pub options: BackupOptions,
}

#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub set_dir: PathBuf,
    pub metadata: BackupMetadata,
    pub payload: Payload,
    pub warnings: Warnings,
    /// Present when `verify_after` was requested
    pub verify: Option<VerifyReport>,
}

/// Resolved plan after preflight.
struct Plan {
    identity: String,
    source_size: u64,
    compression: Option<Compression>,
    split: bool,
}

pub struct BackupProducer<'a, T: SystemTools> {
    tools: &'a T,
    stream: &'a StreamConfig,
}

impl<'a, T: SystemTools> BackupProducer<'a, T> {
    pub fn new(tools: &'a T, stream: &'a StreamConfig) -> Self {
        Self { tools, stream }
    }

    pub async fn run(&self, request: &BackupRequest) -> Result<BackupOutcome> {
        let started = Local::now();
        let mut journal = Journal::new();

        let plan = self.preflight(request, &mut journal).await?;
        if request.kind == BackupKind::Disk {
            self.check_source_mounts(request, &mut journal).await?;
            if !request.options.skip_filesystem_check {
                self.check_filesystems(&request.source, &mut journal).await;
            }
        }

        let id = backup_set_id(&plan.identity, started);
        let (final_dir, staging) = reserve_set_dir(&request.destination, &id)?;
        tokio::fs::create_dir(&staging)
            .await
            .map_err(|e| PipelineError::not_writable(&staging, e))?;
        journal
            .attach(&staging.join(LOG_FILE))
            .map_err(|e| PipelineError::not_writable(staging.join(LOG_FILE), e))?;

        journal.step(format!(
            "Backing up {} {} ({}) into {}",
            request.kind,
            request.source.display(),
            format_bytes(plan.source_size),
            staging.display()
        ));

        let mut metadata =
            BackupMetadata::new(request.kind, &plan.identity, &request.source, started);
        metadata.source_size_bytes = plan.source_size;
        metadata.source_size_human = format_bytes(plan.source_size);
        metadata.compressed = plan.compression.is_some();
        metadata.compression_type = plan.compression.map(|c| c.as_str().to_string());
        metadata.split = plan.split;
        metadata.chunk_size_bytes = plan.split.then_some(request.options.chunk_size);
        metadata.host_system = devices::host_system();

        let (payload, backup_size) = match self
            .assemble(request, &plan, &staging, &mut metadata, &mut journal)
            .await
        {
            Ok(assembled) => assembled,
            Err(e) => {
                journal.error(format!("{}; backup set left incomplete in {}", e, staging.display()));
                // Partial metadata helps a postmortem; the missing manifest keeps the set invalid.
                metadata.complete = false;
                if let Err(write_err) = metadata.write_to(&staging.join(METADATA_FILE)).await {
                    journal.error(format!("could not write partial metadata: {}", write_err));
                }
                return Err(e);
            }
        };

        tokio::fs::rename(&staging, &final_dir)
            .await
            .map_err(|e| PipelineError::not_writable(&final_dir, e))?;
        journal.step(format!(
            "Backup complete: {} ({} payload, {} on disk)",
            final_dir.display(),
            payload.encoding,
            format_bytes(backup_size)
        ));

        let verify = if request.options.verify_after {
            journal.step("Verifying backup set");
            match verify_backup_set(&final_dir).await {
                Ok(report) => {
                    journal.step("Verification passed");
                    Some(report)
                }
                Err(e) => {
                    journal.error(format!("Verification failed: {}", e));
                    return Err(PipelineError::VerificationFailed(e.to_string()));
                }
            }
        } else {
            None
        };

        Ok(BackupOutcome {
            set_dir: final_dir,
            metadata,
            payload,
            warnings: journal.into_warnings(),
            verify,
        })
    }

    /// Everything written into the staging directory: partition table,
    /// payload, VM config, metadata and finally the checksum manifest.
    /// Returns the payload and its size on disk.
    async fn assemble(
        &self,
        request: &BackupRequest,
        plan: &Plan,
        staging: &Path,
        metadata: &mut BackupMetadata,
        journal: &mut Journal,
    ) -> Result<(Payload, u64)> {
        let mut covered = Vec::new();
        if request.kind == BackupKind::Disk {
            covered.extend(
                self.capture_partition_table(&request.source, staging, plan.source_size, journal)
                    .await?,
            );
        }

        let (payload, bytes_read) = self.stream_payload(request, plan, staging).await?;
        if bytes_read != plan.source_size {
            journal.warn(
                WarningKind::MetadataMismatch,
                format!(
                    "read {} bytes from source, expected {}",
                    bytes_read, plan.source_size
                ),
            );
        }
        covered.extend(payload.files.iter().cloned());

        if let (BackupKind::Vm, Some(config)) = (request.kind, &request.options.include_config) {
            if let Some(copied) = self.copy_vm_config(config, staging, journal).await {
                covered.push(copied);
            }
        }

        let backup_size = stream::total_size(staging, &payload.files)
            .await
            .map_err(|e| PipelineError::streaming("measuring payload", e))?;
        metadata.source_size_bytes = bytes_read;
        metadata.source_size_human = format_bytes(bytes_read);
        metadata.backup_file = payload.files[0].clone();
        metadata.backup_size_bytes = backup_size;
        metadata.backup_size_human = format_bytes(backup_size);
        metadata.split_parts = if plan.split { payload.files.len() } else { 0 };
        metadata.complete = true;
        metadata.write_to(&staging.join(METADATA_FILE)).await?;
        covered.push(METADATA_FILE.to_string());

        journal.step(format!("Computing SHA-256 over {} files", covered.len()));
        let manifest = ChecksumManifest::generate(staging, &covered)
            .await
            .map_err(|e| PipelineError::streaming("computing checksums", e))?;
        manifest
            .write_to(&staging.join(CHECKSUM_FILE))
            .await
            .map_err(|e| PipelineError::streaming("writing checksums", e))?;

        Ok((payload, backup_size))
    }

    async fn preflight(&self, request: &BackupRequest, journal: &mut Journal) -> Result<Plan> {
        let options = &request.options;
        let source = &request.source;

        if request.kind == BackupKind::Disk {
            if options.split {
                return Err(PipelineError::Config(
                    "split mode is only available for VM backups".to_string(),
                ));
            }
            if options.include_config.is_some() {
                return Err(PipelineError::Config(
                    "including a VM config is only available for VM backups".to_string(),
                ));
            }
        }
        if options.split && options.chunk_size == 0 {
            return Err(PipelineError::Config(
                "split chunk size must be greater than zero".to_string(),
            ));
        }

        if !source.exists() {
            return Err(PipelineError::SourceNotFound(source.clone()));
        }
        if source.is_dir() {
            return Err(PipelineError::SourceNotFound(source.clone()));
        }
        let is_block = self.tools.is_block_device(source)?;
        if request.kind == BackupKind::Disk && !is_block {
            return Err(PipelineError::SourceNotBlockDevice(source.clone()));
        }
        let source_size = devices::device_size(self.tools, source).await?;

        let mut compression = options.compress.then_some(options.compression);
        if options.split && compression.is_some() {
            journal.warn(
                WarningKind::OptionIgnored,
                "compression is disabled for split backups; parts are stored raw",
            );
            compression = None;
        }

        tokio::fs::create_dir_all(&request.destination)
            .await
            .map_err(|e| PipelineError::not_writable(&request.destination, e))?;
        let available = self
            .tools
            .available_space(&request.destination)
            .map_err(|e| PipelineError::not_writable(&request.destination, e))?;
        journal.step(format!(
            "Source size {}, available at destination {}",
            format_bytes(source_size),
            format_bytes(available)
        ));

        if available < source_size {
            if compression.is_some() {
                journal.warn(
                    WarningKind::SpaceAdvisory,
                    format!(
                        "only {} free for a {} source; continuing because the payload is compressed",
                        format_bytes(available),
                        format_bytes(source_size)
                    ),
                );
            } else {
                return Err(PipelineError::InsufficientSpace {
                    required: source_size,
                    available,
                });
            }
        }

        let identity = match (&options.name, request.kind) {
            (Some(name), _) => name.clone(),
            (None, BackupKind::Disk) => hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string()),
            (None, BackupKind::Vm) => source
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("vm")
                .to_string(),
        };

        Ok(Plan {
            identity,
            source_size,
            compression,
            split: options.split,
        })
    }

    async fn check_source_mounts(&self, request: &BackupRequest, journal: &mut Journal) -> Result<()> {
        let mounted = match devices::mounted_entries(self.tools, &request.source).await {
            Ok(mounted) => mounted,
            Err(e) => {
                journal.warn(
                    WarningKind::MountedSource,
                    format!("could not determine mount state of {}: {}", request.source.display(), e),
                );
                return Ok(());
            }
        };
        if mounted.is_empty() {
            return Ok(());
        }

        let mountpoints: Vec<String> = mounted
            .iter()
            .map(|e| format!("{} on {}", e.name, e.mountpoint.as_deref().unwrap_or("?")))
            .collect();
        if !request.options.allow_mounted {
            return Err(PipelineError::SourceMounted {
                device: request.source.clone(),
                mountpoints,
            });
        }
        journal.warn(
            WarningKind::MountedSource,
            format!(
                "backing up mounted partitions ({}); the image will not be crash-consistent",
                mountpoints.join(", ")
            ),
        );
        Ok(())
    }

    /// Read-only `fsck` of every partition. Failures never stop the backup.
    async fn check_filesystems(&self, device: &Path, journal: &mut Journal) {
        let entries = match devices::list_block_entries(self.tools, device).await {
            Ok(entries) => entries,
            Err(e) => {
                journal.warn(
                    WarningKind::FilesystemCheck,
                    format!("could not list partitions for filesystem check: {}", e),
                );
                return;
            }
        };

        for entry in entries.iter().filter(|e| e.is_partition()) {
            match entry.fstype.as_deref() {
                None | Some("swap") | Some("") => continue,
                Some(_) => {}
            }
            journal.step(format!("Checking filesystem on {}", entry.name));
            if let Err(e) = devices::check_filesystem(self.tools, &entry.name).await {
                journal.warn(
                    WarningKind::FilesystemCheck,
                    format!("filesystem check of {} reported problems: {}", entry.name, e),
                );
            }
        }
    }

    /// Capture text and raw forms of the partition table. Returns the files written.
    async fn capture_partition_table(
        &self,
        device: &Path,
        staging: &Path,
        source_size: u64,
        journal: &mut Journal,
    ) -> Result<Vec<String>> {
        let mut files = Vec::new();

        match devices::dump_partition_table(self.tools, device).await {
            Ok(dump) => {
                tokio::fs::write(staging.join(PARTITION_TABLE_TXT), dump)
                    .await
                    .map_err(|e| PipelineError::streaming("writing partition table dump", e))?;
                files.push(PARTITION_TABLE_TXT.to_string());
            }
            Err(e) => journal.warn(
                WarningKind::PartitionTable,
                format!("could not dump partition table: {}", e),
            ),
        }

        let len = source_size.min(PARTITION_TABLE_SECTORS * SECTOR_SIZE);
        let head = stream::read_leading_bytes(device, len)
            .await
            .map_err(|e| PipelineError::streaming("capturing partition table sectors", e))?;
        tokio::fs::write(staging.join(PARTITION_TABLE_BIN), &head)
            .await
            .map_err(|e| PipelineError::streaming("writing partition table capture", e))?;
        files.push(PARTITION_TABLE_BIN.to_string());

        journal.step(format!("Captured partition table ({} leading bytes)", head.len()));
        Ok(files)
    }

    async fn stream_payload(
        &self,
        request: &BackupRequest,
        plan: &Plan,
        staging: &Path,
    ) -> Result<(Payload, u64)> {
        let base = request.kind.payload_base(&request.source);

        if plan.split {
            let parts = stream::split_to_parts(
                &request.source,
                staging,
                &base,
                request.options.chunk_size,
                plan.source_size,
                self.stream,
            )
            .await
            .map_err(|e| PipelineError::streaming("splitting source into parts", e))?;
            let bytes = stream::total_size(staging, &parts)
                .await
                .map_err(|e| PipelineError::streaming("measuring split parts", e))?;
            return Ok((
                Payload {
                    encoding: PayloadEncoding::SplitParts,
                    files: parts,
                },
                bytes,
            ));
        }

        let name = match plan.compression {
            Some(c) => format!("{}.{}", base, c.extension()),
            None => base,
        };
        let bytes = stream::encode_to_file(
            &request.source,
            &staging.join(&name),
            plan.compression,
            plan.source_size,
            self.stream,
        )
        .await
        .map_err(|e| PipelineError::streaming(format!("writing {}", name), e))?;

        Ok((
            Payload {
                encoding: PayloadEncoding::from_compression(plan.compression),
                files: vec![name],
            },
            bytes,
        ))
    }

    /// Best-effort copy of the VM configuration. Returns its set-relative name.
    async fn copy_vm_config(
        &self,
        config: &Path,
        staging: &Path,
        journal: &mut Journal,
    ) -> Option<String> {
        let Some(file_name) = config.file_name().and_then(|n| n.to_str()) else {
            journal.warn(
                WarningKind::ConfigCopy,
                format!("invalid VM config path {}", config.display()),
            );
            return None;
        };

        let dir = staging.join(VM_CONFIG_DIR);
        let result = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::copy(config, dir.join(file_name)).await
        }
        .await;

        match result {
            Ok(_) => {
                journal.step(format!("Included VM config {}", config.display()));
                Some(format!("{}/{}", VM_CONFIG_DIR, file_name))
            }
            Err(e) => {
                journal.warn(
                    WarningKind::ConfigCopy,
                    format!("could not copy VM config {}: {}", config.display(), e),
                );
                None
            }
        }
    }
}

/// Final and staging paths for set `id`. Refuses when either already exists.
fn reserve_set_dir(destination: &Path, id: &str) -> Result<(PathBuf, PathBuf)> {
    let final_dir = destination.join(id);
    let staging = destination.join(format!("{}{}", id, STAGING_SUFFIX));
    if final_dir.exists() {
        return Err(PipelineError::DestinationExists(final_dir));
    }
    if staging.exists() {
        return Err(PipelineError::DestinationExists(staging));
    }
    Ok((final_dir, staging))
}
