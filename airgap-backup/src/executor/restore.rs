//! Restore consumer: verified backup set back onto a device or disk file.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use super::journal::Journal;
use super::verify::verify_backup_set;
use super::{WarningKind, Warnings};
use crate::backup_set::metadata::BackupMetadata;
use crate::backup_set::{
    detect_payload, BackupKind, Payload, PayloadEncoding, METADATA_FILE, PARTITION_TABLE_BIN,
    PARTITION_TABLE_TXT, VM_CONFIG_DIR,
};
use crate::config::{RestoreConfig, StreamConfig};
use crate::confirm::Confirm;
use crate::tools::{devices, SystemTools, ToolCommand, ToolError};
use crate::transfer::progress::format_bytes;
use crate::transfer::stream;
use crate::utils::{PipelineError, Result};

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Restore even though verification failed
    pub force: bool,
    /// Proceed when destination partitions could not be unmounted
    pub allow_mounted: bool,
    pub skip_partition_table: bool,
    pub skip_bootloader: bool,
    /// Where to copy `vm-config/` back to (VM restores only)
    pub config_destination: Option<PathBuf>,
}

impl RestoreOptions {
    pub fn from_config(config: &RestoreConfig) -> Self {
        Self {
            skip_partition_table: config.skip_partition_table,
            skip_bootloader: config.skip_bootloader,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub kind: BackupKind,
    pub set_dir: PathBuf,
    /// Block device or disk image file
    pub destination: PathBuf,
    pub options: RestoreOptions,
}

#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub bytes_written: u64,
    pub encoding: PayloadEncoding,
    pub partition_table_restored: bool,
    pub bootloader_reinstalled: bool,
    pub warnings: Warnings,
}

/// Destination facts gathered before anything is written.
#[derive(Debug)]
struct RestoreTarget {
    is_block_device: bool,
    capacity: u64,
}

impl RestoreTarget {
    async fn probe<T: SystemTools>(tools: &T, kind: BackupKind, path: &Path) -> Result<Self> {
        if path.is_dir() {
            return Err(PipelineError::not_writable(path, "destination is a directory"));
        }

        if !path.exists() {
            if kind == BackupKind::Disk {
                return Err(PipelineError::DestinationNotFound(path.to_path_buf()));
            }
            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            if !parent.is_dir() {
                return Err(PipelineError::DestinationNotFound(parent.to_path_buf()));
            }
            let capacity = tools
                .available_space(parent)
                .map_err(|e| PipelineError::not_writable(parent, e))?;
            return Ok(Self {
                is_block_device: false,
                capacity,
            });
        }

        if tools.is_block_device(path)? {
            let capacity = devices::device_size(tools, path).await?;
            return Ok(Self {
                is_block_device: true,
                capacity,
            });
        }

        let len = tokio::fs::metadata(path).await?.len();
        let free = tools
            .available_space(path)
            .map_err(|e| PipelineError::not_writable(path, e))?;
        Ok(Self {
            is_block_device: false,
            capacity: len.saturating_add(free),
        })
    }
}

#[derive(Error, Debug)]
enum BootloaderError {
    #[error("no root partition found on {0}")]
    NoRootPartition(String),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("could not create mount point: {0}")]
    MountPoint(#[from] std::io::Error),
}

pub struct RestoreConsumer<'a, T: SystemTools, C: Confirm> {
    tools: &'a T,
    confirm: &'a C,
    stream: &'a StreamConfig,
}

impl<'a, T: SystemTools, C: Confirm> RestoreConsumer<'a, T, C> {
    pub fn new(tools: &'a T, confirm: &'a C, stream: &'a StreamConfig) -> Self {
        Self {
            tools,
            confirm,
            stream,
        }
    }

    pub async fn run(&self, request: &RestoreRequest) -> Result<RestoreOutcome> {
        let mut journal = Journal::new();
        let set_dir = &request.set_dir;
        let destination = &request.destination;

        let (payload, metadata) = self.check_backup(request, &mut journal).await?;

        if let Some(meta) = &metadata {
            if meta.backup_kind != request.kind {
                journal.warn(
                    WarningKind::MetadataMismatch,
                    format!(
                        "set was recorded as a {} backup, restoring as {}",
                        meta.backup_kind, request.kind
                    ),
                );
            }
        }

        let required = match metadata.as_ref().map(|m| m.source_size_bytes) {
            Some(size) if size > 0 => size,
            _ if !payload.encoding.is_compressed() => stream::total_size(set_dir, &payload.files)
                .await
                .map_err(|e| PipelineError::streaming("measuring payload", e))?,
            _ => {
                journal.warn(
                    WarningKind::InvalidMetadata,
                    "source size unknown; skipping destination capacity check",
                );
                0
            }
        };

        let target = RestoreTarget::probe(self.tools, request.kind, destination).await?;
        journal.step(format!(
            "Restoring {} ({}) onto {} (capacity {})",
            set_dir.display(),
            format_bytes(required),
            destination.display(),
            format_bytes(target.capacity)
        ));
        if target.capacity < required {
            return Err(PipelineError::DestinationTooSmall {
                required,
                capacity: target.capacity,
            });
        }

        if target.is_block_device {
            self.release_mounts(destination, request.options.allow_mounted, &mut journal)
                .await?;
        }

        self.confirm_destructive(request.kind, destination).await?;

        let mut partition_table_restored = false;
        if request.kind == BackupKind::Disk && !request.options.skip_partition_table {
            partition_table_restored = self
                .restore_partition_table(set_dir, destination, &mut journal)
                .await;
        }

        let bytes_written = match self
            .write_payload(request.kind, set_dir, &payload, destination, required)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                journal.error(format!(
                    "RESTORE FAILED: {}. {} is likely left in an unusable state",
                    e,
                    destination.display()
                ));
                return Err(e);
            }
        };
        journal.step(format!(
            "Wrote {} to {}",
            format_bytes(bytes_written),
            destination.display()
        ));

        let mut bootloader_reinstalled = false;
        if request.kind == BackupKind::Disk && !request.options.skip_bootloader {
            match self.reinstall_bootloader(destination, &mut journal).await {
                Ok(()) => {
                    journal.step("Bootloader reinstalled");
                    bootloader_reinstalled = true;
                }
                Err(e) => journal.warn(
                    WarningKind::BootloaderRestoreFailed,
                    format!(
                        "bootloader reinstall failed ({}); the system may not boot, repair it from rescue media",
                        e
                    ),
                ),
            }
        }

        if request.kind == BackupKind::Vm {
            if let Some(config_dest) = &request.options.config_destination {
                self.restore_vm_config(set_dir, config_dest, &mut journal)
                    .await;
            }
        }

        journal.step("Restore complete");
        Ok(RestoreOutcome {
            bytes_written,
            encoding: payload.encoding,
            partition_table_restored,
            bootloader_reinstalled,
            warnings: journal.into_warnings(),
        })
    }

    /// Gate on the verifier, or accept the risk when forced.
    async fn check_backup(
        &self,
        request: &RestoreRequest,
        journal: &mut Journal,
    ) -> Result<(Payload, Option<BackupMetadata>)> {
        match verify_backup_set(&request.set_dir).await {
            Ok(report) => {
                journal.step(format!(
                    "Backup verified: {} checksums passed",
                    report.checked_files
                ));
                for warning in report.warnings.iter() {
                    journal.warn(warning.kind, warning.message.clone());
                }
                Ok((report.payload, report.metadata))
            }
            Err(e) if !request.options.force => Err(PipelineError::BackupInvalid(e.to_string())),
            Err(e) => {
                journal.warn(
                    WarningKind::RiskAcknowledged,
                    format!("verification failed ({}); restoring anyway as forced", e),
                );
                let payload = detect_payload(&request.set_dir)?;
                let metadata = BackupMetadata::from_path(&request.set_dir.join(METADATA_FILE)).ok();
                Ok((payload, metadata))
            }
        }
    }

    /// Unmount every partition of `device`; refuse if any stay mounted.
    async fn release_mounts(
        &self,
        device: &Path,
        allow_mounted: bool,
        journal: &mut Journal,
    ) -> Result<()> {
        let mounted = match devices::mounted_entries(self.tools, device).await {
            Ok(mounted) => mounted,
            Err(e) => {
                journal.warn(
                    WarningKind::MountedDestination,
                    format!("could not determine mount state of {}: {}", device.display(), e),
                );
                return Ok(());
            }
        };
        if mounted.is_empty() {
            return Ok(());
        }

        for entry in &mounted {
            let result = if entry.mountpoint.as_deref() == Some("[SWAP]") {
                self.tools
                    .run(ToolCommand::new("swapoff").arg(&entry.name))
                    .await
                    .map(|_| ())
            } else {
                devices::unmount(self.tools, &entry.name).await
            };
            if let Err(e) = result {
                journal.warn(
                    WarningKind::Unmount,
                    format!("could not release {}: {}", entry.name, e),
                );
            }
        }

        let remaining = devices::mounted_entries(self.tools, device)
            .await
            .unwrap_or(mounted);
        if remaining.is_empty() {
            return Ok(());
        }
        let mountpoints: Vec<String> = remaining
            .iter()
            .map(|e| format!("{} on {}", e.name, e.mountpoint.as_deref().unwrap_or("?")))
            .collect();
        if !allow_mounted {
            return Err(PipelineError::DestinationMounted {
                device: device.to_path_buf(),
                mountpoints,
            });
        }
        journal.warn(
            WarningKind::MountedDestination,
            format!("writing over mounted partitions: {}", mountpoints.join(", ")),
        );
        Ok(())
    }

    async fn confirm_destructive(&self, kind: BackupKind, destination: &Path) -> Result<()> {
        let target = destination.display().to_string();

        let answer = self
            .prompt_operator(&format!(
                "This will OVERWRITE all data on {}. Type 'yes' to continue:",
                target
            ))
            .await?;
        if answer != "yes" {
            return Err(PipelineError::Aborted("restore not confirmed".to_string()));
        }

        if kind == BackupKind::Disk {
            let retyped = self
                .prompt_operator(&format!("Retype the destination device ({}) to confirm:", target))
                .await?;
            if retyped != target {
                return Err(PipelineError::Aborted(format!(
                    "destination mismatch: expected {}, got {:?}",
                    target, retyped
                )));
            }
        }
        Ok(())
    }

    async fn prompt_operator(&self, prompt: &str) -> Result<String> {
        self.confirm
            .ask(prompt)
            .await
            .map_err(|e| PipelineError::Aborted(format!("could not read confirmation: {}", e)))
    }

    /// Partition table first: `sfdisk` from the text dump, falling back to the
    /// raw sector capture. Returns whether a table was written.
    async fn restore_partition_table(
        &self,
        set_dir: &Path,
        device: &Path,
        journal: &mut Journal,
    ) -> bool {
        let txt = set_dir.join(PARTITION_TABLE_TXT);
        let bin = set_dir.join(PARTITION_TABLE_BIN);

        let mut restored = false;
        if txt.is_file() {
            match devices::write_partition_table(self.tools, device, &txt).await {
                Ok(()) => {
                    journal.step("Partition table restored with sfdisk");
                    restored = true;
                }
                Err(e) => journal.warn(
                    WarningKind::PartitionTable,
                    format!("sfdisk restore failed: {}", e),
                ),
            }
        }

        if !restored && bin.is_file() {
            let result = async {
                let data = tokio::fs::read(&bin).await?;
                stream::write_leading_bytes(device, &data).await?;
                Ok::<usize, std::io::Error>(data.len())
            }
            .await;
            match result {
                Ok(len) => {
                    journal.step(format!("Partition table restored from {} raw bytes", len));
                    restored = true;
                }
                Err(e) => journal.warn(
                    WarningKind::PartitionTable,
                    format!("raw partition table write failed: {}", e),
                ),
            }
        }

        if !restored {
            if !txt.is_file() && !bin.is_file() {
                journal.step("No partition table captured; relying on the payload");
            }
            return false;
        }

        if let Err(e) = devices::reread_partition_table(self.tools, device).await {
            journal.warn(
                WarningKind::PartitionReread,
                format!("kernel did not re-read the partition table: {}", e),
            );
        }
        true
    }

    async fn write_payload(
        &self,
        kind: BackupKind,
        set_dir: &Path,
        payload: &Payload,
        destination: &Path,
        total: u64,
    ) -> Result<u64> {
        let mut options = OpenOptions::new();
        match kind {
            BackupKind::Disk => options.write(true),
            BackupKind::Vm => options.write(true).create(true).truncate(true),
        };
        let mut out = options
            .open(destination)
            .await
            .map_err(|e| PipelineError::not_writable(destination, e))?;

        let written = stream::decode_to_writer(set_dir, payload, &mut out, total, self.stream)
            .await
            .map_err(|e| PipelineError::streaming(format!("writing {}", destination.display()), e))?;
        out.flush()
            .await
            .map_err(|e| PipelineError::streaming("flushing destination", e))?;
        out.sync_all()
            .await
            .map_err(|e| PipelineError::streaming("syncing destination", e))?;
        Ok(written)
    }

    async fn reinstall_bootloader(
        &self,
        device: &Path,
        journal: &mut Journal,
    ) -> std::result::Result<(), BootloaderError> {
        let entries = devices::list_block_entries(self.tools, device).await?;
        let root = devices::find_root_partition(&entries)
            .ok_or_else(|| BootloaderError::NoRootPartition(device.display().to_string()))?
            .name
            .clone();

        let mount_dir = tempfile::Builder::new()
            .prefix("airgap-restore-")
            .tempdir()?;
        let mnt = mount_dir.path().to_path_buf();
        journal.step(format!("Reinstalling bootloader from {} mounted at {}", root, mnt.display()));

        self.tools
            .run(ToolCommand::new("mount").arg(&root).arg(&mnt))
            .await?;

        let mut mounted = vec![mnt.clone()];
        let result = async {
            for fs in ["dev", "proc", "sys"] {
                let target = mnt.join(fs);
                self.tools
                    .run(
                        ToolCommand::new("mount")
                            .arg("--bind")
                            .arg(format!("/{}", fs))
                            .arg(&target),
                    )
                    .await?;
                mounted.push(target);
            }

            self.tools
                .run(ToolCommand::new("chroot").arg(&mnt).arg("grub-install").arg(device))
                .await?;
            if let Err(e) = self
                .tools
                .run(ToolCommand::new("chroot").arg(&mnt).arg("update-grub"))
                .await
            {
                tracing::debug!("update-grub failed ({}), trying grub-mkconfig", e);
                self.tools
                    .run(
                        ToolCommand::new("chroot")
                            .arg(&mnt)
                            .args(["grub-mkconfig", "-o", "/boot/grub/grub.cfg"]),
                    )
                    .await?;
            }
            Ok::<(), ToolError>(())
        }
        .await;

        for target in mounted.iter().rev() {
            if let Err(e) = self.tools.run(ToolCommand::new("umount").arg(target)).await {
                journal.warn(
                    WarningKind::Unmount,
                    format!("could not unmount {}: {}", target.display(), e),
                );
            }
        }

        result.map_err(BootloaderError::from)
    }

    async fn restore_vm_config(&self, set_dir: &Path, config_dest: &Path, journal: &mut Journal) {
        let source = set_dir.join(VM_CONFIG_DIR);
        if !source.is_dir() {
            journal.warn(
                WarningKind::ConfigCopy,
                format!("backup set has no {} directory", VM_CONFIG_DIR),
            );
            return;
        }

        let result = async {
            tokio::fs::create_dir_all(config_dest).await?;
            let mut copied = 0usize;
            for entry in walkdir::WalkDir::new(&source).min_depth(1).max_depth(1) {
                let entry = entry.map_err(std::io::Error::from)?;
                if entry.file_type().is_file() {
                    tokio::fs::copy(entry.path(), config_dest.join(entry.file_name())).await?;
                    copied += 1;
                }
            }
            Ok::<usize, std::io::Error>(copied)
        }
        .await;

        match result {
            Ok(count) => journal.step(format!(
                "Copied {} VM config file(s) to {}",
                count,
                config_dest.display()
            )),
            Err(e) => journal.warn(
                WarningKind::ConfigCopy,
                format!("could not copy VM config to {}: {}", config_dest.display(), e),
            ),
        }
    }
}
