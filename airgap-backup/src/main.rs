//! Airgap Backup - Main entry point
//!
//! Backup, verify and restore physical disks and VM disk images.

use airgap_backup::backup_set::{list_backup_sets, BackupKind, Compression};
use airgap_backup::config::Config;
use airgap_backup::confirm::TerminalConfirm;
use airgap_backup::executor::{
    verify_backup_set, BackupOptions, BackupProducer, BackupRequest, RestoreConsumer,
    RestoreOptions, RestoreRequest, Warnings,
};
use airgap_backup::shutdown;
use airgap_backup::tools::HostTools;
use airgap_backup::transfer::progress::format_bytes;
use airgap_backup::{utils, PipelineError};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a backup set
    #[command(subcommand)]
    Backup(BackupCommand),

    /// Verify a backup set's checksums and metadata
    Verify {
        /// Backup set directory
        set: PathBuf,
    },

    /// Restore a backup set onto a device or disk image
    #[command(subcommand)]
    Restore(RestoreCommand),

    /// List backup sets in a directory
    List {
        /// Directory holding backup sets
        dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct CompressionArgs {
    /// Compress the payload
    #[arg(long)]
    compress: bool,

    /// Compressor: gzip, xz or zstd (implies --compress)
    #[arg(long, value_name = "TYPE")]
    compression: Option<Compression>,

    /// Verify the set after writing it
    #[arg(long, conflicts_with = "no_verify")]
    verify: bool,

    /// Skip post-backup verification
    #[arg(long)]
    no_verify: bool,

    /// Name used in the backup set id
    #[arg(long)]
    name: Option<String>,
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    /// Back up a physical block device
    Disk {
        /// Source block device (e.g. /dev/sda)
        device: PathBuf,
        /// Directory that will hold the backup set
        dest: PathBuf,
        #[command(flatten)]
        common: CompressionArgs,
        /// Skip read-only filesystem checks
        #[arg(long)]
        skip_fsck: bool,
        /// Back up even if partitions are mounted
        #[arg(long)]
        allow_mounted: bool,
    },
    /// Back up a VM disk image file
    Vm {
        /// VM disk file (qcow2, vmdk, vdi, raw...)
        disk: PathBuf,
        /// Directory that will hold the backup set
        dest: PathBuf,
        #[command(flatten)]
        common: CompressionArgs,
        /// Split the payload into fixed-size parts
        #[arg(long)]
        split: bool,
        /// Part size in bytes
        #[arg(long, value_name = "BYTES")]
        chunk_size: Option<u64>,
        /// VM configuration file to store alongside the disk
        #[arg(long, value_name = "FILE")]
        include_config: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum RestoreCommand {
    /// Restore onto a physical block device
    Disk {
        /// Backup set directory
        set: PathBuf,
        /// Destination block device
        device: PathBuf,
        /// Restore even if verification fails
        #[arg(long)]
        force: bool,
        /// Proceed when partitions cannot be unmounted
        #[arg(long)]
        allow_mounted: bool,
        #[arg(long)]
        skip_partition_table: bool,
        #[arg(long)]
        skip_bootloader: bool,
    },
    /// Restore a VM disk image file
    Vm {
        /// Backup set directory
        set: PathBuf,
        /// Destination disk image file
        file: PathBuf,
        /// Restore even if verification fails
        #[arg(long)]
        force: bool,
        /// Directory to copy the saved VM config into
        #[arg(long, value_name = "PATH")]
        config_dest: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => return report_error(&e),
    };

    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = utils::logger::init(log_level) {
        eprintln!("failed to initialise logging: {e}");
    }

    tracing::debug!("airgap-backup v{}", env!("CARGO_PKG_VERSION"));

    tokio::select! {
        result = run(cli.command, &config) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => report_error(&e),
        },
        signal = shutdown::wait_for_signal() => {
            tracing::error!(
                "Interrupted by {:?}; any *.partial staging directory is incomplete and can be deleted",
                signal
            );
            // A confirmation prompt may still be blocked on stdin; the runtime
            // would wait for it on shutdown.
            std::process::exit(i32::from(signal.exit_code()))
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env(std::env::vars())?;
    Ok(config)
}

fn report_error(error: &anyhow::Error) -> ExitCode {
    let pipeline = error.downcast_ref::<PipelineError>();
    let label = pipeline
        .map(|e| format!("error[{}]", e.kind()))
        .unwrap_or_else(|| "error".to_string());

    tracing::error!("{:#}", error);
    if std::io::stderr().is_terminal() {
        eprintln!("\x1b[1;31m{}\x1b[0m: {:#}", label, error);
    } else {
        eprintln!("{}: {:#}", label, error);
    }

    ExitCode::from(pipeline.map(|e| e.kind().exit_code()).unwrap_or(1))
}

async fn run(command: Command, config: &Config) -> Result<()> {
    match command {
        Command::Backup(backup) => run_backup(backup, config).await,
        Command::Verify { set } => {
            let report = verify_backup_set(&set).await?;
            print!("{}", report);
            Ok(())
        }
        Command::Restore(restore) => run_restore(restore, config).await,
        Command::List { dir } => list(&dir),
    }
}

fn backup_options(config: &Config, common: CompressionArgs) -> BackupOptions {
    let mut options = BackupOptions::from_config(&config.backup);
    if let Some(compression) = common.compression {
        options.compress = true;
        options.compression = compression;
    }
    options.compress |= common.compress;
    if common.verify {
        options.verify_after = true;
    }
    if common.no_verify {
        options.verify_after = false;
    }
    options.name = common.name;
    options
}

async fn run_backup(command: BackupCommand, config: &Config) -> Result<()> {
    let request = match command {
        BackupCommand::Disk {
            device,
            dest,
            common,
            skip_fsck,
            allow_mounted,
        } => {
            let mut options = backup_options(config, common);
            options.skip_filesystem_check |= skip_fsck;
            options.allow_mounted = allow_mounted;
            options.split = false;
            BackupRequest {
                kind: BackupKind::Disk,
                source: device,
                destination: dest,
                options,
            }
        }
        BackupCommand::Vm {
            disk,
            dest,
            common,
            split,
            chunk_size,
            include_config,
        } => {
            let mut options = backup_options(config, common);
            options.split |= split;
            if let Some(chunk_size) = chunk_size {
                options.chunk_size = chunk_size;
            }
            options.include_config = include_config;
            BackupRequest {
                kind: BackupKind::Vm,
                source: disk,
                destination: dest,
                options,
            }
        }
    };

    let tools = HostTools;
    let outcome = BackupProducer::new(&tools, &config.stream)
        .run(&request)
        .await
        .with_context(|| format!("backup of {} failed", request.source.display()))?;

    println!("Backup set:  {}", outcome.set_dir.display());
    println!(
        "Payload:     {} ({} file{}, {})",
        outcome.payload.encoding,
        outcome.payload.files.len(),
        if outcome.payload.files.len() == 1 { "" } else { "s" },
        format_bytes(outcome.metadata.backup_size_bytes)
    );
    println!(
        "Verified:    {}",
        if outcome.verify.is_some() { "yes" } else { "skipped" }
    );
    print_warnings(&outcome.warnings);
    Ok(())
}

async fn run_restore(command: RestoreCommand, config: &Config) -> Result<()> {
    let mut options = RestoreOptions::from_config(&config.restore);
    let request = match command {
        RestoreCommand::Disk {
            set,
            device,
            force,
            allow_mounted,
            skip_partition_table,
            skip_bootloader,
        } => {
            options.force = force;
            options.allow_mounted = allow_mounted;
            options.skip_partition_table |= skip_partition_table;
            options.skip_bootloader |= skip_bootloader;
            RestoreRequest {
                kind: BackupKind::Disk,
                set_dir: set,
                destination: device,
                options,
            }
        }
        RestoreCommand::Vm {
            set,
            file,
            force,
            config_dest,
        } => {
            options.force = force;
            options.config_destination = config_dest;
            RestoreRequest {
                kind: BackupKind::Vm,
                set_dir: set,
                destination: file,
                options,
            }
        }
    };

    let tools = HostTools;
    let confirm = TerminalConfirm;
    let outcome = RestoreConsumer::new(&tools, &confirm, &config.stream)
        .run(&request)
        .await
        .with_context(|| format!("restore onto {} failed", request.destination.display()))?;

    println!("Restored:    {} onto {}", format_bytes(outcome.bytes_written), request.destination.display());
    println!("Payload:     {}", outcome.encoding);
    if request.kind == BackupKind::Disk {
        println!(
            "Partition table: {}",
            if outcome.partition_table_restored { "restored" } else { "not restored" }
        );
        println!(
            "Bootloader:  {}",
            if outcome.bootloader_reinstalled { "reinstalled" } else { "not reinstalled" }
        );
    }
    print_warnings(&outcome.warnings);
    Ok(())
}

fn list(dir: &Path) -> Result<()> {
    let sets = list_backup_sets(dir)?;
    if sets.is_empty() {
        println!("No backup sets in {}", dir.display());
        return Ok(());
    }

    println!(
        "{:<45} {:<5} {:<26} {:>10} {:>10}  STATUS",
        "ID", "KIND", "DATE", "SOURCE", "BACKUP"
    );
    for set in sets {
        let (kind, date, source, backup) = match &set.metadata {
            Some(meta) => (
                meta.backup_kind.as_str().to_string(),
                meta.backup_date.clone(),
                format_bytes(meta.source_size_bytes),
                format_bytes(meta.backup_size_bytes),
            ),
            None => ("?".into(), "?".into(), "?".into(), "?".into()),
        };
        println!(
            "{:<45} {:<5} {:<26} {:>10} {:>10}  {}",
            set.id,
            kind,
            date,
            source,
            backup,
            if set.complete { "complete" } else { "incomplete" }
        );
    }
    Ok(())
}

fn print_warnings(warnings: &Warnings) {
    if warnings.is_empty() {
        return;
    }
    println!("Warnings:    {}", warnings.len());
    for warning in warnings.iter() {
        println!("  - {}", warning.message);
    }
}
