//! Block device queries built on top of [`SystemTools`].

use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

use super::{SystemTools, ToolCommand, ToolError};

/// Filesystems considered when looking for a root partition.
pub const ROOT_FILESYSTEMS: &[&str] = &["ext4", "ext3", "ext2", "xfs", "btrfs"];

/// One node of `lsblk -J` output.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BlockEntry {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub fstype: Option<String>,
    #[serde(default)]
    pub mountpoint: Option<String>,
    #[serde(default)]
    pub children: Vec<BlockEntry>,
}

impl BlockEntry {
    pub fn is_partition(&self) -> bool {
        self.kind.as_deref() == Some("part")
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<BlockEntry>,
}

/// Parse `lsblk -J` output into a flat list, parents before children.
pub fn parse_lsblk(json: &str) -> Result<Vec<BlockEntry>, ToolError> {
    let parsed: LsblkOutput =
        serde_json::from_str(json).map_err(|e| ToolError::InvalidOutput {
            program: "lsblk".to_string(),
            reason: e.to_string(),
        })?;

    let mut flat = Vec::new();
    let mut stack: Vec<BlockEntry> = parsed.blockdevices.into_iter().rev().collect();
    while let Some(mut entry) = stack.pop() {
        let children = std::mem::take(&mut entry.children);
        flat.push(entry);
        stack.extend(children.into_iter().rev());
    }
    Ok(flat)
}

/// List a device and all of its partitions.
pub async fn list_block_entries<T: SystemTools>(
    tools: &T,
    device: &Path,
) -> Result<Vec<BlockEntry>, ToolError> {
    let output = tools
        .run(
            ToolCommand::new("lsblk")
                .args(["-J", "-p", "-o", "NAME,TYPE,FSTYPE,MOUNTPOINT"])
                .arg(device),
        )
        .await?;
    parse_lsblk(&output.stdout)
}

/// Mountpoints currently active on a device or any of its partitions.
pub async fn mounted_entries<T: SystemTools>(
    tools: &T,
    device: &Path,
) -> Result<Vec<BlockEntry>, ToolError> {
    let entries = list_block_entries(tools, device).await?;
    Ok(entries
        .into_iter()
        .filter(|e| e.mountpoint.as_deref().is_some_and(|m| !m.is_empty()))
        .collect())
}

pub async fn unmount<T: SystemTools>(tools: &T, target: &str) -> Result<(), ToolError> {
    info!("Unmounting {}", target);
    tools.run(ToolCommand::new("umount").arg(target)).await?;
    Ok(())
}

/// Size in bytes of a block device or regular file.
pub async fn device_size<T: SystemTools>(tools: &T, path: &Path) -> Result<u64, ToolError> {
    let is_block = tools.is_block_device(path).map_err(|source| ToolError::Spawn {
        program: "stat".to_string(),
        source,
    })?;

    if !is_block {
        return std::fs::metadata(path)
            .map(|m| m.len())
            .map_err(|source| ToolError::Spawn {
                program: "stat".to_string(),
                source,
            });
    }

    let output = tools
        .run(ToolCommand::new("blockdev").arg("--getsize64").arg(path))
        .await?;
    output
        .stdout
        .trim()
        .parse::<u64>()
        .map_err(|e| ToolError::InvalidOutput {
            program: "blockdev".to_string(),
            reason: format!("{:?}: {}", output.stdout.trim(), e),
        })
}

/// Text form of the partition table (`sfdisk --dump`).
pub async fn dump_partition_table<T: SystemTools>(
    tools: &T,
    device: &Path,
) -> Result<String, ToolError> {
    let output = tools
        .run(ToolCommand::new("sfdisk").arg("--dump").arg(device))
        .await?;
    Ok(output.stdout)
}

/// Write a partition table previously produced by `sfdisk --dump`.
pub async fn write_partition_table<T: SystemTools>(
    tools: &T,
    device: &Path,
    dump: &Path,
) -> Result<(), ToolError> {
    tools
        .run(
            ToolCommand::new("sfdisk")
                .args(["--force", "--no-reread"])
                .arg(device)
                .stdin_file(dump),
        )
        .await?;
    Ok(())
}

/// Ask the kernel to re-read the partition table.
pub async fn reread_partition_table<T: SystemTools>(
    tools: &T,
    device: &Path,
) -> Result<(), ToolError> {
    match tools.run(ToolCommand::new("partprobe").arg(device)).await {
        Ok(_) => Ok(()),
        Err(e) => {
            debug!("partprobe failed ({}), trying blockdev --rereadpt", e);
            tools
                .run(ToolCommand::new("blockdev").arg("--rereadpt").arg(device))
                .await?;
            Ok(())
        }
    }
}

/// Read-only consistency check of one partition.
pub async fn check_filesystem<T: SystemTools>(tools: &T, partition: &str) -> Result<(), ToolError> {
    tools
        .run(ToolCommand::new("fsck").args(["-n", partition]))
        .await?;
    Ok(())
}

/// Pick the partition holding the root filesystem.
///
/// An entry mounted at `/` wins; otherwise the first partition carrying a
/// known root filesystem type.
pub fn find_root_partition(entries: &[BlockEntry]) -> Option<&BlockEntry> {
    entries
        .iter()
        .find(|e| e.mountpoint.as_deref() == Some("/"))
        .or_else(|| {
            entries.iter().find(|e| {
                e.is_partition()
                    && e.fstype
                        .as_deref()
                        .is_some_and(|fs| ROOT_FILESYSTEMS.contains(&fs))
            })
        })
}

/// Free bytes available to unprivileged writers on the filesystem holding `path`.
pub fn available_space(path: &Path) -> std::io::Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// `<sysname> <release> <machine>` of the running kernel.
pub fn host_system() -> String {
    match nix::sys::utsname::uname() {
        Ok(uts) => format!(
            "{} {} {}",
            uts.sysname().to_string_lossy(),
            uts.release().to_string_lossy(),
            uts.machine().to_string_lossy()
        ),
        Err(_) => format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSBLK: &str = r#"{
        "blockdevices": [
            {"name": "/dev/sda", "type": "disk", "fstype": null, "mountpoint": null,
             "children": [
                {"name": "/dev/sda1", "type": "part", "fstype": "vfat", "mountpoint": "/boot/efi"},
                {"name": "/dev/sda2", "type": "part", "fstype": "swap", "mountpoint": "[SWAP]"},
                {"name": "/dev/sda3", "type": "part", "fstype": "ext4", "mountpoint": "/"}
             ]}
        ]
    }"#;

    #[test]
    fn test_parse_lsblk_flattens_children() {
        let entries = parse_lsblk(LSBLK).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["/dev/sda", "/dev/sda1", "/dev/sda2", "/dev/sda3"]);
        assert!(!entries[0].is_partition());
        assert!(entries[3].is_partition());
    }

    #[test]
    fn test_parse_lsblk_rejects_garbage() {
        assert!(matches!(
            parse_lsblk("not json"),
            Err(ToolError::InvalidOutput { .. })
        ));
    }

    #[test]
    fn test_root_partition_prefers_root_mount() {
        let entries = parse_lsblk(LSBLK).unwrap();
        let root = find_root_partition(&entries).unwrap();
        assert_eq!(root.name, "/dev/sda3");
    }

    #[test]
    fn test_root_partition_falls_back_to_filesystem_type() {
        let json = r#"{"blockdevices": [
            {"name": "/dev/sdb", "type": "disk", "children": [
                {"name": "/dev/sdb1", "type": "part", "fstype": "vfat"},
                {"name": "/dev/sdb2", "type": "part", "fstype": "xfs"},
                {"name": "/dev/sdb3", "type": "part", "fstype": "ext4"}
            ]}
        ]}"#;
        let entries = parse_lsblk(json).unwrap();
        assert_eq!(find_root_partition(&entries).unwrap().name, "/dev/sdb2");
    }

    #[test]
    fn test_root_partition_none_without_linux_filesystem() {
        let json = r#"{"blockdevices": [
            {"name": "/dev/sdc", "type": "disk", "children": [
                {"name": "/dev/sdc1", "type": "part", "fstype": "ntfs"}
            ]}
        ]}"#;
        let entries = parse_lsblk(json).unwrap();
        assert!(find_root_partition(&entries).is_none());
    }

    #[test]
    fn test_available_space_on_tempdir() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(available_space(dir.path()).unwrap() > 0);
    }
}
