//! SHA-256 manifest in `sha256sum` format (`<hex>  <name>`).

use sha2::{Digest, Sha256};
use std::io;
use std::path::{Component, Path};
use tokio::io::AsyncReadExt;

use crate::utils::{PipelineError, Result};

const HASH_BUFFER_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    pub digest: String,
    /// Path relative to the set directory
    pub file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumManifest {
    pub entries: Vec<ChecksumEntry>,
}

/// Hex SHA-256 of a file, read in bounded chunks.
pub async fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn is_safe_relative(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

impl ChecksumManifest {
    /// Hash `files` (relative to `dir`) in the given order.
    pub async fn generate(dir: &Path, files: &[String]) -> io::Result<Self> {
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let digest = sha256_file(&dir.join(file)).await?;
            entries.push(ChecksumEntry {
                digest,
                file: file.clone(),
            });
        }
        Ok(Self { entries })
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}  {}\n", e.digest, e.file))
            .collect()
    }

    /// Parse `sha256sum` output. Accepts the binary-mode `*` marker.
    pub fn parse(content: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let invalid = || {
                PipelineError::InvalidBackupSet(format!(
                    "malformed checksum line {}: {:?}",
                    lineno + 1,
                    line
                ))
            };

            let (digest, rest) = line.split_once(' ').ok_or_else(invalid)?;
            let file = rest
                .strip_prefix(' ')
                .or_else(|| rest.strip_prefix('*'))
                .unwrap_or(rest);

            if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            if !is_safe_relative(file) {
                return Err(PipelineError::InvalidBackupSet(format!(
                    "checksum entry escapes the backup set: {}",
                    file
                )));
            }
            entries.push(ChecksumEntry {
                digest: digest.to_ascii_lowercase(),
                file: file.to_string(),
            });
        }
        Ok(Self { entries })
    }

    pub async fn read_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    pub async fn write_to(&self, path: &Path) -> io::Result<()> {
        tokio::fs::write(path, self.render()).await
    }

    pub fn covers(&self, file: &str) -> bool {
        self.entries.iter().any(|e| e.file == file)
    }

    /// Re-hash every entry. Returns one message per missing or mismatched file.
    pub async fn verify(&self, dir: &Path) -> Vec<String> {
        let mut failures = Vec::new();
        for entry in &self.entries {
            let path = dir.join(&entry.file);
            match sha256_file(&path).await {
                Ok(actual) if actual == entry.digest => {}
                Ok(actual) => failures.push(format!(
                    "{}: expected {}, got {}",
                    entry.file, entry.digest, actual
                )),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    failures.push(format!("{}: missing", entry.file))
                }
                Err(e) => failures.push(format!("{}: {}", entry.file, e)),
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // sha256("abc")
    const ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[tokio::test]
    async fn test_sha256_known_vector() -> io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("abc");
        std::fs::write(&path, b"abc")?;
        assert_eq!(sha256_file(&path).await?, ABC);
        Ok(())
    }

    #[test]
    fn test_parse_sha256sum_formats() {
        let content = format!("{ABC}  system-disk.img\n{ABC} *partition-table.bin\n\n");
        let manifest = ChecksumManifest::parse(&content).unwrap();
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.entries[0].file, "system-disk.img");
        assert_eq!(manifest.entries[1].file, "partition-table.bin");
        assert_eq!(manifest.render(), format!("{ABC}  system-disk.img\n{ABC}  partition-table.bin\n"));
    }

    #[test]
    fn test_parse_rejects_bad_digest_and_traversal() {
        assert!(ChecksumManifest::parse("xyz  file\n").is_err());
        assert!(ChecksumManifest::parse(&format!("{ABC}  ../etc/passwd\n")).is_err());
        assert!(ChecksumManifest::parse(&format!("{ABC}  /etc/passwd\n")).is_err());
    }

    #[tokio::test]
    async fn test_verify_detects_change_and_missing() -> io::Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("a.img"), b"aaaa")?;
        std::fs::write(dir.path().join("b.img"), b"bbbb")?;

        let manifest =
            ChecksumManifest::generate(dir.path(), &["a.img".to_string(), "b.img".to_string()]).await?;
        assert!(manifest.verify(dir.path()).await.is_empty());

        std::fs::write(dir.path().join("a.img"), b"aaab")?;
        std::fs::remove_file(dir.path().join("b.img"))?;

        let failures = manifest.verify(dir.path()).await;
        assert_eq!(failures.len(), 2);
        assert!(failures[0].starts_with("a.img: expected"));
        assert_eq!(failures[1], "b.img: missing");
        Ok(())
    }
}
