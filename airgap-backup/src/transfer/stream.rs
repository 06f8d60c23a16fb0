//! Streaming encode/decode of disk payloads.
//!
//! Sources are never buffered whole: data moves through a bounded
//! `BufReader` into the optional compressor and out to the destination.

use async_compression::tokio::bufread::{
    GzipDecoder, GzipEncoder, XzDecoder, XzEncoder, ZstdDecoder, ZstdEncoder,
};
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};

use crate::backup_set::{Compression, Payload, PayloadEncoding};
use crate::config::StreamConfig;
use crate::transfer::progress::ProgressTracker;

/// Reader wrapper that counts bytes and feeds a [`ProgressTracker`].
pub struct ProgressReader<R> {
    inner: R,
    bytes_transferred: Arc<AtomicU64>,
    tracker: ProgressTracker,
    finished: bool,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, tracker: ProgressTracker) -> Self {
        Self {
            inner,
            bytes_transferred: Arc::new(AtomicU64::new(0)),
            tracker,
            finished: false,
        }
    }

    /// Shared counter, readable after the reader has been moved into an encoder.
    pub fn counter(&self) -> Arc<AtomicU64> {
        self.bytes_transferred.clone()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = (buf.filled().len() - before) as u64;
                let total = this.bytes_transferred.fetch_add(read, Ordering::Relaxed) + read;
                if read == 0 {
                    if !this.finished {
                        this.finished = true;
                        this.tracker.finish(total);
                    }
                } else {
                    this.tracker.advance(total);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

fn tracker(label: &str, total: u64, config: &StreamConfig) -> ProgressTracker {
    ProgressTracker::new(
        label,
        total,
        Duration::from_secs(config.progress_interval_secs.max(1)),
    )
}

/// Stream `source` into `dest`, compressing on the way if requested.
///
/// Returns the number of source bytes read.
pub async fn encode_to_file(
    source: &Path,
    dest: &Path,
    compression: Option<Compression>,
    total: u64,
    config: &StreamConfig,
) -> io::Result<u64> {
    let input = File::open(source).await?;
    let progress = ProgressReader::new(input, tracker("backup", total, config));
    let counter = progress.counter();
    let reader = BufReader::with_capacity(config.buffer_size, progress);

    let mut encoded: Box<dyn AsyncRead + Unpin> = match compression {
        None => Box::new(reader),
        Some(Compression::Gzip) => Box::new(GzipEncoder::new(reader)),
        Some(Compression::Xz) => Box::new(XzEncoder::new(reader)),
        Some(Compression::Zstd) => Box::new(ZstdEncoder::new(reader)),
    };

    let mut out = File::create(dest).await?;
    tokio::io::copy(&mut encoded, &mut out).await?;
    out.flush().await?;
    out.sync_all().await?;

    Ok(counter.load(Ordering::Relaxed))
}

/// Name of split part `index` for payload `base_name`.
pub fn part_name(base_name: &str, index: usize) -> String {
    format!("{}.part{:03}", base_name, index)
}

/// Split `source` into `chunk_size` files inside `dir`.
///
/// Returns the part file names in order. A zero-byte source yields a single
/// empty part so the set still carries a payload.
pub async fn split_to_parts(
    source: &Path,
    dir: &Path,
    base_name: &str,
    chunk_size: u64,
    total: u64,
    config: &StreamConfig,
) -> io::Result<Vec<String>> {
    if chunk_size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "split chunk size must be greater than zero",
        ));
    }

    let input = File::open(source).await?;
    let progress = ProgressReader::new(input, tracker("backup", total, config));
    let mut reader = BufReader::with_capacity(config.buffer_size, progress);

    let mut parts = Vec::new();
    loop {
        let name = part_name(base_name, parts.len());
        let path = dir.join(&name);
        let mut out = File::create(&path).await?;

        let mut limited = (&mut reader).take(chunk_size);
        let written = tokio::io::copy_buf(&mut limited, &mut out).await?;
        out.flush().await?;
        out.sync_all().await?;
        drop(out);

        if written == 0 && !parts.is_empty() {
            tokio::fs::remove_file(&path).await?;
            break;
        }
        parts.push(name);
        if written < chunk_size {
            break;
        }
    }

    Ok(parts)
}

async fn open_buffered(path: &Path, config: &StreamConfig) -> io::Result<BufReader<File>> {
    Ok(BufReader::with_capacity(
        config.buffer_size,
        File::open(path).await?,
    ))
}

/// Reader producing the original bytes of a payload.
pub async fn open_payload(
    dir: &Path,
    payload: &Payload,
    config: &StreamConfig,
) -> io::Result<Box<dyn AsyncRead + Unpin>> {
    let first = payload.files.first().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "backup set has no payload files")
    })?;
    let first_path = dir.join(first);

    let reader: Box<dyn AsyncRead + Unpin> = match payload.encoding {
        PayloadEncoding::Raw => Box::new(open_buffered(&first_path, config).await?),
        PayloadEncoding::Gzip => {
            let mut decoder = GzipDecoder::new(open_buffered(&first_path, config).await?);
            decoder.multiple_members(true);
            Box::new(decoder)
        }
        PayloadEncoding::Xz => {
            let mut decoder = XzDecoder::new(open_buffered(&first_path, config).await?);
            decoder.multiple_members(true);
            Box::new(decoder)
        }
        PayloadEncoding::Zstd => {
            let mut decoder = ZstdDecoder::new(open_buffered(&first_path, config).await?);
            decoder.multiple_members(true);
            Box::new(decoder)
        }
        PayloadEncoding::SplitParts => {
            let mut chained: Box<dyn AsyncRead + Unpin> =
                Box::new(open_buffered(&first_path, config).await?);
            for part in &payload.files[1..] {
                let next = open_buffered(&dir.join(part), config).await?;
                chained = Box::new(chained.chain(next));
            }
            chained
        }
    };

    Ok(reader)
}

/// Decode a payload onto `writer`. Returns the number of bytes written.
pub async fn decode_to_writer<W: AsyncWrite + Unpin>(
    dir: &Path,
    payload: &Payload,
    writer: &mut W,
    total: u64,
    config: &StreamConfig,
) -> io::Result<u64> {
    let reader = open_payload(dir, payload, config).await?;
    let mut progress = ProgressReader::new(reader, tracker("restore", total, config));
    let written = tokio::io::copy(&mut progress, writer).await?;
    writer.flush().await?;
    Ok(written)
}

/// Read up to `len` bytes from the start of `path`.
pub async fn read_leading_bytes(path: &Path, len: u64) -> io::Result<Vec<u8>> {
    let file = File::open(path).await?;
    let mut buf = Vec::new();
    file.take(len).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Overwrite the start of `path` with `data`, leaving the rest untouched.
pub async fn write_leading_bytes(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// Total size of the given files inside `dir`.
pub async fn total_size(dir: &Path, files: &[String]) -> io::Result<u64> {
    let mut total = 0u64;
    for name in files {
        total += tokio::fs::metadata(dir.join(name)).await?.len();
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn small_config() -> StreamConfig {
        StreamConfig {
            buffer_size: 4096,
            progress_interval_secs: 3600,
        }
    }

    #[tokio::test]
    async fn test_encode_decode_each_compression() -> io::Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("source.img");
        let data = pattern(200_000);
        std::fs::write(&source, &data)?;
        let config = small_config();

        for compression in [None, Some(Compression::Gzip), Some(Compression::Xz), Some(Compression::Zstd)] {
            let name = match compression {
                Some(c) => format!("payload.img.{}", c.extension()),
                None => "payload.img".to_string(),
            };
            let read = encode_to_file(&source, &dir.path().join(&name), compression, data.len() as u64, &config).await?;
            assert_eq!(read, data.len() as u64);

            let payload = Payload {
                encoding: PayloadEncoding::from_compression(compression),
                files: vec![name],
            };
            let mut out = Vec::new();
            let written = decode_to_writer(dir.path(), &payload, &mut out, data.len() as u64, &config).await?;
            assert_eq!(written, data.len() as u64);
            assert_eq!(out, data);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_gzip_output_is_standard_gzip() -> io::Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("source.img");
        std::fs::write(&source, b"hello disk")?;

        let dest = dir.path().join("out.gz");
        encode_to_file(&source, &dest, Some(Compression::Gzip), 10, &small_config()).await?;

        let bytes = std::fs::read(&dest)?;
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        Ok(())
    }

    #[tokio::test]
    async fn test_split_part_count_and_sizes() -> io::Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("vm.qcow2");
        let data = pattern(10_000);
        std::fs::write(&source, &data)?;

        let parts = split_to_parts(&source, dir.path(), "vm-disk.qcow2", 3000, 10_000, &small_config()).await?;
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "vm-disk.qcow2.part000");
        assert_eq!(parts[3], "vm-disk.qcow2.part003");
        assert_eq!(std::fs::metadata(dir.path().join(&parts[3]))?.len(), 1000);

        let payload = Payload {
            encoding: PayloadEncoding::SplitParts,
            files: parts,
        };
        let mut out = Vec::new();
        decode_to_writer(dir.path(), &payload, &mut out, 10_000, &small_config()).await?;
        assert_eq!(out, data);
        Ok(())
    }

    #[tokio::test]
    async fn test_split_exact_multiple_leaves_no_empty_part() -> io::Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("vm.img");
        std::fs::write(&source, pattern(6000))?;

        let parts = split_to_parts(&source, dir.path(), "vm-disk.img", 3000, 6000, &small_config()).await?;
        assert_eq!(parts.len(), 2);
        assert!(!dir.path().join("vm-disk.img.part002").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_split_empty_source_yields_one_part() -> io::Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("empty.img");
        std::fs::write(&source, b"")?;

        let parts = split_to_parts(&source, dir.path(), "vm-disk.img", 3000, 0, &small_config()).await?;
        assert_eq!(parts, vec!["vm-disk.img.part000".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_leading_bytes() -> io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![7u8; 4096])?;

        let head = read_leading_bytes(&path, 512).await?;
        assert_eq!(head.len(), 512);

        write_leading_bytes(&path, &[1u8; 16]).await?;
        let bytes = std::fs::read(&path)?;
        assert_eq!(bytes.len(), 4096);
        assert_eq!(&bytes[..16], &[1u8; 16]);
        assert_eq!(bytes[16], 7);
        Ok(())
    }
}
