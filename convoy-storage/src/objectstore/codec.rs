//! Blob compression and integrity.
//!
//! Blobs are gzip streams; the recorded checksum is the hex SHA-256 of the
//! uncompressed content and is verified on restore.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::error::{Result, StorageError};

/// Writer that hashes everything passing through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Compress `src` into `dst`, returning `(checksum, uncompressed size)`.
pub fn compress_file(src: &Path, dst: &Path) -> Result<(String, u64)> {
    let mut input = BufReader::new(File::open(src)?);
    let encoder = GzEncoder::new(BufWriter::new(File::create(dst)?), Compression::default());

    let mut writer = HashingWriter::new(encoder);
    io::copy(&mut input, &mut writer)?;
    let (encoder, checksum, size) = writer.finish();

    let out = encoder.finish()?;
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok((checksum, size))
}

/// Decompress `src` into `dst` and verify the content against `expected`.
///
/// `dst` is removed on mismatch.
pub fn decompress_file(src: &Path, dst: &Path, expected: &str) -> Result<()> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(src)?));
    let mut writer = HashingWriter::new(BufWriter::new(File::create(dst)?));
    io::copy(&mut decoder, &mut writer)?;

    let (out, checksum, _) = writer.finish();
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;

    if checksum != expected {
        let _ = std::fs::remove_file(dst);
        return Err(StorageError::ChecksumMismatch {
            path: src.display().to_string(),
            expected: expected.to_string(),
            actual: checksum,
        });
    }
    Ok(())
}

/// Hex SHA-256 of a byte slice.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_then_verify() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let blob = dir.path().join("blob.gz");
        let out = dir.path().join("out");
        let data = b"convoy snapshot content\n".repeat(64);
        std::fs::write(&src, &data).unwrap();

        let (sum, size) = compress_file(&src, &blob).unwrap();
        assert_eq!(sum, checksum(&data));
        assert_eq!(size, data.len() as u64);

        decompress_file(&blob, &out, &sum).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), data);
    }

    #[test]
    fn test_checksum_mismatch_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let blob = dir.path().join("blob.gz");
        let out = dir.path().join("out");
        std::fs::write(&src, b"payload").unwrap();
        compress_file(&src, &blob).unwrap();

        let err = decompress_file(&blob, &out, &checksum(b"other")).unwrap_err();
        assert!(matches!(err, StorageError::ChecksumMismatch { .. }));
        assert!(!out.exists());
    }
}
