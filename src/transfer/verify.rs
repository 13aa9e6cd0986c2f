//! Integrity verification of completed stream files

use crate::error::{Error, Result};
use crate::types::Checksum;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

const READ_BUFFER: usize = 64 * 1024;

/// Lower-case hex SHA-256 of a file
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    read_chunks(path, |chunk| hasher.update(chunk)).await?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Lower-case hex MD5 of a file
pub async fn md5_file(path: &Path) -> Result<String> {
    let mut context = md5::Context::new();
    read_chunks(path, |chunk| context.consume(chunk)).await?;
    Ok(format!("{:x}", context.compute()))
}

async fn read_chunks(path: &Path, mut sink: impl FnMut(&[u8])) -> Result<()> {
    let file = File::open(path).await.map_err(|e| Error::disk(path, e))?;
    let mut reader = BufReader::new(file);
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .map_err(|e| Error::disk(path, e))?;
        if n == 0 {
            return Ok(());
        }
        sink(&buffer[..n]);
    }
}

/// Strip the weak marker and quotes from an ETag
pub fn normalize_etag(etag: &str) -> &str {
    let etag = etag.trim();
    let etag = etag.strip_prefix("W/").unwrap_or(etag);
    etag.trim_matches('"')
}

/// Check a completed file against its expected checksum
///
/// `served_etag` is the ETag the server sent with the final response. On
/// mismatch the file is removed and [`Error::Integrity`] is returned, so a
/// corrupt file can never be mistaken for a resumable partial.
pub async fn verify(path: &Path, expected: &Checksum, served_etag: Option<&str>) -> Result<()> {
    let (expected_value, actual) = match expected {
        Checksum::Sha256(hex) => (hex.to_ascii_lowercase(), sha256_file(path).await?),
        Checksum::Md5(hex) => (hex.to_ascii_lowercase(), md5_file(path).await?),
        Checksum::ETag(tag) => (
            normalize_etag(tag).to_string(),
            served_etag
                .map(|t| normalize_etag(t).to_string())
                .unwrap_or_default(),
        ),
    };

    if expected_value == actual {
        return Ok(());
    }

    tracing::warn!(
        path = %path.display(),
        expected = %expected_value,
        actual = %actual,
        "integrity check failed, discarding file"
    );
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        return Err(Error::disk(path, e));
    }

    Err(Error::Integrity {
        path: path.to_path_buf(),
        expected: expected_value,
        actual,
    })
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";

    async fn hello_file(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("hello.part");
        tokio::fs::write(&path, b"hello").await.unwrap();
        path
    }

    #[tokio::test]
    async fn matching_digests_pass() {
        let dir = TempDir::new().unwrap();
        let path = hello_file(&dir).await;

        verify(&path, &Checksum::Sha256(HELLO_SHA256.into()), None)
            .await
            .unwrap();
        verify(&path, &Checksum::Md5(HELLO_MD5.to_uppercase()), None)
            .await
            .unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn mismatch_discards_file() {
        let dir = TempDir::new().unwrap();
        let path = hello_file(&dir).await;

        let err = verify(&path, &Checksum::Md5("00".repeat(16)), None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Integrity { .. }));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn etag_ignores_quotes_and_weak_marker() {
        let dir = TempDir::new().unwrap();
        let path = hello_file(&dir).await;

        verify(&path, &Checksum::ETag("abc123".into()), Some("W/\"abc123\""))
            .await
            .unwrap();

        let err = verify(&path, &Checksum::ETag("abc123".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
    }
}
