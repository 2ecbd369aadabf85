//! Checksum utilities for archived-file auditing
//!
//! The processing ledger stores a SHA-256 of every archived log file. The
//! hash is diagnostic only; dedup decisions never compare it.

use crate::error::{BiologError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Compute the SHA-256 checksum of a file, streaming in 8 KiB chunks
pub fn compute_file_sha256(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_sha256(&mut file)
}

/// Compute the SHA-256 checksum of any readable source
pub fn compute_sha256<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Verify a file against an expected SHA-256 digest
pub fn verify_file_sha256(path: impl AsRef<Path>, expected: &str) -> Result<bool> {
    let actual = compute_file_sha256(path)?;
    if actual == expected {
        Ok(true)
    } else {
        Err(BiologError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_compute_sha256() {
        let data = b"hello world";
        let mut cursor = Cursor::new(data);
        let checksum = compute_sha256(&mut cursor).unwrap();
        assert_eq!(checksum, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
    }

    #[test]
    fn test_verify_file_sha256_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.log");
        std::fs::write(&path, b"hello world").unwrap();

        assert!(verify_file_sha256(
            &path,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        )
        .unwrap());
        assert!(matches!(
            verify_file_sha256(&path, "deadbeef"),
            Err(BiologError::ChecksumMismatch { .. })
        ));
    }
}
