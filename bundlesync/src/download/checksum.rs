//! SHA-256 verification of installed bundle files.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Checksum failures.
#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    Mismatch {
        name: String,
        expected: String,
        actual: String,
    },
}

/// Calculate the SHA-256 checksum of a file.
///
/// # Returns
///
/// The lowercase hexadecimal SHA-256 hash of the file contents.
pub fn calculate_file_checksum(path: &Path) -> Result<String, ChecksumError> {
    let read_err = |e: io::Error| ChecksumError::Read {
        path: path.to_path_buf(),
        source: e,
    };
    let mut file = File::open(path).map_err(read_err)?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer).map_err(read_err)?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify that a file matches an expected checksum.
///
/// The comparison ignores ASCII case so manifests may carry upper-case hex.
pub fn verify_checksum(path: &Path, expected: &str) -> Result<(), ChecksumError> {
    let actual = calculate_file_checksum(path)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(ChecksumError::Mismatch {
            name: path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_calculate_file_checksum() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bundle");
        fs::write(&path, b"hello world").unwrap();

        assert_eq!(calculate_file_checksum(&path).unwrap(), HELLO_WORLD);
    }

    #[test]
    fn test_calculate_missing_file() {
        let result = calculate_file_checksum(Path::new("/nonexistent/bundle"));
        assert!(matches!(result, Err(ChecksumError::Read { .. })));
    }

    #[test]
    fn test_verify_checksum_case_insensitive() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bundle");
        fs::write(&path, b"hello world").unwrap();

        verify_checksum(&path, &HELLO_WORLD.to_uppercase()).unwrap();
    }

    #[test]
    fn test_verify_checksum_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("level1");
        fs::write(&path, b"hello world").unwrap();

        match verify_checksum(&path, "deadbeef") {
            Err(ChecksumError::Mismatch { name, actual, .. }) => {
                assert_eq!(name, "level1");
                assert_eq!(actual, HELLO_WORLD);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }
}
