//! Compression codec used for bundles stored compressed on the server.
//!
//! The downloader treats the codec as a black box: a compressed artifact is
//! identified by its name suffix, decompressed to the canonical name, and the
//! artifact is deleted afterwards by the caller.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::error::is_disk_full;

/// Errors from compression or decompression.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The input does not carry the codec's suffix.
    #[error("{} is not a compressed artifact", path.display())]
    NotCompressed { path: PathBuf },

    /// Reading the input failed or it is corrupt.
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    /// Writing the output failed.
    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

impl CodecError {
    /// Whether the failure was the disk running out of space.
    pub fn is_disk_full(&self) -> bool {
        match self {
            CodecError::Write { source, .. } => is_disk_full(source),
            _ => false,
        }
    }
}

/// Compression collaborator.
pub trait Codec: Send + Sync {
    /// Name suffix of compressed artifacts, including the leading dot.
    fn suffix(&self) -> &str;

    /// Whether a file name denotes a compressed artifact.
    fn is_compressed(&self, name: &str) -> bool {
        name.ends_with(self.suffix())
    }

    /// Name of the compressed artifact for a canonical name.
    fn compressed_name(&self, name: &str) -> String {
        format!("{}{}", name, self.suffix())
    }

    /// Compress `path` next to itself, returning the artifact path.
    fn compress(&self, path: &Path) -> Result<PathBuf, CodecError>;

    /// Decompress an artifact to its canonical name, returning that path.
    fn decompress(&self, compressed_path: &Path) -> Result<PathBuf, CodecError>;
}

/// Gzip codec backed by flate2.
#[derive(Debug, Clone)]
pub struct GzipCodec {
    level: Compression,
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl GzipCodec {
    /// Suffix used for compressed bundles.
    pub const SUFFIX: &'static str = ".gz";

    /// Create a codec with the default compression level.
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    /// Create a codec with an explicit level (0-9).
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Codec for GzipCodec {
    fn suffix(&self) -> &str {
        Self::SUFFIX
    }

    fn compress(&self, path: &Path) -> Result<PathBuf, CodecError> {
        let mut output = path.as_os_str().to_owned();
        output.push(Self::SUFFIX);
        let output = PathBuf::from(output);

        let input = File::open(path).map_err(|e| CodecError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let file = File::create(&output).map_err(|e| CodecError::Write {
            path: output.clone(),
            source: e,
        })?;

        let mut encoder = GzEncoder::new(BufWriter::new(file), self.level);
        io::copy(&mut BufReader::new(input), &mut encoder).map_err(|e| CodecError::Write {
            path: output.clone(),
            source: e,
        })?;
        let mut writer = encoder.finish().map_err(|e| CodecError::Write {
            path: output.clone(),
            source: e,
        })?;
        writer.flush().map_err(|e| CodecError::Write {
            path: output.clone(),
            source: e,
        })?;

        Ok(output)
    }

    fn decompress(&self, compressed_path: &Path) -> Result<PathBuf, CodecError> {
        let name = compressed_path
            .to_str()
            .filter(|s| self.is_compressed(s))
            .ok_or_else(|| CodecError::NotCompressed {
                path: compressed_path.to_path_buf(),
            })?;
        let output = PathBuf::from(&name[..name.len() - Self::SUFFIX.len()]);

        let input = File::open(compressed_path).map_err(|e| CodecError::Read {
            path: compressed_path.to_path_buf(),
            source: e,
        })?;
        let file = File::create(&output).map_err(|e| CodecError::Write {
            path: output.clone(),
            source: e,
        })?;

        let mut decoder = GzDecoder::new(BufReader::new(input));
        let mut writer = BufWriter::new(file);
        // Corrupt input surfaces as a read error from the decoder.
        io::copy(&mut decoder, &mut writer).map_err(|e| {
            if is_disk_full(&e) {
                CodecError::Write {
                    path: output.clone(),
                    source: e,
                }
            } else {
                CodecError::Read {
                    path: compressed_path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        writer.flush().map_err(|e| CodecError::Write {
            path: output.clone(),
            source: e,
        })?;

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_suffix_convention() {
        let codec = GzipCodec::new();
        assert!(codec.is_compressed("level1.gz"));
        assert!(!codec.is_compressed("level1"));
        assert_eq!(codec.compressed_name("level1"), "level1.gz");
    }

    #[test]
    fn test_compress_then_decompress() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bundle");
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 7) as u8).collect();
        fs::write(&path, &data).unwrap();

        let codec = GzipCodec::with_level(6);
        let packed = codec.compress(&path).unwrap();
        assert_eq!(packed, temp.path().join("bundle.gz"));
        assert!(fs::metadata(&packed).unwrap().len() < data.len() as u64);

        fs::remove_file(&path).unwrap();
        let unpacked = codec.decompress(&packed).unwrap();
        assert_eq!(unpacked, path);
        assert_eq!(fs::read(&unpacked).unwrap(), data);
    }

    #[test]
    fn test_decompress_rejects_plain_name() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bundle");
        fs::write(&path, b"x").unwrap();

        let err = GzipCodec::new().decompress(&path).unwrap_err();
        assert!(matches!(err, CodecError::NotCompressed { .. }));
    }

    #[test]
    fn test_decompress_corrupt_input() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bundle.gz");
        fs::write(&path, b"definitely not gzip").unwrap();

        let err = GzipCodec::new().decompress(&path).unwrap_err();
        assert!(matches!(err, CodecError::Read { .. }));
        assert!(!err.is_disk_full());
    }
}
