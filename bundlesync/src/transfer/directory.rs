//! Transport over a local mirror directory.
//!
//! Base URLs are either `file://` URLs or plain paths. Resuming is by byte
//! offset. A copy in progress leaves a `.partial` marker holding the source
//! length; a destination is only extended in place when that marker matches,
//! so an unrelated file already at `dest` is never appended to.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{FetchControl, ProgressFn, TransferError, Transport};

const FILE_SCHEME: &str = "file://";

const BUFFER_SIZE: usize = 64 * 1024;

/// Suffix of the marker left next to an unfinished copy.
const PARTIAL_SUFFIX: &str = ".partial";

/// [`Transport`] serving files from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryTransport;

impl DirectoryTransport {
    /// Create a directory transport.
    pub fn new() -> Self {
        Self
    }

    /// Map a `file://` URL or plain path to a filesystem path.
    pub fn to_path(url: &str) -> PathBuf {
        PathBuf::from(url.strip_prefix(FILE_SCHEME).unwrap_or(url))
    }

    fn marker(dest: &Path) -> PathBuf {
        let mut name = dest.as_os_str().to_os_string();
        name.push(PARTIAL_SUFFIX);
        PathBuf::from(name)
    }

    /// Bytes of `dest` that can be kept for a copy of a `source_len` file.
    fn resume_offset(dest: &Path, source_len: u64) -> u64 {
        let marked = fs::read_to_string(Self::marker(dest))
            .ok()
            .and_then(|text| text.trim().parse::<u64>().ok());
        if marked != Some(source_len) {
            return 0;
        }
        match fs::metadata(dest) {
            Ok(meta) if meta.len() <= source_len => meta.len(),
            _ => 0,
        }
    }
}

impl Transport for DirectoryTransport {
    fn probe(&self, url: &str, _timeout: Duration) -> bool {
        Self::to_path(url).exists()
    }

    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        control: &FetchControl,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64, TransferError> {
        let source = Self::to_path(url);
        let mut input = File::open(&source).map_err(|e| TransferError::Http {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let source_len = input
            .metadata()
            .map_err(|e| TransferError::from_io(&source, e))?
            .len();

        let marker = Self::marker(dest);
        let offset = Self::resume_offset(dest, source_len);

        let file = if offset > 0 {
            input
                .seek(SeekFrom::Start(offset))
                .map_err(|e| TransferError::from_io(&source, e))?;
            OpenOptions::new()
                .append(true)
                .open(dest)
                .map_err(|e| TransferError::from_io(dest, e))?
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| TransferError::from_io(parent, e))?;
            }
            let file = File::create(dest).map_err(|e| TransferError::from_io(dest, e))?;
            fs::write(&marker, source_len.to_string())
                .map_err(|e| TransferError::from_io(&marker, e))?;
            file
        };

        if offset > 0 {
            tracing::debug!(url, offset, "Resuming local copy");
            on_progress(offset);
        }

        let mut writer = BufWriter::new(file);
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut written = offset;

        loop {
            if control.is_aborted() {
                writer.flush().ok();
                return Err(TransferError::Aborted {
                    url: url.to_string(),
                });
            }

            let n = input
                .read(&mut buffer)
                .map_err(|e| TransferError::from_io(&source, e))?;
            if n == 0 {
                break;
            }

            writer
                .write_all(&buffer[..n])
                .map_err(|e| TransferError::from_io(dest, e))?;
            written += n as u64;
            on_progress(n as u64);
        }

        writer.flush().map_err(|e| TransferError::from_io(dest, e))?;
        fs::remove_file(&marker).ok();
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::join_url;
    use tempfile::TempDir;

    fn mirror_with(name: &str, data: &[u8]) -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(name), data).unwrap();
        temp
    }

    #[test]
    fn test_to_path_accepts_scheme_and_plain() {
        assert_eq!(
            DirectoryTransport::to_path("file:///srv/mirror/a"),
            PathBuf::from("/srv/mirror/a")
        );
        assert_eq!(
            DirectoryTransport::to_path("/srv/mirror/a"),
            PathBuf::from("/srv/mirror/a")
        );
    }

    #[test]
    fn test_probe() {
        let mirror = mirror_with("a", b"x");
        let base = format!("file://{}", mirror.path().display());
        let transport = DirectoryTransport::new();

        assert!(transport.probe(&base, Duration::from_secs(1)));
        assert!(!transport.probe(&join_url(&base, "missing"), Duration::from_secs(1)));
    }

    #[test]
    fn test_fetch_full_copy_reports_progress() {
        let data = vec![7u8; 200_000];
        let mirror = mirror_with("bundle", &data);
        let out = TempDir::new().unwrap();
        let dest = out.path().join("nested").join("bundle");

        let mut seen = 0u64;
        let size = DirectoryTransport::new()
            .fetch(
                &join_url(&mirror.path().display().to_string(), "bundle"),
                &dest,
                &FetchControl::new(),
                &mut |delta| seen += delta,
            )
            .unwrap();

        assert_eq!(size, data.len() as u64);
        assert_eq!(seen, data.len() as u64);
        assert_eq!(fs::read(&dest).unwrap(), data);
    }

    #[test]
    fn test_fetch_resumes_partial() {
        let data: Vec<u8> = (0..100u8).collect();
        let mirror = mirror_with("bundle", &data);
        let out = TempDir::new().unwrap();
        let dest = out.path().join("bundle");
        fs::write(&dest, &data[..40]).unwrap();
        fs::write(DirectoryTransport::marker(&dest), "100").unwrap();

        let mut seen = Vec::new();
        DirectoryTransport::new()
            .fetch(
                &join_url(&mirror.path().display().to_string(), "bundle"),
                &dest,
                &FetchControl::new(),
                &mut |delta| seen.push(delta),
            )
            .unwrap();

        assert_eq!(seen, vec![40, 60]);
        assert_eq!(fs::read(&dest).unwrap(), data);
        assert!(!DirectoryTransport::marker(&dest).exists());
    }

    #[test]
    fn test_fetch_replaces_unmarked_file() {
        let mirror = mirror_with("bundle", b"new contents");
        let out = TempDir::new().unwrap();
        let dest = out.path().join("bundle");
        fs::write(&dest, b"old").unwrap();

        DirectoryTransport::new()
            .fetch(
                &join_url(&mirror.path().display().to_string(), "bundle"),
                &dest,
                &FetchControl::new(),
                &mut |_| {},
            )
            .unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"new contents");
    }

    #[test]
    fn test_aborted_copy_keeps_marker() {
        let mirror = mirror_with("bundle", b"payload");
        let out = TempDir::new().unwrap();
        let dest = out.path().join("bundle");
        let control = FetchControl::new();
        control.abort();

        DirectoryTransport::new()
            .fetch(
                &join_url(&mirror.path().display().to_string(), "bundle"),
                &dest,
                &control,
                &mut |_| {},
            )
            .unwrap_err();

        assert_eq!(fs::read_to_string(DirectoryTransport::marker(&dest)).unwrap(), "7");
    }

    #[test]
    fn test_fetch_aborted() {
        let mirror = mirror_with("bundle", b"payload");
        let out = TempDir::new().unwrap();
        let control = FetchControl::new();
        control.abort();

        let err = DirectoryTransport::new()
            .fetch(
                &join_url(&mirror.path().display().to_string(), "bundle"),
                &out.path().join("bundle"),
                &control,
                &mut |_| {},
            )
            .unwrap_err();
        assert!(err.is_aborted());
    }

    #[test]
    fn test_fetch_missing_source() {
        let mirror = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();

        let err = DirectoryTransport::new()
            .fetch(
                &join_url(&mirror.path().display().to_string(), "nope"),
                &out.path().join("nope"),
                &FetchControl::new(),
                &mut |_| {},
            )
            .unwrap_err();
        assert!(matches!(err, TransferError::Http { .. }));
    }
}
