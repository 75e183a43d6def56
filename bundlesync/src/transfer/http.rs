//! HTTP transport with resume support.
//!
//! Partial downloads are resumed with `Range: bytes=N-` guarded by
//! `If-Range: <Last-Modified>`. The validator token is cached next to the
//! partial file in a `.lastmod` sidecar. If the remote file changed since the
//! partial copy was started the server answers `200` and the download restarts
//! from scratch.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{IF_RANGE, LAST_MODIFIED, RANGE};
use reqwest::redirect::Policy;
use reqwest::StatusCode;

use super::{FetchControl, ProgressFn, TransferError, Transport};

/// Default timeout for transfers in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Buffer size for streaming response bodies (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Suffix of the sidecar holding the resume validator.
const LASTMOD_SUFFIX: &str = ".lastmod";

/// reqwest-backed [`Transport`].
#[derive(Debug)]
pub struct HttpTransport {
    client: Client,
    pub(crate) timeout: Duration,
}

impl HttpTransport {
    /// Create a transport with the default transfer timeout.
    pub fn new() -> Result<Self, TransferError> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a transport with a custom transfer timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, TransferError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransferError::Http {
                url: String::new(),
                reason: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, timeout })
    }

    fn sidecar(dest: &Path) -> PathBuf {
        let mut name = dest.as_os_str().to_owned();
        name.push(LASTMOD_SUFFIX);
        PathBuf::from(name)
    }

    fn map_request_error(&self, url: &str, e: reqwest::Error) -> TransferError {
        if e.is_timeout() {
            TransferError::Timeout {
                url: url.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            TransferError::Http {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }

    /// Send the GET, asking for the tail of the file when a validated partial
    /// copy exists. Returns the response and the offset it starts at.
    fn request(&self, url: &str, dest: &Path) -> Result<(Response, u64), TransferError> {
        let existing_size = fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
        let token = fs::read_to_string(Self::sidecar(dest)).ok();

        let mut request = self.client.get(url);
        let resume_from = match (&token, existing_size) {
            (Some(token), size) if size > 0 => {
                request = request
                    .header(RANGE, format!("bytes={}-", size))
                    .header(IF_RANGE, token.trim());
                size
            }
            _ => 0,
        };

        let response = request
            .send()
            .map_err(|e| self.map_request_error(url, e))?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT if resume_from > 0 => Ok((response, resume_from)),
            status if status.is_success() => Ok((response, 0)),
            StatusCode::RANGE_NOT_SATISFIABLE if resume_from > 0 => {
                tracing::debug!(url, "Stale partial download, restarting");
                fs::remove_file(dest).ok();
                fs::remove_file(Self::sidecar(dest)).ok();
                self.request(url, dest)
            }
            status => Err(TransferError::Http {
                url: url.to_string(),
                reason: format!("GET request failed with status {}", status),
            }),
        }
    }

    fn open_destination(dest: &Path, offset: u64) -> Result<File, TransferError> {
        if offset > 0 {
            return OpenOptions::new()
                .append(true)
                .open(dest)
                .map_err(|e| TransferError::from_io(dest, e));
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| TransferError::from_io(parent, e))?;
        }
        File::create(dest).map_err(|e| TransferError::from_io(dest, e))
    }
}

impl Transport for HttpTransport {
    fn probe(&self, url: &str, timeout: Duration) -> bool {
        let client = match Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to create probe client");
                return false;
            }
        };

        match client.head(url).send() {
            Ok(response) => {
                let ok = response.status().is_success();
                tracing::debug!(url, status = %response.status(), ok, "Probed URL");
                ok
            }
            Err(e) => {
                tracing::debug!(url, error = %e, "URL probe failed");
                false
            }
        }
    }

    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        control: &FetchControl,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64, TransferError> {
        let (mut response, offset) = self.request(url, dest)?;

        let sidecar = Self::sidecar(dest);
        let file = Self::open_destination(dest, offset)?;
        match response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
        {
            Some(token) => {
                fs::write(&sidecar, token).map_err(|e| TransferError::from_io(&sidecar, e))?;
            }
            None => {
                fs::remove_file(&sidecar).ok();
            }
        }

        if offset > 0 {
            tracing::debug!(url, offset, "Resuming download");
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

            let bytes_read = response
                .read(&mut buffer)
                .map_err(|e| TransferError::Http {
                    url: url.to_string(),
                    reason: format!("read error: {}", e),
                })?;

            if bytes_read == 0 {
                break;
            }

            writer
                .write_all(&buffer[..bytes_read])
                .map_err(|e| TransferError::from_io(dest, e))?;

            written += bytes_read as u64;
            on_progress(bytes_read as u64);
        }

        writer.flush().map_err(|e| TransferError::from_io(dest, e))?;
        fs::remove_file(&sidecar).ok();

        Ok(written)
    }
}
