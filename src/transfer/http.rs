//! HTTP client wrapper for resumable file transfers.
//!
//! One [`HttpClient`] is shared by every connector and every transfer so that
//! connection pooling, timeouts and the identifying User-Agent apply uniformly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::{Client, RequestBuilder, StatusCode, redirect};
use serde::de::DeserializeOwned;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument};
use url::Url;

use super::filename::filename_from_url;
use super::{CancelToken, ProgressFn, TransferError};
use crate::user_agent;

/// Maximum number of redirects followed for a single request.
pub const MAX_REDIRECTS: usize = 10;

/// HTTP client for catalog requests and streaming downloads.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

/// Result of a HEAD probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Probe {
    /// Declared size from `Content-Length`, when present.
    pub content_length: Option<u64>,
    /// Whether the remote advertised `Accept-Ranges: bytes`.
    pub accepts_ranges: bool,
}

/// Metadata about one landed file.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    /// Final on-disk path.
    pub path: PathBuf,
    /// File size after the transfer.
    pub bytes: u64,
    /// Size declared by the remote, when known.
    pub declared: Option<u64>,
    /// Whether an HTTP range resume was used.
    pub resumed: bool,
}

impl HttpClient {
    /// Creates a client with explicit connect and read timeouts.
    ///
    /// The read timeout bounds the gap between received chunks, not the whole
    /// transfer, so large datasets are never cut off while bytes keep flowing.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ClientBuild`] if the TLS backend cannot be initialised.
    pub fn new(connect_timeout_secs: u64, read_timeout_secs: u64) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .read_timeout(Duration::from_secs(read_timeout_secs))
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .gzip(true)
            .user_agent(user_agent::default_user_agent())
            .build()
            .map_err(TransferError::ClientBuild)?;
        Ok(Self { client })
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// GETs a URL and returns the body as text.
    ///
    /// # Errors
    ///
    /// Returns a network, timeout or status error.
    pub async fn get_text(&self, url: &str) -> Result<String, TransferError> {
        let response = self
            .send(self.client.get(url), url, None, &CancelToken::new())
            .await?;
        response
            .text()
            .await
            .map_err(|e| TransferError::network(url, e))
    }

    /// GETs a URL and deserializes the JSON body.
    ///
    /// # Errors
    ///
    /// Returns a network, timeout or status error; a body that does not match
    /// `T` is reported as a network error carrying reqwest's decode message.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, TransferError> {
        let response = self
            .send(self.client.get(url), url, None, &CancelToken::new())
            .await?;
        response
            .json::<T>()
            .await
            .map_err(|e| TransferError::network(url, e))
    }

    /// Sends a HEAD request to learn the declared size and range support.
    ///
    /// Servers that reject HEAD are treated as declaring nothing.
    ///
    /// # Errors
    ///
    /// Only [`TransferError::Cancelled`] is surfaced.
    pub async fn probe(&self, url: &str, token: &CancelToken) -> Result<Probe, TransferError> {
        match self.send(self.client.head(url), url, None, token).await {
            Ok(response) => {
                let headers = response.headers();
                Ok(Probe {
                    content_length: headers
                        .get(CONTENT_LENGTH)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok()),
                    accepts_ranges: headers
                        .get(ACCEPT_RANGES)
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| v.eq_ignore_ascii_case("bytes")),
                })
            }
            Err(TransferError::Cancelled) => Err(TransferError::Cancelled),
            Err(error) => {
                debug!(error = %error, "HEAD probe failed; continuing without size");
                Ok(Probe::default())
            }
        }
    }

    /// Downloads `url` into `dir`, resuming a partial file when possible.
    ///
    /// The file is named after the URL's last path segment, so a partial file
    /// left by an interrupted transfer is found again. When the remote accepts
    /// byte ranges, the missing tail is requested with `Range: bytes=<n>-` and
    /// appended; otherwise the file is rewritten from zero. A file that already
    /// has the declared size is not downloaded again.
    ///
    /// `progress` receives the file's current size after every chunk.
    ///
    /// # Errors
    ///
    /// Returns `TransferError` if the URL is invalid, the request fails, the
    /// remote answers with a non-2xx status, writing fails, the final size
    /// disagrees with the declared size, or `token` is cancelled.
    #[instrument(skip(self, dir, token, progress), fields(url = %url))]
    pub async fn fetch_to_dir(
        &self,
        url: &str,
        dir: &Path,
        token: &CancelToken,
        progress: ProgressFn<'_>,
    ) -> Result<FetchedFile, TransferError> {
        let parsed = Url::parse(url).map_err(|_| TransferError::invalid_url(url))?;
        let file_path = dir.join(filename_from_url(&parsed));

        let probe = self.probe(url, token).await?;
        let existing_bytes = tokio::fs::metadata(&file_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);

        if existing_bytes > 0 && probe.content_length == Some(existing_bytes) {
            debug!(path = %file_path.display(), bytes = existing_bytes, "file already complete");
            progress(existing_bytes);
            return Ok(FetchedFile {
                path: file_path,
                bytes: existing_bytes,
                declared: probe.content_length,
                resumed: true,
            });
        }

        let use_resume = probe.accepts_ranges
            && existing_bytes > 0
            && probe
                .content_length
                .is_none_or(|total| existing_bytes < total);
        let range_value = use_resume.then(|| format!("bytes={existing_bytes}-"));

        let response = self
            .send(self.client.get(url), url, range_value.as_deref(), token)
            .await?;
        let resumed = use_resume && response.status() == StatusCode::PARTIAL_CONTENT;
        let declared =
            derive_total_content_length(&response, existing_bytes).or(probe.content_length);

        let file = if resumed {
            let mut handle = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)
                .await
                .map_err(|e| TransferError::io(&file_path, e))?;
            handle
                .seek(std::io::SeekFrom::End(0))
                .await
                .map_err(|e| TransferError::io(&file_path, e))?;
            handle
        } else {
            File::create(&file_path)
                .await
                .map_err(|e| TransferError::io(&file_path, e))?
        };

        let base = if resumed { existing_bytes } else { 0 };
        // Partial data stays on disk on failure so a later attempt can resume it.
        let written = stream_to_file(file, response, url, &file_path, token, base, progress).await?;
        let final_size = base.saturating_add(written);

        if let Some(expected) = declared
            && expected != final_size
        {
            return Err(TransferError::integrity(&file_path, expected, final_size));
        }

        info!(
            path = %file_path.display(),
            bytes = final_size,
            resumed,
            "file transfer complete"
        );

        Ok(FetchedFile {
            path: file_path,
            bytes: final_size,
            declared,
            resumed,
        })
    }

    async fn send(
        &self,
        mut request: RequestBuilder,
        url: &str,
        range_header: Option<&str>,
        token: &CancelToken,
    ) -> Result<reqwest::Response, TransferError> {
        if let Some(range) = range_header {
            request = request.header(RANGE, range);
        }

        let response = tokio::select! {
            biased;
            () = token.cancelled() => return Err(TransferError::Cancelled),
            result = request.send() => result.map_err(|e| TransferError::network(url, e))?,
        };

        if !response.status().is_success() {
            return Err(TransferError::http_status(url, response.status().as_u16()));
        }
        Ok(response)
    }
}

/// Streams the response body to `file`, returning bytes written.
///
/// Buffered data is flushed on every exit path so nothing already received is
/// lost to a later resume.
async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
    token: &CancelToken,
    base: u64,
    progress: ProgressFn<'_>,
) -> Result<u64, TransferError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    let outcome = async {
        loop {
            let next = tokio::select! {
                biased;
                () = token.cancelled() => return Err(TransferError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = next else {
                return Ok(());
            };
            let chunk = chunk.map_err(|e| TransferError::network(url, e))?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| TransferError::io(file_path, e))?;
            bytes_written += chunk.len() as u64;
            progress(base.saturating_add(bytes_written));
        }
    }
    .await;

    let flushed = writer
        .flush()
        .await
        .map_err(|e| TransferError::io(file_path, e));
    outcome?;
    flushed?;
    Ok(bytes_written)
}

fn derive_total_content_length(response: &reqwest::Response, existing_bytes: u64) -> Option<u64> {
    let current = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if response.status() == StatusCode::PARTIAL_CONTENT {
        current.map(|remaining| existing_bytes.saturating_add(remaining))
    } else {
        current
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> HttpClient {
        HttpClient::new(5, 5).unwrap()
    }

    fn no_progress() -> impl Fn(u64) + Send + Sync {
        |_| {}
    }

    #[tokio::test]
    async fn test_fetch_to_dir_fresh_download() {
        let mock_server = MockServer::start().await;
        let temp_dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/data/5kxs.tar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"diffraction images"))
            .mount(&mock_server)
            .await;

        let url = format!("{}/data/5kxs.tar", mock_server.uri());
        let fetched = client()
            .fetch_to_dir(&url, temp_dir.path(), &CancelToken::new(), &no_progress())
            .await
            .unwrap();

        assert_eq!(fetched.path, temp_dir.path().join("5kxs.tar"));
        assert_eq!(fetched.bytes, 18);
        assert!(!fetched.resumed);
        assert_eq!(std::fs::read(&fetched.path).unwrap(), b"diffraction images");
    }

    #[tokio::test]
    async fn test_fetch_to_dir_reports_progress() {
        let mock_server = MockServer::start().await;
        let temp_dir = TempDir::new().unwrap();
        let body = vec![7u8; 64 * 1024];

        Mock::given(method("GET"))
            .and(path("/big.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&mock_server)
            .await;

        let seen = Arc::new(AtomicU64::new(0));
        let observer = {
            let seen = Arc::clone(&seen);
            move |bytes: u64| seen.store(bytes, Ordering::SeqCst)
        };
        let url = format!("{}/big.bin", mock_server.uri());
        client()
            .fetch_to_dir(&url, temp_dir.path(), &CancelToken::new(), &observer)
            .await
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), body.len() as u64);
    }

    #[tokio::test]
    async fn test_fetch_to_dir_non_success_status_fails() {
        let mock_server = MockServer::start().await;
        let temp_dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/missing.tar"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let url = format!("{}/missing.tar", mock_server.uri());
        let result = client()
            .fetch_to_dir(&url, temp_dir.path(), &CancelToken::new(), &no_progress())
            .await;

        assert!(matches!(
            result,
            Err(TransferError::HttpStatus { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_to_dir_invalid_url() {
        let temp_dir = TempDir::new().unwrap();
        let result = client()
            .fetch_to_dir("not a url", temp_dir.path(), &CancelToken::new(), &no_progress())
            .await;
        assert!(matches!(result, Err(TransferError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_fetch_to_dir_resumes_partial_file_with_range() {
        let mock_server = MockServer::start().await;
        let temp_dir = TempDir::new().unwrap();
        let full = b"0123456789abcdefghij";
        std::fs::write(temp_dir.path().join("set.tar"), &full[..8]).unwrap();

        Mock::given(method("HEAD"))
            .and(path("/set.tar"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Accept-Ranges", "bytes")
                    .insert_header("Content-Length", "20"),
            )
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/set.tar"))
            .and(header("Range", "bytes=8-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(&full[8..]))
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = format!("{}/set.tar", mock_server.uri());
        let fetched = client()
            .fetch_to_dir(&url, temp_dir.path(), &CancelToken::new(), &no_progress())
            .await
            .unwrap();

        assert!(fetched.resumed);
        assert_eq!(fetched.bytes, 20);
        assert_eq!(std::fs::read(&fetched.path).unwrap(), full);
    }

    #[tokio::test]
    async fn test_fetch_to_dir_restarts_without_range_support() {
        let mock_server = MockServer::start().await;
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("set.tar"), b"stale-").unwrap();

        Mock::given(method("GET"))
            .and(path("/set.tar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh content"))
            .mount(&mock_server)
            .await;

        let url = format!("{}/set.tar", mock_server.uri());
        let fetched = client()
            .fetch_to_dir(&url, temp_dir.path(), &CancelToken::new(), &no_progress())
            .await
            .unwrap();

        assert!(!fetched.resumed);
        assert_eq!(std::fs::read(&fetched.path).unwrap(), b"fresh content");
    }

    #[tokio::test]
    async fn test_fetch_to_dir_cancelled_before_start() {
        let mock_server = MockServer::start().await;
        let temp_dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x"))
            .mount(&mock_server)
            .await;

        let token = CancelToken::new();
        token.cancel();
        let url = format!("{}/a.bin", mock_server.uri());
        let result = client()
            .fetch_to_dir(&url, temp_dir.path(), &token, &no_progress())
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn test_get_json_decodes_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ids"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec!["1ABC", "2XYZ"]))
            .mount(&mock_server)
            .await;

        let ids: Vec<String> = client()
            .get_json(&format!("{}/ids", mock_server.uri()))
            .await
            .unwrap();
        assert_eq!(ids, vec!["1ABC", "2XYZ"]);
    }
}
