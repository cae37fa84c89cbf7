//! Transfer and unpack pipeline.
//!
//! This module moves a dataset onto local disk:
//! - [`HttpClient`] downloads individual files with range resume
//! - [`Rsync`] mirrors directory-listing sources and parses their progress
//! - [`unpack`] extracts archives with external tools and sweeps directories
//! - [`UploadWriter`] stores client uploads under sanitized names
//!
//! Every step takes the job's [`CancelToken`].

mod cancel;
mod error;
pub(crate) mod filename;
mod http;
mod process;
pub mod rsync;
pub mod unpack;
mod upload;

use std::path::Path;

use tracing::{info, instrument};

pub use cancel::CancelToken;
pub use error::TransferError;
pub use filename::sanitize_relative_path;
pub use http::{FetchedFile, HttpClient, MAX_REDIRECTS, Probe};
pub use rsync::Rsync;
pub use upload::UploadWriter;

/// Progress callback receiving a running byte count.
pub type ProgressFn<'a> = &'a (dyn Fn(u64) + Send + Sync);

/// Downloads every URL into `dir` in order, unpacking each file as it lands.
///
/// `progress` receives the cumulative byte count across all files.
/// Returns the total number of bytes received.
///
/// # Errors
///
/// Stops at the first failing file and returns its error.
#[instrument(skip(client, urls, token, progress), fields(dir = %dir.display(), files = urls.len()))]
pub async fn fetch_http_files(
    client: &HttpClient,
    urls: &[String],
    dir: &Path,
    token: &CancelToken,
    progress: ProgressFn<'_>,
) -> Result<u64, TransferError> {
    let mut completed: u64 = 0;
    for url in urls {
        let base = completed;
        let per_file = move |bytes: u64| progress(base.saturating_add(bytes));
        let fetched = client.fetch_to_dir(url, dir, token, &per_file).await?;
        completed = completed.saturating_add(fetched.bytes);
        unpack::unpack_file(&fetched.path, true, token).await?;
    }
    info!(bytes = completed, "all files received");
    Ok(completed)
}
