//! Remote source connectors and their catalogs.
//!
//! A [`Source`] wraps one [`Connector`] together with the last catalog it
//! produced. Catalogs are immutable snapshots: a refresh builds a new
//! [`SourceCatalog`], persists it under `<state_dir>/sources/<name>.json` and
//! swaps it in. Until the first catalog is installed the source is not ready;
//! callers that need it wait on a readiness signal instead of polling.
//!
//! Three transport families are supported:
//! - [`irrmc`]: paginated HTML listing scraped page by page
//! - [`sbgrid`]: rsync module listing
//! - [`zenodo`]: paginated JSON API filtered by a PDB id allow-list

mod error;
pub mod irrmc;
pub mod pdb_ids;
mod registry;
pub mod sbgrid;
pub mod zenodo;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

pub use error::SourceError;
pub use registry::{SourceKind, SourceRegistry};

use crate::catalog::now_millis;
use crate::fs_util::{read_optional, write_atomic};
use crate::transfer::{HttpClient, Rsync};

/// Compiles a regex at static init; panics on invalid pattern.
pub(crate) fn compile_static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid static regex '{pattern}': {e}"))
}

/// One remote dataset as described by its connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    /// Stable remote identifier, also the local directory name.
    pub id: String,
    /// Lowercase PDB code of the related structure, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdb: Option<String>,
    /// DOI of the dataset, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    /// Display name.
    pub name: String,
    /// Remote paths: absolute URLs for HTTP sources, sub-paths for rsync.
    #[serde(default)]
    pub files: Vec<String>,
    /// Size declared by the remote, in bytes (0 if unknown).
    #[serde(default)]
    pub size: u64,
}

/// Snapshot of a connector's remote catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCatalog {
    /// When the catalog was fetched, milliseconds since the Unix epoch.
    pub fetched_at: u64,
    /// Entries keyed by remote id.
    pub entries: BTreeMap<String, SourceEntry>,
}

impl SourceCatalog {
    /// Builds a catalog stamped with the current time.
    ///
    /// Later entries with a duplicate id replace earlier ones.
    pub fn new(entries: impl IntoIterator<Item = SourceEntry>) -> Self {
        Self {
            fetched_at: now_millis(),
            entries: entries.into_iter().map(|e| (e.id.clone(), e)).collect(),
        }
    }

    /// Looks up an entry by remote id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&SourceEntry> {
        self.entries.get(id)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the catalog has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Availability of a connector's catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogStatus {
    /// No catalog has been fetched or loaded.
    None,
    /// A refresh is running.
    InProgress,
    /// A catalog is available.
    Completed,
}

impl CatalogStatus {
    /// Returns the status as a lowercase string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for CatalogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CatalogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid catalog status: {s}")),
        }
    }
}

/// How one entry is moved onto local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPlan {
    /// Download each URL, unpacking archives as they land.
    Http {
        /// Absolute URLs, fetched in order.
        urls: Vec<String>,
    },
    /// Mirror a remote directory with rsync.
    Rsync {
        /// Full remote path, ending in `/`.
        remote: String,
    },
}

/// Shared clients and paths handed to every connector.
#[derive(Debug, Clone)]
pub struct SourceContext {
    /// HTTP client for listings, APIs and downloads.
    pub http: HttpClient,
    /// rsync wrapper for directory-listing sources.
    pub rsync: Rsync,
    /// Directory holding persisted catalogs and caches.
    pub state_dir: PathBuf,
}

/// The closed set of connector implementations.
#[derive(Debug, Clone)]
pub enum Connector {
    /// HTML listing scrape.
    Irrmc(irrmc::Irrmc),
    /// rsync module listing.
    Sbgrid(sbgrid::Sbgrid),
    /// Paginated JSON API.
    Zenodo(zenodo::Zenodo),
}

impl Connector {
    /// Enumerates the remote catalog.
    ///
    /// # Errors
    ///
    /// Returns the first error that prevents a complete listing.
    pub async fn fetch_catalog(&self, ctx: &SourceContext) -> Result<Vec<SourceEntry>, SourceError> {
        match self {
            Self::Irrmc(connector) => connector.fetch_catalog(&ctx.http).await,
            Self::Sbgrid(connector) => connector.fetch_catalog(&ctx.rsync).await,
            Self::Zenodo(connector) => connector.fetch_catalog(&ctx.http, &ctx.state_dir).await,
        }
    }

    /// Describes how to transfer `entry`.
    #[must_use]
    pub fn plan(&self, entry: &SourceEntry) -> TransferPlan {
        match self {
            Self::Irrmc(_) | Self::Zenodo(_) => TransferPlan::Http {
                urls: entry.files.clone(),
            },
            Self::Sbgrid(connector) => connector.plan(entry),
        }
    }
}

/// Public description of a source for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    /// Connector name.
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Catalog availability.
    pub status: CatalogStatus,
    /// Number of catalog entries (0 without a catalog).
    pub entries: usize,
    /// When the current catalog was fetched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<u64>,
}

/// A connector plus its current catalog and readiness signal.
#[derive(Debug)]
pub struct Source {
    kind: SourceKind,
    connector: Connector,
    catalog_path: PathBuf,
    ctx: Arc<SourceContext>,
    catalog: RwLock<Option<Arc<SourceCatalog>>>,
    refreshing: AtomicBool,
    ready: watch::Sender<bool>,
}

/// Clears the refreshing flag however the refresh ends.
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Source {
    /// Creates a source with no catalog.
    #[must_use]
    pub fn new(kind: SourceKind, connector: Connector, ctx: Arc<SourceContext>) -> Self {
        let catalog_path = catalog_path(&ctx.state_dir, kind.name());
        let (ready, _) = watch::channel(false);
        Self {
            kind,
            connector,
            catalog_path,
            ctx,
            catalog: RwLock::new(None),
            refreshing: AtomicBool::new(false),
            ready,
        }
    }

    /// Connector name, also the `source` component of local entries.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Which connector this is.
    #[must_use]
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Shared clients.
    #[must_use]
    pub fn context(&self) -> &SourceContext {
        &self.ctx
    }

    /// Current catalog availability.
    #[must_use]
    pub fn status(&self) -> CatalogStatus {
        if self.refreshing.load(Ordering::Acquire) {
            CatalogStatus::InProgress
        } else if self.catalog().is_some() {
            CatalogStatus::Completed
        } else {
            CatalogStatus::None
        }
    }

    /// The installed catalog, if any.
    #[must_use]
    pub fn catalog(&self) -> Option<Arc<SourceCatalog>> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Looks up one entry in the installed catalog.
    #[must_use]
    pub fn entry(&self, id: &str) -> Option<SourceEntry> {
        self.catalog()?.get(id).cloned()
    }

    /// Returns true once a catalog has been installed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Waits up to `timeout` for a catalog, returning it if one arrived.
    pub async fn wait_ready(&self, timeout: Duration) -> Option<Arc<SourceCatalog>> {
        let mut ready = self.ready.subscribe();
        let _ = tokio::time::timeout(timeout, ready.wait_for(|ready| *ready)).await;
        self.catalog()
    }

    /// Describes how to transfer `entry`.
    #[must_use]
    pub fn plan(&self, entry: &SourceEntry) -> TransferPlan {
        self.connector.plan(entry)
    }

    /// Summary for API responses.
    #[must_use]
    pub fn info(&self) -> SourceInfo {
        let catalog = self.catalog();
        SourceInfo {
            name: self.kind.name(),
            description: self.kind.description(),
            status: self.status(),
            entries: catalog.as_ref().map_or(0, |c| c.len()),
            fetched_at: catalog.map(|c| c.fetched_at),
        }
    }

    /// Swaps in a new catalog and signals readiness.
    pub fn install(&self, catalog: SourceCatalog) -> Arc<SourceCatalog> {
        let catalog = Arc::new(catalog);
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&catalog));
        self.ready.send_replace(true);
        catalog
    }

    /// Loads the last persisted catalog, if there is one.
    ///
    /// Returns `Ok(false)` when nothing was saved.
    ///
    /// # Errors
    ///
    /// Returns an IO or JSON error for an unreadable catalog file.
    pub async fn load_saved(&self) -> Result<bool, SourceError> {
        let path = &self.catalog_path;
        let Some(content) = read_optional(path)
            .await
            .map_err(|e| SourceError::io(path, e))?
        else {
            return Ok(false);
        };
        let catalog: SourceCatalog =
            serde_json::from_slice(&content).map_err(|e| SourceError::json(path, e))?;
        info!(source = self.name(), entries = catalog.len(), "saved catalog loaded");
        self.install(catalog);
        Ok(true)
    }

    /// Fetches a fresh catalog, persists it and installs it.
    ///
    /// On failure the previously installed catalog, if any, stays in place.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::RefreshInProgress`] if another refresh of this
    /// source is running, or the connector's error.
    #[instrument(skip(self), fields(source = self.name()))]
    pub async fn refresh(&self) -> Result<Arc<SourceCatalog>, SourceError> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SourceError::RefreshInProgress {
                source_name: self.name().to_string(),
            });
        }
        let _guard = RefreshGuard(&self.refreshing);

        let entries = match self.connector.fetch_catalog(&self.ctx).await {
            Ok(entries) => entries,
            Err(error) => {
                warn!(error = %error, "catalog refresh failed");
                return Err(error);
            }
        };
        let catalog = SourceCatalog::new(entries);
        let path = &self.catalog_path;
        let content = serde_json::to_vec(&catalog).map_err(|e| SourceError::json(path, e))?;
        write_atomic(path, &content)
            .await
            .map_err(|e| SourceError::io(path, e))?;
        info!(entries = catalog.len(), "catalog refreshed");
        Ok(self.install(catalog))
    }
}

/// Where a source's catalog is persisted.
#[must_use]
pub fn catalog_path(state_dir: &Path, name: &str) -> PathBuf {
    state_dir.join("sources").join(format!("{name}.json"))
}

/// Collapses whitespace and strips HTML tags from a fragment of markup.
pub(crate) fn plain_text(html: &str) -> String {
    static TAG_RE: std::sync::LazyLock<Regex> =
        std::sync::LazyLock::new(|| compile_static_regex(r"(?s)<[^>]*>"));
    let stripped = TAG_RE.replace_all(html, " ");
    let decoded = stripped
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::config::SourceSettings;

    fn context(state_dir: &Path) -> Arc<SourceContext> {
        Arc::new(SourceContext {
            http: HttpClient::new(5, 5).unwrap(),
            rsync: Rsync::new("rsync"),
            state_dir: state_dir.to_path_buf(),
        })
    }

    fn listing_page() -> String {
        r#"<table>
<tr class="dataset" data-id="abc123" data-size="500000">
  <td><a href="/p/1abc/">1ABC</a></td>
  <td class="description">Lysozyme <b>native</b></td>
  <td><a href="/files/abc123.dat">Download</a></td>
</tr>
</table>
<span class="pages">Page 1 of 1</span>"#
            .to_string()
    }

    async fn irrmc_source(server: &MockServer, state_dir: &Path) -> Source {
        let settings = SourceSettings {
            base_url: Some(format!("{}/datasets/", server.uri())),
            politeness_delay_ms: Some(0),
            ..SourceSettings::default()
        };
        SourceKind::Irrmc.build(&settings, context(state_dir))
    }

    #[test]
    fn test_catalog_status_parse_and_display() {
        assert_eq!(
            "in_progress".parse::<CatalogStatus>().unwrap(),
            CatalogStatus::InProgress
        );
        assert_eq!(CatalogStatus::None.to_string(), "none");
        assert!("ready".parse::<CatalogStatus>().is_err());
    }

    #[test]
    fn test_plain_text_strips_tags_and_entities() {
        assert_eq!(plain_text("  <b>A</b> &amp;\n  B "), "A & B");
    }

    #[tokio::test]
    async fn test_refresh_installs_persists_and_signals_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/datasets/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing_page()))
            .mount(&server)
            .await;
        let temp_dir = TempDir::new().unwrap();
        let source = irrmc_source(&server, temp_dir.path()).await;
        assert_eq!(source.status(), CatalogStatus::None);
        assert!(!source.is_ready());

        let catalog = source.refresh().await.unwrap();

        assert_eq!(catalog.len(), 1);
        assert_eq!(source.status(), CatalogStatus::Completed);
        assert_eq!(source.entry("abc123").unwrap().size, 500_000);
        assert!(source.wait_ready(Duration::from_millis(10)).await.is_some());
        assert!(catalog_path(temp_dir.path(), "irrmc").exists());

        let reloaded = irrmc_source(&server, temp_dir.path()).await;
        assert!(reloaded.load_saved().await.unwrap());
        assert_eq!(reloaded.entry("abc123"), source.entry("abc123"));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_catalog() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/datasets/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let temp_dir = TempDir::new().unwrap();
        let source = irrmc_source(&server, temp_dir.path()).await;
        source.install(SourceCatalog::new(vec![SourceEntry {
            id: "old".to_string(),
            pdb: None,
            doi: None,
            name: "old".to_string(),
            files: Vec::new(),
            size: 1,
        }]));

        assert!(source.refresh().await.is_err());
        assert!(source.entry("old").is_some());
        assert_eq!(source.status(), CatalogStatus::Completed);
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_without_catalog() {
        let server = MockServer::start().await;
        let temp_dir = TempDir::new().unwrap();
        let source = irrmc_source(&server, temp_dir.path()).await;
        assert!(source.wait_ready(Duration::from_millis(20)).await.is_none());
        assert!(!source.load_saved().await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_ready_wakes_on_install() {
        let server = MockServer::start().await;
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(irrmc_source(&server, temp_dir.path()).await);
        let waiter = {
            let source = Arc::clone(&source);
            tokio::spawn(async move { source.wait_ready(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.install(SourceCatalog::default());
        assert!(waiter.await.unwrap().is_some());
    }
}
