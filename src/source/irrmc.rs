//! proteindiffraction.org (IRRMC) listing scraper.
//!
//! The listing is paginated HTML. Each dataset is a table row tagged
//! `class="dataset"` carrying its id (and optionally its size) as data
//! attributes; the row links the related PDB structure, a description cell,
//! the archive download and the dataset DOI. The page footer reads
//! `Page N of M`.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, instrument};
use url::Url;

use super::{SourceEntry, SourceError, compile_static_regex, plain_text};
use crate::transfer::{HttpClient, TransferError};

/// Default listing URL.
pub const DEFAULT_BASE_URL: &str = "https://proteindiffraction.org/search/";

/// Default delay between page requests.
pub const DEFAULT_POLITENESS_DELAY: Duration = Duration::from_millis(1000);

static ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<tr\b([^>]*)>(.*?)</tr>"));
static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"(?i)([a-z-]+)\s*=\s*["']([^"']*)["']"#));
static PDB_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)/p/([0-9][a-z0-9]{3})/"));
static DESCRIPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?is)<td[^>]*class\s*=\s*["'][^"']*description[^"']*["'][^>]*>(.*?)</td>"#)
});
static HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"(?i)href\s*=\s*["']([^"']+)["']"#));
static DOI_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"(?i)doi\.org/(10\.[0-9]{4,9}/[^\s"'<>]+)"#));
static PAGE_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)Page\s+(\d+)\s+of\s+(\d+)"));

const DOWNLOAD_SUFFIXES: &[&str] = &[
    ".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar.xz", ".txz", ".zip", ".gz", ".bz2",
    ".xz", ".dat",
];

/// HTML-scrape connector.
#[derive(Debug, Clone)]
pub struct Irrmc {
    base_url: String,
    delay: Duration,
}

impl Irrmc {
    /// Scrapes `base_url` with `delay` between pages.
    #[must_use]
    pub fn new(base_url: impl Into<String>, delay: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            delay,
        }
    }

    fn page_url(&self, page: u32) -> Result<Url, SourceError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|_| SourceError::from(TransferError::invalid_url(&self.base_url)))?;
        url.query_pairs_mut().append_pair("page", &page.to_string());
        Ok(url)
    }

    /// Walks every listing page.
    ///
    /// # Errors
    ///
    /// Fails on the first page that cannot be fetched.
    #[instrument(skip(self, http), fields(base_url = %self.base_url))]
    pub async fn fetch_catalog(&self, http: &HttpClient) -> Result<Vec<SourceEntry>, SourceError> {
        let mut entries = Vec::new();
        let mut page: u32 = 1;
        loop {
            let url = self.page_url(page)?;
            let html = http.get_text(url.as_str()).await?;
            let found = parse_page(&html, &url);
            debug!(page, entries = found.len(), "listing page parsed");
            entries.extend(found);

            let last = parse_page_count(&html).map_or(page, |(_, last)| last);
            if page >= last {
                break;
            }
            tokio::time::sleep(self.delay).await;
            page += 1;
        }
        info!(pages = page, entries = entries.len(), "listing scraped");
        Ok(entries)
    }
}

/// Extracts `(current, last)` from the `Page N of M` footer.
#[must_use]
pub fn parse_page_count(html: &str) -> Option<(u32, u32)> {
    let captures = PAGE_COUNT_RE.captures(html)?;
    let current = captures.get(1)?.as_str().parse().ok()?;
    let last = captures.get(2)?.as_str().parse().ok()?;
    Some((current, last))
}

/// Parses every dataset row on one page; `page_url` resolves relative links.
///
/// Rows without an id or a download link are skipped.
#[must_use]
pub fn parse_page(html: &str, page_url: &Url) -> Vec<SourceEntry> {
    ROW_RE
        .captures_iter(html)
        .filter_map(|row| {
            let attrs = row.get(1)?.as_str();
            let body = row.get(2)?.as_str();
            parse_row(attrs, body, page_url)
        })
        .collect()
}

fn parse_row(attrs: &str, body: &str, page_url: &Url) -> Option<SourceEntry> {
    let mut id = None;
    let mut size = 0;
    let mut is_dataset = false;
    for attr in ATTR_RE.captures_iter(attrs) {
        let value = &attr[2];
        match attr[1].to_ascii_lowercase().as_str() {
            "class" => is_dataset = value.split_whitespace().any(|c| c == "dataset"),
            "data-id" => id = Some(value.trim().to_string()),
            "data-size" => size = value.trim().parse().unwrap_or(0),
            _ => {}
        }
    }
    let id = id.filter(|id| is_dataset && !id.is_empty())?;

    let download = HREF_RE
        .captures_iter(body)
        .map(|c| c[1].to_string())
        .find(|href| is_download_link(href))
        .and_then(|href| page_url.join(&href).ok());
    let Some(download) = download else {
        debug!(id = %id, "dataset row without download link");
        return None;
    };

    let pdb = PDB_LINK_RE.captures(body).map(|c| c[1].to_lowercase());
    let doi = DOI_RE
        .captures(body)
        .map(|c| c[1].trim_end_matches(['.', ',', ')']).to_string());
    let name = DESCRIPTION_RE
        .captures(body)
        .map(|c| plain_text(&c[1]))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| id.clone());

    Some(SourceEntry {
        id,
        pdb,
        doi,
        name,
        files: vec![download.to_string()],
        size,
    })
}

fn is_download_link(href: &str) -> bool {
    let path = href.split(['?', '#']).next().unwrap_or(href).to_lowercase();
    DOWNLOAD_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
}
