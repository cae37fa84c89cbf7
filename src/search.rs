//! Cross-source lookup by PDB code or DOI, with RCSB metadata augmentation.
//!
//! PDB searches also return the RCSB entry summary. Summaries are cached as
//! `<state_dir>/pdb_meta/<c2c3>/<pdb>.json`, sharded by the second and third
//! characters of the id, and trusted for [`METADATA_MAX_AGE`]. A failed
//! lookup never fails the search.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::fs_util::{modified_age, read_optional, write_atomic};
use crate::source::{SourceEntry, SourceRegistry};
use crate::transfer::HttpClient;

/// RCSB entry endpoint; the upper-case id is appended.
pub const DEFAULT_RCSB_ENTRY_URL: &str = "https://data.rcsb.org/rest/v1/core/entry";

/// How long cached metadata is trusted.
pub const METADATA_MAX_AGE: Duration = Duration::from_secs(28 * 24 * 60 * 60);

/// Field a search matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    /// Related PDB entry.
    Pdb,
    /// Dataset DOI.
    Doi,
}

impl SearchField {
    /// Returns the field as a lowercase string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdb => "pdb",
            Self::Doi => "doi",
        }
    }
}

impl fmt::Display for SearchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SearchField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pdb" => Ok(Self::Pdb),
            "doi" => Ok(Self::Doi),
            _ => Err(format!("Invalid search field: {s}. Expected pdb or doi")),
        }
    }
}

/// One matching catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    /// Source the entry belongs to.
    pub source: &'static str,
    /// The catalog entry.
    #[serde(flatten)]
    pub entry: SourceEntry,
}

/// Search response body.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    /// Matching entries across all ready sources.
    pub results: Vec<SearchHit>,
    /// RCSB summary for PDB searches, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PdbMetadata>,
}

/// Summary of an RCSB entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdbMetadata {
    /// Lowercase PDB id.
    pub pdb_id: String,
    /// Structure title.
    pub title: Option<String>,
    /// First experimental method.
    pub experimental_method: Option<String>,
    /// Best resolution in Å.
    pub resolution: Option<f64>,
    /// Deposition date.
    pub deposition_date: Option<String>,
    /// Initial release date.
    pub release_date: Option<String>,
    /// DOI of the primary citation.
    pub citation_doi: Option<String>,
}

impl PdbMetadata {
    /// Extracts the summary fields from an RCSB `core/entry` document.
    #[must_use]
    pub fn from_rcsb(pdb_id: &str, raw: &Value) -> Self {
        let text = |value: Option<&Value>| value.and_then(Value::as_str).map(str::to_string);
        Self {
            pdb_id: pdb_id.to_lowercase(),
            title: text(raw.pointer("/struct/title")),
            experimental_method: text(raw.pointer("/exptl/0/method")),
            resolution: raw
                .pointer("/rcsb_entry_info/resolution_combined/0")
                .and_then(Value::as_f64),
            deposition_date: text(raw.pointer("/rcsb_accession_info/deposit_date")),
            release_date: text(raw.pointer("/rcsb_accession_info/initial_release_date")),
            citation_doi: text(raw.pointer("/rcsb_primary_citation/pdbx_database_id_doi")),
        }
    }
}

/// Returns true for a well-formed PDB id such as `1abc`.
#[must_use]
pub fn is_pdb_id(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 4 && bytes[0].is_ascii_digit() && bytes.iter().all(u8::is_ascii_alphanumeric)
}

/// Finds entries whose `field` equals `value` (case-insensitively).
#[must_use]
pub fn search_catalogs(registry: &SourceRegistry, field: SearchField, value: &str) -> Vec<SearchHit> {
    let needle = value.trim().to_lowercase();
    let mut hits = Vec::new();
    for source in registry.iter() {
        let Some(catalog) = source.catalog() else {
            continue;
        };
        for entry in catalog.entries.values() {
            let candidate = match field {
                SearchField::Pdb => entry.pdb.as_deref(),
                SearchField::Doi => entry.doi.as_deref(),
            };
            if candidate.is_some_and(|c| c.to_lowercase() == needle) {
                hits.push(SearchHit {
                    source: source.name(),
                    entry: entry.clone(),
                });
            }
        }
    }
    hits
}

/// On-disk cache of RCSB entry summaries.
#[derive(Debug, Clone)]
pub struct PdbMetadataCache {
    http: HttpClient,
    dir: PathBuf,
    base_url: String,
}

impl PdbMetadataCache {
    /// Caches below `<state_dir>/pdb_meta`, fetching from `base_url`.
    #[must_use]
    pub fn new(http: HttpClient, state_dir: &Path, base_url: impl Into<String>) -> Self {
        Self {
            http,
            dir: state_dir.join("pdb_meta"),
            base_url: base_url.into(),
        }
    }

    /// Cache file of one id.
    #[must_use]
    pub fn path_for(&self, pdb_id: &str) -> PathBuf {
        let shard = pdb_id.get(1..3).unwrap_or("__");
        self.dir.join(shard).join(format!("{pdb_id}.json"))
    }

    /// Returns the summary for `pdb_id`, from cache when fresh.
    ///
    /// A failed download falls back to a stale cached copy; with no copy at
    /// all the result is `None`.
    pub async fn lookup(&self, pdb_id: &str) -> Option<PdbMetadata> {
        let pdb_id = pdb_id.to_lowercase();
        if !is_pdb_id(&pdb_id) {
            return None;
        }
        let path = self.path_for(&pdb_id);
        let fresh = modified_age(&path)
            .await
            .is_some_and(|age| age < METADATA_MAX_AGE);
        if fresh && let Some(cached) = read_metadata(&path).await {
            debug!(pdb = %pdb_id, "metadata cache hit");
            return Some(cached);
        }

        let url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            pdb_id.to_uppercase()
        );
        match self.http.get_json::<Value>(&url).await {
            Ok(raw) => {
                let metadata = PdbMetadata::from_rcsb(&pdb_id, &raw);
                match serde_json::to_vec(&metadata) {
                    Ok(content) => {
                        if let Err(error) = write_atomic(&path, &content).await {
                            warn!(path = %path.display(), error = %error, "could not cache metadata");
                        }
                    }
                    Err(error) => warn!(error = %error, "could not serialize metadata"),
                }
                Some(metadata)
            }
            Err(error) => {
                warn!(pdb = %pdb_id, error = %error, "metadata lookup failed");
                read_metadata(&path).await
            }
        }
    }
}

async fn read_metadata(path: &Path) -> Option<PdbMetadata> {
    let content = read_optional(path).await.ok()??;
    serde_json::from_slice(&content).ok()
}
