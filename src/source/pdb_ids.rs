//! Allow-list of current PDB entry ids.
//!
//! Connectors that only have free-text metadata use the list to tell real
//! PDB codes from other four-character tokens. The list is downloaded from
//! RCSB once and cached under `<state_dir>/pdb_ids.json`; the cached copy is
//! refreshed after [`MAX_AGE`] and still used if a refresh fails.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use super::{SourceError, compile_static_regex};
use crate::fs_util::{modified_age, read_optional, write_atomic};
use crate::transfer::HttpClient;

/// RCSB endpoint listing every current entry id.
pub const DEFAULT_URL: &str = "https://data.rcsb.org/rest/v1/holdings/current/entry_ids";

/// How long a cached list is trusted.
pub const MAX_AGE: Duration = Duration::from_secs(28 * 24 * 60 * 60);

static CANDIDATE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"\b([0-9][A-Za-z0-9]{3})\b"));

/// Set of lowercase PDB ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PdbIdList {
    ids: HashSet<String>,
}

impl PdbIdList {
    /// Builds a list from any ids, normalised to lowercase.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            ids: ids
                .into_iter()
                .map(|id| id.as_ref().trim().to_lowercase())
                .filter(|id| !id.is_empty())
                .collect(),
        }
    }

    /// Number of ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Returns true if `id` (any case) is a known PDB id.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(&id.to_lowercase())
    }

    /// First known PDB id mentioned in `text`, lowercased.
    #[must_use]
    pub fn find_in(&self, text: &str) -> Option<String> {
        CANDIDATE_RE
            .captures_iter(text)
            .map(|c| c[1].to_lowercase())
            .find(|candidate| self.ids.contains(candidate))
    }

    /// Loads the cached list, downloading a new one when it is missing or
    /// older than [`MAX_AGE`].
    ///
    /// # Errors
    ///
    /// Fails only when no usable list exists: the download failed and there
    /// is no cached copy to fall back on.
    pub async fn load_or_fetch(
        http: &HttpClient,
        state_dir: &Path,
        url: &str,
    ) -> Result<Self, SourceError> {
        let path = cache_path(state_dir);
        let fresh = modified_age(&path).await.is_some_and(|age| age < MAX_AGE);
        if fresh && let Some(list) = read_cached(&path).await? {
            debug!(ids = list.len(), "using cached PDB id list");
            return Ok(list);
        }

        match http.get_json::<Vec<String>>(url).await {
            Ok(ids) => {
                let list = Self::new(&ids);
                let content = serde_json::to_vec(&ids).map_err(|e| SourceError::json(&path, e))?;
                write_atomic(&path, &content)
                    .await
                    .map_err(|e| SourceError::io(&path, e))?;
                info!(ids = list.len(), "PDB id list downloaded");
                Ok(list)
            }
            Err(error) => match read_cached(&path).await? {
                Some(list) => {
                    warn!(error = %error, "PDB id list refresh failed, using stale copy");
                    Ok(list)
                }
                None => Err(error.into()),
            },
        }
    }
}

fn cache_path(state_dir: &Path) -> PathBuf {
    state_dir.join("pdb_ids.json")
}

async fn read_cached(path: &Path) -> Result<Option<PdbIdList>, SourceError> {
    let Some(content) = read_optional(path)
        .await
        .map_err(|e| SourceError::io(path, e))?
    else {
        return Ok(None);
    };
    let ids: Vec<String> = serde_json::from_slice(&content).map_err(|e| SourceError::json(path, e))?;
    Ok(Some(PdbIdList::new(&ids)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_find_in_matches_known_ids_only() {
        let list = PdbIdList::new(["1ABC", "4hhb"]);
        assert!(list.contains("4HHB"));
        assert_eq!(list.find_in("Data for 2XYZ and 4HHB."), Some("4hhb".to_string()));
        assert_eq!(list.find_in("version 2019 release"), None);
    }

    #[tokio::test]
    async fn test_load_or_fetch_downloads_then_uses_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/holdings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec!["1ABC", "4HHB"]))
            .expect(1)
            .mount(&server)
            .await;
        let temp_dir = TempDir::new().unwrap();
        let http = HttpClient::new(5, 5).unwrap();
        let url = format!("{}/holdings", server.uri());

        let first = PdbIdList::load_or_fetch(&http, temp_dir.path(), &url).await.unwrap();
        let second = PdbIdList::load_or_fetch(&http, temp_dir.path(), &url).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert!(temp_dir.path().join("pdb_ids.json").exists());
    }

    #[tokio::test]
    async fn test_load_or_fetch_without_cache_propagates_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let temp_dir = TempDir::new().unwrap();
        let http = HttpClient::new(5, 5).unwrap();

        let result =
            PdbIdList::load_or_fetch(&http, temp_dir.path(), &format!("{}/x", server.uri())).await;
        assert!(result.is_err());
    }
}
