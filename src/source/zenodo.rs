//! Zenodo records API connector.
//!
//! Zenodo has no structured link to the PDB, so each record's free-text
//! metadata is searched for a known PDB id (see [`PdbIdList`]). Records with
//! no recognisable id are skipped. Pages are followed through `links.next`.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info, instrument};
use url::Url;

use super::pdb_ids::PdbIdList;
use super::{SourceEntry, SourceError, plain_text};
use crate::transfer::{HttpClient, TransferError};

/// Default records endpoint.
pub const DEFAULT_BASE_URL: &str = "https://zenodo.org/api/records";

/// Default search query.
pub const DEFAULT_QUERY: &str = "\"diffraction images\" AND resource_type.type:dataset";

const PAGE_SIZE: &str = "100";

/// One page of search results.
#[derive(Debug, Deserialize)]
pub(crate) struct RecordsPage {
    pub hits: Hits,
    #[serde(default)]
    pub links: PageLinks,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Hits {
    #[serde(default)]
    pub hits: Vec<Record>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PageLinks {
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Record {
    pub id: u64,
    pub doi: Option<String>,
    #[serde(default)]
    pub metadata: RecordMetadata,
    #[serde(default)]
    pub files: Vec<RecordFile>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RecordMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub doi: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub related_identifiers: Vec<RelatedIdentifier>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RelatedIdentifier {
    pub identifier: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RecordFile {
    #[serde(default)]
    pub size: u64,
    pub links: FileLinks,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileLinks {
    #[serde(rename = "self")]
    pub self_link: String,
}

/// JSON-API connector.
#[derive(Debug, Clone)]
pub struct Zenodo {
    base_url: String,
    query: String,
    pdb_ids_url: String,
}

impl Zenodo {
    /// Searches `base_url` with `query`, validating ids against the list at
    /// `pdb_ids_url`.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        query: impl Into<String>,
        pdb_ids_url: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            query: query.into(),
            pdb_ids_url: pdb_ids_url.into(),
        }
    }

    fn first_page_url(&self) -> Result<Url, SourceError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|_| SourceError::from(TransferError::invalid_url(&self.base_url)))?;
        url.query_pairs_mut()
            .append_pair("q", &self.query)
            .append_pair("size", PAGE_SIZE)
            .append_pair("page", "1");
        Ok(url)
    }

    /// Follows the result cursor to the end.
    ///
    /// # Errors
    ///
    /// Fails if the PDB id list is unavailable or a page cannot be fetched.
    #[instrument(skip(self, http, state_dir), fields(base_url = %self.base_url))]
    pub async fn fetch_catalog(
        &self,
        http: &HttpClient,
        state_dir: &Path,
    ) -> Result<Vec<SourceEntry>, SourceError> {
        let pdb_ids = PdbIdList::load_or_fetch(http, state_dir, &self.pdb_ids_url).await?;
        let mut entries = Vec::new();
        let mut skipped = 0usize;
        let mut next = Some(self.first_page_url()?.to_string());
        while let Some(url) = next.take() {
            let page: RecordsPage = http.get_json(&url).await?;
            debug!(records = page.hits.hits.len(), "records page received");
            for record in page.hits.hits {
                match record_to_entry(record, &pdb_ids) {
                    Some(entry) => entries.push(entry),
                    None => skipped += 1,
                }
            }
            next = page.links.next.filter(|n| *n != url);
        }
        info!(entries = entries.len(), skipped, "records listed");
        Ok(entries)
    }
}

pub(crate) fn record_to_entry(record: Record, pdb_ids: &PdbIdList) -> Option<SourceEntry> {
    let metadata = &record.metadata;
    let texts = metadata
        .title
        .iter()
        .chain(metadata.description.iter())
        .chain(metadata.keywords.iter())
        .chain(metadata.notes.iter())
        .chain(metadata.related_identifiers.iter().map(|r| &r.identifier));
    let pdb = texts.map(|text| plain_text(text)).find_map(|text| pdb_ids.find_in(&text))?;

    let name = metadata
        .title
        .as_deref()
        .map(plain_text)
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| record.id.to_string());
    let doi = record.doi.clone().or_else(|| metadata.doi.clone());
    let size = record.files.iter().map(|f| f.size).sum();
    let files = record.files.into_iter().map(|f| f.links.self_link).collect();

    Some(SourceEntry {
        id: record.id.to_string(),
        pdb: Some(pdb),
        doi,
        name,
        files,
        size,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(id: u64, title: &str, keywords: &[&str]) -> serde_json::Value {
        json!({
            "id": id,
            "doi": format!("10.5281/zenodo.{id}"),
            "metadata": {
                "title": title,
                "description": "<p>Raw images</p>",
                "keywords": keywords,
            },
            "files": [
                {"key": "a.tar", "size": 10, "links": {"self": format!("https://zenodo.org/api/records/{id}/files/a.tar/content")}},
                {"key": "b.zip", "size": 5, "links": {"self": format!("https://zenodo.org/api/records/{id}/files/b.zip/content")}}
            ]
        })
    }

    #[test]
    fn test_record_to_entry_recovers_pdb_from_keywords() {
        let list = PdbIdList::new(["6xyz"]);
        let record: Record =
            serde_json::from_value(record(42, "Diffraction data", &["PDB 6XYZ"])).unwrap();

        let entry = record_to_entry(record, &list).unwrap();

        assert_eq!(entry.id, "42");
        assert_eq!(entry.pdb.as_deref(), Some("6xyz"));
        assert_eq!(entry.doi.as_deref(), Some("10.5281/zenodo.42"));
        assert_eq!(entry.size, 15);
        assert_eq!(entry.files.len(), 2);
    }

    #[test]
    fn test_record_without_known_id_is_skipped() {
        let list = PdbIdList::new(["6xyz"]);
        let record: Record =
            serde_json::from_value(record(43, "Data from 2019", &["1ABC"])).unwrap();
        assert!(record_to_entry(record, &list).is_none());
    }

    #[tokio::test]
    async fn test_fetch_catalog_follows_next_links() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/holdings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec!["6XYZ", "7ABC"]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/records"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {"hits": [record(1, "6XYZ images", &[]), record(2, "unrelated", &[])]},
                "links": {"next": format!("{}/records?page=2", server.uri())}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/records"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {"hits": [record(3, "Lysozyme", &["7abc"])]},
                "links": {}
            })))
            .mount(&server)
            .await;
        let temp_dir = TempDir::new().unwrap();
        let http = HttpClient::new(5, 5).unwrap();
        let zenodo = Zenodo::new(
            format!("{}/records", server.uri()),
            DEFAULT_QUERY,
            format!("{}/holdings", server.uri()),
        );

        let entries = zenodo.fetch_catalog(&http, temp_dir.path()).await.unwrap();

        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(entries[1].pdb.as_deref(), Some("7abc"));
    }
}
