//! On-disk catalog documents.
//!
//! Each user has one JSON document mapping `source -> id -> entry`. The
//! document lives either in a dedicated catalog directory or inside the
//! user's data directory, and is always replaced atomically through a
//! temporary file and a rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{CatalogError, DataEntry};
use crate::fs_util::{read_optional, write_atomic};

/// File name of a co-located catalog document inside `<data_dir>/<user>/`.
pub const COLOCATED_DOCUMENT: &str = ".catalog.json";

/// One user's entries: `source -> id -> entry`.
pub type UserDocument = BTreeMap<String, BTreeMap<String, DataEntry>>;

/// Where catalog documents are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogLocation {
    /// `<dir>/<user>.json`
    Dedicated(PathBuf),
    /// `<data_dir>/<user>/.catalog.json`
    WithData,
}

#[derive(Debug, Clone)]
pub(crate) struct CatalogStore {
    data_dir: PathBuf,
    location: CatalogLocation,
}

impl CatalogStore {
    pub(crate) fn new(data_dir: PathBuf, location: CatalogLocation) -> Self {
        Self { data_dir, location }
    }

    pub(crate) fn document_path(&self, user: &str) -> PathBuf {
        match &self.location {
            CatalogLocation::Dedicated(dir) => dir.join(format!("{user}.json")),
            CatalogLocation::WithData => self.data_dir.join(user).join(COLOCATED_DOCUMENT),
        }
    }

    pub(crate) async fn ensure_dirs(&self) -> Result<(), CatalogError> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| CatalogError::io(&self.data_dir, e))?;
        if let CatalogLocation::Dedicated(dir) = &self.location {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| CatalogError::io(dir, e))?;
        }
        Ok(())
    }

    /// Reads a user's document; `Ok(None)` when it does not exist.
    pub(crate) async fn read(&self, user: &str) -> Result<Option<UserDocument>, CatalogError> {
        let path = self.document_path(user);
        let Some(content) = read_optional(&path)
            .await
            .map_err(|e| CatalogError::io(&path, e))?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| CatalogError::json(&path, e))
    }

    /// Atomically replaces a user's document.
    pub(crate) async fn write(&self, user: &str, document: &UserDocument) -> Result<(), CatalogError> {
        let path = self.document_path(user);
        let content =
            serde_json::to_vec_pretty(document).map_err(|e| CatalogError::json(&path, e))?;
        write_atomic(&path, &content)
            .await
            .map_err(|e| CatalogError::io(&path, e))?;
        debug!(user, path = %path.display(), "catalog document written");
        Ok(())
    }

    /// Deletes a user's document if present.
    pub(crate) async fn delete(&self, user: &str) -> Result<(), CatalogError> {
        let path = self.document_path(user);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CatalogError::io(&path, e)),
        }
    }

    /// Users that have a document on disk.
    pub(crate) async fn list_users(&self) -> Result<Vec<String>, CatalogError> {
        let mut users = Vec::new();
        match &self.location {
            CatalogLocation::Dedicated(dir) => {
                let mut entries = tokio::fs::read_dir(dir)
                    .await
                    .map_err(|e| CatalogError::io(dir, e))?;
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| CatalogError::io(dir, e))?
                {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "json")
                        && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                    {
                        users.push(stem.to_string());
                    }
                }
            }
            CatalogLocation::WithData => {
                for user in list_subdirs(&self.data_dir).await? {
                    if tokio::fs::try_exists(self.document_path(&user))
                        .await
                        .unwrap_or(false)
                    {
                        users.push(user);
                    }
                }
            }
        }
        users.sort();
        Ok(users)
    }
}

/// Names of the immediate subdirectories of `dir` (empty if `dir` is missing).
pub(crate) async fn list_subdirs(dir: &Path) -> Result<Vec<String>, CatalogError> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(CatalogError::io(dir, e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CatalogError::io(dir, e))?
    {
        let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
        if is_dir && let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::catalog::{EntryFields, EntryKey};
    use tempfile::TempDir;

    fn document() -> UserDocument {
        let key = EntryKey::new("alice", "sbgrid", "abc123").unwrap();
        let entry = DataEntry::new(&key, &EntryFields::default());
        let mut ids = BTreeMap::new();
        ids.insert("abc123".to_string(), entry);
        let mut doc = UserDocument::new();
        doc.insert("sbgrid".to_string(), ids);
        doc
    }

    #[test]
    fn test_document_path_for_each_location() {
        let dedicated = CatalogStore::new(
            PathBuf::from("/data"),
            CatalogLocation::Dedicated(PathBuf::from("/state/catalogs")),
        );
        assert_eq!(
            dedicated.document_path("alice"),
            PathBuf::from("/state/catalogs/alice.json")
        );
        let colocated = CatalogStore::new(PathBuf::from("/data"), CatalogLocation::WithData);
        assert_eq!(
            colocated.document_path("alice"),
            PathBuf::from("/data/alice/.catalog.json")
        );
    }

    #[tokio::test]
    async fn test_write_then_read_document() {
        let temp_dir = TempDir::new().unwrap();
        let store = CatalogStore::new(
            temp_dir.path().join("data"),
            CatalogLocation::Dedicated(temp_dir.path().join("catalogs")),
        );
        store.ensure_dirs().await.unwrap();

        store.write("alice", &document()).await.unwrap();
        let read = store.read("alice").await.unwrap().unwrap();
        assert_eq!(read, document());
        assert!(!temp_dir.path().join("catalogs/alice.json.tmp").exists());
        assert_eq!(store.list_users().await.unwrap(), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_read_missing_document_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = CatalogStore::new(temp_dir.path().to_path_buf(), CatalogLocation::WithData);
        assert!(store.read("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_corrupt_document_is_json_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = CatalogStore::new(temp_dir.path().to_path_buf(), CatalogLocation::WithData);
        std::fs::create_dir_all(temp_dir.path().join("bob")).unwrap();
        std::fs::write(store.document_path("bob"), b"{not json").unwrap();
        assert!(matches!(
            store.read("bob").await,
            Err(CatalogError::Json { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_users_colocated_requires_document() {
        let temp_dir = TempDir::new().unwrap();
        let store = CatalogStore::new(temp_dir.path().to_path_buf(), CatalogLocation::WithData);
        std::fs::create_dir_all(temp_dir.path().join("carol")).unwrap();
        store.write("dave", &document()).await.unwrap();
        assert_eq!(store.list_users().await.unwrap(), vec!["dave"]);
    }
}
