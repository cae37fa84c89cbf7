//! Local catalog of cached entries and their lifecycle.
//!
//! The catalog is the authority on what is cached: for every entry there is a
//! directory `<data_dir>/<user>/<source>/<id>` and a record in the user's
//! document. Mutations of one user are serialised by that user's write lock,
//! which is held from the in-memory change through the document write, so a
//! document on disk always reflects a complete sequence of mutations.

mod entry;
mod error;
pub mod recovery;
mod store;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

pub use entry::{
    DataEntry, EntryFields, EntryKey, EntryStatus, EntryUpdate, MAX_NAME_LEN, now_millis,
    validate_name,
};
pub use error::CatalogError;
pub use store::{COLOCATED_DOCUMENT, CatalogLocation, UserDocument};

pub(crate) use store::list_subdirs;
use store::CatalogStore;

#[derive(Debug, Default)]
struct UserState {
    document: Mutex<UserDocument>,
    write_lock: tokio::sync::Mutex<()>,
}

impl UserState {
    fn document(&self) -> MutexGuard<'_, UserDocument> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory view of all users' catalogs backed by per-user JSON documents.
#[derive(Debug)]
pub struct LocalCatalog {
    data_dir: PathBuf,
    store: CatalogStore,
    users: DashMap<String, Arc<UserState>>,
}

impl LocalCatalog {
    /// Opens the catalog, loading every readable user document.
    ///
    /// Documents that fail to parse are skipped with a warning; their users
    /// show up in [`users_without_document`](Self::users_without_document)
    /// so the caller can rebuild them from disk.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the data or catalog directories cannot be created
    /// or listed.
    #[instrument(skip_all, fields(data_dir = %data_dir.as_ref().display()))]
    pub async fn open(
        data_dir: impl AsRef<Path>,
        location: CatalogLocation,
    ) -> Result<Self, CatalogError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let store = CatalogStore::new(data_dir.clone(), location);
        store.ensure_dirs().await?;

        let users = DashMap::new();
        for user in store.list_users().await? {
            if validate_name("user", &user).is_err() {
                warn!(user = %user, "skipping catalog document with invalid user name");
                continue;
            }
            match store.read(&user).await {
                Ok(Some(document)) => {
                    let state = UserState {
                        document: Mutex::new(document),
                        write_lock: tokio::sync::Mutex::new(()),
                    };
                    users.insert(user, Arc::new(state));
                }
                Ok(None) => {}
                Err(error) => warn!(user = %user, error = %error, "unreadable catalog document"),
            }
        }
        info!(users = users.len(), "catalog loaded");

        Ok(Self {
            data_dir,
            store,
            users,
        })
    }

    /// Root of all cached data.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Absolute directory of an entry.
    #[must_use]
    pub fn entry_dir(&self, key: &EntryKey) -> PathBuf {
        self.data_dir.join(key.relative_dir())
    }

    fn user_state(&self, user: &str) -> Arc<UserState> {
        Arc::clone(self.users.entry(user.to_string()).or_default().value())
    }

    fn existing_user_state(&self, user: &str) -> Option<Arc<UserState>> {
        self.users.get(user).map(|state| Arc::clone(state.value()))
    }

    async fn persist(&self, user: &str, state: &UserState) -> Result<(), CatalogError> {
        let snapshot = state.document().clone();
        self.store.write(user, &snapshot).await
    }

    async fn create_entry_dir(&self, key: &EntryKey) -> Result<(), CatalogError> {
        let dir = self.entry_dir(key);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CatalogError::io(&dir, e))
    }

    /// Creates the entry directory and records a new entry.
    ///
    /// An existing record for the same key is replaced. `status` defaults to
    /// `in_progress`. The directory is created under the user's write lock.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory cannot be created (no record is
    /// made), or an IO/JSON error if the document cannot be written.
    #[instrument(skip(self, fields), fields(entry = %key))]
    pub async fn add_entry(
        &self,
        key: &EntryKey,
        fields: EntryFields,
    ) -> Result<DataEntry, CatalogError> {
        let state = self.user_state(key.user());
        let _write = state.write_lock.lock().await;
        self.create_entry_dir(key).await?;
        let entry = DataEntry::new(key, &fields);
        state
            .document()
            .entry(key.source().to_string())
            .or_default()
            .insert(key.id().to_string(), entry.clone());
        self.persist(key.user(), &state).await?;
        debug!(status = %entry.status, "entry added");
        Ok(entry)
    }

    /// Marks an entry `in_progress` with declared size `size_s`, creating its
    /// directory and record when missing.
    ///
    /// An existing record keeps its size and pin.
    ///
    /// # Errors
    ///
    /// Same as [`add_entry`](Self::add_entry).
    #[instrument(skip(self), fields(entry = %key))]
    pub async fn begin_entry(&self, key: &EntryKey, size_s: u64) -> Result<DataEntry, CatalogError> {
        let state = self.user_state(key.user());
        let _write = state.write_lock.lock().await;
        self.create_entry_dir(key).await?;
        let entry = {
            let mut document = state.document();
            let ids = document.entry(key.source().to_string()).or_default();
            match ids.get_mut(key.id()) {
                Some(entry) => {
                    entry.apply(&EntryUpdate {
                        status: Some(EntryStatus::InProgress),
                        size_s: Some(size_s),
                        ..EntryUpdate::default()
                    });
                    entry.clone()
                }
                None => {
                    let fields = EntryFields {
                        size_s,
                        ..EntryFields::default()
                    };
                    let entry = DataEntry::new(key, &fields);
                    ids.insert(key.id().to_string(), entry.clone());
                    entry
                }
            }
        };
        self.persist(key.user(), &state).await?;
        debug!(size_s, "entry in progress");
        Ok(entry)
    }

    /// Returns a copy of the entry, if present.
    #[must_use]
    pub fn get_entry(&self, key: &EntryKey) -> Option<DataEntry> {
        let state = self.existing_user_state(key.user())?;
        let document = state.document();
        document.get(key.source())?.get(key.id()).cloned()
    }

    /// Applies `update` to an existing entry and persists the document.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::NotFound`] if there is no such entry, or an
    /// IO/JSON error if the document cannot be written.
    #[instrument(skip(self, update), fields(entry = %key))]
    pub async fn update_entry(
        &self,
        key: &EntryKey,
        update: EntryUpdate,
    ) -> Result<DataEntry, CatalogError> {
        let not_found = || CatalogError::NotFound {
            key: key.to_string(),
        };
        let state = self.existing_user_state(key.user()).ok_or_else(not_found)?;
        let _write = state.write_lock.lock().await;
        let updated = {
            let mut document = state.document();
            let entry = document
                .get_mut(key.source())
                .and_then(|ids| ids.get_mut(key.id()))
                .ok_or_else(not_found)?;
            entry.apply(&update);
            entry.clone()
        };
        self.persist(key.user(), &state).await?;
        debug!(status = %updated.status, size = updated.size, "entry updated");
        Ok(updated)
    }

    /// Records transfer progress in memory only.
    ///
    /// The value reaches disk with the next persisted mutation of the user.
    pub fn set_size(&self, key: &EntryKey, size: u64) {
        let Some(state) = self.existing_user_state(key.user()) else {
            return;
        };
        let mut document = state.document();
        if let Some(entry) = document
            .get_mut(key.source())
            .and_then(|ids| ids.get_mut(key.id()))
        {
            entry.size = size;
        }
    }

    /// Deletes an entry's directory and record, cascading to empty containers.
    ///
    /// Order: entry directory, then the source directory if no other entries
    /// remain, then the user directory and document if no other sources
    /// remain. Records change only after every directory is gone, and are put
    /// back if the document cannot be written. Any failing step aborts the
    /// removal.
    ///
    /// Returns `Ok(false)` if there was no such entry.
    ///
    /// # Errors
    ///
    /// Returns an IO error for the first directory that cannot be deleted, or
    /// an IO/JSON error if the document cannot be written or deleted.
    pub async fn remove_entry(&self, key: &EntryKey) -> Result<bool, CatalogError> {
        self.remove_entry_if(key, |_| true).await
    }

    /// Like [`remove_entry`](Self::remove_entry), but only if `predicate`
    /// holds for the entry as it is when the user's write lock is taken.
    ///
    /// Returns `Ok(false)` if there was no such entry or the predicate failed.
    ///
    /// # Errors
    ///
    /// Same as [`remove_entry`](Self::remove_entry).
    #[instrument(skip(self, predicate), fields(entry = %key))]
    pub async fn remove_entry_if(
        &self,
        key: &EntryKey,
        predicate: impl FnOnce(&DataEntry) -> bool,
    ) -> Result<bool, CatalogError> {
        let Some(state) = self.existing_user_state(key.user()) else {
            return Ok(false);
        };
        let _write = state.write_lock.lock().await;
        let (source_empty, user_empty) = {
            let document = state.document();
            let Some(ids) = document.get(key.source()) else {
                return Ok(false);
            };
            if !ids.get(key.id()).is_some_and(predicate) {
                return Ok(false);
            }
            let source_empty = ids.len() == 1;
            (source_empty, source_empty && document.len() == 1)
        };

        remove_dir_tree(&self.entry_dir(key)).await?;
        let user_dir = self.data_dir.join(key.user());
        if source_empty {
            remove_dir_tree(&user_dir.join(key.source())).await?;
        }
        if user_empty {
            remove_dir_tree(&user_dir).await?;
            self.store.delete(key.user()).await?;
        }

        let removed = {
            let mut document = state.document();
            let removed = document
                .get_mut(key.source())
                .and_then(|ids| ids.remove(key.id()));
            if source_empty {
                document.remove(key.source());
            }
            removed
        };
        if !user_empty
            && let Err(error) = self.persist(key.user(), &state).await
        {
            if let Some(entry) = removed {
                state
                    .document()
                    .entry(key.source().to_string())
                    .or_default()
                    .insert(key.id().to_string(), entry);
            }
            return Err(error);
        }
        info!("entry removed");
        Ok(true)
    }

    /// Inserts already-built entries (used when rebuilding a lost document).
    ///
    /// # Errors
    ///
    /// Returns an IO/JSON error if the document cannot be written.
    pub async fn restore_entries(
        &self,
        user: &str,
        entries: Vec<DataEntry>,
    ) -> Result<(), CatalogError> {
        validate_name("user", user)?;
        let state = self.user_state(user);
        let _write = state.write_lock.lock().await;
        {
            let mut document = state.document();
            for entry in entries {
                document
                    .entry(entry.source.clone())
                    .or_default()
                    .insert(entry.id.clone(), entry);
            }
        }
        self.persist(user, &state).await
    }

    /// All entries of all users.
    #[must_use]
    pub fn entries(&self) -> Vec<DataEntry> {
        let states: Vec<Arc<UserState>> = self
            .users
            .iter()
            .map(|state| Arc::clone(state.value()))
            .collect();
        let mut entries: Vec<DataEntry> = states
            .iter()
            .flat_map(|state| {
                state
                    .document()
                    .values()
                    .flat_map(BTreeMap::values)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        entries.sort_by(|a, b| (&a.user, &a.source, &a.id).cmp(&(&b.user, &b.source, &b.id)));
        entries
    }

    /// Snapshot of one user's document (empty if unknown).
    #[must_use]
    pub fn user_document(&self, user: &str) -> UserDocument {
        self.existing_user_state(user)
            .map(|state| state.document().clone())
            .unwrap_or_default()
    }

    /// Users that currently have at least one entry.
    #[must_use]
    pub fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .users
            .iter()
            .filter(|state| !state.value().document().is_empty())
            .map(|state| state.key().clone())
            .collect();
        users.sort();
        users
    }

    /// User directories under the data root with no loaded document.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the data root cannot be listed.
    pub async fn users_without_document(&self) -> Result<Vec<String>, CatalogError> {
        let mut orphaned = Vec::new();
        for user in list_subdirs(&self.data_dir).await? {
            if validate_name("user", &user).is_err() {
                continue;
            }
            let loaded = self
                .existing_user_state(&user)
                .is_some_and(|state| !state.document().is_empty());
            if !loaded {
                orphaned.push(user);
            }
        }
        Ok(orphaned)
    }
}

async fn remove_dir_tree(path: &Path) -> Result<(), CatalogError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CatalogError::io(path, e)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tempfile::TempDir;

    async fn open(temp_dir: &TempDir) -> LocalCatalog {
        LocalCatalog::open(
            temp_dir.path().join("data"),
            CatalogLocation::Dedicated(temp_dir.path().join("catalogs")),
        )
        .await
        .unwrap()
    }

    fn key(user: &str, source: &str, id: &str) -> EntryKey {
        EntryKey::new(user, source, id).unwrap()
    }

    #[tokio::test]
    async fn test_add_entry_creates_directory_and_defaults_to_in_progress() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = open(&temp_dir).await;
        let key = key("alice", "sbgrid", "abc123");

        let entry = catalog.add_entry(&key, EntryFields::default()).await.unwrap();

        assert_eq!(entry.status, EntryStatus::InProgress);
        assert!(catalog.entry_dir(&key).is_dir());
        assert_eq!(catalog.get_entry(&key), Some(entry));
    }

    #[tokio::test]
    async fn test_update_entry_refreshes_updated_and_persists() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = open(&temp_dir).await;
        let key = key("alice", "sbgrid", "abc123");
        let added = catalog.add_entry(&key, EntryFields::default()).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let updated = catalog
            .update_entry(&key, EntryUpdate::status(EntryStatus::Completed))
            .await
            .unwrap();

        assert_eq!(updated.status, EntryStatus::Completed);
        assert!(updated.updated > added.updated);
        let reopened = open(&temp_dir).await;
        assert_eq!(reopened.get_entry(&key), Some(updated));
    }

    #[tokio::test]
    async fn test_update_missing_entry_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = open(&temp_dir).await;
        let result = catalog
            .update_entry(&key("alice", "sbgrid", "nope"), EntryUpdate::default())
            .await;
        assert!(matches!(result, Err(CatalogError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_set_size_is_memory_only_until_next_persist() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = open(&temp_dir).await;
        let key = key("alice", "sbgrid", "abc123");
        catalog.add_entry(&key, EntryFields::default()).await.unwrap();

        catalog.set_size(&key, 500);
        assert_eq!(catalog.get_entry(&key).unwrap().size, 500);
        assert_eq!(open(&temp_dir).await.get_entry(&key).unwrap().size, 0);

        catalog
            .update_entry(&key, EntryUpdate::status(EntryStatus::Failed))
            .await
            .unwrap();
        assert_eq!(open(&temp_dir).await.get_entry(&key).unwrap().size, 500);
    }

    #[tokio::test]
    async fn test_remove_entry_keeps_siblings() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = open(&temp_dir).await;
        let first = key("alice", "sbgrid", "1");
        let second = key("alice", "sbgrid", "2");
        catalog.add_entry(&first, EntryFields::default()).await.unwrap();
        catalog.add_entry(&second, EntryFields::default()).await.unwrap();

        assert!(catalog.remove_entry(&first).await.unwrap());

        assert!(!catalog.entry_dir(&first).exists());
        assert!(catalog.entry_dir(&second).exists());
        assert!(catalog.get_entry(&second).is_some());
    }

    #[tokio::test]
    async fn test_remove_last_entry_cascades_to_user() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = open(&temp_dir).await;
        let key = key("alice", "sbgrid", "abc123");
        catalog.add_entry(&key, EntryFields::default()).await.unwrap();

        assert!(catalog.remove_entry(&key).await.unwrap());

        assert!(!temp_dir.path().join("data/alice").exists());
        assert!(!temp_dir.path().join("catalogs/alice.json").exists());
        assert!(catalog.users().is_empty());
        assert!(!catalog.remove_entry(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_colocated_document_survives_sibling_removal() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = LocalCatalog::open(temp_dir.path(), CatalogLocation::WithData)
            .await
            .unwrap();
        let keep = key("bob", "zenodo", "1");
        let drop = key("bob", "irrmc", "2");
        catalog.add_entry(&keep, EntryFields::default()).await.unwrap();
        catalog.add_entry(&drop, EntryFields::default()).await.unwrap();

        catalog.remove_entry(&drop).await.unwrap();

        assert!(temp_dir.path().join("bob").join(COLOCATED_DOCUMENT).exists());
        assert!(!temp_dir.path().join("bob/irrmc").exists());
    }

    #[tokio::test]
    async fn test_users_without_document_lists_orphaned_directories() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = open(&temp_dir).await;
        catalog
            .add_entry(&key("alice", "sbgrid", "1"), EntryFields::default())
            .await
            .unwrap();
        std::fs::create_dir_all(temp_dir.path().join("data/carol/sbgrid/9")).unwrap();

        assert_eq!(catalog.users_without_document().await.unwrap(), vec!["carol"]);
    }

    /// Queues a removal of `first`, then `op`, behind alice's write lock and
    /// releases the lock once both wait on it.
    async fn queue_behind_removal<F>(catalog: &Arc<LocalCatalog>, first: &EntryKey, op: F)
    where
        F: Future<Output = Result<DataEntry, CatalogError>> + Send + 'static,
    {
        let state = catalog.user_state("alice");
        let held = state.write_lock.lock().await;
        let removal = {
            let catalog = Arc::clone(catalog);
            let first = first.clone();
            tokio::spawn(async move { catalog.remove_entry(&first).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let addition = tokio::spawn(op);
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert!(removal.await.unwrap().unwrap());
        addition.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_add_entry_racing_sibling_removal_keeps_directory() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = Arc::new(open(&temp_dir).await);
        let first = key("alice", "sbgrid", "1");
        let second = key("alice", "sbgrid", "2");
        catalog.add_entry(&first, EntryFields::default()).await.unwrap();

        let op = {
            let catalog = Arc::clone(&catalog);
            let second = second.clone();
            async move { catalog.add_entry(&second, EntryFields::default()).await }
        };
        queue_behind_removal(&catalog, &first, op).await;

        assert!(catalog.get_entry(&first).is_none());
        assert!(catalog.get_entry(&second).is_some());
        assert!(catalog.entry_dir(&second).is_dir());
    }

    #[tokio::test]
    async fn test_begin_entry_racing_sibling_removal_keeps_directory() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = Arc::new(open(&temp_dir).await);
        let first = key("alice", "sbgrid", "1");
        let second = key("alice", "sbgrid", "2");
        catalog.add_entry(&first, EntryFields::default()).await.unwrap();

        let op = {
            let catalog = Arc::clone(&catalog);
            let second = second.clone();
            async move { catalog.begin_entry(&second, 700).await }
        };
        queue_behind_removal(&catalog, &first, op).await;

        assert_eq!(catalog.get_entry(&second).unwrap().size_s, 700);
        assert!(catalog.entry_dir(&second).is_dir());
    }

    #[tokio::test]
    async fn test_begin_entry_resets_existing_record_to_in_progress() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = open(&temp_dir).await;
        let key = key("alice", "sbgrid", "abc123");
        let fields = EntryFields {
            status: Some(EntryStatus::Failed),
            size: 40,
            size_s: 100,
            in_use: false,
        };
        catalog.add_entry(&key, fields).await.unwrap();

        let entry = catalog.begin_entry(&key, 250).await.unwrap();

        assert_eq!(entry.status, EntryStatus::InProgress);
        assert_eq!(entry.size, 40);
        assert_eq!(entry.size_s, 250);
        assert_eq!(open(&temp_dir).await.get_entry(&key), Some(entry));
    }

    /// Puts a directory where alice's document lives so it can be neither
    /// rewritten nor deleted.
    fn block_document(temp_dir: &TempDir) {
        let document = temp_dir.path().join("catalogs/alice.json");
        std::fs::remove_file(&document).unwrap();
        std::fs::create_dir_all(document.join("blocked")).unwrap();
    }

    #[tokio::test]
    async fn test_failed_document_delete_keeps_record() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = open(&temp_dir).await;
        let key = key("alice", "sbgrid", "1");
        catalog.add_entry(&key, EntryFields::default()).await.unwrap();
        block_document(&temp_dir);

        let result = catalog.remove_entry(&key).await;

        assert!(matches!(result, Err(CatalogError::Io { .. })), "{result:?}");
        assert!(catalog.get_entry(&key).is_some());
        assert_eq!(catalog.users(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_document_write_restores_record() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = open(&temp_dir).await;
        let removed = key("alice", "sbgrid", "1");
        let kept = key("alice", "zenodo", "2");
        catalog.add_entry(&removed, EntryFields::default()).await.unwrap();
        catalog.add_entry(&kept, EntryFields::default()).await.unwrap();
        block_document(&temp_dir);

        let result = catalog.remove_entry(&removed).await;

        assert!(result.is_err());
        assert!(catalog.get_entry(&removed).is_some());
        assert!(catalog.get_entry(&kept).is_some());
    }
}
