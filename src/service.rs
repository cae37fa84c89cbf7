//! The data-link service: request operations, startup recovery and timers.
//!
//! [`DataLinkService`] owns the local catalog, the source registry and the job
//! registry. Fetches are accepted synchronously and run in background tasks;
//! their outcome is recorded on the entry, never returned to the caller.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::recovery::{disk_usage, scan_user_dir};
use crate::catalog::{
    CatalogError, DataEntry, EntryFields, EntryKey, EntryStatus, EntryUpdate, LocalCatalog,
    UserDocument,
};
use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::jobs::{Job, JobGuard, JobInfo, JobRegistry};
use crate::prune::{self, PrunePolicy, PruneReport};
use crate::search::{PdbMetadataCache, SearchField, SearchResults, search_catalogs};
use crate::source::{
    CatalogStatus, Source, SourceCatalog, SourceContext, SourceEntry, SourceInfo, SourceRegistry,
    TransferPlan,
};
use crate::transfer::{
    CancelToken, HttpClient, ProgressFn, Rsync, TransferError, UploadWriter, fetch_http_files,
    unpack,
};

/// Result of a fetch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    /// A transfer was started.
    Started,
    /// A transfer for the entry is already running.
    AlreadyInProgress,
    /// The entry is already cached.
    AlreadyCompleted,
}

impl FetchOutcome {
    /// Message for API responses.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::Started => "transfer started",
            Self::AlreadyInProgress => "already in progress",
            Self::AlreadyCompleted => "already completed",
        }
    }
}

/// Aggregate counters for `/stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Users with at least one entry.
    pub users: usize,
    /// All entries.
    pub entries: usize,
    /// Entries being transferred.
    pub in_progress: usize,
    /// Cached entries.
    pub completed: usize,
    /// Failed entries.
    pub failed: usize,
    /// Pinned entries.
    pub in_use: usize,
    /// Sum of entry sizes in bytes.
    pub size: u64,
    /// Running jobs.
    pub jobs: usize,
    /// Free bytes on the data volume.
    pub free_space: u64,
    /// Bytes available to this process on the data volume.
    pub usable_space: u64,
}

/// An upload accepted by [`DataLinkService::begin_upload`].
///
/// Files are written with [`write_file`](Self::write_file); the session is
/// then handed back to [`DataLinkService::finish_upload`].
#[derive(Debug)]
pub struct UploadSession {
    key: EntryKey,
    guard: JobGuard,
    writer: UploadWriter,
}

impl UploadSession {
    /// Entry being uploaded into.
    #[must_use]
    pub fn key(&self) -> &EntryKey {
        &self.key
    }

    /// Streams one file into the entry directory.
    ///
    /// # Errors
    ///
    /// See [`UploadWriter::write_file`].
    pub async fn write_file<S, B, E>(&mut self, name: &str, stream: S) -> Result<PathBuf, TransferError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        self.writer.write_file(name, stream, self.guard.token()).await
    }
}

/// Longest a removal waits for a cancelled job to stop before deleting data.
const JOB_EXIT_WAIT: Duration = Duration::from_secs(10);

struct Inner {
    config: ServiceConfig,
    catalog: LocalCatalog,
    sources: SourceRegistry,
    jobs: Arc<JobRegistry>,
    context: Arc<SourceContext>,
    metadata: PdbMetadataCache,
    shutdown: CancelToken,
}

/// Cheaply cloneable handle to the service.
#[derive(Clone)]
pub struct DataLinkService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DataLinkService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLinkService")
            .field("data_dir", &self.inner.config.data_dir)
            .field("sources", &self.inner.sources.names())
            .field("jobs", &self.inner.jobs.len())
            .finish()
    }
}

impl DataLinkService {
    /// Opens the catalog and builds the enabled connectors.
    ///
    /// Nothing runs in the background until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns an internal error if directories cannot be created, the
    /// catalog cannot be opened, or the HTTP client cannot be built.
    pub async fn open(config: ServiceConfig) -> Result<Self, ServiceError> {
        tokio::fs::create_dir_all(&config.state_dir)
            .await
            .map_err(|e| CatalogError::io(&config.state_dir, e))?;
        let http = HttpClient::new(config.connect_timeout_secs, config.read_timeout_secs)?;
        let context = Arc::new(SourceContext {
            http: http.clone(),
            rsync: Rsync::new(&config.rsync_path),
            state_dir: config.state_dir.clone(),
        });
        let sources = SourceRegistry::from_settings(&config.sources, &context);
        let catalog = LocalCatalog::open(&config.data_dir, config.catalog_location()).await?;
        let metadata = PdbMetadataCache::new(http, &config.state_dir, config.pdb_metadata_url.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                catalog,
                sources,
                jobs: Arc::new(JobRegistry::new()),
                context,
                metadata,
                shutdown: CancelToken::new(),
            }),
        })
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// The local catalog.
    #[must_use]
    pub fn catalog(&self) -> &LocalCatalog {
        &self.inner.catalog
    }

    /// The enabled sources.
    #[must_use]
    pub fn sources(&self) -> &SourceRegistry {
        &self.inner.sources
    }

    /// Snapshot of running jobs.
    #[must_use]
    pub fn jobs(&self) -> Vec<JobInfo> {
        self.inner.jobs.list()
    }

    /// Returns true if a job is registered for `key`.
    #[must_use]
    pub fn has_job(&self, key: &EntryKey) -> bool {
        self.inner.jobs.contains(key)
    }

    /// Loads saved source catalogs and launches the background work: catalog
    /// refreshes for sources without one, crash recovery, then reclamation
    /// once immediately and every `prune_interval_secs`.
    pub async fn start(&self) -> JoinHandle<()> {
        for source in self.inner.sources.load_saved().await {
            info!(source = source.name(), "no saved catalog, refreshing");
            spawn_refresh(source);
        }
        let service = self.clone();
        tokio::spawn(async move {
            service.recover().await;
            service.prune_loop().await;
        })
    }

    /// Cancels background work and every running job.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.jobs.cancel_all();
    }

    async fn prune_loop(&self) {
        let period = Duration::from_secs(self.inner.config.prune_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = self.inner.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(error) = self.prune().await {
                error!(error = %error, "prune failed");
            }
        }
        debug!("prune loop stopped");
    }

    /// Runs one reclamation pass with the configured thresholds.
    ///
    /// # Errors
    ///
    /// Returns the first catalog error of the run.
    pub async fn prune(&self) -> Result<PruneReport, CatalogError> {
        let policy = PrunePolicy {
            min_free_gb: self.inner.config.min_free_gb,
            max_age_days: self.inner.config.max_age_days,
        };
        prune::prune(&self.inner.catalog, policy).await
    }

    /// Rebuilds lost user documents, then restarts interrupted work.
    pub async fn recover(&self) {
        if let Err(error) = self.rebuild_orphaned_users().await {
            error!(error = %error, "catalog rebuild failed");
        }
        self.resubmit_interrupted().await;
    }

    /// Recreates the document of every user directory that has none.
    ///
    /// Entries found on disk become `completed` with their disk usage as
    /// size. Each connector is given `catalog_wait_secs` to become ready so
    /// the declared size can be filled in.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the data root cannot be listed.
    #[instrument(skip(self))]
    pub async fn rebuild_orphaned_users(&self) -> Result<usize, CatalogError> {
        let catalog = &self.inner.catalog;
        let wait = Duration::from_secs(self.inner.config.catalog_wait_secs);
        let mut ready: HashMap<String, Option<Arc<SourceCatalog>>> = HashMap::new();
        let mut rebuilt = 0;

        for user in catalog.users_without_document().await? {
            let found = scan_user_dir(catalog.data_dir(), &user).await?;
            if found.is_empty() {
                continue;
            }
            let mut entries = Vec::with_capacity(found.len());
            for item in found {
                let source_name = item.key.source().to_string();
                if !ready.contains_key(&source_name) {
                    let remote = match self.inner.sources.get(&source_name) {
                        Some(source) => source.wait_ready(wait).await,
                        None => None,
                    };
                    ready.insert(source_name.clone(), remote);
                }
                let size_s = ready
                    .get(&source_name)
                    .and_then(Option::as_ref)
                    .and_then(|remote| remote.get(item.key.id()))
                    .map_or(0, |remote| remote.size);
                let fields = EntryFields {
                    status: Some(EntryStatus::Completed),
                    size: item.size,
                    size_s,
                    in_use: false,
                };
                entries.push(DataEntry::new(&item.key, &fields));
            }
            info!(user = %user, entries = entries.len(), "user catalog rebuilt from disk");
            rebuilt += entries.len();
            catalog.restore_entries(&user, entries).await?;
        }
        Ok(rebuilt)
    }

    /// Restarts every `in_progress` entry as a forced fetch.
    ///
    /// Entries that do not belong to a connector (uploads) cannot be resumed
    /// and are marked `failed`.
    pub async fn resubmit_interrupted(&self) {
        let interrupted: Vec<DataEntry> = self
            .inner
            .catalog
            .entries()
            .into_iter()
            .filter(|e| e.status == EntryStatus::InProgress)
            .collect();
        let wait = Duration::from_secs(self.inner.config.catalog_wait_secs);

        for entry in interrupted {
            let Ok(key) = entry.key() else {
                continue;
            };
            if self.inner.jobs.contains(&key) {
                continue;
            }
            if let Some(source) = self.inner.sources.get(key.source()) {
                let _ = source.wait_ready(wait).await;
                match self.fetch(&key, true).await {
                    Ok(outcome) => info!(entry = %key, ?outcome, "interrupted transfer resubmitted"),
                    Err(error) => {
                        warn!(entry = %key, error = %error, "could not resubmit transfer");
                        self.mark_failed(&key).await;
                    }
                }
            } else {
                info!(entry = %key, "interrupted upload marked failed");
                self.mark_failed(&key).await;
            }
        }
    }

    async fn mark_failed(&self, key: &EntryKey) {
        if let Err(error) = self
            .inner
            .catalog
            .update_entry(key, EntryUpdate::status(EntryStatus::Failed))
            .await
        {
            warn!(entry = %key, error = %error, "could not mark entry failed");
        }
    }

    fn connector_entry(&self, key: &EntryKey) -> Result<(Arc<Source>, SourceEntry), ServiceError> {
        let source = self
            .inner
            .sources
            .get(key.source())
            .ok_or_else(|| ServiceError::not_found(format!("unknown source: {}", key.source())))?;
        let remote_catalog = source.catalog().ok_or_else(|| {
            ServiceError::NotReady(format!("catalog of {} is not available yet", source.name()))
        })?;
        let remote = remote_catalog.get(key.id()).cloned().ok_or_else(|| {
            ServiceError::not_found(format!("{} has no entry {}", source.name(), key.id()))
        })?;
        Ok((source, remote))
    }

    /// Starts or resumes the transfer of an entry.
    ///
    /// Without `force`, a cached entry is left alone and a running transfer
    /// is not duplicated. With `force`, any running transfer is cancelled and
    /// replaced.
    ///
    /// # Errors
    ///
    /// Returns not-found for an unknown source or remote id, not-ready while
    /// the source catalog is missing, or an internal error if the entry cannot
    /// be recorded.
    #[instrument(skip(self, key), fields(entry = %key))]
    pub async fn fetch(&self, key: &EntryKey, force: bool) -> Result<FetchOutcome, ServiceError> {
        let (source, remote) = self.connector_entry(key)?;
        let catalog = &self.inner.catalog;

        if !force
            && catalog
                .get_entry(key)
                .is_some_and(|e| e.status == EntryStatus::Completed)
        {
            return Ok(FetchOutcome::AlreadyCompleted);
        }

        let description = format!("fetch {key}");
        let (guard, previous) = if force {
            self.inner.jobs.replace(key, &description)
        } else {
            match self.inner.jobs.try_add(key, &description) {
                Some(guard) => (guard, None),
                None => return Ok(FetchOutcome::AlreadyInProgress),
            }
        };

        self.inner.catalog.begin_entry(key, remote.size).await?;

        let plan = source.plan(&remote);
        info!(size_s = remote.size, force, "transfer accepted");
        tokio::spawn(run_transfer(
            Arc::clone(&self.inner),
            key.clone(),
            guard,
            previous,
            plan,
        ));
        Ok(FetchOutcome::Started)
    }

    /// Cancels any transfer and deletes the entry.
    ///
    /// The entry's data is deleted once the cancelled job has stopped, or
    /// after [`JOB_EXIT_WAIT`] at the latest.
    ///
    /// # Errors
    ///
    /// Returns not-found if there is no entry, or a conflict if its data
    /// cannot be deleted.
    #[instrument(skip(self, key), fields(entry = %key))]
    pub async fn remove(&self, key: &EntryKey) -> Result<(), ServiceError> {
        if let Some(job) = self.inner.jobs.remove(key) {
            info!(job = job.id, "running job cancelled for removal");
            if tokio::time::timeout(JOB_EXIT_WAIT, job.finished()).await.is_err() {
                warn!(job = job.id, "cancelled job still running, removing its data anyway");
            }
        }
        match self.inner.catalog.remove_entry(key).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ServiceError::not_found(format!("no entry {key}"))),
            Err(CatalogError::Io { path, source }) => Err(ServiceError::conflict(format!(
                "could not delete {}: {source}",
                path.display()
            ))),
            Err(error) => Err(error.into()),
        }
    }

    /// Cancels a running transfer, leaving the entry `failed`.
    ///
    /// # Errors
    ///
    /// Returns not-found if there is no entry.
    #[instrument(skip(self, key), fields(entry = %key))]
    pub async fn abort(&self, key: &EntryKey) -> Result<DataEntry, ServiceError> {
        let job = self.inner.jobs.remove(key);
        let entry = self
            .inner
            .catalog
            .get_entry(key)
            .ok_or_else(|| ServiceError::not_found(format!("no entry {key}")))?;
        if job.is_none() && entry.status != EntryStatus::InProgress {
            return Ok(entry);
        }
        let entry = self
            .inner
            .catalog
            .update_entry(key, EntryUpdate::status(EntryStatus::Failed))
            .await?;
        info!("transfer aborted");
        Ok(entry)
    }

    /// Changes the pin of a cached entry.
    ///
    /// # Errors
    ///
    /// Returns not-found if there is no entry, or a conflict unless the entry
    /// is `completed`.
    pub async fn set_in_use(&self, key: &EntryKey, in_use: bool) -> Result<DataEntry, ServiceError> {
        let entry = self
            .inner
            .catalog
            .get_entry(key)
            .ok_or_else(|| ServiceError::not_found(format!("no entry {key}")))?;
        if entry.status != EntryStatus::Completed {
            return Err(ServiceError::conflict(format!(
                "entry {key} is {}, only completed entries can be changed",
                entry.status
            )));
        }
        let update = EntryUpdate {
            in_use: Some(in_use),
            ..EntryUpdate::default()
        };
        Ok(self.inner.catalog.update_entry(key, update).await?)
    }

    /// Accepts an upload into `key`.
    ///
    /// # Errors
    ///
    /// Returns not-found when uploads are disabled, a validation error when
    /// `key` names a connector source, a conflict while the entry is busy,
    /// or an internal error if the entry cannot be recorded.
    pub async fn begin_upload(&self, key: &EntryKey) -> Result<UploadSession, ServiceError> {
        if !self.inner.config.upload_enabled {
            return Err(ServiceError::not_found("uploads are disabled"));
        }
        if self.inner.sources.contains(key.source()) {
            return Err(ServiceError::validation(format!(
                "cannot upload into connector source {}",
                key.source()
            )));
        }
        let guard = self
            .inner
            .jobs
            .try_add(key, &format!("upload {key}"))
            .ok_or_else(|| ServiceError::conflict(format!("entry {key} is busy")))?;
        self.inner.catalog.begin_entry(key, 0).await?;
        let dir = self.inner.catalog.entry_dir(key);
        Ok(UploadSession {
            key: key.clone(),
            guard,
            writer: UploadWriter::new(dir, self.inner.config.upload_max_bytes),
        })
    }

    /// Completes an upload: unpacks the received files and records the
    /// outcome on the entry.
    ///
    /// # Errors
    ///
    /// Returns `result`'s error (after marking the entry `failed`), or the
    /// first unpack failure.
    #[instrument(skip(self, session, result), fields(entry = %session.key))]
    pub async fn finish_upload(
        &self,
        session: UploadSession,
        result: Result<(), TransferError>,
    ) -> Result<DataEntry, ServiceError> {
        let UploadSession { key, guard, writer } = session;
        let result = match result {
            Ok(()) => unpack_uploads(writer.files(), guard.token()).await,
            Err(error) => Err(error),
        };
        let current = guard.finish();
        match result {
            Ok(()) => {
                let size = disk_usage(&self.inner.catalog.entry_dir(&key)).await;
                let update = EntryUpdate {
                    status: Some(EntryStatus::Completed),
                    size: Some(size),
                    size_s: Some(writer.written()),
                    ..EntryUpdate::default()
                };
                let entry = self.inner.catalog.update_entry(&key, update).await?;
                info!(bytes = writer.written(), size, "upload stored");
                Ok(entry)
            }
            Err(error) => {
                warn!(error = %error, "upload failed");
                if current {
                    self.mark_failed(&key).await;
                }
                Err(error.into())
            }
        }
    }

    /// Every user's document.
    #[must_use]
    pub fn view_all(&self) -> BTreeMap<String, UserDocument> {
        self.inner
            .catalog
            .users()
            .into_iter()
            .map(|user| {
                let document = self.inner.catalog.user_document(&user);
                (user, document)
            })
            .collect()
    }

    /// One user's document.
    ///
    /// # Errors
    ///
    /// Returns not-found if the user has no entries.
    pub fn view_user(&self, user: &str) -> Result<UserDocument, ServiceError> {
        let document = self.inner.catalog.user_document(user);
        if document.is_empty() {
            return Err(ServiceError::not_found(format!("no entries for user {user}")));
        }
        Ok(document)
    }

    /// One user's entries of one source.
    ///
    /// # Errors
    ///
    /// Returns not-found if there are none.
    pub fn view_source(&self, user: &str, source: &str) -> Result<BTreeMap<String, DataEntry>, ServiceError> {
        self.inner
            .catalog
            .user_document(user)
            .remove(source)
            .ok_or_else(|| ServiceError::not_found(format!("no {source} entries for user {user}")))
    }

    /// One entry.
    ///
    /// # Errors
    ///
    /// Returns not-found if there is no entry.
    pub fn view_entry(&self, key: &EntryKey) -> Result<DataEntry, ServiceError> {
        self.inner
            .catalog
            .get_entry(key)
            .ok_or_else(|| ServiceError::not_found(format!("no entry {key}")))
    }

    /// Aggregate counters and disk space.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let mut stats = Stats {
            users: self.inner.catalog.users().len(),
            jobs: self.inner.jobs.len(),
            ..Stats::default()
        };
        for entry in self.inner.catalog.entries() {
            stats.entries += 1;
            stats.size = stats.size.saturating_add(entry.size);
            if entry.in_use {
                stats.in_use += 1;
            }
            match entry.status {
                EntryStatus::InProgress => stats.in_progress += 1,
                EntryStatus::Completed => stats.completed += 1,
                EntryStatus::Failed => stats.failed += 1,
            }
        }
        let data_dir = self.inner.catalog.data_dir();
        stats.free_space = fs2::free_space(data_dir).unwrap_or(0);
        stats.usable_space = fs2::available_space(data_dir).unwrap_or(0);
        stats
    }

    fn select_sources(&self, selector: &str) -> Result<Vec<Arc<Source>>, ServiceError> {
        self.inner
            .sources
            .select(selector)
            .ok_or_else(|| ServiceError::not_found(format!("unknown source: {selector}")))
    }

    /// Descriptions of the selected sources (`*` for all).
    ///
    /// # Errors
    ///
    /// Returns not-found for an unknown source.
    pub fn source_info(&self, selector: &str) -> Result<Vec<SourceInfo>, ServiceError> {
        Ok(self
            .select_sources(selector)?
            .iter()
            .map(|source| source.info())
            .collect())
    }

    /// Remote catalogs of the selected sources (`*` for all ready ones).
    ///
    /// # Errors
    ///
    /// Returns not-found for an unknown source, or not-ready when no selected
    /// source has a catalog.
    pub fn source_catalogs(
        &self,
        selector: &str,
    ) -> Result<BTreeMap<&'static str, Arc<SourceCatalog>>, ServiceError> {
        let catalogs: BTreeMap<&'static str, Arc<SourceCatalog>> = self
            .select_sources(selector)?
            .iter()
            .filter_map(|source| source.catalog().map(|catalog| (source.name(), catalog)))
            .collect();
        if catalogs.is_empty() {
            return Err(ServiceError::NotReady(format!(
                "no catalog available for {selector}"
            )));
        }
        Ok(catalogs)
    }

    /// Starts background catalog refreshes; returns the sources refreshed.
    ///
    /// # Errors
    ///
    /// Returns not-found for an unknown source, or a conflict when the one
    /// selected source is already refreshing.
    pub fn refresh_sources(&self, selector: &str) -> Result<Vec<&'static str>, ServiceError> {
        let selected = self.select_sources(selector)?;
        let idle: Vec<Arc<Source>> = selected
            .iter()
            .filter(|source| source.status() != CatalogStatus::InProgress)
            .cloned()
            .collect();
        if idle.is_empty() && selector != "*" {
            return Err(ServiceError::conflict(format!(
                "catalog refresh already in progress for {selector}"
            )));
        }
        let names = idle.iter().map(|source| source.name()).collect();
        for source in idle {
            spawn_refresh(source);
        }
        Ok(names)
    }

    /// Finds catalog entries by PDB code or DOI.
    ///
    /// # Errors
    ///
    /// Returns not-ready when no source has a catalog yet.
    pub async fn search(&self, field: SearchField, value: &str) -> Result<SearchResults, ServiceError> {
        if !self.inner.sources.is_empty() && self.inner.sources.iter().all(|s| !s.is_ready()) {
            return Err(ServiceError::NotReady("no source catalog is available yet".to_string()));
        }
        let results = search_catalogs(&self.inner.sources, field, value);
        let metadata = match field {
            SearchField::Pdb => self.inner.metadata.lookup(value.trim()).await,
            SearchField::Doi => None,
        };
        Ok(SearchResults { results, metadata })
    }
}

fn spawn_refresh(source: Arc<Source>) {
    tokio::spawn(async move {
        if let Err(error) = source.refresh().await {
            warn!(source = source.name(), error = %error, "catalog refresh did not complete");
        }
    });
}

async fn unpack_uploads(files: &[PathBuf], token: &CancelToken) -> Result<(), TransferError> {
    for path in files {
        unpack::unpack_file(path, true, token).await?;
    }
    Ok(())
}

async fn execute_plan(
    context: &SourceContext,
    plan: &TransferPlan,
    dir: &Path,
    token: &CancelToken,
    progress: ProgressFn<'_>,
) -> Result<u64, TransferError> {
    let received = match plan {
        TransferPlan::Http { urls } => fetch_http_files(&context.http, urls, dir, token, progress).await?,
        TransferPlan::Rsync { remote } => context.rsync.transfer(remote, dir, token, progress).await?,
    };
    unpack::sweep(dir, token).await?;
    Ok(received)
}

/// Runs one transfer to its terminal state.
///
/// A replaced job is waited for first so two transfers never share the entry
/// directory. The outcome is only written when this job is still the
/// registered one, so a superseded or aborted transfer never overwrites newer
/// state.
async fn run_transfer(
    inner: Arc<Inner>,
    key: EntryKey,
    guard: JobGuard,
    previous: Option<Job>,
    plan: TransferPlan,
) {
    if let Some(previous) = previous {
        previous.finished().await;
    }
    let id = guard.job().id;
    let dir = inner.catalog.entry_dir(&key);
    let progress = |bytes: u64| inner.catalog.set_size(&key, bytes);
    let result = execute_plan(&inner.context, &plan, &dir, guard.token(), &progress).await;

    if !guard.finish() {
        debug!(entry = %key, job = id, "transfer superseded, outcome discarded");
        return;
    }

    let update = match &result {
        Ok(received) => {
            let size = disk_usage(&dir).await;
            info!(entry = %key, received, size, "transfer completed");
            EntryUpdate {
                status: Some(EntryStatus::Completed),
                size: Some(size),
                ..EntryUpdate::default()
            }
        }
        Err(error) => {
            warn!(entry = %key, error = %error, "transfer failed");
            EntryUpdate::status(EntryStatus::Failed)
        }
    };
    if let Err(error) = inner.catalog.update_entry(&key, update).await {
        error!(entry = %key, error = %error, "could not record transfer outcome");
    }
}
