//! Local catalog entry types.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::CatalogError;

/// Maximum length of a user, source or id component.
pub const MAX_NAME_LEN: usize = 128;

/// Lifecycle state of a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// A transfer or upload is running (or was running when the process stopped).
    InProgress,
    /// Data is fully on disk and unpacked.
    Completed,
    /// The last transfer failed or was aborted.
    Failed,
}

impl EntryStatus {
    /// Returns the serialized string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid entry status: {s}")),
        }
    }
}

/// Identifies one cached entry: `(user, source, id)`.
///
/// Every component is validated on construction so it can be used directly
/// as a path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    user: String,
    source: String,
    id: String,
}

impl EntryKey {
    /// Validates and builds a key.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidName`] if any component is empty, longer
    /// than [`MAX_NAME_LEN`], `.`/`..`, or contains characters outside
    /// `[A-Za-z0-9._-]` (the first character must be alphanumeric).
    pub fn new(
        user: impl Into<String>,
        source: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<Self, CatalogError> {
        let user = user.into();
        let source = source.into();
        let id = id.into();
        validate_name("user", &user)?;
        validate_name("source", &source)?;
        validate_name("id", &id)?;
        Ok(Self { user, source, id })
    }

    /// Owning user.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Connector name (or an upload-only source name).
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Remote entry id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Directory of the entry relative to the data root: `user/source/id`.
    #[must_use]
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(&self.user).join(&self.source).join(&self.id)
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user, self.source, self.id)
    }
}

/// Checks one name component.
///
/// # Errors
///
/// Returns [`CatalogError::InvalidName`] naming `kind` when `value` is unusable.
pub fn validate_name(kind: &'static str, value: &str) -> Result<(), CatalogError> {
    let invalid = || CatalogError::InvalidName {
        kind,
        value: value.to_string(),
    };
    if value.is_empty() || value.len() > MAX_NAME_LEN || value == "." || value == ".." {
        return Err(invalid());
    }
    let mut chars = value.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid());
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return Err(invalid());
    }
    Ok(())
}

/// One cached dataset as stored in a user's catalog document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    /// Owning user.
    pub user: String,
    /// Source name.
    pub source: String,
    /// Remote entry id.
    pub id: String,
    /// Directory relative to the data root, always `user/source/id`.
    pub dir: String,
    /// Lifecycle state.
    pub status: EntryStatus,
    /// Bytes on disk (progress while in progress, disk usage once completed).
    pub size: u64,
    /// Declared size from the source catalog.
    pub size_s: u64,
    /// Pinned entries are never evicted.
    #[serde(rename = "inUse")]
    pub in_use: bool,
    /// Last modification, milliseconds since the Unix epoch.
    pub updated: u64,
}

impl DataEntry {
    /// Builds a fresh entry for `key`.
    #[must_use]
    pub fn new(key: &EntryKey, fields: &EntryFields) -> Self {
        Self {
            user: key.user.clone(),
            source: key.source.clone(),
            id: key.id.clone(),
            dir: key.relative_dir().to_string_lossy().into_owned(),
            status: fields.status.unwrap_or(EntryStatus::InProgress),
            size: fields.size,
            size_s: fields.size_s,
            in_use: fields.in_use,
            updated: now_millis(),
        }
    }

    /// Applies the set fields of `update` and refreshes `updated`.
    pub fn apply(&mut self, update: &EntryUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(size) = update.size {
            self.size = size;
        }
        if let Some(size_s) = update.size_s {
            self.size_s = size_s;
        }
        if let Some(in_use) = update.in_use {
            self.in_use = in_use;
        }
        self.updated = now_millis();
    }

    /// Rebuilds the key of this entry.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidName`] if the stored names were tampered with.
    pub fn key(&self) -> Result<EntryKey, CatalogError> {
        EntryKey::new(&self.user, &self.source, &self.id)
    }
}

/// Initial field values for [`LocalCatalog::add_entry`](super::LocalCatalog::add_entry).
#[derive(Debug, Clone, Default)]
pub struct EntryFields {
    /// Defaults to [`EntryStatus::InProgress`].
    pub status: Option<EntryStatus>,
    /// Bytes already on disk.
    pub size: u64,
    /// Declared size.
    pub size_s: u64,
    /// Initial pin state.
    pub in_use: bool,
}

/// Partial update for [`LocalCatalog::update_entry`](super::LocalCatalog::update_entry).
#[derive(Debug, Clone, Default)]
pub struct EntryUpdate {
    /// New lifecycle state.
    pub status: Option<EntryStatus>,
    /// New on-disk size.
    pub size: Option<u64>,
    /// New declared size.
    pub size_s: Option<u64>,
    /// New pin state.
    pub in_use: Option<bool>,
}

impl EntryUpdate {
    /// Update that only changes the status.
    #[must_use]
    pub fn status(status: EntryStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
