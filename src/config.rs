//! Service configuration.
//!
//! Read from a JSON file whose fields are all optional; missing fields take
//! the defaults below. Command-line flags override individual fields after
//! loading (see `cli.rs`). [`ServiceConfig::validate`] range-checks the result
//! before the service starts.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::CatalogLocation;
use crate::search::DEFAULT_RCSB_ENTRY_URL;
use crate::source::SourceKind;

/// Config file looked for in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "datalink.json";

const GIB: u64 = 1024 * 1024 * 1024;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field is out of range or malformed.
    #[error("Invalid config value for `{field}`: {value}. Expected {expected}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: String,
        /// Accepted values.
        expected: String,
    },

    /// A `sources` key names no known connector.
    #[error("Unknown source `{name}` in config. Known sources: {known}")]
    UnknownSource {
        /// The unknown key.
        name: String,
        /// Comma-separated known names.
        known: String,
    },

    /// The config file could not be read.
    #[error("could not read config {path}: {source}")]
    Io {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`ServiceConfig`].
    #[error("invalid config {path}: {source}")]
    Json {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Per-connector settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceSettings {
    /// Whether the connector is registered at all.
    pub enabled: bool,
    /// Listing or API base URL.
    pub base_url: Option<String>,
    /// rsync module URL for directory-listing connectors.
    pub rsync_url: Option<String>,
    /// Delay between listing pages, in milliseconds.
    pub politeness_delay_ms: Option<u64>,
    /// Search query for API connectors.
    pub query: Option<String>,
    /// Where to download the PDB id allow-list.
    pub pdb_ids_url: Option<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            rsync_url: None,
            politeness_delay_ms: None,
            query: None,
            pdb_ids_url: None,
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Listen address.
    pub bind: SocketAddr,
    /// Root of cached data: `<data_dir>/<user>/<source>/<id>`.
    pub data_dir: PathBuf,
    /// Source catalogs and lookup caches.
    pub state_dir: PathBuf,
    /// Dedicated directory for user catalog documents.
    ///
    /// Defaults to `<state_dir>/catalogs` unless `catalog_with_data` is set.
    pub catalog_dir: Option<PathBuf>,
    /// Store each user's document at `<data_dir>/<user>/.catalog.json`.
    pub catalog_with_data: bool,
    /// Directory of per-user token records `<user>.json`.
    ///
    /// Defaults to `<state_dir>/tokens`.
    pub tokens_dir: Option<PathBuf>,
    /// Admin key granting access to every endpoint; admin access is off when unset.
    pub admin_key: Option<String>,
    /// Seconds between reclamation runs.
    pub prune_interval_secs: u64,
    /// Free space to keep on the data volume, in GiB (0 disables space eviction).
    pub min_free_gb: u64,
    /// Age after which unpinned entries are evicted, in days (0 disables age eviction).
    pub max_age_days: u64,
    /// Inbound request timeout in seconds (uploads excluded).
    pub request_timeout_secs: u64,
    /// Whether the upload endpoint is available.
    pub upload_enabled: bool,
    /// Cumulative byte limit of one upload.
    pub upload_max_bytes: u64,
    /// How long startup recovery waits for a source catalog, in seconds.
    pub catalog_wait_secs: u64,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// HTTP read timeout in seconds (between chunks).
    pub read_timeout_secs: u64,
    /// rsync executable.
    pub rsync_path: PathBuf,
    /// RCSB entry endpoint used to augment PDB searches.
    pub pdb_metadata_url: String,
    /// Per-connector settings keyed by connector name.
    pub sources: BTreeMap<String, SourceSettings>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8100)),
            data_dir: PathBuf::from("data"),
            state_dir: PathBuf::from("state"),
            catalog_dir: None,
            catalog_with_data: false,
            tokens_dir: None,
            admin_key: None,
            prune_interval_secs: 3600,
            min_free_gb: 10,
            max_age_days: 30,
            request_timeout_secs: 30,
            upload_enabled: false,
            upload_max_bytes: 10 * GIB,
            catalog_wait_secs: 300,
            connect_timeout_secs: 30,
            read_timeout_secs: 300,
            rsync_path: PathBuf::from("rsync"),
            pdb_metadata_url: DEFAULT_RCSB_ENTRY_URL.to_string(),
            sources: BTreeMap::new(),
        }
    }
}

impl ServiceConfig {
    /// Reads and parses a config file.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be read, or a JSON error if it
    /// does not describe a [`ServiceConfig`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `path` if given, else [`DEFAULT_CONFIG_FILE`] if it exists, else defaults.
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Checks ranges and source names.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_range("prune_interval_secs", self.prune_interval_secs, 60, 7 * 24 * 3600)?;
        validate_range("min_free_gb", self.min_free_gb, 0, 1_000_000)?;
        validate_range("max_age_days", self.max_age_days, 0, 36_500)?;
        validate_range("request_timeout_secs", self.request_timeout_secs, 1, 3600)?;
        validate_range("catalog_wait_secs", self.catalog_wait_secs, 0, 86_400)?;
        validate_range("connect_timeout_secs", self.connect_timeout_secs, 1, 3600)?;
        validate_range("read_timeout_secs", self.read_timeout_secs, 1, 3600)?;
        if self.upload_max_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "upload_max_bytes",
                value: "0".to_string(),
                expected: "a positive byte count".to_string(),
            });
        }
        if self.catalog_with_data && self.catalog_dir.is_some() {
            return Err(ConfigError::Invalid {
                field: "catalog_dir",
                value: "set".to_string(),
                expected: "unset when `catalog_with_data` is true".to_string(),
            });
        }
        if let Some(key) = &self.admin_key
            && key.trim().is_empty()
        {
            return Err(ConfigError::Invalid {
                field: "admin_key",
                value: "\"\"".to_string(),
                expected: "a non-empty key or no key".to_string(),
            });
        }
        for name in self.sources.keys() {
            if SourceKind::from_name(name).is_none() {
                return Err(ConfigError::UnknownSource {
                    name: name.clone(),
                    known: SourceKind::ALL.map(SourceKind::name).join(", "),
                });
            }
        }
        Ok(())
    }

    /// Where user catalog documents are kept.
    #[must_use]
    pub fn catalog_location(&self) -> CatalogLocation {
        if self.catalog_with_data {
            CatalogLocation::WithData
        } else {
            CatalogLocation::Dedicated(
                self.catalog_dir
                    .clone()
                    .unwrap_or_else(|| self.state_dir.join("catalogs")),
            )
        }
    }

    /// Directory of per-user token records.
    #[must_use]
    pub fn tokens_dir(&self) -> PathBuf {
        self.tokens_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("tokens"))
    }
}

fn validate_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            value: value.to_string(),
            expected: format!("range {min}..={max}"),
        })
    }
}
