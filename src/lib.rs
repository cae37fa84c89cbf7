//! Datalink Core Library
//!
//! A retrieval and caching service for remote scientific datasets. Entries
//! are mirrored on demand from several heterogeneous repositories into a
//! per-user local cache, with resumable transfers, automatic archive
//! unpacking, crash recovery and disk-quota-driven eviction.
//!
//! # Architecture
//!
//! - [`source`] - Remote repository connectors and their catalogs
//! - [`catalog`] - Per-user local catalog and entry lifecycle
//! - [`transfer`] - HTTP and rsync transfers, unpacking and uploads
//! - [`jobs`] - Registry of running transfers and their cancellation tokens
//! - [`prune`] - Age and free-space driven eviction
//! - [`search`] - Cross-source lookup with PDB metadata
//! - [`service`] - Operations, startup recovery and timers
//! - [`api`] - HTTP API over the service

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
mod fs_util;
pub mod jobs;
pub mod prune;
pub mod search;
pub mod service;
pub mod source;
pub mod transfer;
mod user_agent;

// Re-export commonly used types
pub use catalog::{CatalogError, DataEntry, EntryKey, EntryStatus, LocalCatalog};
pub use config::{ConfigError, ServiceConfig, SourceSettings};
pub use error::ServiceError;
pub use service::{DataLinkService, FetchOutcome, Stats};
pub use source::{SourceKind, SourceRegistry};
pub use transfer::{CancelToken, HttpClient, TransferError};
