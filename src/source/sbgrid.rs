//! SBGrid Data Bank connector (rsync module listing).

use tracing::{info, instrument};

use super::{SourceEntry, SourceError, TransferPlan};
use crate::transfer::rsync::parse_listing;
use crate::transfer::{CancelToken, Rsync};

/// Default rsync module holding every dataset.
pub const DEFAULT_RSYNC_URL: &str = "rsync://data.sbgrid.org/10.15785/SBGRID/";

/// DOI prefix of SBGrid datasets.
pub const DOI_PREFIX: &str = "10.15785/SBGRID";

/// Directory-listing connector.
#[derive(Debug, Clone)]
pub struct Sbgrid {
    module: String,
}

impl Sbgrid {
    /// Lists and mirrors datasets below `module` (a trailing `/` is added).
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        let mut module = module.into();
        if !module.ends_with('/') {
            module.push('/');
        }
        Self { module }
    }

    /// Lists the module and sums file sizes per top-level directory.
    ///
    /// # Errors
    ///
    /// Returns a transfer error if rsync cannot be run or exits non-zero.
    #[instrument(skip(self, rsync), fields(module = %self.module))]
    pub async fn fetch_catalog(&self, rsync: &Rsync) -> Result<Vec<SourceEntry>, SourceError> {
        let listing = rsync.list(&self.module, &CancelToken::new()).await?;
        let entries = entries_from_listing(&listing);
        info!(entries = entries.len(), "module listed");
        Ok(entries)
    }

    /// Mirrors the entry's directory.
    #[must_use]
    pub fn plan(&self, entry: &SourceEntry) -> TransferPlan {
        TransferPlan::Rsync {
            remote: format!("{}{}/", self.module, entry.id),
        }
    }
}

/// Turns raw `rsync --list-only -r` output into catalog entries.
#[must_use]
pub fn entries_from_listing(listing: &str) -> Vec<SourceEntry> {
    parse_listing(listing)
        .into_iter()
        .map(|(id, size)| SourceEntry {
            doi: Some(format!("{DOI_PREFIX}/{id}")),
            name: id.clone(),
            files: vec![format!("{id}/")],
            pdb: None,
            size,
            id,
        })
        .collect()
}
