//! Static table of connectors and the registry of enabled sources.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::{Connector, Source, SourceContext, irrmc, pdb_ids, sbgrid, zenodo};
use crate::config::SourceSettings;

/// Every connector this service knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    /// Integrated Resource for Reproducibility in Macromolecular Crystallography.
    Irrmc,
    /// SBGrid Data Bank.
    Sbgrid,
    /// Zenodo records mentioning a PDB entry.
    Zenodo,
}

impl SourceKind {
    /// All connectors, in registration order.
    pub const ALL: [Self; 3] = [Self::Irrmc, Self::Sbgrid, Self::Zenodo];

    /// Connector name used in URLs, configuration and entry keys.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Irrmc => "irrmc",
            Self::Sbgrid => "sbgrid",
            Self::Zenodo => "zenodo",
        }
    }

    /// Human-readable description.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Irrmc => "Integrated Resource for Reproducibility in Macromolecular Crystallography",
            Self::Sbgrid => "SBGrid Data Bank",
            Self::Zenodo => "Zenodo datasets linked to PDB entries",
        }
    }

    /// Looks up a connector by name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Builds the connector described by `settings`.
    #[must_use]
    pub fn build(self, settings: &SourceSettings, ctx: Arc<SourceContext>) -> Source {
        let connector = match self {
            Self::Irrmc => Connector::Irrmc(irrmc::Irrmc::new(
                settings.base_url.as_deref().unwrap_or(irrmc::DEFAULT_BASE_URL),
                settings
                    .politeness_delay_ms
                    .map_or(irrmc::DEFAULT_POLITENESS_DELAY, Duration::from_millis),
            )),
            Self::Sbgrid => Connector::Sbgrid(sbgrid::Sbgrid::new(
                settings.rsync_url.as_deref().unwrap_or(sbgrid::DEFAULT_RSYNC_URL),
            )),
            Self::Zenodo => Connector::Zenodo(zenodo::Zenodo::new(
                settings.base_url.as_deref().unwrap_or(zenodo::DEFAULT_BASE_URL),
                settings.query.as_deref().unwrap_or(zenodo::DEFAULT_QUERY),
                settings.pdb_ids_url.as_deref().unwrap_or(pdb_ids::DEFAULT_URL),
            )),
        };
        Source::new(self, connector, ctx)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(&s.to_lowercase()).ok_or_else(|| format!("Unknown source: {s}"))
    }
}

/// The enabled sources, keyed by name.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<&'static str, Arc<Source>>,
}

impl SourceRegistry {
    /// Registers the given sources.
    pub fn new(sources: impl IntoIterator<Item = Source>) -> Self {
        Self {
            sources: sources
                .into_iter()
                .map(|source| (source.name(), Arc::new(source)))
                .collect(),
        }
    }

    /// Builds every connector not disabled in `settings`.
    ///
    /// Connectors without a settings block use their defaults.
    #[must_use]
    pub fn from_settings(
        settings: &BTreeMap<String, SourceSettings>,
        ctx: &Arc<SourceContext>,
    ) -> Self {
        let defaults = SourceSettings::default();
        let sources = SourceKind::ALL.into_iter().filter_map(|kind| {
            let settings = settings.get(kind.name()).unwrap_or(&defaults);
            settings
                .enabled
                .then(|| kind.build(settings, Arc::clone(ctx)))
        });
        let registry = Self::new(sources);
        info!(sources = ?registry.names(), "sources registered");
        registry
    }

    /// Looks up a source by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Source>> {
        self.sources.get(name).cloned()
    }

    /// Returns true if `name` is a registered source.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Resolves a path selector: `*` is every source, anything else one name.
    #[must_use]
    pub fn select(&self, selector: &str) -> Option<Vec<Arc<Source>>> {
        if selector == "*" {
            return Some(self.iter().cloned().collect());
        }
        self.get(selector).map(|source| vec![source])
    }

    /// Sources in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Source>> {
        self.sources.values()
    }

    /// Registered names in order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.sources.keys().copied().collect()
    }

    /// Number of registered sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns true if no source is enabled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Loads every persisted catalog, returning the sources still without one.
    pub async fn load_saved(&self) -> Vec<Arc<Source>> {
        let mut missing = Vec::new();
        for source in self.iter() {
            match source.load_saved().await {
                Ok(true) => {}
                Ok(false) => missing.push(Arc::clone(source)),
                Err(error) => {
                    warn!(source = source.name(), error = %error, "saved catalog unreadable");
                    missing.push(Arc::clone(source));
                }
            }
        }
        missing
    }
}
