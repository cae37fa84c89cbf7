//! CLI argument definitions using clap derive macros.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use datalink::ServiceConfig;

/// Retrieve, cache and evict scientific datasets.
///
/// Serves the datalink HTTP API. Settings come from the JSON config file;
/// flags given here override it.
#[derive(Parser, Debug)]
#[command(name = "datalink-server")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Config file (defaults to ./datalink.json when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen address
    #[arg(short, long)]
    pub bind: Option<SocketAddr>,

    /// Root directory of cached data
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Directory for source catalogs and lookup caches
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

impl Args {
    /// Applies flag overrides to a loaded config.
    pub fn apply(&self, config: &mut ServiceConfig) {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir.clone_from(data_dir);
        }
        if let Some(state_dir) = &self.state_dir {
            config.state_dir.clone_from(state_dir);
        }
    }
}
