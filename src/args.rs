use clap::Parser;
use std::path::PathBuf;

use crate::constants::DEFAULT_REGISTRY_API_BASE_URL;

/// Matches a provider roster against the canonical location registry and
/// writes an annotated onboarding file.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Args {
    /// Provider roster CSV. Defaults to data/provider_roster.csv under the
    /// project root.
    #[arg(long)]
    pub roster_path: Option<PathBuf>,

    /// Annotated output CSV. Defaults to data/provider_roster_matched.csv.
    #[arg(long)]
    pub output_path: Option<PathBuf>,

    /// Where to export the fetched registry as CSV. Defaults to
    /// data/location_registry.csv.
    #[arg(long)]
    pub registry_csv: Option<PathBuf>,

    /// SQLite cache of registry API responses. Defaults to
    /// data/registry_cache.sqlite.
    #[arg(long)]
    pub cache_db: Option<PathBuf>,

    /// Two-column CSV (commonly used form, postal standard form) replacing
    /// the built-in street suffix dictionary.
    #[arg(long)]
    pub suffix_csv: Option<PathBuf>,

    /// Re-fetch every practice from the registry API, ignoring cached rows.
    #[arg(long, default_value_t = false)]
    pub rebuild_registry: bool,

    /// Delete the registry cache and exported registry CSV before running.
    #[arg(long, default_value_t = false)]
    pub reset_registry: bool,

    /// Never call the registry API; run from cache only.
    #[arg(long, default_value_t = false)]
    pub skip_api: bool,

    /// Concurrent registry API requests.
    #[arg(long, default_value_t = 2)]
    pub concurrency: usize,

    /// Registry API request rate cap.
    #[arg(long, default_value_t = 2)]
    pub requests_per_second: u32,

    /// Retries per practice lookup before recording an error row.
    #[arg(long, default_value_t = 5)]
    pub max_retries: u32,

    /// Cap on how many uncached practices to fetch this run.
    #[arg(long)]
    pub max_new_lookups: Option<usize>,

    /// Registry API base URL.
    #[arg(long, default_value = DEFAULT_REGISTRY_API_BASE_URL)]
    pub api_base_url: String,
}
