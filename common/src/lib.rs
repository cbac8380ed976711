//! Core engine for the `rput` tools - one-directional synchronization of
//! changed files from a source tree to a mirror.
//!
//! A run walks the source through a [`provider::SyncProvider`], decides per
//! entry whether it changed (against a persistent baseline store or by
//! cross-statting the destination) and streams the changed entries across.
//! Nothing is ever deleted from the destination and the two trees are never
//! merged; the source always wins.

pub mod baseline;
pub mod config;
pub mod detect;
pub mod execute;
pub mod glob;
pub mod local;
pub mod provider;
pub mod testutils;
pub mod walk;

pub use config::{Job, OutputConfig, load_jobs};
pub use detect::{ChangeDetector, Plan, PlanItem, SyncVerdict, cross_stat, plan};
pub use execute::{Settings as SyncSettings, Summary, SyncMode, execute};
pub use glob::{IgnoreSet, PatternList, glob_match};
pub use local::LocalFs;
pub use provider::{DirEntry, EntryKind, ProviderError, Stat, SyncProvider, TreeEntry};
pub use walk::{walk, walk_select};

pub use tokio_util::sync::CancellationToken;

/// Sets up logging per the output config, runs `func` to completion on a
/// current-thread runtime and prints the summary when requested.
///
/// The engine is deliberately sequential - one entry, one chunk in flight -
/// so a single-threaded runtime is all it needs. Returns `None` on error
/// (already reported unless quiet); callers translate that into their exit
/// code.
pub fn run<F, Fut, SummaryT>(output: &OutputConfig, func: F) -> Option<SummaryT>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<SummaryT>>,
    SummaryT: std::fmt::Display,
{
    let default_level = if output.quiet {
        "off"
    } else {
        match output.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to create the runtime: {error}");
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary {
                println!("{}", &summary);
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                tracing::error!("{:#}", error);
            }
            None
        }
    }
}
