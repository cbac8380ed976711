//! Job configuration and output settings

use anyhow::Context;

use crate::execute::DEFAULT_CHUNK_SIZE;

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

/// One sync job from the config file.
///
/// `ignore` excludes entries from a full-tree walk; `select` switches the
/// job to the inclusion-pattern walk instead. The two are mutually
/// exclusive. A job with a `baseline` path detects changes against its
/// record store, a job without one cross-stats the destination.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Job {
    #[serde(default)]
    pub label: String,
    pub source: std::path::PathBuf,
    pub destination: std::path::PathBuf,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub select: Option<Vec<String>>,
    #[serde(default)]
    pub follow_links: bool,
    #[serde(default)]
    pub baseline: Option<std::path::PathBuf>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Job {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source.as_os_str().is_empty() {
            anyhow::bail!("source must not be empty");
        }
        if self.destination.as_os_str().is_empty() {
            anyhow::bail!("destination must not be empty");
        }
        if self.select.is_some() && !self.ignore.is_empty() {
            anyhow::bail!("\"ignore\" and \"select\" are mutually exclusive");
        }
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be non-zero");
        }
        Ok(())
    }
}

/// Loads and validates the job array from a JSON config file.
pub fn load_jobs(path: &std::path::Path) -> anyhow::Result<Vec<Job>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {path:?}"))?;
    let jobs: Vec<Job> = serde_json::from_str(&content)
        .with_context(|| format!("cannot parse config file {path:?}"))?;
    for job in &jobs {
        job.validate()
            .with_context(|| format!("invalid job {:?} in {path:?}", job.label))?;
    }
    Ok(jobs)
}

/// Starter config written by the template action.
pub const TEMPLATE: &str = r#"[
  {
    "label": "",
    "source": ".",
    "destination": "/tmp/mirror",
    "ignore": ["*.o", ".git/", "build/", "rput.json", "rput.db"],
    "follow_links": false,
    "baseline": "rput.db",
    "chunk_size": 8192
  }
]
"#;
