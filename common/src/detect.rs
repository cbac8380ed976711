use anyhow::Context;

use crate::baseline::Baseline;
use crate::provider::{ProviderError, SyncProvider, TreeEntry};

/// Per-entry decision, computed fresh on every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncVerdict {
    pub needs_transfer: bool,
    pub destination_exists: bool,
}

/// Live comparison of a source entry against the destination tree.
///
/// Missing destination: transfer. Type mismatch (regular vs directory vs
/// symlink): transfer, replacing whatever is there. Same type: transfer only
/// when the destination is strictly older. Any other stat failure is an
/// error for this entry alone.
pub async fn cross_stat(dst: &dyn SyncProvider, entry: &TreeEntry) -> anyhow::Result<SyncVerdict> {
    match dst.stat_link(&entry.rel_path).await {
        Err(ProviderError::NotFound) => Ok(SyncVerdict {
            needs_transfer: true,
            destination_exists: false,
        }),
        Err(error) => Err(error)
            .with_context(|| format!("cannot stat {:?} on {}", entry.rel_path, dst.name())),
        Ok(stat) => Ok(SyncVerdict {
            needs_transfer: stat.kind != entry.kind || stat.mtime < entry.mtime,
            destination_exists: true,
        }),
    }
}

/// Detection strategy of a job. The two strategies are never composed, a job
/// runs either against its baseline store or against live destination stats.
#[derive(Debug)]
pub enum ChangeDetector {
    Baseline(Baseline),
    CrossStat,
}

impl ChangeDetector {
    pub async fn verdict(
        &self,
        dst: &dyn SyncProvider,
        entry: &TreeEntry,
    ) -> anyhow::Result<SyncVerdict> {
        match self {
            ChangeDetector::Baseline(store) => Ok(SyncVerdict {
                needs_transfer: store.check(&entry.rel_path, entry.mtime),
                destination_exists: store.contains(&entry.rel_path),
            }),
            ChangeDetector::CrossStat => cross_stat(dst, entry).await,
        }
    }

    /// Notes a completed transfer. Only the baseline strategy keeps state.
    pub fn record(&mut self, entry: &TreeEntry) {
        if let ChangeDetector::Baseline(store) = self {
            store.update(&entry.rel_path, entry.mtime);
        }
    }

    pub async fn close(self) -> anyhow::Result<()> {
        match self {
            ChangeDetector::Baseline(store) => store.close().await,
            ChangeDetector::CrossStat => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct PlanItem {
    pub entry: TreeEntry,
    pub verdict: SyncVerdict,
}

/// Result of the detection phase over a walked tree.
///
/// Entries whose status could not be determined are excluded from `items`
/// and listed in `failed`; they count against the job outcome but never
/// stop the batch.
#[derive(Debug)]
pub struct Plan {
    pub items: Vec<PlanItem>,
    pub failed: Vec<(String, anyhow::Error)>,
}

impl Plan {
    pub fn pending(&self) -> impl Iterator<Item = &PlanItem> {
        self.items.iter().filter(|item| item.verdict.needs_transfer)
    }
}

pub async fn plan(
    entries: Vec<TreeEntry>,
    detector: &ChangeDetector,
    dst: &dyn SyncProvider,
) -> Plan {
    let mut items = Vec::with_capacity(entries.len());
    let mut failed = Vec::new();
    for entry in entries {
        match detector.verdict(dst, &entry).await {
            Ok(verdict) => items.push(PlanItem { entry, verdict }),
            Err(error) => {
                tracing::error!("cannot determine status of {:?}: {:#}", entry.rel_path, error);
                failed.push((entry.rel_path, error));
            }
        }
    }
    Plan { items, failed }
}
