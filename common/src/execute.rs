use anyhow::{Context, anyhow};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::detect::{ChangeDetector, Plan, PlanItem};
use crate::provider::{EntryKind, ProviderError, SyncProvider};

/// Error type for sync operations that preserves the operation summary even
/// on failure.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Push,
    Pull,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SyncMode::Push => write!(f, "push"),
            SyncMode::Pull => write!(f, "pull"),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct Settings {
    pub mode: SyncMode,
    /// Bytes per streamed read, must be non-zero.
    pub chunk_size: usize,
}

pub const DEFAULT_CHUNK_SIZE: usize = 8192;

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: SyncMode::Push,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub bytes_transferred: u64,
    pub files_transferred: usize,
    pub symlinks_created: usize,
    pub directories_created: usize,
    pub entries_unchanged: usize,
    pub entries_unsupported: usize,
    pub entries_failed: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_transferred: self.bytes_transferred + other.bytes_transferred,
            files_transferred: self.files_transferred + other.files_transferred,
            symlinks_created: self.symlinks_created + other.symlinks_created,
            directories_created: self.directories_created + other.directories_created,
            entries_unchanged: self.entries_unchanged + other.entries_unchanged,
            entries_unsupported: self.entries_unsupported + other.entries_unsupported,
            entries_failed: self.entries_failed + other.entries_failed,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes transferred: {}\n\
            files transferred: {}\n\
            symlinks created: {}\n\
            directories created: {}\n\
            entries unchanged: {}\n\
            entries unsupported: {}\n\
            entries failed: {}",
            bytesize::ByteSize(self.bytes_transferred),
            self.files_transferred,
            self.symlinks_created,
            self.directories_created,
            self.entries_unchanged,
            self.entries_unsupported,
            self.entries_failed,
        )
    }
}

/// Runs a sync plan against the destination.
///
/// Items are processed in the plan's sorted order, so a directory is created
/// strictly before anything inside it. A failed entry is reported, counted
/// and skipped - it never stops the batch. Cancellation is honored between
/// entries, never mid-file. Returns an error iff any entry failed; the
/// error still carries the full summary of the work that was done.
pub async fn execute(
    plan: &Plan,
    src: &dyn SyncProvider,
    dst: &dyn SyncProvider,
    detector: &mut ChangeDetector,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<Summary, Error> {
    let mut summary = Summary {
        entries_failed: plan.failed.len(),
        ..Default::default()
    };
    for (idx, item) in plan.items.iter().enumerate() {
        if cancel.is_cancelled() {
            tracing::warn!(
                "{} cancelled, {} entries not attempted",
                settings.mode,
                plan.items.len() - idx
            );
            break;
        }
        if !item.verdict.needs_transfer {
            summary.entries_unchanged += 1;
            continue;
        }
        match transfer_entry(item, src, dst, settings).await {
            Ok(delta) => {
                summary = summary + delta;
                // symlinks are recreated every time they show up changed, so
                // only files and directories are recorded as synced
                if matches!(item.entry.kind, EntryKind::File | EntryKind::Directory) {
                    detector.record(&item.entry);
                }
            }
            Err(error) => {
                tracing::error!("{}: {:?} failed: {:#}", settings.mode, item.entry.rel_path, error);
                summary.entries_failed += 1;
            }
        }
    }
    if summary.entries_failed > 0 {
        return Err(Error::new(
            anyhow!(
                "{} failed for {} {}",
                settings.mode,
                summary.entries_failed,
                if summary.entries_failed == 1 { "entry" } else { "entries" }
            ),
            summary,
        ));
    }
    Ok(summary)
}

async fn transfer_entry(
    item: &PlanItem,
    src: &dyn SyncProvider,
    dst: &dyn SyncProvider,
    settings: &Settings,
) -> anyhow::Result<Summary> {
    let entry = &item.entry;
    tracing::debug!("{}ing {:?} ({})", settings.mode, entry.rel_path, entry.kind.label());
    match entry.kind {
        EntryKind::Directory => {
            if item.verdict.destination_exists {
                match dst.stat_link(&entry.rel_path).await {
                    // already a directory, nothing to do
                    Ok(stat) if stat.kind == EntryKind::Directory => {
                        return Ok(Summary {
                            entries_unchanged: 1,
                            ..Default::default()
                        });
                    }
                    // some other object blocks the path, clear it or every
                    // child transfer fails
                    Ok(_) => {
                        dst.unlink(&entry.rel_path).await.with_context(|| {
                            format!("cannot remove object blocking directory {:?}", entry.rel_path)
                        })?;
                    }
                    Err(ProviderError::NotFound) => {}
                    Err(error) => {
                        return Err(error)
                            .with_context(|| format!("cannot stat {:?}", entry.rel_path));
                    }
                }
            }
            match dst.mkdir(&entry.rel_path, entry.mode).await {
                // lost the race with somebody else, the directory is there
                Ok(()) | Err(ProviderError::AlreadyExists) => Ok(Summary {
                    directories_created: 1,
                    ..Default::default()
                }),
                Err(error) => Err(error)
                    .with_context(|| format!("cannot create directory {:?}", entry.rel_path)),
            }
        }
        EntryKind::Symlink => {
            // the verdict may claim the destination is missing (a baseline
            // store never records symlinks), so always clear the path first
            match dst.unlink(&entry.rel_path).await {
                Ok(()) | Err(ProviderError::NotFound) => {}
                Err(error) => {
                    return Err(error)
                        .with_context(|| format!("cannot remove stale {:?}", entry.rel_path));
                }
            }
            let target = src
                .read_link(&entry.rel_path)
                .await
                .with_context(|| format!("cannot read link target of {:?}", entry.rel_path))?;
            if dst.supports_symlinks() {
                dst.symlink(&target, &entry.rel_path)
                    .await
                    .with_context(|| format!("cannot create symlink {:?}", entry.rel_path))?;
            } else {
                // degrade to a plain file holding the target path
                let mut writer = dst
                    .open_write(&entry.rel_path, 0o644)
                    .await
                    .with_context(|| format!("cannot create {:?}", entry.rel_path))?;
                writer.write_all(target.as_bytes()).await?;
                writer.shutdown().await?;
            }
            Ok(Summary {
                symlinks_created: 1,
                ..Default::default()
            })
        }
        EntryKind::File => transfer_file(item, src, dst, settings).await,
        EntryKind::Other => {
            tracing::warn!("skipping unsupported object {:?}", entry.rel_path);
            Ok(Summary {
                entries_unsupported: 1,
                ..Default::default()
            })
        }
    }
}

/// Streams one file in `chunk_size` reads. A write failure aborts this file
/// and removes the partial destination (best effort); the error surfaces to
/// the per-entry isolation in [`execute`].
async fn transfer_file(
    item: &PlanItem,
    src: &dyn SyncProvider,
    dst: &dyn SyncProvider,
    settings: &Settings,
) -> anyhow::Result<Summary> {
    let entry = &item.entry;
    let mut reader = src
        .open_read(&entry.rel_path)
        .await
        .with_context(|| format!("cannot open {:?} on {}", entry.rel_path, src.name()))?;
    let mut writer = dst
        .open_write(&entry.rel_path, entry.mode)
        .await
        .with_context(|| format!("cannot create {:?} on {}", entry.rel_path, dst.name()))?;
    let mut buf = vec![0u8; settings.chunk_size.max(1)];
    let mut bytes = 0u64;
    loop {
        let nread = reader
            .read(&mut buf)
            .await
            .with_context(|| format!("failed reading {:?} from {}", entry.rel_path, src.name()))?;
        if nread == 0 {
            break;
        }
        if let Err(error) = writer.write_all(&buf[..nread]).await {
            drop(writer);
            if let Err(rm_error) = dst.unlink(&entry.rel_path).await {
                tracing::warn!(
                    "could not remove partial {:?}: {:#}",
                    entry.rel_path,
                    anyhow::Error::from(rm_error)
                );
            }
            return Err(error)
                .with_context(|| format!("failed writing {:?} to {}", entry.rel_path, dst.name()));
        }
        bytes += nread as u64;
    }
    writer
        .shutdown()
        .await
        .with_context(|| format!("failed flushing {:?} on {}", entry.rel_path, dst.name()))?;
    Ok(Summary {
        bytes_transferred: bytes,
        files_transferred: 1,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{SyncVerdict, plan};
    use crate::glob::IgnoreSet;
    use crate::local::LocalFs;
    use crate::provider::{DirEntry, ReadHandle, Stat, TreeEntry, WriteHandle};
    use crate::testutils;
    use crate::walk::walk;
    use anyhow::Result;
    use async_trait::async_trait;
    use tracing_test::traced_test;

    async fn build_plan(src: &LocalFs, dst: &LocalFs, ignore: &IgnoreSet) -> Result<Plan> {
        let entries = walk(src, ignore, false).await?;
        Ok(plan(entries, &ChangeDetector::CrossStat, dst).await)
    }

    #[tokio::test]
    #[traced_test]
    async fn full_tree_sync() -> Result<()> {
        let src_dir = testutils::setup_test_tree().await?;
        let dst_dir = testutils::create_temp_dir().await?;
        let src = LocalFs::new(&src_dir);
        let dst = LocalFs::new(&dst_dir);
        let sync_plan = build_plan(&src, &dst, &IgnoreSet::default()).await?;
        let mut detector = ChangeDetector::CrossStat;
        let summary = execute(
            &sync_plan,
            &src,
            &dst,
            &mut detector,
            &Settings::default(),
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!(summary.files_transferred, 4);
        assert_eq!(summary.directories_created, 2);
        assert_eq!(summary.symlinks_created, 1);
        assert_eq!(summary.entries_failed, 0);
        assert_eq!(tokio::fs::read(dst_dir.join("bar/2.txt")).await?, b"2");
        let link = tokio::fs::read_link(dst_dir.join("baz/4.txt")).await?;
        assert_eq!(link.to_string_lossy(), "../bar/2.txt");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn second_run_is_a_no_op() -> Result<()> {
        let src_dir = testutils::setup_test_tree().await?;
        let dst_dir = testutils::create_temp_dir().await?;
        let src = LocalFs::new(&src_dir);
        let dst = LocalFs::new(&dst_dir);
        let mut detector = ChangeDetector::CrossStat;
        for _ in 0..2 {
            let sync_plan = build_plan(&src, &dst, &IgnoreSet::default()).await?;
            execute(
                &sync_plan,
                &src,
                &dst,
                &mut detector,
                &Settings::default(),
                &CancellationToken::new(),
            )
            .await?;
        }
        let sync_plan = build_plan(&src, &dst, &IgnoreSet::default()).await?;
        assert_eq!(sync_plan.pending().count(), 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn ignored_entries_never_reach_the_destination() -> Result<()> {
        let src_dir = testutils::create_temp_dir().await?;
        tokio::fs::write(src_dir.join("keep.txt"), "keep").await?;
        tokio::fs::write(src_dir.join("drop.log"), "drop").await?;
        let dst_dir = testutils::create_temp_dir().await?;
        let src = LocalFs::new(&src_dir);
        let dst = LocalFs::new(&dst_dir);
        let sync_plan = build_plan(&src, &dst, &IgnoreSet::new(["*.log"])).await?;
        let mut detector = ChangeDetector::CrossStat;
        let summary = execute(
            &sync_plan,
            &src,
            &dst,
            &mut detector,
            &Settings::default(),
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!(summary.files_transferred, 1);
        assert!(tokio::fs::try_exists(dst_dir.join("keep.txt")).await?);
        assert!(!tokio::fs::try_exists(dst_dir.join("drop.log")).await?);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn baseline_records_only_successful_transfers() -> Result<()> {
        let src_dir = testutils::setup_test_tree().await?;
        let dst_dir = testutils::create_temp_dir().await?;
        let db_path = dst_dir.join("sync.db");
        let src = LocalFs::new(&src_dir);
        let dst = LocalFs::new(dst_dir.join("mirror"));
        tokio::fs::create_dir(dst_dir.join("mirror")).await?;

        let mut detector =
            ChangeDetector::Baseline(crate::baseline::Baseline::open(&db_path).await?);
        let entries = walk(&src, &IgnoreSet::default(), false).await?;
        let sync_plan = plan(entries, &detector, &dst).await;
        execute(
            &sync_plan,
            &src,
            &dst,
            &mut detector,
            &Settings::default(),
            &CancellationToken::new(),
        )
        .await?;
        detector.close().await?;

        // 4 files + 2 directories, the symlink is recreated each time
        let store = crate::baseline::Baseline::open(&db_path).await?;
        assert_eq!(store.len(), 6);
        let entries = walk(&src, &IgnoreSet::default(), false).await?;
        let file = entries.iter().find(|e| e.rel_path == "bar/1.txt").unwrap();
        assert!(!store.check("bar/1.txt", file.mtime));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn baseline_rerun_recreates_symlinks() -> Result<()> {
        let src_dir = testutils::setup_test_tree().await?;
        let dst_dir = testutils::create_temp_dir().await?;
        let db_path = dst_dir.join("sync.db");
        let mirror = dst_dir.join("mirror");
        tokio::fs::create_dir(&mirror).await?;
        let src = LocalFs::new(&src_dir);
        let dst = LocalFs::new(&mirror);

        // the store never records symlinks, so on the second run the link's
        // verdict still claims the destination is missing; the transfer must
        // replace the existing link instead of tripping over it
        for _ in 0..2 {
            let mut detector =
                ChangeDetector::Baseline(crate::baseline::Baseline::open(&db_path).await?);
            let entries = walk(&src, &IgnoreSet::default(), false).await?;
            let sync_plan = plan(entries, &detector, &dst).await;
            let summary = execute(
                &sync_plan,
                &src,
                &dst,
                &mut detector,
                &Settings::default(),
                &CancellationToken::new(),
            )
            .await?;
            assert_eq!(summary.entries_failed, 0);
            assert_eq!(summary.symlinks_created, 1);
            detector.close().await?;
        }
        let target = tokio::fs::read_link(mirror.join("baz/4.txt")).await?;
        assert_eq!(target.to_string_lossy(), "../bar/2.txt");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn blocking_file_is_replaced_by_directory() -> Result<()> {
        let src_dir = testutils::create_temp_dir().await?;
        tokio::fs::create_dir(src_dir.join("bar")).await?;
        tokio::fs::write(src_dir.join("bar/1.txt"), "1").await?;
        let dst_dir = testutils::create_temp_dir().await?;
        // a plain file sits where the directory has to go
        tokio::fs::write(dst_dir.join("bar"), "in the way").await?;
        let src = LocalFs::new(&src_dir);
        let dst = LocalFs::new(&dst_dir);
        let sync_plan = build_plan(&src, &dst, &IgnoreSet::default()).await?;
        let mut detector = ChangeDetector::CrossStat;
        let summary = execute(
            &sync_plan,
            &src,
            &dst,
            &mut detector,
            &Settings::default(),
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!(summary.entries_failed, 0);
        assert_eq!(summary.directories_created, 1);
        assert!(tokio::fs::metadata(dst_dir.join("bar")).await?.is_dir());
        assert_eq!(tokio::fs::read(dst_dir.join("bar/1.txt")).await?, b"1");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn cancellation_stops_between_entries() -> Result<()> {
        let src_dir = testutils::setup_test_tree().await?;
        let dst_dir = testutils::create_temp_dir().await?;
        let src = LocalFs::new(&src_dir);
        let dst = LocalFs::new(&dst_dir);
        let sync_plan = build_plan(&src, &dst, &IgnoreSet::default()).await?;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut detector = ChangeDetector::CrossStat;
        let summary = execute(
            &sync_plan,
            &src,
            &dst,
            &mut detector,
            &Settings::default(),
            &cancel,
        )
        .await?;
        assert_eq!(summary.files_transferred, 0);
        assert_eq!(summary.directories_created, 0);
        Ok(())
    }

    /// Wrapper that fails `open_write` for one path, everything else is
    /// delegated to the wrapped provider.
    struct FailingWrites<'a> {
        inner: &'a LocalFs,
        fail_path: &'a str,
    }

    #[async_trait]
    impl SyncProvider for FailingWrites<'_> {
        async fn list(&self, dir: &str) -> crate::provider::Result<Vec<DirEntry>> {
            self.inner.list(dir).await
        }
        async fn stat_link(&self, path: &str) -> crate::provider::Result<Stat> {
            self.inner.stat_link(path).await
        }
        async fn stat_resolved(&self, path: &str) -> crate::provider::Result<Stat> {
            self.inner.stat_resolved(path).await
        }
        async fn read_link(&self, path: &str) -> crate::provider::Result<String> {
            self.inner.read_link(path).await
        }
        async fn mkdir(&self, path: &str, mode: u32) -> crate::provider::Result<()> {
            self.inner.mkdir(path, mode).await
        }
        async fn symlink(&self, target: &str, path: &str) -> crate::provider::Result<()> {
            self.inner.symlink(target, path).await
        }
        async fn unlink(&self, path: &str) -> crate::provider::Result<()> {
            self.inner.unlink(path).await
        }
        async fn open_read(&self, path: &str) -> crate::provider::Result<ReadHandle> {
            self.inner.open_read(path).await
        }
        async fn open_write(&self, path: &str, mode: u32) -> crate::provider::Result<WriteHandle> {
            if path == self.fail_path {
                return Err(ProviderError::Other(anyhow!("injected write failure")));
            }
            self.inner.open_write(path, mode).await
        }
        fn name(&self) -> &str {
            self.inner.name()
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_entry_does_not_stop_the_batch() -> Result<()> {
        let src_dir = testutils::setup_test_tree().await?;
        let dst_dir = testutils::create_temp_dir().await?;
        let src = LocalFs::new(&src_dir);
        let local_dst = LocalFs::new(&dst_dir);
        let dst = FailingWrites {
            inner: &local_dst,
            fail_path: "bar/1.txt",
        };
        let entries = walk(&src, &IgnoreSet::default(), false).await?;
        let sync_plan = plan(entries, &ChangeDetector::CrossStat, &dst).await;
        let mut detector = ChangeDetector::CrossStat;
        let error = execute(
            &sync_plan,
            &src,
            &dst,
            &mut detector,
            &Settings::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(error.summary.entries_failed, 1);
        assert_eq!(error.summary.files_transferred, 3);
        // the rest of the tree made it across
        assert!(tokio::fs::try_exists(dst_dir.join("bar/2.txt")).await?);
        assert!(!tokio::fs::try_exists(dst_dir.join("bar/1.txt")).await?);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn symlink_is_replaced_not_followed() -> Result<()> {
        let src_dir = testutils::create_temp_dir().await?;
        tokio::fs::write(src_dir.join("real.txt"), "real").await?;
        tokio::fs::symlink("real.txt", src_dir.join("link")).await?;
        let dst_dir = testutils::create_temp_dir().await?;
        tokio::fs::write(dst_dir.join("real.txt"), "real").await?;
        // stale destination link pointing somewhere else
        tokio::fs::symlink("elsewhere", dst_dir.join("link")).await?;
        let src = LocalFs::new(&src_dir);
        let dst = LocalFs::new(&dst_dir);

        let entry = TreeEntry {
            rel_path: "link".to_string(),
            kind: EntryKind::Symlink,
            mode: 0o777,
            mtime: 0,
            size: 0,
        };
        let item = PlanItem {
            entry,
            verdict: SyncVerdict {
                needs_transfer: true,
                destination_exists: true,
            },
        };
        let summary = transfer_entry(&item, &src, &dst, &Settings::default()).await?;
        assert_eq!(summary.symlinks_created, 1);
        let target = tokio::fs::read_link(dst_dir.join("link")).await?;
        assert_eq!(target.to_string_lossy(), "real.txt");
        Ok(())
    }
}
