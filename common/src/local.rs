use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::provider::{
    DirEntry, EntryKind, ProviderError, ReadHandle, Result, Stat, SyncProvider, WriteHandle,
};

/// [`SyncProvider`] over a local directory tree via `tokio::fs`.
#[derive(Debug)]
pub struct LocalFs {
    root: PathBuf,
    name: String,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let name = format!("local:{}", root.display());
        Self { root, name }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }
}

fn stat_from_metadata(metadata: &std::fs::Metadata) -> Stat {
    let file_type = metadata.file_type();
    let kind = if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        // sockets, fifos, devices
        EntryKind::Other
    };
    Stat {
        kind,
        mode: metadata.permissions().mode() & 0o777,
        mtime: metadata.mtime(),
        size: metadata.len(),
    }
}

#[async_trait]
impl SyncProvider for LocalFs {
    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(self.full(dir)).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(name) => {
                    tracing::warn!("skipping non-UTF-8 name {:?} under {:?}", name, dir);
                    continue;
                }
            };
            // DirEntry::metadata does not follow symlinks
            let metadata = entry.metadata().await?;
            entries.push(DirEntry {
                name,
                stat: stat_from_metadata(&metadata),
            });
        }
        Ok(entries)
    }

    async fn stat_link(&self, path: &str) -> Result<Stat> {
        let metadata = tokio::fs::symlink_metadata(self.full(path)).await?;
        Ok(stat_from_metadata(&metadata))
    }

    async fn stat_resolved(&self, path: &str) -> Result<Stat> {
        let metadata = tokio::fs::metadata(self.full(path)).await?;
        Ok(stat_from_metadata(&metadata))
    }

    async fn read_link(&self, path: &str) -> Result<String> {
        let target = tokio::fs::read_link(self.full(path)).await?;
        Ok(target.to_string_lossy().into_owned())
    }

    async fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.mode(if mode == 0 { 0o755 } else { mode });
        builder.create(self.full(path)).await?;
        Ok(())
    }

    async fn symlink(&self, target: &str, path: &str) -> Result<()> {
        tokio::fs::symlink(target, self.full(path)).await?;
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        tokio::fs::remove_file(self.full(path)).await?;
        Ok(())
    }

    async fn open_read(&self, path: &str) -> Result<ReadHandle> {
        let file = tokio::fs::File::open(self.full(path)).await?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &str, mode: u32) -> Result<WriteHandle> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(if mode == 0 { 0o644 } else { mode })
            .open(self.full(path))
            .await?;
        Ok(Box::new(file))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
