use async_trait::async_trait;

/// Coarse object type of a tree entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl EntryKind {
    /// Short tag used in listings and log lines.
    pub fn label(&self) -> &'static str {
        match self {
            EntryKind::File => "REG",
            EntryKind::Directory => "DIR",
            EntryKind::Symlink => "LNK",
            EntryKind::Other => "UNK",
        }
    }
}

/// Metadata snapshot of a single object.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub kind: EntryKind,
    /// Permission bits, masked to 0o777.
    pub mode: u32,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
    pub size: u64,
}

/// One child returned by [`SyncProvider::list`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub stat: Stat,
}

/// An object produced by a tree walk.
///
/// `rel_path` is relative to the walk root, uses `/` separators on every
/// platform and never contains a `.` or `..` segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub rel_path: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub mtime: i64,
    pub size: u64,
}

impl TreeEntry {
    pub fn from_stat(rel_path: String, stat: Stat) -> Self {
        Self {
            rel_path,
            kind: stat.kind,
            mode: stat.mode,
            mtime: stat.mtime,
            size: stat.size,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("object not found")]
    NotFound,
    #[error("object already exists")]
    AlreadyExists,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for ProviderError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            // a path below a non-directory does not exist either
            std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory => {
                ProviderError::NotFound
            }
            std::io::ErrorKind::AlreadyExists => ProviderError::AlreadyExists,
            _ => ProviderError::Other(error.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

pub type ReadHandle = Box<dyn tokio::io::AsyncRead + Send + Unpin>;
pub type WriteHandle = Box<dyn tokio::io::AsyncWrite + Send + Unpin>;

/// One side of a sync - a tree of objects addressed by relative path.
///
/// An empty path refers to the provider root. Implementations back this with
/// a local directory, an SFTP session or anything else that can stat, list
/// and stream objects; the engine only ever talks through this trait.
#[async_trait]
pub trait SyncProvider: Send + Sync {
    /// Lists the children of a directory. Order is unspecified.
    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>>;

    /// Stats an object without following a final symlink.
    async fn stat_link(&self, path: &str) -> Result<Stat>;

    /// Stats an object, following symlinks.
    async fn stat_resolved(&self, path: &str) -> Result<Stat>;

    /// Reads the target of a symlink.
    async fn read_link(&self, path: &str) -> Result<String>;

    async fn mkdir(&self, path: &str, mode: u32) -> Result<()>;

    /// Creates a symlink at `path` pointing at `target`.
    async fn symlink(&self, target: &str, path: &str) -> Result<()>;

    /// Removes a non-directory object.
    async fn unlink(&self, path: &str) -> Result<()>;

    async fn open_read(&self, path: &str) -> Result<ReadHandle>;

    /// Opens an object for writing, creating or truncating it.
    async fn open_write(&self, path: &str, mode: u32) -> Result<WriteHandle>;

    /// Whether symlinks can be created natively. When `false` the executor
    /// degrades symlinks to plain files holding the target path.
    fn supports_symlinks(&self) -> bool {
        true
    }

    /// Name used in log messages.
    fn name(&self) -> &str;
}
