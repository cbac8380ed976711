use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

// record layout:
// --------------------------------------------
// |  len  |  path (null-terminated)  | mtime |
// --------------------------------------------
// |   4   |          (len)           |   8   | bytes, little-endian
// --------------------------------------------
const MAX_PATH_LEN: u32 = 1024;

#[derive(Debug)]
struct Record {
    mtime: i64,
    dirty: bool,
    /// Byte offset of the mtime field, `None` for records not yet on disk.
    disk_offset: Option<u64>,
}

/// Persistent mtime record store - the "already synced" baseline of a job.
///
/// The store assumes exclusive single-process ownership; there is no file
/// locking. A missing file is an empty store. A corrupt or truncated record
/// ends the load at that point, records read before it stay valid.
#[derive(Debug)]
pub struct Baseline {
    path: PathBuf,
    records: HashMap<String, Record>,
}

impl Baseline {
    pub async fn open(path: &Path) -> Result<Self> {
        let mut records = HashMap::new();
        match tokio::fs::File::open(path).await {
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("cannot open baseline store {path:?}"));
            }
            Ok(mut file) => {
                if let Err(error) = load_records(&mut file, &mut records).await {
                    tracing::warn!(
                        "baseline store {:?} is damaged, keeping {} records loaded so far: {:#}",
                        path,
                        records.len(),
                        error
                    );
                }
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }

    /// Whether an entry needs a transfer: no record, or a strictly newer
    /// mtime than the recorded one.
    pub fn check(&self, path: &str, mtime: i64) -> bool {
        match self.records.get(path) {
            None => true,
            Some(record) => mtime > record.mtime,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.records.contains_key(path)
    }

    /// Records a successful transfer. New paths create a dirty record, known
    /// paths are bumped only when `mtime` is strictly newer.
    pub fn update(&mut self, path: &str, mtime: i64) {
        match self.records.get_mut(path) {
            None => {
                self.records.insert(
                    path.to_string(),
                    Record {
                        mtime,
                        dirty: true,
                        disk_offset: None,
                    },
                );
            }
            Some(record) if mtime > record.mtime => {
                record.mtime = mtime;
                record.dirty = true;
            }
            Some(_) => {}
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Flushes dirty records back to disk. Records already on disk get their
    /// mtime overwritten in place, new records are appended; a record
    /// updated several times in one session is written exactly once.
    pub async fn close(self) -> Result<()> {
        if !self.records.values().any(|record| record.dirty) {
            return Ok(());
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.path)
            .await
            .with_context(|| format!("cannot open baseline store {:?} for writing", self.path))?;
        let mut appends = Vec::new();
        for (path, record) in &self.records {
            if !record.dirty {
                continue;
            }
            match record.disk_offset {
                Some(offset) => {
                    file.seek(SeekFrom::Start(offset)).await?;
                    file.write_all(&(record.mtime as u64).to_le_bytes()).await?;
                }
                None => appends.push((path, record)),
            }
        }
        file.seek(SeekFrom::End(0)).await?;
        for (path, record) in appends {
            let bytes = path.as_bytes();
            let len = bytes.len() as u32 + 1;
            file.write_all(&len.to_le_bytes()).await?;
            file.write_all(bytes).await?;
            file.write_all(&[0]).await?;
            file.write_all(&(record.mtime as u64).to_le_bytes()).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

async fn load_records(
    file: &mut tokio::fs::File,
    records: &mut HashMap<String, Record>,
) -> Result<()> {
    let mut pos = 0u64;
    loop {
        let len = match read_record_len(file).await? {
            None => return Ok(()),
            Some(len) => len,
        };
        if len == 0 || len > MAX_PATH_LEN {
            anyhow::bail!("implausible path length {len}");
        }
        let mut path_buf = vec![0u8; len as usize];
        file.read_exact(&mut path_buf)
            .await
            .context("truncated path field")?;
        if path_buf.pop() != Some(0) {
            anyhow::bail!("path field is not null-terminated");
        }
        let path = String::from_utf8(path_buf).context("path field is not UTF-8")?;
        let mut mtime_buf = [0u8; 8];
        file.read_exact(&mut mtime_buf)
            .await
            .context("truncated mtime field")?;
        records.insert(
            path,
            Record {
                mtime: u64::from_le_bytes(mtime_buf) as i64,
                dirty: false,
                disk_offset: Some(pos + 4 + u64::from(len)),
            },
        );
        pos += 4 + u64::from(len) + 8;
    }
}

/// Reads the 4-byte length header, `None` on a clean end of file.
async fn read_record_len(file: &mut tokio::fs::File) -> Result<Option<u32>> {
    let mut buf = [0u8; 4];
    let mut nread = 0;
    while nread < buf.len() {
        let n = file.read(&mut buf[nread..]).await?;
        if n == 0 {
            if nread == 0 {
                return Ok(None);
            }
            anyhow::bail!("truncated record header");
        }
        nread += n;
    }
    Ok(Some(u32::from_le_bytes(buf)))
}
