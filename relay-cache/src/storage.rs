//! Blob storage
//!
//! Cache payloads live as flat files named by record id under a root
//! directory. Uploads land in `<id>.tmp` and become visible only when
//! [`Storage::commit`] renames them into place.
//!
//! Offset writes to the same temporary file are not serialized here: callers
//! are expected to upload disjoint ranges.

use std::io::{self, SeekFrom};
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

const TEMP_EXT: &str = "tmp";

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Opens (creating if needed) the storage directory
    pub async fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Path of the committed blob
    pub fn path(&self, id: i64) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn temp_path(&self, id: i64) -> PathBuf {
        self.path(id).with_extension(TEMP_EXT)
    }

    /// Whether a committed blob exists for `id`
    pub async fn exists(&self, id: i64) -> io::Result<bool> {
        fs::try_exists(self.path(id)).await
    }

    /// Writes `data` at `offset` of the temporary file for `id`
    pub async fn write(&self, id: i64, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.temp_path(id))
            .await?;

        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await
    }

    /// Atomically promotes the temporary file to the committed blob
    pub async fn commit(&self, id: i64) -> io::Result<()> {
        fs::rename(self.temp_path(id), self.path(id)).await
    }

    /// Removes both the committed and temporary file, ignoring absence
    pub async fn remove(&self, id: i64) {
        for path in [self.path(id), self.temp_path(id)] {
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }
}
