//! Filesystem-based offset storage.

use async_trait::async_trait;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use stream_types::StreamPosition;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{OffsetError, Result};
use crate::store::{check_advance, OffsetRecord, OffsetStore, StreamIdentity};

/// Stores one `offset_<stream>.json` file per stream in a directory.
///
/// Saves write a temporary file, fsync it, rename it over the previous file
/// and fsync the directory, so a crash leaves either the old or the new
/// offset on disk.
pub struct FilesystemStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FilesystemStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, stream: &StreamIdentity) -> PathBuf {
        self.dir.join(format!("offset_{}.json", stream.file_stem()))
    }

    async fn read(&self, stream: &StreamIdentity) -> Result<Option<OffsetRecord>> {
        let path = self.path_for(stream);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(OffsetError::Io { path, source }),
        };
        let record: OffsetRecord =
            serde_json::from_str(&content).map_err(|e| OffsetError::Corrupt {
                location: path.display().to_string(),
                reason: e.to_string(),
            })?;
        if record.stream != *stream {
            return Err(OffsetError::Corrupt {
                location: path.display().to_string(),
                reason: format!("file belongs to stream '{}'", record.stream),
            });
        }
        Ok(Some(record))
    }

    async fn write_atomically(&self, path: &Path, content: &[u8]) -> Result<()> {
        let io_err = |source| OffsetError::Io {
            path: path.to_path_buf(),
            source,
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;

        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await.map_err(io_err)?;
        file.write_all(content).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        sync_dir(&self.dir).await.map_err(io_err)?;
        Ok(())
    }
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl OffsetStore for FilesystemStore {
    async fn load(&self, stream: &StreamIdentity) -> Result<Option<OffsetRecord>> {
        self.read(stream).await
    }

    async fn save(&self, stream: &StreamIdentity, position: StreamPosition) -> Result<OffsetRecord> {
        let _guard = self.write_lock.lock().await;
        let current = self.read(stream).await?;
        if check_advance(stream, current.as_ref(), position)? {
            if let Some(record) = current {
                return Ok(record);
            }
        }

        let record = OffsetRecord {
            stream: stream.clone(),
            confirmed_position: position,
            updated_at: Utc::now(),
        };
        let path = self.path_for(stream);
        let content = serde_json::to_vec_pretty(&record).map_err(|e| OffsetError::Corrupt {
            location: path.display().to_string(),
            reason: e.to_string(),
        })?;
        self.write_atomically(&path, &content).await?;
        tracing::debug!(stream = %stream, position = %position, "stored offset to {}", path.display());
        Ok(record)
    }
}
