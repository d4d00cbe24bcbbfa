use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

use crate::error::ProxyError;

use super::codec::to_file_name;
use super::yaml::ScalarStyle;
use super::{CacheKey, ExchangeRecord};

const TEMP_PREFIX: &str = "tmp_";

/// Directory of YAML fixtures, one file per cache key.
#[derive(Debug, Clone)]
pub struct FixtureStore {
    base_dir: PathBuf,
    body_style: ScalarStyle,
    temp_seq: Arc<AtomicU64>,
}

impl FixtureStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            body_style: ScalarStyle::Literal,
            temp_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_body_style(mut self, style: ScalarStyle) -> Self {
        self.body_style = style;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path_for(&self, key: &CacheKey) -> Result<PathBuf, ProxyError> {
        Ok(self.base_dir.join(to_file_name(key)?))
    }

    pub async fn exists(&self, key: &CacheKey) -> Result<bool, ProxyError> {
        let path = self.path_for(key)?;
        match async_fs::try_exists(&path).await {
            Ok(found) => Ok(found),
            Err(source) => Err(ProxyError::StoreIo { path, source }),
        }
    }

    /// Replaces the record for `key`. Readers see either the previous file or the complete new
    /// one, never a partial write.
    pub async fn write(
        &self,
        key: &CacheKey,
        record: &ExchangeRecord,
    ) -> Result<PathBuf, ProxyError> {
        let path = self.path_for(key)?;
        let document = record
            .to_yaml(self.body_style)
            .map_err(|err| ProxyError::StoreIo {
                path: path.clone(),
                source: io::Error::new(io::ErrorKind::InvalidData, err),
            })?;

        async_fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|source| ProxyError::StoreIo {
                path: self.base_dir.clone(),
                source,
            })?;

        let temp_path = self.temp_path();
        if let Err(source) = write_file(&temp_path, document.as_bytes()).await {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(ProxyError::StoreIo { path, source });
        }
        if let Err(source) = async_fs::rename(&temp_path, &path).await {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(ProxyError::StoreIo { path, source });
        }
        trace!(path = %path.display(), bytes = document.len(), "fixture written");
        Ok(path)
    }

    pub async fn read(&self, key: &CacheKey) -> Result<ExchangeRecord, ProxyError> {
        let path = self.path_for(key)?;
        let bytes = match async_fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(source) => return Err(ProxyError::StoreIo { path, source }),
        };
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => {
                return Err(ProxyError::CorruptRecord {
                    path,
                    reason: err.to_string(),
                });
            }
        };
        ExchangeRecord::from_yaml(&text).map_err(|err| ProxyError::CorruptRecord {
            path,
            reason: format!("{err:#}"),
        })
    }

    /// Removes temporary files left behind by an interrupted write.
    pub async fn remove_temp_files(&self) -> io::Result<usize> {
        let mut entries = match async_fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let is_temp = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(TEMP_PREFIX))
                .unwrap_or(false);
            if !is_temp {
                continue;
            }
            match async_fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "failed to remove stale temp file")
                }
            }
        }
        if removed > 0 {
            debug!(removed, dir = %self.base_dir.display(), "removed stale fixture temp files");
        }
        Ok(removed)
    }

    fn temp_path(&self) -> PathBuf {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        self.base_dir
            .join(format!("{TEMP_PREFIX}{}_{seq}", std::process::id()))
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = async_fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}
