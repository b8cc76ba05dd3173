//! Object-store adapter
//!
//! A narrow file-system capability: list, read, open-for-write, rename,
//! stat, mkdir-p, set-mtime. Every operation runs under a 30-second
//! deadline; expiration is a fatal condition that panics -- the daemon's
//! `tokio::task::JoinHandle` is the recover boundary (see `bin/mirror.rs`).
//!
//! The real backend (typically an SMB/CIFS-mounted share) is out of this
//! core's scope; `LocalObjectStore` implements the same trait against the
//! local filesystem so the rest of the crate never depends on a concrete
//! transport. A CIFS-backed implementation is a drop-in replacement
//! behind this trait.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const DEADLINE: Duration = Duration::from_secs(30);

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Recursively list file paths (not directories) under `dir`.
    async fn list_files(&self, dir: &str) -> Result<Vec<String>>;
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;
    async fn mkdir_all(&self, dir: &str) -> Result<()>;
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
    async fn remove(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
    /// Set access/modification times (backup sink sets mtime from the
    /// envelope date; atime is "now").
    async fn set_mtime(&self, path: &str, mtime: DateTime<Utc>) -> Result<()>;
}

/// Runs `fut` under the object-store deadline. Expiration panics rather
/// than returning an error — see module docs.
async fn under_deadline<T>(op: &str, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(DEADLINE, fut).await {
        Ok(result) => result,
        Err(_) => panic!("object-store operation '{op}' exceeded its {DEADLINE:?} deadline"),
    }
}

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn list_files_sync(dir: &Path) -> std::io::Result<Vec<String>> {
        let mut out = Vec::new();
        if !dir.exists() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                out.extend(Self::list_files_sync(&path)?);
            } else {
                out.push(path.to_string_lossy().into_owned());
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn list_files(&self, dir: &str) -> Result<Vec<String>> {
        let target = self.resolve(dir);
        under_deadline("list_files", async move {
            tokio::task::spawn_blocking(move || Self::list_files_sync(&target))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))?
                .map_err(Error::from)
        })
        .await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path);
        under_deadline("read_file", async move {
            let mut file = tokio::fs::File::open(&target).await?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).await?;
            Ok(buf)
        })
        .await
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let target = self.resolve(path);
        let data = data.to_vec();
        under_deadline("write_file", async move {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&target)
                .await?;
            file.write_all(&data).await?;
            file.flush().await?;
            Ok(())
        })
        .await
    }

    async fn mkdir_all(&self, dir: &str) -> Result<()> {
        let target = self.resolve(dir);
        under_deadline("mkdir_all", async move {
            tokio::fs::create_dir_all(&target).await?;
            Ok(())
        })
        .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = self.resolve(from);
        let to = self.resolve(to);
        under_deadline("rename", async move {
            tokio::fs::rename(&from, &to).await?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let target = self.resolve(path);
        under_deadline("remove", async move {
            tokio::fs::remove_file(&target).await?;
            Ok(())
        })
        .await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let target = self.resolve(path);
        under_deadline("exists", async move { Ok(tokio::fs::metadata(&target).await.is_ok()) }).await
    }

    async fn set_mtime(&self, path: &str, mtime: DateTime<Utc>) -> Result<()> {
        let target = self.resolve(path);
        under_deadline("set_mtime", async move {
            let mtime = filetime::FileTime::from_unix_time(mtime.timestamp(), 0);
            let atime = filetime::FileTime::now();
            tokio::task::spawn_blocking(move || filetime::set_file_times(&target, atime, mtime))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))?
                .map_err(Error::from)
        })
        .await
    }
}
