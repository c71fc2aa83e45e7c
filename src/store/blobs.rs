//! Content-addressed blob files on disk.
//!
//! Blobs are stored in a flat directory sharded by the first two hex chars of
//! the digest, so `ab17...` lands in `<root>/ab/ab17....data`. Writes go to a
//! temp file first and are renamed into place, so a crash never leaves a
//! partially written blob under its final name.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use anyhow::{Context, Result};
use bytes::Bytes;

use crate::digest::Digest;

const EXTENSION: &str = "data";

/// Timeout for a backoff on retrying operations.
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// The maximum number of retries that will be attempted.
const RETRY_ATTEMPTS: usize = 6;

#[derive(Debug)]
pub struct BlobStore {
    /// Path to the root of the storage on disk.
    path: PathBuf,
    /// Current disk usage in bytes.
    disk_usage: AtomicU64,
}

impl BlobStore {
    /// Creates or opens an existing store at the provided path as the root.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path).with_context(|| format!("Failed to create {path:?}"))?;
        let disk_usage = calculate_disk_usage(path)?;
        Ok(BlobStore {
            path: path.to_path_buf(),
            disk_usage: AtomicU64::new(disk_usage),
        })
    }

    /// Stores the given bytes under their digest.
    ///
    /// A blob that already exists is left untouched, so re-putting identical
    /// bytes is free and never duplicates storage.
    pub async fn put(&self, digest: &Digest, value: &[u8]) -> Result<()> {
        let filepath = self.as_path(digest);
        if filepath.exists() {
            return Ok(());
        }
        let parent_dir = filepath.parent().expect("blob path has a shard dir");

        // Make sure the sharding directory exists.
        if !parent_dir.exists() {
            if let Err(err) = retry(|| tokio::fs::create_dir(parent_dir)).await {
                // Directory got already created, that's fine.
                if err.kind() != io::ErrorKind::AlreadyExists {
                    return Err(err).with_context(|| format!("Failed to create {parent_dir:?}"));
                }
            }
        }

        // Write to temp location
        let temp_filepath = filepath.with_extension("temp");
        retry(|| tokio::fs::write(&temp_filepath, value))
            .await
            .with_context(|| format!("Failed to write {temp_filepath:?}"))?;

        // Rename after successful write
        retry(|| tokio::fs::rename(&temp_filepath, &filepath))
            .await
            .with_context(|| format!("Failed to rename: {temp_filepath:?} -> {filepath:?}"))?;

        self.disk_usage
            .fetch_add(value.len() as u64, Ordering::SeqCst);

        Ok(())
    }

    /// Retrieves the bytes stored under the given digest.
    pub async fn get(&self, digest: &Digest) -> Result<Option<Bytes>> {
        let filepath = self.as_path(digest);
        match tokio::fs::read(&filepath).await {
            Ok(value) => Ok(Some(value.into())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("Failed to read {filepath:?}")),
        }
    }

    /// Current disk usage in bytes.
    pub fn disk_usage(&self) -> u64 {
        self.disk_usage.load(Ordering::SeqCst)
    }

    fn as_path(&self, digest: &Digest) -> PathBuf {
        let key = digest.to_hex();
        let mut p = self.path.join(&key[..2]).join(key);
        p.set_extension(EXTENSION);
        p
    }
}

async fn retry<T, F, Fut>(f: F) -> io::Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = io::Result<T>>,
{
    let mut attempts = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempts += 1;
                if attempts >= RETRY_ATTEMPTS {
                    return Err(err);
                }
                tokio::time::sleep(RETRY_DELAY * attempts as u32).await;
            }
        }
    }
}

fn calculate_disk_usage(path: &Path) -> Result<u64> {
    let mut total = 0;
    for shard in fs::read_dir(path)? {
        let shard = shard?;
        if !shard.path().is_dir() {
            continue;
        }
        for entry in fs::read_dir(shard.path())? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_file() {
                total += metadata.len();
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(dir.path()).unwrap();
        let value = b"some track bytes".to_vec();
        let digest = Digest::new(&value);

        blobs.put(&digest, &value).await.unwrap();
        assert_eq!(blobs.get(&digest).await.unwrap().unwrap(), value.as_slice());
        assert_eq!(blobs.disk_usage(), value.len() as u64);

        // re-put is a no-op
        blobs.put(&digest, &value).await.unwrap();
        assert_eq!(blobs.disk_usage(), value.len() as u64);
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(dir.path()).unwrap();
        let digest = Digest::new(b"never stored");
        assert!(blobs.get(&digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn usage_recalculated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let blobs = BlobStore::open(dir.path()).unwrap();
            blobs.put(&Digest::new(b"a"), b"a").await.unwrap();
            blobs.put(&Digest::new(b"bb"), b"bb").await.unwrap();
        }
        let blobs = BlobStore::open(dir.path()).unwrap();
        assert_eq!(blobs.disk_usage(), 3);
    }
}
