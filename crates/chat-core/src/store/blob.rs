//! Blob store implementations.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{BlobReader, BlobStore, StoredBlob};

/// Reject names that could escape the storage directory.
fn check_storage_name(filename: &str) -> io::Result<()> {
    if filename.is_empty()
        || filename.starts_with('.')
        || filename.contains(|c: char| c == '/' || c == '\\')
        || filename.contains("..")
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid storage name: {:?}", filename),
        ));
    }
    Ok(())
}

/// Stores each blob as a flat file at `{dir}/{filename}`.
pub struct LocalBlobStore {
    dir: PathBuf,
    public_url: String,
}

impl LocalBlobStore {
    /// Open (creating if needed) a storage directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn new(dir: impl Into<PathBuf>, public_url: impl Into<String>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        info!("Blob storage directory: {}", dir.display());
        Ok(Self {
            dir,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Path of a stored blob.
    #[must_use]
    pub fn file_path(&self, file_id: &str) -> PathBuf {
        self.dir.join(file_id)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn store_file(
        &self,
        mut reader: BlobReader<'_>,
        filename: &str,
        content_type: &str,
    ) -> io::Result<StoredBlob> {
        check_storage_name(filename)?;

        let path = self.file_path(filename);
        let mut file = fs::File::create(&path).await?;
        let size = match tokio::io::copy(&mut reader, &mut file).await {
            Ok(size) => size,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&path).await;
                return Err(e);
            }
        };
        file.flush().await?;

        debug!(file = %filename, content_type, size, "Stored blob");
        Ok(StoredBlob {
            file_id: filename.to_string(),
            url: format!("{}/{}", self.public_url, filename),
            size,
        })
    }

    async fn delete_file(&self, file_id: &str) -> io::Result<()> {
        check_storage_name(file_id)?;
        match fs::remove_file(self.file_path(file_id)).await {
            Ok(()) => {
                debug!(file = %file_id, "Deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(file = %file_id, "Blob already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Blob store kept in memory, with call counters and failure switches.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, (Bytes, String)>,
    store_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    fail_stores: AtomicBool,
    fail_deletes: AtomicBool,
    store_delay: parking_lot::Mutex<Option<Duration>>,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `store_file` calls received.
    #[must_use]
    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }

    /// Number of `delete_file` calls received.
    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Make every `store_file` call fail.
    pub fn fail_stores(&self, fail: bool) {
        self.fail_stores.store(fail, Ordering::SeqCst);
    }

    /// Make every `delete_file` call fail.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long inside `store_file` before reading the stream.
    pub fn set_store_delay(&self, delay: Option<Duration>) {
        *self.store_delay.lock() = delay;
    }

    /// Contents of a stored blob.
    #[must_use]
    pub fn get(&self, file_id: &str) -> Option<Bytes> {
        self.blobs.get(file_id).map(|entry| entry.0.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn store_file(
        &self,
        mut reader: BlobReader<'_>,
        filename: &str,
        content_type: &str,
    ) -> io::Result<StoredBlob> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.store_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_stores.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "blob store unavailable"));
        }

        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let size = data.len() as u64;
        self.blobs
            .insert(filename.to_string(), (Bytes::from(data), content_type.to_string()));

        Ok(StoredBlob {
            file_id: filename.to_string(),
            url: format!("memory://{}", filename),
            size,
        })
    }

    async fn delete_file(&self, file_id: &str) -> io::Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "blob store unavailable"));
        }
        self.blobs.remove(file_id);
        Ok(())
    }
}
