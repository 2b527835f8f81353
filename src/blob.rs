//! Blob store collaborator
//!
//! Uploaded bytes live under `uploads/{jobId}/{fileName}` so a worker can
//! find them from the job descriptor alone.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{Error, Result};

pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, body: ByteStream, size: u64, content_type: &str) -> Result<()>;

    /// Fails with [`Error::BlobNotFound`] when nothing is stored at `path`.
    async fn get(&self, path: &str) -> Result<ByteStream>;
}

pub fn upload_path(job_id: Uuid, file_name: &str) -> String {
    format!("uploads/{job_id}/{}", sanitize_file_name(file_name))
}

/// Reduces a client-supplied name to one safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

pub fn stream_from_bytes(data: impl Into<Bytes>) -> ByteStream {
    Box::pin(std::io::Cursor::new(data.into()))
}

const MAX_PREALLOCATION: u64 = 8 * 1024 * 1024;

/// Blob store rooted in a local directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::blob(format!("invalid blob path: {path}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, mut body: ByteStream, size: u64, content_type: &str) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Readers never observe a half-written blob.
        let partial = target.with_extension(format!("partial-{}", Uuid::new_v4()));
        let written = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            let written = tokio::io::copy(&mut body, &mut file).await?;
            file.sync_all().await?;
            Ok::<_, std::io::Error>(written)
        }
        .await;

        let written = match written {
            Ok(written) => written,
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(Error::blob(format!("failed to write {path}: {err}")));
            }
        };
        if let Err(err) = tokio::fs::rename(&partial, &target).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(Error::blob(format!("failed to store {path}: {err}")));
        }

        info!(path, size, written, content_type, "Stored blob");
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<ByteStream> {
        let target = self.resolve(path)?;
        match tokio::fs::File::open(&target).await {
            Ok(file) => {
                debug!(path, "Opened blob");
                Ok(Box::pin(file))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Err(Error::BlobNotFound(path.to_string())),
            Err(err) => Err(Error::blob(format!("failed to open {path}: {err}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub data: Bytes,
    pub content_type: String,
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, StoredBlob>>,
}

impl MemoryBlobStore {
    pub fn object(&self, path: &str) -> Option<StoredBlob> {
        self.objects.lock().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, mut body: ByteStream, size: u64, content_type: &str) -> Result<()> {
        // The size is caller-reported, so it only hints the allocation.
        let mut data = Vec::with_capacity(size.min(MAX_PREALLOCATION) as usize);
        body.read_to_end(&mut data)
            .await
            .map_err(|e| Error::blob(format!("failed to read upload for {path}: {e}")))?;

        self.objects.lock().insert(
            path.to_string(),
            StoredBlob {
                data: data.into(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<ByteStream> {
        self.objects
            .lock()
            .get(path)
            .map(|blob| stream_from_bytes(blob.data.clone()))
            .ok_or_else(|| Error::BlobNotFound(path.to_string()))
    }
}
