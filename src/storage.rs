use crate::format::content_type_from_name;
use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::io::ReaderStream;

const CONTENT_TYPE_SUFFIX: &str = ".content-type";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object name: {0}")]
    InvalidName(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub struct StoredObject {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: Body,
}

/// Durable object storage for transformed images.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool, StorageError>;
    async fn read(&self, name: &str) -> Result<StoredObject, StorageError>;
    /// Stores `bytes` publicly readable under `name`.
    async fn write(
        &self,
        name: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError>;
    fn backend(&self) -> &'static str;
}

/// Objects as files in one directory; the content type lives in a sidecar
/// file written before the object so a visible object always has one.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn object_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        let path = self.object_path(name)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn read(&self, name: &str) -> Result<StoredObject, StorageError> {
        let path = self.object_path(name)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(name.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let content_length = file.metadata().await.ok().map(|metadata| metadata.len());
        let content_type = match tokio::fs::read_to_string(sidecar_path(&path)).await {
            Ok(value) => Some(value.trim().to_string()),
            Err(_) => content_type_from_name(name).map(str::to_string),
        };
        Ok(StoredObject {
            content_type,
            content_length,
            body: Body::from_stream(ReaderStream::new(file)),
        })
    }

    async fn write(
        &self,
        name: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let path = self.object_path(name)?;
        write_atomic(&sidecar_path(&path), content_type.as_bytes()).await?;
        write_atomic(&path, &bytes).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "fs"
    }
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with(CONTENT_TYPE_SUFFIX)
        && !name.contains(['/', '\\'])
        && !name.contains("..");
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(CONTENT_TYPE_SUFFIX);
    PathBuf::from(sidecar)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("object");
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    let temp_path = parent.join(format!(".{file_name}.tmp-{nonce}"));
    if let Err(err) = tokio::fs::write(&temp_path, bytes).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(err);
    }
    if let Err(err) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    objects: Arc<DashMap<String, (Bytes, String)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<(Bytes, String)> {
        self.objects.get(name).map(|entry| entry.value().clone())
    }

    #[cfg(test)]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.objects.len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.objects.contains_key(name))
    }

    async fn read(&self, name: &str) -> Result<StoredObject, StorageError> {
        let (bytes, content_type) = self
            .get(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        Ok(StoredObject {
            content_type: Some(content_type),
            content_length: Some(bytes.len() as u64),
            body: Body::from(bytes),
        })
    }

    async fn write(
        &self,
        name: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.objects
            .insert(name.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
