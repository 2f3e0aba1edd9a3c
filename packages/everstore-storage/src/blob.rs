//! Opaque blob storage with streamed reads.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncReadExt;

use crate::error::{Result, StorageError};

/// Byte storage keyed by id. Large payloads are read through
/// [`BlobStream`] so callers never materialize them unless they ask to.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn initialize(&self) -> Result<()>;
    async fn save(&self, id: &str, bytes: &[u8]) -> Result<()>;
    async fn load(&self, id: &str) -> Result<Option<Vec<u8>>>;
    async fn delete(&self, id: &str) -> Result<bool>;
    async fn contains(&self, id: &str) -> Result<bool>;
    async fn size(&self, id: &str) -> Result<Option<u64>>;
    async fn stream_read(&self, id: &str, chunk_size: usize) -> Result<BlobStream>;
    async fn dispose(&self) -> Result<()>;
}

/// Pull-based chunked reader over one blob.
#[derive(Debug)]
pub struct BlobStream {
    file: fs::File,
    chunk_size: usize,
}

impl BlobStream {
    /// The next chunk, at most `chunk_size` bytes; `None` at end of blob.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(buf))
    }
}

/// File-system blob store: one file per id under a root directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() {
            return Err(StorageError::not_supported("blob id must be non-empty"));
        }
        // Flatten ids into safe file names.
        let sanitized: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Ok(self.root.join(sanitized))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn save(&self, id: &str, bytes: &[u8]) -> Result<()> {
        fs::write(self.path_for(id)?, bytes).await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(id)?).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(id)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        Ok(fs::try_exists(self.path_for(id)?).await?)
    }

    async fn size(&self, id: &str) -> Result<Option<u64>> {
        match fs::metadata(self.path_for(id)?).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn stream_read(&self, id: &str, chunk_size: usize) -> Result<BlobStream> {
        if chunk_size == 0 {
            return Err(StorageError::not_supported("chunk size must be positive"));
        }
        let path = self.path_for(id)?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::not_found(format!("blob {}", id)));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(BlobStream { file, chunk_size })
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}
