use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncRead;

pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryStore;
#[cfg(feature = "s3")]
pub use s3::{S3Config, S3Store};

/// Result type for storage client operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Chunked object body as delivered by a storage client
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Upload source handed to a storage client
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Errors surfaced by the object storage client
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found")]
    NotFound,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Requested range not satisfiable")]
    InvalidRange,
    #[error("Object changed since the read started")]
    Changed,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Storage error: {0}")]
    Other(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageError::PermissionDenied,
            _ => StorageError::Io(err.to_string()),
        }
    }
}

/// Metadata of a single object in a listing page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Full object key, relative to the store's configured prefix
    pub key: String,
    pub size: u64,
    /// Unix timestamp of the last modification
    pub last_modified: u32,
}

/// One page of a flat object listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectMeta>,
    /// Continuation marker for the next page, `None` once the listing is exhausted
    pub next: Option<String>,
}

/// A ranged object read
pub struct ObjectRead {
    /// Number of bytes remaining from the requested offset to the end of the object
    pub content_length: u64,
    /// Version tag of the object that was read
    pub etag: Option<String>,
    pub body: ByteStream,
}

/// Buffering parameters for streaming uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    /// Size of each upload buffer in bytes
    pub buffer_size: usize,
    /// Maximum number of buffers uploading concurrently
    pub max_buffers: usize,
}

/// Object storage client contract
///
/// Keys are flat strings; any "directory" structure is inferred by callers
/// from delimiter characters inside keys.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch one page of the flat object listing
    ///
    /// Pass `None` for the first page and the previous page's `next` marker
    /// afterwards.
    async fn list_page(&self, continuation: Option<String>) -> StorageResult<ListPage>;

    /// Read an object from `offset` to its end
    ///
    /// An offset equal to the object size yields an empty body. With
    /// `if_match`, the read fails with [`StorageError::Changed`] unless the
    /// object still carries that etag.
    async fn get_range(
        &self,
        key: &str,
        offset: u64,
        if_match: Option<&str>,
    ) -> StorageResult<ObjectRead>;

    /// Stream `reader` into the object at `key`, replacing it
    ///
    /// A failed upload must not leave a partially written object behind.
    async fn upload(&self, key: &str, reader: BoxReader, options: UploadOptions)
        -> StorageResult<()>;

    /// Delete an object, including any retained versions or snapshots
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Address of an object as understood by [`ObjectStore::copy_from`]
    fn source_address(&self, key: &str) -> String;

    /// Server-side copy of the object at `source` into `dst_key`
    async fn copy_from(&self, source: &str, dst_key: &str) -> StorageResult<()>;
}

/// Get current Unix timestamp
pub fn current_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
