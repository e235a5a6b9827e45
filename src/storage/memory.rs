use super::{
    current_timestamp, BoxReader, ListPage, ObjectMeta, ObjectRead, ObjectStore, StorageError,
    StorageResult, UploadOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

const ADDRESS_SCHEME: &str = "mem://";
const DEFAULT_PAGE_SIZE: usize = 1000;

/// Object data stored in memory
#[derive(Debug, Clone)]
struct StoredObject {
    content: Bytes,
    last_modified: u32,
    etag: String,
}

/// In-memory object store for testing and development
///
/// Keys are kept in lexicographic order and listed in pages, like a real
/// object store. Clones share the same objects.
#[derive(Clone)]
pub struct MemoryStore {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
    versions: Arc<AtomicU64>,
    page_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            versions: Arc::new(AtomicU64::new(0)),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Limit the number of objects returned per listing page
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Every write gets a fresh etag, even for identical content
    fn next_etag(&self) -> String {
        format!("\"{:x}\"", self.versions.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Store an object directly, stamped with the current time
    pub fn insert(&self, key: impl Into<String>, content: impl Into<Bytes>) {
        self.insert_with_mtime(key, content, current_timestamp());
    }

    /// Store an object directly with an explicit modification time
    pub fn insert_with_mtime(
        &self,
        key: impl Into<String>,
        content: impl Into<Bytes>,
        last_modified: u32,
    ) {
        let etag = self.next_etag();
        self.objects.write().insert(
            key.into(),
            StoredObject {
                content: content.into(),
                last_modified,
                etag,
            },
        );
    }

    /// Current content of an object, if present
    pub fn content(&self, key: &str) -> Option<Bytes> {
        self.objects.read().get(key).map(|o| o.content.clone())
    }

    /// All keys in listing order
    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_page(&self, continuation: Option<String>) -> StorageResult<ListPage> {
        let objects = self.objects.read();
        let lower = match continuation {
            Some(ref marker) => Bound::Excluded(marker.clone()),
            None => Bound::Unbounded,
        };

        let mut page: Vec<ObjectMeta> = objects
            .range((lower, Bound::Unbounded))
            .take(self.page_size + 1)
            .map(|(key, obj)| ObjectMeta {
                key: key.clone(),
                size: obj.content.len() as u64,
                last_modified: obj.last_modified,
            })
            .collect();

        // One extra object fetched tells whether another page follows
        let next = if page.len() > self.page_size {
            page.truncate(self.page_size);
            page.last().map(|o| o.key.clone())
        } else {
            None
        };

        Ok(ListPage {
            objects: page,
            next,
        })
    }

    async fn get_range(
        &self,
        key: &str,
        offset: u64,
        if_match: Option<&str>,
    ) -> StorageResult<ObjectRead> {
        let (content, etag) = self
            .objects
            .read()
            .get(key)
            .map(|o| (o.content.clone(), o.etag.clone()))
            .ok_or(StorageError::NotFound)?;

        if if_match.is_some_and(|expected| expected != etag) {
            return Err(StorageError::Changed);
        }

        let len = content.len() as u64;
        if offset > len {
            return Err(StorageError::InvalidRange);
        }

        let remaining = content.slice(offset as usize..);
        let body = if remaining.is_empty() {
            stream::empty().boxed()
        } else {
            stream::once(async move { Ok(remaining) }).boxed()
        };

        Ok(ObjectRead {
            content_length: len - offset,
            etag: Some(etag),
            body,
        })
    }

    async fn upload(
        &self,
        key: &str,
        mut reader: BoxReader,
        options: UploadOptions,
    ) -> StorageResult<()> {
        let mut content = Vec::new();
        let mut buffer = vec![0u8; options.buffer_size.max(1)];
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            content.extend_from_slice(&buffer[..n]);
        }

        // Committed only once the whole source has been read
        self.insert(key, content);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    fn source_address(&self, key: &str) -> String {
        format!("{}{}", ADDRESS_SCHEME, key)
    }

    async fn copy_from(&self, source: &str, dst_key: &str) -> StorageResult<()> {
        let src_key = source
            .strip_prefix(ADDRESS_SCHEME)
            .ok_or_else(|| StorageError::Other(format!("Unsupported source address: {}", source)))?;

        let etag = self.next_etag();
        let mut objects = self.objects.write();
        let obj = objects.get(src_key).cloned().ok_or(StorageError::NotFound)?;
        objects.insert(
            dst_key.to_string(),
            StoredObject {
                content: obj.content,
                last_modified: current_timestamp(),
                etag,
            },
        );
        Ok(())
    }
}
