use super::{
    BoxReader, ListPage, MemoryStore, ObjectRead, ObjectStore, StorageError, StorageResult,
    UploadOptions,
};
use async_trait::async_trait;

/// [`MemoryStore`] wrapper that refuses selected write operations
#[derive(Clone, Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    pub deny_uploads: bool,
    pub deny_deletes: bool,
}

impl FaultyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub fn deny_uploads(mut self) -> Self {
        self.deny_uploads = true;
        self
    }

    pub fn deny_deletes(mut self) -> Self {
        self.deny_deletes = true;
        self
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn list_page(&self, continuation: Option<String>) -> StorageResult<ListPage> {
        self.inner.list_page(continuation).await
    }

    async fn get_range(
        &self,
        key: &str,
        offset: u64,
        if_match: Option<&str>,
    ) -> StorageResult<ObjectRead> {
        self.inner.get_range(key, offset, if_match).await
    }

    async fn upload(&self, key: &str, reader: BoxReader, options: UploadOptions) -> StorageResult<()> {
        if self.deny_uploads {
            return Err(StorageError::PermissionDenied);
        }
        self.inner.upload(key, reader, options).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        if self.deny_deletes {
            return Err(StorageError::PermissionDenied);
        }
        self.inner.delete(key).await
    }

    fn source_address(&self, key: &str) -> String {
        self.inner.source_address(key)
    }

    async fn copy_from(&self, source: &str, dst_key: &str) -> StorageResult<()> {
        self.inner.copy_from(source, dst_key).await
    }
}
