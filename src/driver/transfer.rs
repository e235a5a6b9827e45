use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::counting::CountingReader;
use super::{object_key, DriverResult, ObjectDriver};
use crate::storage::{BoxReader, ByteStream, ObjectStore, StorageError, UploadOptions};

/// Size of each streaming upload buffer (the S3 minimum part size)
pub const UPLOAD_BUFFER_SIZE: usize = 5 * 1024 * 1024;

/// Upload buffers in flight at once
pub const UPLOAD_MAX_BUFFERS: usize = 3;

/// Reopen attempts allowed per download after a failed or truncated read
pub const MAX_READ_RETRIES: u32 = 20;

/// Delay before the first reopen; doubles with every further attempt
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

/// Backoff before reopen attempt `attempt` (1-based)
fn retry_delay(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    RETRY_BASE_DELAY.saturating_mul(factor).min(RETRY_MAX_DELAY)
}

/// Download state that resumes from the last delivered byte on failure
///
/// Reopens are pinned to the etag of the first read, so an object replaced
/// mid-download fails the stream instead of splicing two versions.
struct ResumableRead {
    store: Arc<dyn ObjectStore>,
    key: String,
    etag: Option<String>,
    offset: u64,
    remaining: u64,
    body: Option<ByteStream>,
    retries_left: u32,
    cancel: CancellationToken,
    done: bool,
}

impl ResumableRead {
    fn into_stream(self) -> ByteStream {
        stream::unfold(self, |mut read| async move {
            let chunk = read.next_chunk().await?;
            Some((chunk, read))
        })
        .boxed()
    }

    fn cancelled(&mut self) -> Option<io::Result<Bytes>> {
        self.done = true;
        Some(Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "transfer cancelled",
        )))
    }

    /// Consume one retry, or end the stream with `err` once the budget is spent
    fn retry_or_fail(&mut self, err: io::Error) -> Option<io::Result<Bytes>> {
        if self.retries_left == 0 {
            self.done = true;
            return Some(Err(err));
        }
        self.retries_left -= 1;
        self.body = None;
        warn!(
            key = %self.key,
            offset = self.offset,
            retries_left = self.retries_left,
            error = %err,
            "Retrying object read"
        );
        None
    }

    fn backoff(&self) -> Duration {
        retry_delay(MAX_READ_RETRIES - self.retries_left)
    }

    async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        loop {
            if self.done {
                return None;
            }

            if self.body.is_none() {
                let delay = self.backoff();
                let (store, key, etag, offset) =
                    (&self.store, &self.key, self.etag.as_deref(), self.offset);
                let reopened = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    result = async move {
                        tokio::time::sleep(delay).await;
                        store.get_range(key, offset, etag).await
                    } => Some(result),
                };
                match reopened {
                    None => return self.cancelled(),
                    Some(Ok(read)) => self.body = Some(read.body),
                    Some(Err(StorageError::Changed)) => {
                        warn!(key = %self.key, offset = self.offset, "Object replaced during download");
                        self.done = true;
                        return Some(Err(io::Error::other(StorageError::Changed)));
                    }
                    Some(Err(err)) => {
                        if let Some(failed) = self.retry_or_fail(io::Error::other(err)) {
                            return Some(failed);
                        }
                        continue;
                    }
                }
            }

            let Some(body) = self.body.as_mut() else {
                continue;
            };
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                next = body.next() => Some(next),
            };

            match next {
                None => return self.cancelled(),
                Some(Some(Ok(chunk))) => {
                    let len = chunk.len() as u64;
                    self.offset += len;
                    self.remaining = self.remaining.saturating_sub(len);
                    return Some(Ok(chunk));
                }
                Some(Some(Err(err))) => {
                    if let Some(failed) = self.retry_or_fail(err) {
                        return Some(failed);
                    }
                }
                Some(None) if self.remaining == 0 => {
                    self.done = true;
                    return None;
                }
                Some(None) => {
                    let err = io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "object body ended before its content length",
                    );
                    if let Some(failed) = self.retry_or_fail(err) {
                        return Some(failed);
                    }
                }
            }
        }
    }
}

impl ObjectDriver {
    pub(super) async fn download(&self, path: &str, offset: u64) -> DriverResult<(u64, ByteStream)> {
        let key = object_key(path);
        debug!(key, offset, "Downloading object");

        let read = self.guarded(self.store.get_range(key, offset, None)).await?;
        let content_length = read.content_length;

        let body = ResumableRead {
            store: self.store.clone(),
            key: key.to_string(),
            etag: read.etag,
            offset,
            remaining: content_length,
            body: Some(read.body),
            retries_left: MAX_READ_RETRIES,
            cancel: self.cancel.clone(),
            done: false,
        }
        .into_stream();

        Ok((content_length, body))
    }

    /// Append is accepted but behaves as a full overwrite
    pub(super) async fn upload(&self, path: &str, data: BoxReader, append: bool) -> DriverResult<u64> {
        let key = object_key(path);
        debug!(key, append, "Uploading object");

        let reader = CountingReader::new(data);
        let counter = reader.counter();
        let options = UploadOptions {
            buffer_size: UPLOAD_BUFFER_SIZE,
            max_buffers: UPLOAD_MAX_BUFFERS,
        };

        self.guarded(self.store.upload(key, Box::new(reader), options))
            .await?;

        let written = counter.get();
        debug!(key, written, "Upload complete");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::driver;
    use super::super::{Driver, DriverError, Ephemeral};
    use super::*;
    use crate::storage::testing::FaultyStore;
    use crate::storage::{ListPage, MemoryStore, ObjectRead, StorageResult};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};

    async fn read_all(body: ByteStream) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut body = body;
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = MemoryStore::new();
        let driver = driver(&store);
        let payload = b"some file content".to_vec();

        let written = driver
            .put_file("/a/b.txt", Box::new(std::io::Cursor::new(payload.clone())), false)
            .await
            .unwrap();
        assert_eq!(written, payload.len() as u64);
        assert_eq!(store.keys(), vec!["a/b.txt"]);

        let (len, body) = driver.get_file("/a/b.txt", 0).await.unwrap();
        assert_eq!(len, payload.len() as u64);
        assert_eq!(read_all(body).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_append_overwrites() {
        let store = MemoryStore::new();
        store.insert("log.txt", &b"old contents"[..]);
        let driver = driver(&store);

        let written = driver
            .put_file("/log.txt", Box::new(&b"new"[..]), true)
            .await
            .unwrap();
        assert_eq!(written, 3);
        assert_eq!(store.content("log.txt").unwrap(), &b"new"[..]);
    }

    #[tokio::test]
    async fn test_get_missing_file() {
        let driver = driver(&MemoryStore::new());
        assert!(matches!(
            driver.get_file("/nope.txt", 0).await,
            Err(DriverError::Storage(StorageError::NotFound))
        ));
    }

    /// Store whose first reads break off after `cut` bytes
    struct FlakyStore {
        inner: MemoryStore,
        failures_left: AtomicU32,
        cut: usize,
        opens: AtomicU32,
        /// Content written over the object right after the first broken read
        replacement: Mutex<Option<Bytes>>,
    }

    impl FlakyStore {
        fn new(inner: MemoryStore, failures: u32, cut: usize) -> Self {
            Self {
                inner,
                failures_left: AtomicU32::new(failures),
                cut,
                opens: AtomicU32::new(0),
                replacement: Mutex::new(None),
            }
        }

        fn replaced_with(self, content: &'static [u8]) -> Self {
            *self.replacement.lock() = Some(Bytes::from_static(content));
            self
        }
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn list_page(&self, continuation: Option<String>) -> StorageResult<ListPage> {
            self.inner.list_page(continuation).await
        }

        async fn get_range(
            &self,
            key: &str,
            offset: u64,
            if_match: Option<&str>,
        ) -> StorageResult<ObjectRead> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let read = self.inner.get_range(key, offset, if_match).await?;
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !failing {
                return Ok(read);
            }

            let etag = read.etag;
            let content = read_all(read.body).await?;
            let head = Bytes::from(content[..self.cut.min(content.len())].to_vec());
            if let Some(replacement) = self.replacement.lock().take() {
                self.inner.insert(key, replacement);
            }
            let body = stream::iter(vec![
                Ok(head),
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")),
            ])
            .boxed();
            Ok(ObjectRead {
                content_length: read.content_length,
                etag,
                body,
            })
        }

        async fn upload(
            &self,
            key: &str,
            reader: BoxReader,
            options: UploadOptions,
        ) -> StorageResult<()> {
            self.inner.upload(key, reader, options).await
        }

        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.inner.delete(key).await
        }

        fn source_address(&self, key: &str) -> String {
            self.inner.source_address(key)
        }

        async fn copy_from(&self, source: &str, dst_key: &str) -> StorageResult<()> {
            self.inner.copy_from(source, dst_key).await
        }
    }

    fn flaky_driver(store: Arc<FlakyStore>) -> ObjectDriver {
        ObjectDriver::new(store, Arc::new(Ephemeral), CancellationToken::new())
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        assert_eq!(retry_delay(1), Duration::from_millis(50));
        assert_eq!(retry_delay(2), Duration::from_millis(100));
        assert_eq!(retry_delay(4), Duration::from_millis(400));
        assert_eq!(retry_delay(MAX_READ_RETRIES), RETRY_MAX_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_resumes_after_read_failure() {
        let inner = MemoryStore::new();
        inner.insert("f.bin", &b"0123456789"[..]);
        let store = Arc::new(FlakyStore::new(inner, 2, 3));
        let driver = flaky_driver(store.clone());

        let (len, body) = driver.get_file("/f.bin", 2).await.unwrap();
        assert_eq!(len, 8);
        let started = tokio::time::Instant::now();
        assert_eq!(read_all(body).await.unwrap(), b"23456789");
        assert_eq!(store.opens.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= retry_delay(1) + retry_delay(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_fails_when_object_replaced() {
        let inner = MemoryStore::new();
        inner.insert("f.bin", &b"0123456789"[..]);
        let store = Arc::new(FlakyStore::new(inner.clone(), 1, 3).replaced_with(b"ABCDEFGHIJ"));
        let driver = flaky_driver(store.clone());

        let (len, mut body) = driver.get_file("/f.bin", 0).await.unwrap();
        assert_eq!(len, 10);
        assert_eq!(body.next().await.unwrap().unwrap(), &b"012"[..]);

        let err = body.next().await.unwrap().unwrap_err();
        assert!(matches!(
            err.get_ref().and_then(|e| e.downcast_ref::<StorageError>()),
            Some(StorageError::Changed)
        ));
        assert!(body.next().await.is_none());
        // One reopen, refused without spending further retries
        assert_eq!(store.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_gives_up_after_retry_budget() {
        let inner = MemoryStore::new();
        inner.insert("f.bin", &b"0123456789"[..]);
        let store = Arc::new(FlakyStore::new(inner, MAX_READ_RETRIES + 5, 1));
        let driver = flaky_driver(store.clone());

        let (_, body) = driver.get_file("/f.bin", 0).await.unwrap();
        let err = read_all(body).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(store.opens.load(Ordering::SeqCst), MAX_READ_RETRIES + 1);
    }

    #[tokio::test]
    async fn test_refused_upload_returns_storage_error() {
        let inner = MemoryStore::new();
        let driver = ObjectDriver::new(
            Arc::new(FaultyStore::new(inner.clone()).deny_uploads()),
            Arc::new(Ephemeral),
            CancellationToken::new(),
        );

        let result = driver
            .put_file("/a.txt", Box::new(&b"data"[..]), false)
            .await;
        assert!(matches!(
            result,
            Err(DriverError::Storage(StorageError::PermissionDenied))
        ));
        assert!(inner.keys().is_empty());
    }

    /// Reader that yields `head` and then fails
    struct BrokenReader {
        head: Option<&'static [u8]>,
    }

    impl AsyncRead for BrokenReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.head.take() {
                Some(head) => {
                    buf.put_slice(head);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "client went away",
                ))),
            }
        }
    }

    #[tokio::test]
    async fn test_failed_source_commits_nothing() {
        let store = MemoryStore::new();
        store.insert("keep.txt", &b"old"[..]);
        let driver = driver(&store);

        let result = driver
            .put_file("/keep.txt", Box::new(BrokenReader { head: Some(b"new") }), false)
            .await;
        assert!(matches!(result, Err(DriverError::Storage(StorageError::Io(_)))));
        assert_eq!(store.content("keep.txt").unwrap(), &b"old"[..]);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_upload() {
        let store = MemoryStore::new();
        let driver = Arc::new(driver(&store));
        let (mut client, reader) = tokio::io::duplex(64);

        let upload = tokio::spawn({
            let driver = driver.clone();
            async move { driver.put_file("/big.bin", Box::new(reader), false).await }
        });
        tokio::io::AsyncWriteExt::write_all(&mut client, b"partial").await.unwrap();
        driver.abort();

        assert!(matches!(upload.await.unwrap(), Err(DriverError::Cancelled)));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_download() {
        let store = MemoryStore::new();
        store.insert("f.bin", &b"abc"[..]);
        let driver = driver(&store);

        let (_, mut body) = driver.get_file("/f.bin", 0).await.unwrap();
        driver.abort();

        let err = body.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert!(body.next().await.is_none());
    }

    proptest! {
        #[test]
        fn prop_get_from_offset_returns_suffix(
            (payload, offset) in proptest::collection::vec(any::<u8>(), 0..512)
                .prop_flat_map(|p| { let len = p.len(); (Just(p), 0..=len) })
        ) {
            let store = MemoryStore::new();
            let driver = driver(&store);
            let (written, len, content) = tokio_test::block_on(async {
                let written = driver
                    .put_file("/data/blob.bin", Box::new(std::io::Cursor::new(payload.clone())), false)
                    .await
                    .unwrap();
                let (len, body) = driver.get_file("/data/blob.bin", offset as u64).await.unwrap();
                (written, len, read_all(body).await.unwrap())
            });
            prop_assert_eq!(written, payload.len() as u64);
            prop_assert_eq!(len, (payload.len() - offset) as u64);
            prop_assert_eq!(&content[..], &payload[offset..]);
        }
    }
}
