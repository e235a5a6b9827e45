use super::{
    current_timestamp, BoxReader, ListPage, ObjectMeta, ObjectRead, ObjectStore, StorageError,
    StorageResult, UploadOptions,
};
use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use std::future::Future;
use tokio::io::AsyncReadExt;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

/// S3 object store configuration
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 bucket name (required)
    pub bucket: String,
    /// Key prefix for all objects (optional, for multi-tenant setups)
    pub prefix: String,
    /// Also delete non-current versions and delete markers of a removed object
    pub purge_versions: bool,
}

impl S3Config {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: String::new(),
            purge_versions: false,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_purge_versions(mut self, purge: bool) -> Self {
        self.purge_versions = purge;
        self
    }
}

/// S3 object store
pub struct S3Store {
    client: Client,
    config: S3Config,
}

impl S3Store {
    /// Create a new S3 store with the given client and configuration
    pub fn new(client: Client, config: S3Config) -> Self {
        Self { client, config }
    }

    /// Create from AWS SDK config loaded from environment
    pub async fn from_env(config: S3Config) -> Self {
        let aws_config = aws_config::load_from_env().await;
        let client = Client::new(&aws_config);
        Self::new(client, config)
    }

    /// Create for an S3-compatible service at a custom endpoint
    pub async fn with_endpoint(config: S3Config, endpoint: &str, region: &str) -> Self {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region.to_string()))
            .endpoint_url(endpoint)
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .force_path_style(true)
            .build();
        Self::new(Client::from_conf(s3_config), config)
    }

    fn key_prefix(&self) -> Option<String> {
        let prefix = self.config.prefix.trim_matches('/');
        if prefix.is_empty() {
            None
        } else {
            Some(format!("{}/", prefix))
        }
    }

    /// Build the full S3 key from a store-relative key
    fn build_key(&self, key: &str) -> String {
        match self.key_prefix() {
            Some(prefix) => format!("{}{}", prefix, key),
            None => key.to_string(),
        }
    }

    /// Convert S3 error to StorageError
    fn map_s3_error<E: std::error::Error>(err: E) -> StorageError {
        let msg = DisplayErrorContext(&err).to_string();
        if msg.contains("PreconditionFailed") || msg.contains("412") {
            StorageError::Changed
        } else if msg.contains("NoSuchKey") || msg.contains("NotFound") || msg.contains("404") {
            StorageError::NotFound
        } else if msg.contains("AccessDenied") || msg.contains("403") {
            StorageError::PermissionDenied
        } else if msg.contains("InvalidRange") || msg.contains("416") {
            StorageError::InvalidRange
        } else {
            StorageError::Io(msg)
        }
    }

    /// Parse AWS DateTime to Unix timestamp
    fn parse_datetime(dt: &aws_sdk_s3::primitives::DateTime) -> u32 {
        dt.secs() as u32
    }

    fn into_body_stream(body: ByteStream) -> super::ByteStream {
        stream::unfold(body, |mut body| async move {
            body.next()
                .await
                .map(|chunk| (chunk.map_err(std::io::Error::other), body))
        })
        .boxed()
    }

    /// Size and etag of an object
    async fn head(&self, key: &str, if_match: Option<&str>) -> StorageResult<(u64, Option<String>)> {
        let head = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(key)
            .set_if_match(if_match.map(str::to_string))
            .send()
            .await
            .map_err(Self::map_s3_error)?;
        Ok((head.content_length.unwrap_or(0) as u64, head.e_tag))
    }

    async fn put_single(&self, key: &str, content: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .body(ByteStream::from(content))
            .send()
            .await
            .map_err(Self::map_s3_error)?;
        Ok(())
    }

    /// Upload the remaining buffers as parts, keeping at most `max_buffers` in flight
    ///
    /// Parts run as tasks so they keep uploading while the next buffer is read.
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first: Bytes,
        reader: &mut BoxReader,
        options: UploadOptions,
    ) -> StorageResult<Vec<CompletedPart>> {
        let mut in_flight = JoinSet::new();
        let mut parts = Vec::new();
        let mut next_buffer = Some(first);
        let mut part_number = 1;

        while let Some(buffer) = next_buffer.take() {
            while in_flight.len() >= options.max_buffers.max(1) {
                if let Some(joined) = in_flight.join_next().await {
                    parts.push(completed_part(joined)?);
                }
            }

            debug!(key, part_number, len = buffer.len(), "Uploading part");
            let request = self
                .client
                .upload_part()
                .bucket(&self.config.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buffer));
            in_flight.spawn(async move {
                let result = request.send().await.map_err(Self::map_s3_error)?;
                Ok::<_, StorageError>(
                    CompletedPart::builder()
                        .set_e_tag(result.e_tag)
                        .part_number(part_number)
                        .build(),
                )
            });
            part_number += 1;

            let buffer = read_buffer(reader, options.buffer_size).await?;
            if !buffer.is_empty() {
                next_buffer = Some(buffer);
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            parts.push(completed_part(joined)?);
        }

        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    fn abort_upload(&self, key: &str, upload_id: &str) -> impl Future<Output = ()> + Send + 'static {
        let request = self
            .client
            .abort_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(upload_id);
        let key = key.to_string();
        async move {
            match request.send().await {
                Ok(_) => debug!(key = %key, "Multipart upload aborted"),
                Err(err) => warn!(key = %key, error = %DisplayErrorContext(&err), "Abort failed"),
            }
        }
    }

    async fn purge_versions(&self, key: &str) -> StorageResult<()> {
        let result = self
            .client
            .list_object_versions()
            .bucket(&self.config.bucket)
            .prefix(key)
            .send()
            .await
            .map_err(Self::map_s3_error)?;

        let versions = result
            .versions
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| v.key.filter(|k| k == key).and(v.version_id));
        let markers = result
            .delete_markers
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.key.filter(|k| k == key).and(m.version_id));

        for version_id in versions.chain(markers) {
            debug!(key, version_id = %version_id, "Deleting object version");
            self.client
                .delete_object()
                .bucket(&self.config.bucket)
                .key(key)
                .version_id(version_id)
                .send()
                .await
                .map_err(Self::map_s3_error)?;
        }
        Ok(())
    }
}

fn completed_part(
    joined: Result<StorageResult<CompletedPart>, JoinError>,
) -> StorageResult<CompletedPart> {
    joined.map_err(|err| StorageError::Other(format!("Part upload task failed: {}", err)))?
}

/// Runs an abort request if dropped before being disarmed
///
/// An upload future dropped mid-transfer (session cancelled, handle closed
/// without `close`) never reaches its own error path.
struct AbortOnDrop {
    abort: Option<BoxFuture<'static, ()>>,
}

impl AbortOnDrop {
    fn new(abort: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            abort: Some(abort.boxed()),
        }
    }

    fn disarm(&mut self) {
        self.abort = None;
    }

    async fn run(mut self) {
        if let Some(abort) = self.abort.take() {
            abort.await;
        }
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(abort);
            }
        }
    }
}

/// Fill one upload buffer; shorter than `size` only at end of input
async fn read_buffer(reader: &mut BoxReader, size: usize) -> StorageResult<Bytes> {
    let mut buffer = Vec::with_capacity(size);
    (&mut *reader).take(size as u64).read_to_end(&mut buffer).await?;
    Ok(Bytes::from(buffer))
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_page(&self, continuation: Option<String>) -> StorageResult<ListPage> {
        let prefix = self.key_prefix();
        debug!(prefix = ?prefix, continuation = ?continuation, "Listing S3 objects");

        let result = self
            .client
            .list_objects_v2()
            .bucket(&self.config.bucket)
            .set_prefix(prefix.clone())
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(Self::map_s3_error)?;

        let objects = result
            .contents
            .unwrap_or_default()
            .into_iter()
            .filter_map(|obj| {
                let key = obj.key?;
                let relative = match prefix {
                    Some(ref prefix) => key.strip_prefix(prefix.as_str())?.to_string(),
                    None => key,
                };
                if relative.is_empty() {
                    return None;
                }
                Some(ObjectMeta {
                    key: relative,
                    size: obj.size.unwrap_or(0) as u64,
                    last_modified: obj
                        .last_modified
                        .as_ref()
                        .map(Self::parse_datetime)
                        .unwrap_or_else(current_timestamp),
                })
            })
            .collect();

        let next = if result.is_truncated.unwrap_or(false) {
            result.next_continuation_token
        } else {
            None
        };

        Ok(ListPage { objects, next })
    }

    async fn get_range(
        &self,
        key: &str,
        offset: u64,
        if_match: Option<&str>,
    ) -> StorageResult<ObjectRead> {
        let key = self.build_key(key);

        let mut request = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .set_if_match(if_match.map(str::to_string));
        if offset > 0 {
            request = request.range(format!("bytes={}-", offset));
        }

        match request.send().await.map_err(Self::map_s3_error) {
            Ok(result) => Ok(ObjectRead {
                content_length: result.content_length.unwrap_or(0) as u64,
                etag: result.e_tag,
                body: Self::into_body_stream(result.body),
            }),
            // S3 rejects a range starting exactly at the end of the object
            Err(StorageError::InvalidRange) => {
                let (size, etag) = self.head(&key, if_match).await?;
                if size != offset {
                    return Err(StorageError::InvalidRange);
                }
                Ok(ObjectRead {
                    content_length: 0,
                    etag,
                    body: stream::empty().boxed(),
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn upload(
        &self,
        key: &str,
        mut reader: BoxReader,
        options: UploadOptions,
    ) -> StorageResult<()> {
        let key = self.build_key(key);

        let first = read_buffer(&mut reader, options.buffer_size).await?;
        if first.len() < options.buffer_size {
            debug!(key = %key, len = first.len(), "Uploading single object");
            return self.put_single(&key, first).await;
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(Self::map_s3_error)?;
        let upload_id = created
            .upload_id
            .ok_or_else(|| StorageError::Other("Missing multipart upload id".to_string()))?;

        let mut guard = AbortOnDrop::new(self.abort_upload(&key, &upload_id));
        let parts = match self
            .upload_parts(&key, &upload_id, first, &mut reader, options)
            .await
        {
            Ok(parts) => parts,
            Err(err) => {
                warn!(key = %key, error = %err, "Aborting multipart upload");
                guard.run().await;
                return Err(err);
            }
        };

        self.client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(&key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(Self::map_s3_error)?;
        guard.disarm();

        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let key = self.build_key(key);

        // S3 deletes are idempotent; surface a missing object explicitly
        self.head(&key, None).await?;

        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(Self::map_s3_error)?;

        if self.config.purge_versions {
            self.purge_versions(&key).await?;
        }

        Ok(())
    }

    fn source_address(&self, key: &str) -> String {
        format!("{}/{}", self.config.bucket, self.build_key(key))
    }

    async fn copy_from(&self, source: &str, dst_key: &str) -> StorageResult<()> {
        let dst_key = self.build_key(dst_key);

        self.client
            .copy_object()
            .bucket(&self.config.bucket)
            .copy_source(source)
            .key(&dst_key)
            .send()
            .await
            .map_err(Self::map_s3_error)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(prefix: &str) -> S3Store {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .build();
        S3Store::new(
            Client::from_conf(config),
            S3Config::new("bucket").with_prefix(prefix),
        )
    }

    #[test]
    fn test_build_key_with_prefix() {
        assert_eq!(store("").build_key("a/b.txt"), "a/b.txt");
        assert_eq!(store("tenant/").build_key("a/b.txt"), "tenant/a/b.txt");
        assert_eq!(store("/tenant").build_key("x"), "tenant/x");
    }

    #[test]
    fn test_source_address() {
        assert_eq!(store("").source_address("a.txt"), "bucket/a.txt");
        assert_eq!(store("t").source_address("a.txt"), "bucket/t/a.txt");
    }

    #[test]
    fn test_map_s3_error() {
        let err = std::io::Error::other("NoSuchKey: gone");
        assert!(matches!(S3Store::map_s3_error(err), StorageError::NotFound));
        let err = std::io::Error::other("AccessDenied");
        assert!(matches!(
            S3Store::map_s3_error(err),
            StorageError::PermissionDenied
        ));
        let err = std::io::Error::other("InvalidRange");
        assert!(matches!(
            S3Store::map_s3_error(err),
            StorageError::InvalidRange
        ));
        let err = std::io::Error::other("PreconditionFailed");
        assert!(matches!(S3Store::map_s3_error(err), StorageError::Changed));
        let err = std::io::Error::other("timeout");
        assert!(matches!(S3Store::map_s3_error(err), StorageError::Io(_)));
    }

    #[tokio::test]
    async fn test_abort_runs_when_upload_is_dropped() {
        let (aborted, on_abort) = tokio::sync::oneshot::channel();
        let upload = tokio::spawn(async move {
            let _guard = AbortOnDrop::new(async move {
                let _ = aborted.send(());
            });
            futures::future::pending::<()>().await;
        });

        upload.abort();
        assert!(on_abort.await.is_ok());
    }

    #[tokio::test]
    async fn test_disarmed_guard_does_not_abort() {
        let (aborted, on_abort) = tokio::sync::oneshot::channel::<()>();
        let mut guard = AbortOnDrop::new(async move {
            let _ = aborted.send(());
        });
        guard.disarm();
        drop(guard);

        assert!(on_abort.await.is_err());
    }

    #[tokio::test]
    async fn test_abort_on_error_path_runs_inline() {
        let (aborted, mut on_abort) = tokio::sync::oneshot::channel();
        let guard = AbortOnDrop::new(async move {
            let _ = aborted.send(());
        });
        guard.run().await;

        assert!(on_abort.try_recv().is_ok());
    }
}
