//! Translation of directory-oriented file operations onto a flat object store.
//!
//! Each connection gets its own [`ObjectDriver`] from a [`SessionFactory`].
//! Directories are inferred from the first `/`-delimited segment of object
//! keys, merged with virtual folders that exist only in the session. The
//! namespace is two levels deep: root, one folder level, files.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::storage::{BoxReader, ByteStream, ObjectStore, StorageError, StorageResult};

pub mod counting;
pub mod entry;
pub mod factory;
pub mod folders;
mod namespace;
pub mod session;
mod transfer;

pub use counting::{ByteCounter, CountingReader};
pub use entry::{EntryKind, EntryRecord};
pub use factory::{DriverFactory, SessionFactory};
pub use folders::{Ephemeral, Folder, FolderPersistence, FolderTable, MarkerObjects};
pub use session::SessionState;
pub use transfer::{MAX_READ_RETRIES, UPLOAD_BUFFER_SIZE, UPLOAD_MAX_BUFFERS};

/// Result type for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors returned to the protocol engine
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Not a directory")]
    NotADirectory,
    #[error("File already exists")]
    AlreadyExists,
    #[error("Not implemented")]
    NotImplemented,
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The copy succeeded but the source could not be removed; the object
    /// now exists under both keys.
    #[error("Renamed {from} to {to} but the source remains: {source}")]
    PartialRename {
        from: String,
        to: String,
        source: Box<DriverError>,
    },
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Listing aborted: {0}")]
    Consumer(String),
}

/// Operations the protocol engine invokes on a session
///
/// Paths are absolute, `/`-delimited protocol paths.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Called once when the connection is established
    fn init(&self, _client: Option<SocketAddr>) {}

    /// Abort any in-flight storage calls of this session
    fn abort(&self) {}

    async fn change_dir(&self, path: &str) -> DriverResult<()>;

    async fn stat(&self, path: &str) -> DriverResult<EntryRecord>;

    /// Feed every entry of `path` to `consumer`, stopping at its first error
    async fn list_dir(
        &self,
        path: &str,
        consumer: &mut (dyn FnMut(EntryRecord) -> DriverResult<()> + Send),
    ) -> DriverResult<()>;

    async fn make_dir(&self, path: &str) -> DriverResult<()>;

    async fn delete_dir(&self, path: &str) -> DriverResult<()>;

    async fn delete_file(&self, path: &str) -> DriverResult<()>;

    async fn rename(&self, from: &str, to: &str) -> DriverResult<()>;

    /// Returns the number of bytes from `offset` to the end and a stream of them
    async fn get_file(&self, path: &str, offset: u64) -> DriverResult<(u64, ByteStream)>;

    /// Returns the number of bytes consumed from `data`
    async fn put_file(&self, path: &str, data: BoxReader, append: bool) -> DriverResult<u64>;
}

/// Session driver over an [`ObjectStore`]
pub struct ObjectDriver {
    store: Arc<dyn ObjectStore>,
    persistence: Arc<dyn FolderPersistence>,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
}

impl ObjectDriver {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        persistence: Arc<dyn FolderPersistence>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            persistence,
            state: Mutex::new(SessionState::new()),
            cancel,
        }
    }

    /// Name of the current working folder, `None` at the root
    pub fn current_folder(&self) -> Option<String> {
        self.state.lock().current_folder_name().map(str::to_string)
    }

    /// Names of the session's virtual folders, in creation order
    pub fn virtual_folders(&self) -> Vec<String> {
        self.state.lock().folder_names()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run a storage call unless the session is cancelled first
    async fn guarded<T, F>(&self, call: F) -> DriverResult<T>
    where
        F: Future<Output = StorageResult<T>> + Send,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DriverError::Cancelled),
            result = call => result.map_err(DriverError::from),
        }
    }
}

#[async_trait]
impl Driver for ObjectDriver {
    fn init(&self, client: Option<SocketAddr>) {
        debug!(?client, "Driver initialized");
    }

    fn abort(&self) {
        self.cancel.cancel();
    }

    async fn change_dir(&self, path: &str) -> DriverResult<()> {
        self.enter(path).await
    }

    async fn stat(&self, path: &str) -> DriverResult<EntryRecord> {
        Ok(self.stub_stat(path))
    }

    async fn list_dir(
        &self,
        path: &str,
        consumer: &mut (dyn FnMut(EntryRecord) -> DriverResult<()> + Send),
    ) -> DriverResult<()> {
        self.list(path, consumer).await
    }

    async fn make_dir(&self, path: &str) -> DriverResult<()> {
        self.make_folder(path).await
    }

    async fn delete_dir(&self, path: &str) -> DriverResult<()> {
        debug!(path, "Directory deletion requested");
        Err(DriverError::NotImplemented)
    }

    async fn delete_file(&self, path: &str) -> DriverResult<()> {
        self.remove_object(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> DriverResult<()> {
        self.move_object(from, to).await
    }

    async fn get_file(&self, path: &str, offset: u64) -> DriverResult<(u64, ByteStream)> {
        self.download(path, offset).await
    }

    async fn put_file(&self, path: &str, data: BoxReader, append: bool) -> DriverResult<u64> {
        self.upload(path, data, append).await
    }
}

/// Non-empty `/`-delimited segments of a protocol path
pub(crate) fn path_segments(path: &str) -> Vec<&str> {
    path.trim()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect()
}

/// Object key addressed by a protocol path
pub(crate) fn object_key(path: &str) -> &str {
    path.trim_start_matches('/')
}
