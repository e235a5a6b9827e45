use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::driver::DriverResult;
use crate::storage::ByteStream;

/// Open download: a stream positioned at `position` within the object
pub struct ReadState {
    pub path: String,
    /// Total object size, known from the initial open at offset 0
    pub size: u64,
    /// Object offset of the next byte not yet handed to the client
    pub position: u64,
    pub body: ByteStream,
    /// Bytes received from `body` but not yet handed to the client
    pub pending: Bytes,
}

/// Open upload: client writes are piped into a running `put_file`
pub struct WriteState {
    pub path: String,
    pub written: u64,
    pub pipe: DuplexStream,
    upload: Option<JoinHandle<DriverResult<u64>>>,
}

impl WriteState {
    pub fn new(path: String, pipe: DuplexStream, upload: JoinHandle<DriverResult<u64>>) -> Self {
        Self {
            path,
            written: 0,
            pipe,
            upload: Some(upload),
        }
    }

    /// Hand over the upload task; the handle no longer aborts it on drop
    pub fn take_upload(&mut self) -> Option<JoinHandle<DriverResult<u64>>> {
        self.upload.take()
    }
}

impl Drop for WriteState {
    fn drop(&mut self) {
        // A handle dropped without close must not commit a truncated object
        if let Some(upload) = self.upload.take() {
            upload.abort();
        }
    }
}

/// Types of file handles
pub enum HandleType {
    /// Directory handle for listing
    Dir { path: String, read_done: bool },
    /// Streaming read handle
    Read(ReadState),
    /// Streaming write handle
    Write(WriteState),
}

/// Manages file handles for SFTP sessions
///
/// Handle state is taken out for the duration of a request and put back
/// afterwards, since read and write state cannot be cloned.
pub struct HandleManager {
    handles: RwLock<HashMap<String, HandleType>>,
}

impl HandleManager {
    pub fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
        }
    }

    fn generate_handle() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn insert(&self, data: HandleType) -> String {
        let handle = Self::generate_handle();
        self.handles.write().insert(handle.clone(), data);
        handle
    }

    pub fn create_dir_handle(&self, path: String) -> String {
        self.insert(HandleType::Dir {
            path,
            read_done: false,
        })
    }

    pub fn take(&self, handle: &str) -> Option<HandleType> {
        self.handles.write().remove(handle)
    }

    pub fn restore(&self, handle: &str, data: HandleType) {
        self.handles.write().insert(handle.to_string(), data);
    }
}

impl Default for HandleManager {
    fn default() -> Self {
        Self::new()
    }
}
