use crate::driver::{Driver, DriverError, EntryRecord};
use crate::handle::{HandleManager, HandleType, ReadState, WriteState};
use crate::storage::StorageError;
use bytes::Bytes;
use futures::StreamExt;
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Capacity of the in-memory pipe between client writes and the upload task
const UPLOAD_PIPE_CAPACITY: usize = 256 * 1024;

/// Convert an EntryRecord to russh_sftp FileAttributes
fn to_file_attributes(entry: &EntryRecord) -> FileAttributes {
    FileAttributes {
        size: Some(entry.size),
        permissions: Some(entry.unix_mode()),
        mtime: Some(entry.mtime),
        atime: Some(entry.mtime),
        ..Default::default()
    }
}

/// Absolute protocol path for an SFTP path, resolving `.` and `..`
pub fn absolute_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

fn leaf_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// SFTP session handler that delegates to a driver
pub struct SftpHandler<D: Driver> {
    driver: Arc<D>,
    handles: HandleManager,
}

impl<D: Driver> SftpHandler<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self {
            driver,
            handles: HandleManager::new(),
        }
    }

    /// Serve `len` bytes at `offset`, reopening the download if the client seeks
    async fn read_from(
        driver: &D,
        state: &mut ReadState,
        offset: u64,
        len: u32,
    ) -> Result<Vec<u8>, StatusCode> {
        if offset >= state.size {
            return Err(StatusCode::Eof);
        }

        if offset != state.position {
            debug!(path = %state.path, from = state.position, to = offset, "Reopening read stream");
            let (_, body) = driver
                .get_file(&state.path, offset)
                .await
                .map_err(StatusCode::from)?;
            state.body = body;
            state.position = offset;
            state.pending = Bytes::new();
        }

        let len = len as usize;
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            if state.pending.is_empty() {
                match state.body.next().await {
                    Some(Ok(chunk)) => state.pending = chunk,
                    Some(Err(err)) => {
                        warn!(path = %state.path, error = %err, "Read stream failed");
                        return Err(StatusCode::Failure);
                    }
                    None => break,
                }
            }
            let take = std::cmp::min(len - data.len(), state.pending.len());
            data.extend_from_slice(&state.pending.split_to(take));
        }

        state.position += data.len() as u64;
        if data.is_empty() {
            return Err(StatusCode::Eof);
        }
        Ok(data)
    }

    async fn write_to(
        state: &mut WriteState,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StatusCode> {
        // Uploads are streamed, so writes must arrive in order
        if offset != state.written {
            warn!(path = %state.path, offset, expected = state.written, "Non-sequential write");
            return Err(StatusCode::OpUnsupported);
        }

        state.pipe.write_all(data).await.map_err(|err| {
            warn!(path = %state.path, error = %err, "Upload pipe closed");
            StatusCode::Failure
        })?;
        state.written += data.len() as u64;
        Ok(())
    }

    async fn finish_upload(mut state: WriteState) -> Result<(), StatusCode> {
        let _ = state.pipe.shutdown().await;
        let Some(upload) = state.take_upload() else {
            return Err(StatusCode::Failure);
        };
        drop(state);

        match upload.await {
            Ok(Ok(written)) => {
                debug!(written, "Upload finished");
                Ok(())
            }
            Ok(Err(err)) => {
                warn!(error = %err, "Upload failed");
                Err(StatusCode::from(err))
            }
            Err(err) => {
                warn!(error = %err, "Upload task failed");
                Err(StatusCode::Failure)
            }
        }
    }
}

/// Convert DriverError to SFTP StatusCode
impl From<DriverError> for StatusCode {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NotADirectory => StatusCode::NoSuchFile,
            DriverError::AlreadyExists => StatusCode::Failure,
            DriverError::NotImplemented => StatusCode::OpUnsupported,
            DriverError::Storage(StorageError::NotFound) => StatusCode::NoSuchFile,
            DriverError::Storage(StorageError::PermissionDenied) => StatusCode::PermissionDenied,
            DriverError::Storage(_) => StatusCode::Failure,
            DriverError::PartialRename { .. } => StatusCode::Failure,
            DriverError::Cancelled => StatusCode::ConnectionLost,
            DriverError::Consumer(_) => StatusCode::Failure,
        }
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en".to_string(),
    }
}

impl<D: Driver> russh_sftp::server::Handler for SftpHandler<D> {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!(version, "SFTP init");
        Ok(Version::new())
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        debug!(id, handle = %handle, "Closing handle");

        // Write handles report the outcome of their upload
        if let Some(HandleType::Write(state)) = self.handles.take(&handle) {
            Self::finish_upload(state).await?;
        }

        Ok(ok_status(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        debug!(id, path = %path, "Opening directory");
        let path = absolute_path(&path);

        self.driver
            .change_dir(&path)
            .await
            .map_err(StatusCode::from)?;

        let handle = self.handles.create_dir_handle(path);
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        debug!(id, handle = %handle, "Reading directory");

        match self.handles.take(&handle).ok_or(StatusCode::Failure)? {
            HandleType::Dir { path, read_done } => {
                if read_done {
                    self.handles
                        .restore(&handle, HandleType::Dir { path, read_done });
                    return Err(StatusCode::Eof);
                }

                let mut files = Vec::new();
                let listed = self
                    .driver
                    .list_dir(&path, &mut |entry| {
                        files.push(File {
                            filename: entry.name.clone(),
                            longname: String::new(),
                            attrs: to_file_attributes(&entry),
                        });
                        Ok(())
                    })
                    .await;

                // Mark as read
                self.handles.restore(
                    &handle,
                    HandleType::Dir {
                        path,
                        read_done: true,
                    },
                );
                listed.map_err(StatusCode::from)?;

                if files.is_empty() {
                    return Err(StatusCode::Eof);
                }
                Ok(Name { id, files })
            }
            other => {
                self.handles.restore(&handle, other);
                Err(StatusCode::Failure)
            }
        }
    }

    async fn open(
        &mut self,
        id: u32,
        path: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        debug!(id, path = %path, ?pflags, "Opening file");
        let path = absolute_path(&path);

        let handle = if pflags.intersects(OpenFlags::WRITE | OpenFlags::APPEND) {
            let append = pflags.contains(OpenFlags::APPEND);
            let (pipe, reader) = tokio::io::duplex(UPLOAD_PIPE_CAPACITY);
            let driver = self.driver.clone();
            let upload_path = path.clone();
            let upload = tokio::spawn(async move {
                driver
                    .put_file(&upload_path, Box::new(reader), append)
                    .await
            });
            self.handles
                .insert(HandleType::Write(WriteState::new(path, pipe, upload)))
        } else {
            let (size, body) = self
                .driver
                .get_file(&path, 0)
                .await
                .map_err(StatusCode::from)?;
            self.handles.insert(HandleType::Read(ReadState {
                path,
                size,
                position: 0,
                body,
                pending: Bytes::new(),
            }))
        };

        Ok(Handle { id, handle })
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        debug!(id, handle = %handle, offset, len, "Reading file");

        match self.handles.take(&handle).ok_or(StatusCode::Failure)? {
            HandleType::Read(mut state) => {
                let driver = self.driver.clone();
                let result = Self::read_from(&driver, &mut state, offset, len).await;
                self.handles.restore(&handle, HandleType::Read(state));
                Ok(Data { id, data: result? })
            }
            other => {
                self.handles.restore(&handle, other);
                Err(StatusCode::Failure)
            }
        }
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        debug!(id, handle = %handle, offset, len = data.len(), "Writing file");

        match self.handles.take(&handle).ok_or(StatusCode::Failure)? {
            HandleType::Write(mut state) => {
                let result = Self::write_to(&mut state, offset, &data).await;
                self.handles.restore(&handle, HandleType::Write(state));
                result?;
                Ok(ok_status(id))
            }
            other => {
                self.handles.restore(&handle, other);
                Err(StatusCode::Failure)
            }
        }
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        debug!(id, path = %path, "Getting file stats");
        let entry = self
            .driver
            .stat(&absolute_path(&path))
            .await
            .map_err(StatusCode::from)?;

        Ok(Attrs {
            id,
            attrs: to_file_attributes(&entry),
        })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        // No symlink support, same as stat
        self.stat(id, path).await
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let data = self.handles.take(&handle).ok_or(StatusCode::Failure)?;

        let entry = match data {
            HandleType::Read(ref state) => EntryRecord::file(
                leaf_name(&state.path),
                state.size,
                crate::storage::current_timestamp(),
            ),
            HandleType::Write(ref state) => EntryRecord::file(
                leaf_name(&state.path),
                state.written,
                crate::storage::current_timestamp(),
            ),
            HandleType::Dir { ref path, .. } => EntryRecord::directory_now(path.as_str()),
        };
        self.handles.restore(&handle, data);

        Ok(Attrs {
            id,
            attrs: to_file_attributes(&entry),
        })
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        Ok(Name {
            id,
            files: vec![File::dummy(&absolute_path(&path))],
        })
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        debug!(id, path = %path, "Creating directory");
        self.driver
            .make_dir(&absolute_path(&path))
            .await
            .map_err(StatusCode::from)?;

        Ok(ok_status(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        debug!(id, path = %path, "Removing directory");
        self.driver
            .delete_dir(&absolute_path(&path))
            .await
            .map_err(StatusCode::from)?;

        Ok(ok_status(id))
    }

    async fn remove(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        debug!(id, path = %path, "Removing file");
        self.driver
            .delete_file(&absolute_path(&path))
            .await
            .map_err(StatusCode::from)?;

        Ok(ok_status(id))
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        debug!(id, from = %oldpath, to = %newpath, "Renaming");
        self.driver
            .rename(&absolute_path(&oldpath), &absolute_path(&newpath))
            .await
            .map_err(StatusCode::from)?;

        Ok(ok_status(id))
    }

    async fn setstat(
        &mut self,
        id: u32,
        _path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        // Object stores don't support setting attributes, just acknowledge
        Ok(ok_status(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        _handle: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        Ok(ok_status(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverFactory, SessionFactory};
    use crate::storage::testing::FaultyStore;
    use crate::storage::MemoryStore;
    use russh_sftp::server::Handler;

    fn handler(store: &MemoryStore) -> SftpHandler<crate::driver::ObjectDriver> {
        let factory = SessionFactory::new(store.clone());
        SftpHandler::new(Arc::new(factory.new_driver()))
    }

    fn assert_send<T: Send>(_: T) {}

    #[test]
    fn test_handler_futures_are_send() {
        let mut sftp = handler(&MemoryStore::new());
        assert_send(sftp.open(1, "/f".into(), OpenFlags::READ, FileAttributes::default()));
        assert_send(sftp.read(2, "h".into(), 0, 16));
        assert_send(sftp.write(3, "h".into(), 0, b"x".to_vec()));
        assert_send(sftp.readdir(4, "h".into()));
        assert_send(sftp.close(5, "h".into()));
    }

    #[test]
    fn test_absolute_path() {
        assert_eq!(absolute_path(""), "/");
        assert_eq!(absolute_path("."), "/");
        assert_eq!(absolute_path("dir1"), "/dir1");
        assert_eq!(absolute_path("/dir1/./y.txt"), "/dir1/y.txt");
        assert_eq!(absolute_path("/dir1/../x.txt"), "/x.txt");
        assert_eq!(absolute_path("/.."), "/");
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            StatusCode::from(DriverError::NotImplemented),
            StatusCode::OpUnsupported
        ));
        assert!(matches!(
            StatusCode::from(DriverError::Storage(StorageError::NotFound)),
            StatusCode::NoSuchFile
        ));
        assert!(matches!(
            StatusCode::from(DriverError::NotADirectory),
            StatusCode::NoSuchFile
        ));
        assert!(matches!(
            StatusCode::from(DriverError::AlreadyExists),
            StatusCode::Failure
        ));
    }

    #[tokio::test]
    async fn test_readdir_lists_once() {
        let store = MemoryStore::new();
        store.insert("x.txt", &b"x"[..]);
        store.insert("dir1/y.txt", &b"yy"[..]);
        let mut sftp = handler(&store);

        let Handle { handle, .. } = sftp.opendir(1, "/".into()).await.unwrap();
        let Name { files, .. } = sftp.readdir(2, handle.clone()).await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["dir1", "x.txt"]);
        assert_eq!(files[0].attrs.permissions, Some(0o040777));
        assert_eq!(files[1].attrs.size, Some(1));

        assert!(matches!(
            sftp.readdir(3, handle).await.unwrap_err(),
            StatusCode::Eof
        ));
    }

    #[tokio::test]
    async fn test_opendir_missing_folder() {
        let mut sftp = handler(&MemoryStore::new());
        assert!(matches!(
            sftp.opendir(1, "/nowhere".into()).await.unwrap_err(),
            StatusCode::NoSuchFile
        ));
    }

    #[tokio::test]
    async fn test_write_then_read_through_handles() {
        let store = MemoryStore::new();
        let mut sftp = handler(&store);

        let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE;
        let Handle { handle, .. } = sftp
            .open(1, "/a/b.txt".into(), flags, FileAttributes::default())
            .await
            .unwrap();
        sftp.write(2, handle.clone(), 0, b"hello ".to_vec())
            .await
            .unwrap();
        sftp.write(3, handle.clone(), 6, b"world".to_vec())
            .await
            .unwrap();
        sftp.close(4, handle).await.unwrap();
        assert_eq!(store.content("a/b.txt").unwrap(), &b"hello world"[..]);

        let Handle { handle, .. } = sftp
            .open(5, "/a/b.txt".into(), OpenFlags::READ, FileAttributes::default())
            .await
            .unwrap();
        let Data { data, .. } = sftp.read(6, handle.clone(), 0, 5).await.unwrap();
        assert_eq!(data, b"hello");
        let Data { data, .. } = sftp.read(7, handle.clone(), 5, 100).await.unwrap();
        assert_eq!(data, b" world");
        // Out of order read reopens at the offset
        let Data { data, .. } = sftp.read(8, handle.clone(), 6, 3).await.unwrap();
        assert_eq!(data, b"wor");
        assert!(matches!(
            sftp.read(9, handle.clone(), 11, 10).await.unwrap_err(),
            StatusCode::Eof
        ));

        let Attrs { attrs, .. } = sftp.fstat(10, handle.clone()).await.unwrap();
        assert_eq!(attrs.size, Some(11));
        sftp.close(11, handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_reports_refused_upload() {
        let store = MemoryStore::new();
        let driver = SessionFactory::new(FaultyStore::new(store.clone()).deny_uploads()).new_driver();
        let mut sftp = SftpHandler::new(Arc::new(driver));

        let Handle { handle, .. } = sftp
            .open(1, "/a.txt".into(), OpenFlags::WRITE, FileAttributes::default())
            .await
            .unwrap();
        assert!(matches!(
            sftp.close(2, handle).await.unwrap_err(),
            StatusCode::PermissionDenied
        ));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_non_sequential_write_rejected() {
        let mut sftp = handler(&MemoryStore::new());
        let Handle { handle, .. } = sftp
            .open(1, "/f".into(), OpenFlags::WRITE, FileAttributes::default())
            .await
            .unwrap();

        assert!(matches!(
            sftp.write(2, handle, 10, b"late".to_vec())
                .await
                .unwrap_err(),
            StatusCode::OpUnsupported
        ));
    }

    #[tokio::test]
    async fn test_stat_reports_directory_stub() {
        let store = MemoryStore::new();
        store.insert("x.txt", &b"x"[..]);
        let mut sftp = handler(&store);

        let Attrs { attrs, .. } = sftp.stat(1, "/x.txt".into()).await.unwrap();
        assert_eq!(attrs.permissions, Some(0o040777));
    }

    #[tokio::test]
    async fn test_rmdir_unsupported() {
        let mut sftp = handler(&MemoryStore::new());
        sftp.mkdir(1, "/docs".into(), FileAttributes::default())
            .await
            .unwrap();
        assert!(matches!(
            sftp.rmdir(2, "/docs".into()).await.unwrap_err(),
            StatusCode::OpUnsupported
        ));
    }
}
