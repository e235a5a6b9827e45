use crate::storage::{ObjectStore, StorageResult, UploadOptions};
use async_trait::async_trait;

/// Marker object written by [`MarkerObjects`] for each created folder
pub const KEEP_MARKER: &str = ".keep";

/// Directory descriptor
///
/// Either a virtual folder created by the client, or a descriptor synthesized
/// from an object key prefix during a directory change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub name: String,
    /// True for folders that exist only in the folder table
    pub is_virtual: bool,
    /// Reserved for nested folders; always empty
    pub sub_folders: Vec<Folder>,
}

impl Folder {
    pub fn virtual_folder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_virtual: true,
            sub_folders: Vec::new(),
        }
    }

    pub fn from_prefix(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_virtual: false,
            sub_folders: Vec::new(),
        }
    }
}

/// Per-session table of virtual folders, in insertion order
///
/// Only lives as long as the session that owns it.
#[derive(Debug, Default)]
pub struct FolderTable {
    folders: Vec<Folder>,
}

impl FolderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, name: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.name == name)
    }

    /// Add a virtual folder; returns false if the name is already taken
    pub fn insert(&mut self, folder: Folder) -> bool {
        if self.find(&folder.name).is_some() {
            return false;
        }
        self.folders.push(folder);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &Folder> {
        self.folders.iter()
    }
}

/// Strategy for persisting virtual folders beyond the session
#[async_trait]
pub trait FolderPersistence: Send + Sync + 'static {
    /// Called before a folder is added to the session's table; on failure
    /// the table is left unchanged
    async fn persist(&self, store: &dyn ObjectStore, folder: &Folder) -> StorageResult<()>;

    /// Whether a leaf name is a persistence artifact hidden from listings
    fn hides(&self, _leaf: &str) -> bool {
        false
    }
}

/// Virtual folders live in memory only and vanish with the session
#[derive(Debug, Clone, Copy, Default)]
pub struct Ephemeral;

#[async_trait]
impl FolderPersistence for Ephemeral {
    async fn persist(&self, _store: &dyn ObjectStore, _folder: &Folder) -> StorageResult<()> {
        Ok(())
    }
}

/// Each virtual folder is backed by a zero-length `<name>/.keep` object
///
/// The marker makes the folder visible to later sessions as a regular key
/// prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerObjects;

#[async_trait]
impl FolderPersistence for MarkerObjects {
    async fn persist(&self, store: &dyn ObjectStore, folder: &Folder) -> StorageResult<()> {
        let key = format!("{}/{}", folder.name, KEEP_MARKER);
        let options = UploadOptions {
            buffer_size: 1,
            max_buffers: 1,
        };
        store
            .upload(&key, Box::new(tokio::io::empty()), options)
            .await
    }

    fn hides(&self, leaf: &str) -> bool {
        leaf == KEEP_MARKER
    }
}
