use super::folders::{Folder, FolderTable};

/// Mutable per-connection state
///
/// The object store handle is shared across sessions and lives on the
/// driver; everything here belongs to exactly one connection.
#[derive(Debug, Default)]
pub struct SessionState {
    /// `None` while at the root
    pub current_folder: Option<Folder>,
    pub folders: FolderTable,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_folder_name(&self) -> Option<&str> {
        self.current_folder.as_ref().map(|f| f.name.as_str())
    }

    /// Names of all virtual folders, in creation order
    pub fn folder_names(&self) -> Vec<String> {
        self.folders.iter().map(|f| f.name.clone()).collect()
    }
}
