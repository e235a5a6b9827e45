use crate::storage::current_timestamp;

/// Permission bits reported for every entry
pub const DEFAULT_PERMISSIONS: u32 = 0o777;

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// Entry type of a namespace record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Normalized description of one namespace entry
///
/// `name` is always the leaf name shown to the client, never a full object
/// key. The size of a directory record is always 0 and carries no meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub name: String,
    pub size: u64,
    pub kind: EntryKind,
    pub permissions: u32,
    /// Unix timestamp of the last modification
    pub mtime: u32,
    /// Always empty, kept for protocol compatibility
    pub owner: String,
    /// Always empty, kept for protocol compatibility
    pub group: String,
}

impl EntryRecord {
    /// Create a record for a regular file
    pub fn file(name: impl Into<String>, size: u64, mtime: u32) -> Self {
        Self {
            name: name.into(),
            size,
            kind: EntryKind::File,
            permissions: DEFAULT_PERMISSIONS,
            mtime,
            owner: String::new(),
            group: String::new(),
        }
    }

    /// Create a record for a directory
    pub fn directory(name: impl Into<String>, mtime: u32) -> Self {
        Self {
            name: name.into(),
            size: 0,
            kind: EntryKind::Directory,
            permissions: DEFAULT_PERMISSIONS,
            mtime,
            owner: String::new(),
            group: String::new(),
        }
    }

    /// Create a record for a directory with no backing object, stamped now
    pub fn directory_now(name: impl Into<String>) -> Self {
        Self::directory(name, current_timestamp())
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Permission bits combined with the POSIX file type bits
    pub fn unix_mode(&self) -> u32 {
        match self.kind {
            EntryKind::Directory => S_IFDIR | self.permissions,
            EntryKind::File => S_IFREG | self.permissions,
        }
    }
}
