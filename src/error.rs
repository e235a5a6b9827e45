use thiserror::Error;

/// Top-level error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("Driver error: {0}")]
    Driver(#[from] crate::driver::DriverError),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key error: {0}")]
    Key(#[from] russh_keys::Error),

    #[error("Key generation error: {0}")]
    KeyGen(#[from] russh::keys::ssh_key::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
