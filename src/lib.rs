//! # objftp
//!
//! An SFTP front end for flat object storage. Directories are inferred from
//! `/` delimiters in object keys and merged with folders that exist only in
//! the client's session.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use objftp::{MemoryStore, Server, ServerConfig, SessionFactory};
//!
//! #[tokio::main]
//! async fn main() -> objftp::Result<()> {
//!     let factory = SessionFactory::new(MemoryStore::new());
//!     let config = ServerConfig::new().port(2222).with_generated_key()?;
//!
//!     Server::new(factory)
//!         .config(config)
//!         .with_users(vec![("user".into(), "pass".into())])
//!         .run()
//!         .await
//! }
//! ```
//!
//! ## S3 Storage
//!
//! ```rust,ignore
//! use objftp::{S3Config, S3Store, Server, ServerConfig, SessionFactory};
//!
//! let store = S3Store::from_env(S3Config::new("my-bucket")).await;
//! Server::new(SessionFactory::new(store))
//!     .config(ServerConfig::new().with_generated_key()?)
//!     .with_users(vec![("user".into(), "pass".into())])
//!     .run()
//!     .await
//! ```
//!
//! ## Using the driver directly
//!
//! ```rust,ignore
//! use objftp::driver::{Driver, DriverFactory};
//!
//! let driver = SessionFactory::new(MemoryStore::new()).new_driver();
//! driver.make_dir("/reports").await?;
//! driver
//!     .list_dir("/", &mut |entry| {
//!         println!("{} {}", entry.name, entry.is_dir());
//!         Ok(())
//!     })
//!     .await?;
//! ```

pub mod driver;
pub mod error;
pub mod handle;
pub mod server;
pub mod sftp_handler;
pub mod ssh_handler;
pub mod storage;

// Re-exports for convenience
pub use driver::{
    Driver, DriverError, DriverFactory, DriverResult, EntryRecord, MarkerObjects, ObjectDriver,
    SessionFactory,
};
pub use storage::{MemoryStore, ObjectStore, StorageError, StorageResult};
#[cfg(feature = "s3")]
pub use storage::{S3Config, S3Store};

pub use error::{Error, Result};
pub use server::{Server, ServerConfig};
