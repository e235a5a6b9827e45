use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::folders::{Ephemeral, FolderPersistence};
use super::{Driver, ObjectDriver};
use crate::storage::ObjectStore;

/// Builds one driver per incoming connection
///
/// Only what the factory holds is shared between sessions, so anything a
/// session mutates must be created fresh in `new_driver`.
pub trait DriverFactory: Send + Sync + 'static {
    type Driver: Driver;

    fn new_driver(&self) -> Self::Driver;
}

/// Factory of [`ObjectDriver`] sessions over a shared object store
#[derive(Clone)]
pub struct SessionFactory {
    store: Arc<dyn ObjectStore>,
    persistence: Arc<dyn FolderPersistence>,
    shutdown: CancellationToken,
}

impl SessionFactory {
    pub fn new(store: impl ObjectStore) -> Self {
        Self::from_arc(Arc::new(store))
    }

    pub fn from_arc(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            persistence: Arc::new(Ephemeral),
            shutdown: CancellationToken::new(),
        }
    }

    /// Choose how virtual folders outlive their session
    pub fn with_persistence(mut self, persistence: impl FolderPersistence) -> Self {
        self.persistence = Arc::new(persistence);
        self
    }

    /// Parent token; cancelling it aborts every session's storage calls
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

}

impl DriverFactory for SessionFactory {
    type Driver = ObjectDriver;

    fn new_driver(&self) -> ObjectDriver {
        debug!("Creating session driver");
        ObjectDriver::new(
            self.store.clone(),
            self.persistence.clone(),
            self.shutdown.child_token(),
        )
    }
}
