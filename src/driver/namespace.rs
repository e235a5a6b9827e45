use std::ops::ControlFlow;
use tracing::{debug, warn};

use super::entry::EntryRecord;
use super::folders::Folder;
use super::{object_key, path_segments, DriverError, DriverResult, ObjectDriver};
use crate::storage::ObjectMeta;

impl ObjectDriver {
    /// Walk the full object listing page by page until `visit` breaks
    ///
    /// Every call re-reads the listing from the first page.
    async fn scan<T, F>(&self, mut visit: F) -> DriverResult<Option<T>>
    where
        T: Send,
        F: FnMut(&ObjectMeta) -> DriverResult<ControlFlow<T>> + Send,
    {
        let mut marker = None;
        loop {
            let page = self.guarded(self.store.list_page(marker.take())).await?;
            debug!(objects = page.objects.len(), more = page.next.is_some(), "Listing page");

            for object in &page.objects {
                if let ControlFlow::Break(found) = visit(object)? {
                    return Ok(Some(found));
                }
            }

            match page.next {
                Some(next) => marker = Some(next),
                None => return Ok(None),
            }
        }
    }

    pub(super) async fn enter(&self, path: &str) -> DriverResult<()> {
        debug!(path, "Changing directory");
        let segments = path_segments(path);
        let Some(&target) = segments.first() else {
            return Ok(());
        };

        let virtual_hit = self.state.lock().folders.find(target).cloned();
        if let Some(folder) = virtual_hit {
            self.state.lock().current_folder = Some(folder);
            return Ok(());
        }

        let found = self
            .scan(|object| {
                Ok(match object.key.split_once('/') {
                    Some((first, _)) if first == target => ControlFlow::Break(first.to_string()),
                    _ => ControlFlow::Continue(()),
                })
            })
            .await?;

        match found {
            Some(name) => {
                self.state.lock().current_folder = Some(Folder::from_prefix(name));
                Ok(())
            }
            None => Err(DriverError::NotADirectory),
        }
    }

    pub(super) async fn list(
        &self,
        path: &str,
        consumer: &mut (dyn FnMut(EntryRecord) -> DriverResult<()> + Send),
    ) -> DriverResult<()> {
        debug!(path, "Listing directory");
        let segments = path_segments(path);
        let folder = segments.first().copied();
        let persistence = self.persistence.clone();

        self.scan(|object| {
            let entry = match (folder, object.key.split_once('/')) {
                // Root: one directory record per object under a prefix, not deduplicated
                (None, Some((first, _))) if !first.is_empty() => {
                    Some(EntryRecord::directory(first, object.last_modified))
                }
                (None, None) => Some(EntryRecord::file(
                    object.key.as_str(),
                    object.size,
                    object.last_modified,
                )),
                (Some(folder), Some((first, rest))) if first == folder => {
                    let leaf = rest.split('/').next().unwrap_or(rest);
                    if leaf.is_empty() || persistence.hides(leaf) {
                        None
                    } else {
                        Some(EntryRecord::file(leaf, object.size, object.last_modified))
                    }
                }
                _ => None,
            };

            if let Some(entry) = entry {
                consumer(entry)?;
            }
            Ok(ControlFlow::<()>::Continue(()))
        })
        .await?;

        let folders = self.state.lock().folder_names();
        for name in folders {
            consumer(EntryRecord::directory_now(name))?;
        }
        Ok(())
    }

    /// Existence and type are never checked; every path reports as a directory
    pub(super) fn stub_stat(&self, path: &str) -> EntryRecord {
        debug!(path, "Stat");
        EntryRecord::directory_now(path)
    }

    pub(super) async fn make_folder(&self, path: &str) -> DriverResult<()> {
        debug!(path, "Creating directory");
        let segments = path_segments(path);
        let Some(&name) = segments.first() else {
            return Err(DriverError::AlreadyExists);
        };

        if self.state.lock().folders.find(name).is_some() {
            return Err(DriverError::AlreadyExists);
        }

        let folder = Folder::virtual_folder(name);
        self.guarded(self.persistence.persist(self.store.as_ref(), &folder))
            .await?;

        if self.state.lock().folders.insert(folder) {
            Ok(())
        } else {
            Err(DriverError::AlreadyExists)
        }
    }

    pub(super) async fn remove_object(&self, path: &str) -> DriverResult<()> {
        let key = object_key(path);
        debug!(key, "Deleting object");
        self.guarded(self.store.delete(key)).await
    }

    /// Copy to the destination, then delete the source
    pub(super) async fn move_object(&self, from: &str, to: &str) -> DriverResult<()> {
        let from_key = object_key(from);
        let to_key = object_key(to);
        debug!(from = from_key, to = to_key, "Renaming object");

        // Copying onto itself then deleting the source would remove the only copy
        if from_key == to_key {
            return Ok(());
        }

        let source = self.store.source_address(from_key);
        self.guarded(self.store.copy_from(&source, to_key)).await?;

        if let Err(err) = self.guarded(self.store.delete(from_key)).await {
            warn!(from = from_key, to = to_key, error = %err, "Rename left source object in place");
            return Err(DriverError::PartialRename {
                from: from_key.to_string(),
                to: to_key.to_string(),
                source: Box::new(err),
            });
        }
        Ok(())
    }
}
