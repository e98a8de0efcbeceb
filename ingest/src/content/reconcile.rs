use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    time::UNIX_EPOCH,
};

use walkdir::WalkDir;

use crate::content::autoscan::{AutoscanDirectory, AutoscanKey, AutoscanRegistry, ScanLevel, ScanMode};
use crate::content::chain::ChainBuilder;
use crate::content::events::{CatalogEvent, EventBus};
use crate::content::metadata::Importer;
use crate::content::scheduler::TaskFilter;
use crate::content::task::{TaskKind, TaskRun};
use crate::content::transform::{ObjectTransform, TransformOutcome};
use crate::db::{
    CatalogObject, Database, FS_ROOT_ID, INVALID_OBJECT_ID, NewObject, ROOT_ID, RemovedObject,
};
use crate::error::{IngestError, IngestResult};

/// One entry of a single directory level.
#[derive(Debug, Clone)]
pub(crate) struct LevelEntry {
    pub path: PathBuf,
    pub is_dir: bool,
    pub modified: Option<i64>,
}

pub(crate) fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

/// Lists the direct children of `dir` sorted by name. Unreadable entries are
/// logged and skipped.
pub(crate) fn read_level(dir: &Path, include_hidden: bool) -> Vec<LevelEntry> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(error = %err, dir = %dir.display(), "error reading directory entry");
                continue;
            }
        };
        let path = entry.path().to_path_buf();
        if !include_hidden && is_hidden(&path) {
            continue;
        }
        let file_type = entry.file_type();
        if !file_type.is_dir() && !file_type.is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|metadata| metadata.modified().ok())
            .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_secs() as i64);
        entries.push(LevelEntry {
            path,
            is_dir: file_type.is_dir(),
            modified,
        });
    }
    entries
}

pub(crate) fn lock_registry(registry: &Mutex<AutoscanRegistry>) -> MutexGuard<'_, AutoscanRegistry> {
    registry.lock().unwrap_or_else(|err| err.into_inner())
}

/// Keeps the catalog in line with the filesystem: imports, rescans and
/// removals. Works one directory level at a time and checks for
/// cancellation between entries.
pub(crate) struct DirectoryReconciler<'a> {
    pub db: &'a dyn Database,
    pub importer: &'a Importer,
    pub transform: Option<&'a dyn ObjectTransform>,
    pub registry: &'a Mutex<AutoscanRegistry>,
    pub events: &'a EventBus,
}

impl<'a> DirectoryReconciler<'a> {
    pub(crate) fn chains(&self) -> ChainBuilder<'a> {
        ChainBuilder::new(self.db, self.events)
    }

    pub(crate) async fn add_object(&self, object: &NewObject) -> IngestResult<i64> {
        let id = self.db.create_object(object).await?;
        tracing::debug!(id, parent_id = object.parent_id, title = %object.title, "object added");
        self.events.object_added(id, object.parent_id);
        Ok(id)
    }

    /// Stores a new file object, letting the transform veto it or place
    /// references to it in virtual containers.
    async fn store_file_object(&self, object: NewObject) -> IngestResult<Option<i64>> {
        let outcome = match self.transform {
            Some(transform) => transform.transform(object),
            None => TransformOutcome::Keep(object),
        };
        match outcome {
            TransformOutcome::Keep(object) => Ok(Some(self.add_object(&object).await?)),
            TransformOutcome::Veto => {
                tracing::debug!("import vetoed by transform");
                Ok(None)
            }
            TransformOutcome::Place { object, references } => {
                let id = self.add_object(&object).await?;
                let chains = self.chains();
                for placement in references {
                    let container_id = chains
                        .ensure_chain(&placement.chain, Some(placement.leaf_class.as_str()))
                        .await?;
                    self.add_object(&NewObject::reference_to(id, &object, container_id))
                        .await?;
                }
                Ok(Some(id))
            }
        }
    }

    /// Adds the file at `path` unless the catalog already has it. `parent_id`
    /// is the container of its directory when the caller already knows it.
    pub(crate) async fn add_file_item(
        &self,
        path: &Path,
        parent_id: Option<i64>,
    ) -> IngestResult<Option<i64>> {
        if let Some(existing) = self.db.find_object_by_location(path).await? {
            return Ok(Some(existing.id));
        }
        let Some(mut object) = self.importer.create_object_from_file(path).await? else {
            return Ok(None);
        };
        object.parent_id = match parent_id {
            Some(parent_id) => parent_id,
            None => {
                let dir = path.parent().ok_or_else(|| {
                    IngestError::invalid(format!("{} has no parent directory", path.display()))
                })?;
                self.chains().ensure_path_existence(dir).await?
            }
        };
        self.store_file_object(object).await
    }

    /// Imports a file, or a directory and (when `recursive`) everything
    /// below it, depth-first.
    pub(crate) async fn import_path(
        &self,
        path: &Path,
        recursive: bool,
        hidden: bool,
        run: &TaskRun,
    ) -> IngestResult<()> {
        run.ensure_valid()?;
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "path vanished before import");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), "failed to stat import path");
                return Err(IngestError::internal(format!(
                    "Failed to read {}",
                    path.display()
                )));
            }
        };
        if metadata.is_file() {
            self.add_file_item(path, None).await?;
            return Ok(());
        }
        if !metadata.is_dir() {
            tracing::debug!(path = %path.display(), "skipping special file");
            return Ok(());
        }

        let chains = self.chains();
        let root_id = chains.ensure_path_existence(path).await?;
        let mut pending = vec![(root_id, path.to_path_buf())];
        while let Some((container_id, dir)) = pending.pop() {
            run.ensure_valid()?;
            let mut subdirs = Vec::new();
            for entry in read_level(&dir, hidden) {
                run.ensure_valid()?;
                if entry.is_dir {
                    if recursive {
                        let id = chains.ensure_folder(container_id, &entry.path).await?;
                        subdirs.push((id, entry.path));
                    }
                } else {
                    self.add_file_item(&entry.path, Some(container_id)).await?;
                }
            }
            pending.extend(subdirs.into_iter().rev());
        }
        Ok(())
    }

    /// Removes `id`. With `all`, a reference is resolved to its real object
    /// first so that the object and every reference to it disappear.
    pub(crate) async fn remove_object(
        &self,
        id: i64,
        all: bool,
        run: &TaskRun,
    ) -> IngestResult<Vec<RemovedObject>> {
        if id == ROOT_ID || id == FS_ROOT_ID {
            return Err(IngestError::invalid(format!("Object {id} cannot be removed")));
        }
        let object = self
            .db
            .load_object(id)
            .await?
            .ok_or_else(|| IngestError::not_found(format!("Object {id} not found")))?;
        let target = match (all, object.ref_id) {
            (true, Some(real_id)) => real_id,
            _ => id,
        };
        let location = if target == id {
            object.location.clone()
        } else {
            self.db
                .load_object(target)
                .await?
                .and_then(|real| real.location)
        };

        let removed = self.db.remove_object(target, true).await?;
        tracing::debug!(id = target, count = removed.len(), "objects removed");
        for entry in &removed {
            self.events.object_removed(entry.id, entry.parent_id);
        }

        if let (Some(location), Some(scheduler)) = (location, run.scheduler()) {
            let invalidated = scheduler
                .invalidate_matching(TaskFilter::AddFileUnder(location))
                .await?;
            if !invalidated.is_empty() {
                tracing::debug!(count = invalidated.len(), "pending imports under removed path invalidated");
            }
        }
        Ok(removed)
    }

    /// Removes an object a rescan found stale. Autoscan entries rooted in the
    /// removed subtree stay registered and get a new container on their next
    /// scan.
    async fn remove_stale(&self, id: i64, run: &TaskRun) -> IngestResult<()> {
        let removed = self.remove_object(id, false, run).await?;
        for entry in &removed {
            self.detach_autoscans(entry.id).await?;
        }
        Ok(())
    }

    async fn detach_autoscans(&self, object_id: i64) -> IngestResult<()> {
        loop {
            let detached = lock_registry(self.registry).detach_object(object_id);
            let Some(dir) = detached else {
                return Ok(());
            };
            tracing::info!(
                path = %dir.location.display(),
                scan_mode = dir.scan_mode.as_str(),
                "autoscan container removed, detached"
            );
            self.db.save_autoscan(&dir.to_record()).await?;
        }
    }

    fn autoscan(&self, scan_id: u32, scan_mode: ScanMode) -> Option<AutoscanDirectory> {
        lock_registry(self.registry)
            .get(AutoscanKey::ScanId(scan_id, scan_mode))
            .cloned()
    }

    fn ensure_wanted(&self, scan_id: u32, scan_mode: ScanMode, run: &TaskRun) -> IngestResult<()> {
        run.ensure_valid()?;
        if self.autoscan(scan_id, scan_mode).is_none() {
            return Err(IngestError::cancelled(format!(
                "Autoscan {scan_id} was removed during its rescan"
            )));
        }
        Ok(())
    }

    /// Resolves the container a rescan works on, assigning the autoscan
    /// root container on its first scan.
    async fn rescan_target(&self, object_id: i64, dir: &AutoscanDirectory) -> IngestResult<Option<i64>> {
        if object_id != INVALID_OBJECT_ID {
            return Ok(Some(object_id));
        }
        if dir.object_id != INVALID_OBJECT_ID {
            if self.db.load_object(dir.object_id).await?.is_some() {
                return Ok(Some(dir.object_id));
            }
            tracing::info!(
                object_id = dir.object_id,
                path = %dir.location.display(),
                "autoscan container is gone, recreating it"
            );
            self.detach_autoscans(dir.object_id).await?;
        }
        if !tokio::fs::metadata(&dir.location)
            .await
            .is_ok_and(|metadata| metadata.is_dir())
        {
            tracing::warn!(path = %dir.location.display(), "autoscan location is not a directory");
            return Ok(None);
        }
        let container_id = self.chains().ensure_path_existence(&dir.location).await?;
        let assigned = lock_registry(self.registry).assign_object_id(
            dir.scan_id,
            dir.scan_mode,
            container_id,
        );
        if let Some(assigned) = assigned {
            self.db.save_autoscan(&assigned.to_record()).await?;
        }
        Ok(Some(container_id))
    }

    /// Brings the container `object_id` (or, when invalid, the autoscan
    /// root) in line with the directory it mirrors.
    pub(crate) async fn rescan(
        &self,
        object_id: i64,
        scan_id: u32,
        scan_mode: ScanMode,
        run: &TaskRun,
    ) -> IngestResult<()> {
        let Some(dir) = self.autoscan(scan_id, scan_mode) else {
            tracing::info!(scan_id, scan_mode = scan_mode.as_str(), "autoscan no longer registered, skipping rescan");
            return Ok(());
        };
        let Some(container_id) = self.rescan_target(object_id, &dir).await? else {
            return Ok(());
        };
        let Some(container) = self.db.load_object(container_id).await? else {
            tracing::debug!(container_id, "rescan target no longer exists");
            return Ok(());
        };
        let location = match container.location.clone() {
            Some(location) if container.is_container() && !container.is_virtual => location,
            _ => {
                return Err(IngestError::invalid(format!(
                    "Object {container_id} does not mirror a directory"
                )));
            }
        };

        if !tokio::fs::metadata(&location)
            .await
            .is_ok_and(|metadata| metadata.is_dir())
        {
            if container_id == dir.object_id {
                tracing::warn!(path = %location.display(), "autoscan location vanished, clearing its contents");
                for child in self.db.get_children(container_id).await? {
                    self.remove_stale(child.id, run).await?;
                }
            } else {
                tracing::debug!(path = %location.display(), "directory vanished, removing container");
                self.remove_stale(container_id, run).await?;
            }
            return Ok(());
        }

        let mut newest: Option<i64> = None;
        let mut pending = vec![(container_id, location)];
        while let Some((parent_id, path)) = pending.pop() {
            self.ensure_wanted(scan_id, scan_mode, run)?;
            let mut known: HashMap<PathBuf, CatalogObject> = self
                .db
                .get_children(parent_id)
                .await?
                .into_iter()
                .filter(|child| !child.is_virtual)
                .filter_map(|child| Some((child.location.clone()?, child)))
                .collect();

            let mut subdirs = Vec::new();
            for entry in read_level(&path, dir.hidden) {
                self.ensure_wanted(scan_id, scan_mode, run)?;
                newest = newest.max(entry.modified);
                match known.remove(&entry.path) {
                    Some(existing) if existing.is_container() == entry.is_dir => {
                        if entry.is_dir {
                            if dir.recursive {
                                subdirs.push((existing.id, entry.path));
                            }
                        } else if dir.scan_level == ScanLevel::Full {
                            self.refresh_item(existing).await?;
                        }
                    }
                    Some(existing) => {
                        tracing::debug!(path = %entry.path.display(), "entry changed type, replacing");
                        self.remove_stale(existing.id, run).await?;
                        self.add_new_entry(parent_id, &entry, &dir, run).await?;
                    }
                    None => self.add_new_entry(parent_id, &entry, &dir, run).await?,
                }
            }

            for stale in known.into_values() {
                tracing::debug!(id = stale.id, title = %stale.title, "entry gone from disk");
                self.remove_stale(stale.id, run).await?;
            }
            pending.extend(subdirs.into_iter().rev());
        }

        if let Some(newest) = newest {
            let updated = lock_registry(self.registry).set_last_modified(scan_id, scan_mode, newest);
            if let Some(updated) = updated {
                self.db.save_autoscan(&updated.to_record()).await?;
            }
        }
        Ok(())
    }

    async fn add_new_entry(
        &self,
        parent_id: i64,
        entry: &LevelEntry,
        dir: &AutoscanDirectory,
        run: &TaskRun,
    ) -> IngestResult<()> {
        if !entry.is_dir {
            self.add_file_item(&entry.path, Some(parent_id)).await?;
            return Ok(());
        }
        if !dir.recursive {
            return Ok(());
        }
        let kind = TaskKind::AddFile {
            path: entry.path.clone(),
            recursive: true,
            hidden: dir.hidden,
        };
        if run.spawn_child(kind).await?.is_none() {
            self.import_path(&entry.path, true, dir.hidden, run).await?;
        }
        Ok(())
    }

    /// Re-extracts an existing item and writes it back only if something
    /// the extractor controls has changed.
    async fn refresh_item(&self, existing: CatalogObject) -> IngestResult<()> {
        let Some(path) = existing.location.as_deref() else {
            return Ok(());
        };
        let Some(fresh) = self.importer.create_object_from_file(path).await? else {
            return Ok(());
        };
        if fresh.metadata == existing.metadata
            && fresh.resources == existing.resources
            && fresh.mime_type == existing.mime_type
            && fresh.last_modified == existing.last_modified
        {
            return Ok(());
        }
        let mut updated = existing;
        updated.metadata = fresh.metadata;
        updated.resources = fresh.resources;
        updated.mime_type = fresh.mime_type;
        updated.last_modified = fresh.last_modified;
        self.db.update_object(&updated).await?;
        tracing::debug!(id = updated.id, "item metadata refreshed");
        self.events.publish(CatalogEvent::ObjectUpdated { id: updated.id });
        Ok(())
    }
}
