use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{Arc, Mutex, OnceLock},
};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::content::accounting::Accounting;
use crate::content::autoscan::{
    AutoscanDirectory, AutoscanKey, AutoscanRegistry, ScanMode, SetOutcome, normalize_location,
};
use crate::content::chain::parse_chain;
use crate::content::events::{CatalogEvent, EventBus};
use crate::content::metadata::{Importer, MetadataHandler, MimeMapper};
use crate::content::reconcile::{DirectoryReconciler, lock_registry};
use crate::content::scheduler::{EnqueueOptions, Scheduler, TaskFilter};
use crate::content::task::{ContentOps, NO_PARENT, TaskId, TaskKind, TaskModel, TaskRun};
use crate::content::transform::ObjectTransform;
use crate::content::triggers::{Triggers, WatcherOptions};
use crate::db::{
    CLASS_CONTAINER, CLASS_ITEM, Database, FS_ROOT_ID, NewObject, ObjectKind, ROOT_ID, RemovedObject,
};
use crate::error::{IngestError, IngestResult};

#[derive(Default)]
pub struct ContentOptions {
    /// Default for [`AddFileOptions::hidden`].
    pub hidden_files: bool,
    pub ignore_unknown_extensions: bool,
    pub extension_mimetype: HashMap<String, String>,
    pub mimetype_upnpclass: HashMap<String, String>,
    pub handlers: Vec<Arc<dyn MetadataHandler>>,
    pub transform: Option<Arc<dyn ObjectTransform>>,
    pub watcher: WatcherOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddFileOptions {
    pub recursive: bool,
    pub hidden: bool,
    pub low_priority: bool,
}

impl Default for AddFileOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            hidden: false,
            low_priority: false,
        }
    }
}

/// State shared by the manager, the task runner and the autoscan triggers.
pub(crate) struct ContentCore {
    db: Arc<dyn Database>,
    importer: Importer,
    transform: Option<Arc<dyn ObjectTransform>>,
    registry: Mutex<AutoscanRegistry>,
    events: EventBus,
    accounting: Mutex<Accounting>,
    hidden_files: bool,
    triggers: OnceLock<Triggers>,
}

impl ContentCore {
    fn reconciler(&self) -> DirectoryReconciler<'_> {
        DirectoryReconciler {
            db: self.db.as_ref(),
            importer: &self.importer,
            transform: self.transform.as_deref(),
            registry: &self.registry,
            events: &self.events,
        }
    }

    pub(crate) fn autoscan(&self, key: AutoscanKey<'_>) -> Option<AutoscanDirectory> {
        lock_registry(&self.registry).get(key).cloned()
    }

    pub(crate) fn autoscan_containing(&self, path: &Path, mode: ScanMode) -> Option<AutoscanDirectory> {
        lock_registry(&self.registry)
            .innermost_containing(path, mode)
            .cloned()
    }

    /// Drops everything attached to an autoscan entry that has already left
    /// the registry.
    async fn retire_autoscan(
        &self,
        dir: &AutoscanDirectory,
        scheduler: Option<&Scheduler>,
    ) -> IngestResult<()> {
        if let Some(triggers) = self.triggers.get() {
            triggers.deregister(dir);
        }
        if let Some(scheduler) = scheduler {
            scheduler
                .invalidate_matching(TaskFilter::Rescans {
                    scan_id: dir.scan_id,
                    scan_mode: dir.scan_mode,
                })
                .await?;
        }
        self.db.delete_autoscan(&dir.location).await?;
        tracing::info!(path = %dir.location.display(), scan_mode = dir.scan_mode.as_str(), "autoscan directory removed");
        Ok(())
    }

    /// Unregisters autoscan entries whose container was just removed.
    async fn forget_autoscans(
        &self,
        removed: &[RemovedObject],
        scheduler: Option<&Scheduler>,
    ) -> IngestResult<()> {
        for entry in removed {
            let dir = lock_registry(&self.registry).remove(AutoscanKey::ObjectId(entry.id));
            if let Some(dir) = dir {
                self.retire_autoscan(&dir, scheduler).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContentOps for ContentCore {
    async fn import_path(
        &self,
        path: &Path,
        recursive: bool,
        hidden: bool,
        run: &TaskRun,
    ) -> IngestResult<()> {
        self.reconciler()
            .import_path(path, recursive, hidden, run)
            .await
    }

    async fn remove_object(&self, object_id: i64, all: bool, run: &TaskRun) -> IngestResult<()> {
        let removed = self.reconciler().remove_object(object_id, all, run).await?;
        self.forget_autoscans(&removed, run.scheduler()).await
    }

    async fn reload_accounting(&self) -> IngestResult<()> {
        let accounting = Accounting::load(self.db.as_ref()).await?;
        *self
            .accounting
            .lock()
            .unwrap_or_else(|err| err.into_inner()) = accounting;
        tracing::debug!(total_files = accounting.total_files, "accounting reloaded");
        Ok(())
    }

    async fn rescan_directory(
        &self,
        object_id: i64,
        scan_id: u32,
        scan_mode: ScanMode,
        run: &TaskRun,
    ) -> IngestResult<()> {
        self.reconciler()
            .rescan(object_id, scan_id, scan_mode, run)
            .await
    }
}

async fn enqueue_rescan(
    scheduler: &Scheduler,
    dir: &AutoscanDirectory,
    object_id: i64,
) -> IngestResult<TaskModel> {
    scheduler
        .enqueue(
            TaskKind::RescanDirectory {
                object_id,
                scan_id: dir.scan_id,
                scan_mode: dir.scan_mode,
            },
            EnqueueOptions {
                low_priority: true,
                parent_id: NO_PARENT,
                dedupe: true,
            },
        )
        .await
}

/// Queues a rescan of a registered autoscan root. Unknown scan ids are
/// ignored.
pub(crate) async fn dispatch_rescan(
    core: &ContentCore,
    scheduler: &Scheduler,
    scan_id: u32,
    scan_mode: ScanMode,
) -> IngestResult<Option<TaskModel>> {
    let Some(dir) = core.autoscan(AutoscanKey::ScanId(scan_id, scan_mode)) else {
        return Ok(None);
    };
    enqueue_rescan(scheduler, &dir, dir.object_id).await.map(Some)
}

/// Queues a rescan of the container mirroring `location`, if it lies in a
/// monitored autoscan directory.
pub(crate) async fn dispatch_directory_change(
    core: &ContentCore,
    scheduler: &Scheduler,
    location: &Path,
) -> IngestResult<Option<TaskModel>> {
    let location = normalize_location(location);
    let Some(dir) = core.autoscan_containing(&location, ScanMode::Monitored) else {
        tracing::debug!(path = %location.display(), "change outside monitored directories");
        return Ok(None);
    };
    let object_id = if location == dir.location {
        dir.object_id
    } else {
        match core.db.find_object_by_location(&location).await? {
            Some(object) if object.is_container() => object.id,
            Some(object) => object.parent_id,
            None => dir.object_id,
        }
    };
    enqueue_rescan(scheduler, &dir, object_id).await.map(Some)
}

/// Entry point for everything that changes the catalog.
///
/// Long-running work is queued on the task scheduler; the synchronous
/// variants run on the caller's task instead.
#[derive(Clone)]
pub struct ContentManager {
    core: Arc<ContentCore>,
    scheduler: Scheduler,
    triggers: Triggers,
}

impl ContentManager {
    pub async fn start(db: Arc<dyn Database>, options: ContentOptions) -> IngestResult<Self> {
        let mime = MimeMapper::new(
            options.extension_mimetype,
            options.mimetype_upnpclass,
            options.ignore_unknown_extensions,
        );
        let core = Arc::new(ContentCore {
            db,
            importer: Importer::new(mime, options.handlers),
            transform: options.transform,
            registry: Mutex::new(AutoscanRegistry::default()),
            events: EventBus::new(),
            accounting: Mutex::new(Accounting::default()),
            hidden_files: options.hidden_files,
            triggers: OnceLock::new(),
        });
        let scheduler = Scheduler::start(core.clone()).await?;
        let triggers = Triggers::start(Arc::clone(&core), scheduler.clone(), options.watcher).await?;
        let _ = core.triggers.set(triggers.clone());

        let manager = Self {
            core,
            scheduler,
            triggers,
        };
        manager.restore_autoscans().await?;
        manager.load_accounting(true).await?;
        tracing::info!("content manager started");
        Ok(manager)
    }

    async fn restore_autoscans(&self) -> IngestResult<()> {
        for record in self.core.db.load_autoscans().await? {
            let dir = AutoscanDirectory::from_record(record);
            if let Err(err) = dir.validate() {
                tracing::warn!(error = %err, "ignoring stored autoscan directory");
                continue;
            }
            let current = lock_registry(&self.core.registry).set(dir).current().clone();
            tracing::info!(
                path = %current.location.display(),
                scan_mode = current.scan_mode.as_str(),
                "autoscan directory restored"
            );
            self.triggers.register(&current);
            enqueue_rescan(&self.scheduler, &current, current.object_id).await?;
        }
        Ok(())
    }

    /// Stops the autoscan triggers and the scheduler. Queued tasks are
    /// abandoned; a running one is allowed to finish.
    pub async fn shutdown(&self) -> IngestResult<()> {
        self.triggers.stop();
        self.scheduler.shutdown().await?;
        tracing::info!("content manager stopped");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.core.events.subscribe()
    }

    pub fn default_add_options(&self) -> AddFileOptions {
        AddFileOptions {
            hidden: self.core.hidden_files,
            ..AddFileOptions::default()
        }
    }

    fn detached_run(&self) -> TaskRun {
        TaskRun::detached(Some(self.scheduler.clone()))
    }

    pub async fn current_task(&self) -> IngestResult<Option<TaskModel>> {
        self.scheduler.current_task().await
    }

    pub async fn task_list(&self) -> IngestResult<Vec<TaskModel>> {
        self.scheduler.list_tasks().await
    }

    pub async fn recent_tasks(&self) -> IngestResult<Vec<TaskModel>> {
        self.scheduler.recent_tasks().await
    }

    pub async fn is_busy(&self) -> IngestResult<bool> {
        self.scheduler.is_busy().await
    }

    /// Marks a queued or running task invalid. Unknown ids are ignored.
    pub async fn invalidate_task(&self, task_id: TaskId) -> IngestResult<()> {
        if !self.scheduler.invalidate(task_id).await? {
            tracing::debug!(task_id, "invalidate requested for unknown task");
        }
        Ok(())
    }

    pub fn accounting(&self) -> Accounting {
        *self
            .core
            .accounting
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }

    pub async fn load_accounting(&self, run_async: bool) -> IngestResult<Option<TaskModel>> {
        if run_async {
            let task = self
                .scheduler
                .enqueue(
                    TaskKind::LoadAccounting,
                    EnqueueOptions {
                        low_priority: true,
                        dedupe: true,
                        ..EnqueueOptions::default()
                    },
                )
                .await?;
            return Ok(Some(task));
        }
        self.core.reload_accounting().await?;
        Ok(None)
    }

    /// Imports a file or directory tree. Returns the queued task when
    /// `run_async`.
    pub async fn add_file(
        &self,
        path: &Path,
        options: AddFileOptions,
        run_async: bool,
    ) -> IngestResult<Option<TaskModel>> {
        if !path.is_absolute() {
            return Err(IngestError::invalid(format!(
                "Path {} must be absolute",
                path.display()
            )));
        }
        let path = normalize_location(path);
        if run_async {
            let task = self
                .scheduler
                .enqueue(
                    TaskKind::AddFile {
                        path,
                        recursive: options.recursive,
                        hidden: options.hidden,
                    },
                    EnqueueOptions {
                        low_priority: options.low_priority,
                        ..EnqueueOptions::default()
                    },
                )
                .await?;
            return Ok(Some(task));
        }
        self.core
            .import_path(&path, options.recursive, options.hidden, &self.detached_run())
            .await?;
        Ok(None)
    }

    pub async fn remove_object(
        &self,
        object_id: i64,
        all: bool,
        run_async: bool,
    ) -> IngestResult<Option<TaskModel>> {
        if run_async {
            let task = self
                .scheduler
                .enqueue(
                    TaskKind::RemoveObject { object_id, all },
                    EnqueueOptions::default(),
                )
                .await?;
            return Ok(Some(task));
        }
        ContentOps::remove_object(self.core.as_ref(), object_id, all, &self.detached_run()).await?;
        Ok(None)
    }

    /// Applies `parameters` to an object. Accepted keys are `title`,
    /// `class`, `mime_type` and `meta:<field>`; an empty `meta:` value
    /// deletes the field.
    pub async fn update_object(
        &self,
        object_id: i64,
        parameters: &BTreeMap<String, String>,
    ) -> IngestResult<()> {
        let mut object = self
            .core
            .db
            .load_object(object_id)
            .await?
            .ok_or_else(|| IngestError::not_found(format!("Object {object_id} not found")))?;
        if parameters.is_empty() {
            return Ok(());
        }
        for (key, value) in parameters {
            match key.as_str() {
                "title" => {
                    if value.trim().is_empty() {
                        return Err(IngestError::invalid("Title must not be empty"));
                    }
                    object.title = value.clone();
                }
                "class" => {
                    if value.trim().is_empty() {
                        return Err(IngestError::invalid("Class must not be empty"));
                    }
                    object.upnp_class = value.clone();
                }
                "mime_type" => {
                    if object.is_container() {
                        return Err(IngestError::invalid("Containers have no mime type"));
                    }
                    object.mime_type = Some(value.clone());
                }
                other => match other.strip_prefix("meta:") {
                    Some(field) if !field.is_empty() => {
                        if value.is_empty() {
                            object.metadata.remove(field);
                        } else {
                            object.metadata.insert(field.to_string(), value.clone());
                        }
                    }
                    _ => {
                        return Err(IngestError::invalid(format!(
                            "Unknown object field '{other}'"
                        )));
                    }
                },
            }
        }
        self.core.db.update_object(&object).await?;
        self.core
            .events
            .publish(CatalogEvent::ObjectUpdated { id: object_id });
        Ok(())
    }

    /// Turns an empty container into an item or an unreferenced item into a
    /// container. The upnp class is reset to the generic one of the new kind.
    pub async fn convert_object(&self, object_id: i64, kind: ObjectKind) -> IngestResult<()> {
        if object_id == ROOT_ID || object_id == FS_ROOT_ID {
            return Err(IngestError::invalid(format!(
                "Object {object_id} cannot be converted"
            )));
        }
        let mut object = self
            .core
            .db
            .load_object(object_id)
            .await?
            .ok_or_else(|| IngestError::not_found(format!("Object {object_id} not found")))?;
        if object.kind == kind {
            return Ok(());
        }
        if object.is_reference() {
            return Err(IngestError::invalid("References cannot be converted"));
        }
        match kind {
            ObjectKind::Item => {
                if !self.core.db.get_children(object_id).await?.is_empty() {
                    return Err(IngestError::invalid(format!(
                        "Container {object_id} is not empty"
                    )));
                }
                if self.core.autoscan(AutoscanKey::ObjectId(object_id)).is_some() {
                    return Err(IngestError::invalid(format!(
                        "Container {object_id} is scanned by an autoscan directory"
                    )));
                }
                object.upnp_class = CLASS_ITEM.to_string();
            }
            ObjectKind::Container => {
                if !self.core.db.find_references(object_id).await?.is_empty() {
                    return Err(IngestError::invalid(format!(
                        "Item {object_id} is still referenced"
                    )));
                }
                object.upnp_class = CLASS_CONTAINER.to_string();
                object.mime_type = None;
                object.resources.clear();
            }
        }
        object.kind = kind;
        self.core.db.update_object(&object).await?;
        tracing::debug!(id = object_id, kind = ?kind, "object converted");
        self.core
            .events
            .publish(CatalogEvent::ObjectUpdated { id: object_id });
        Ok(())
    }

    /// Stores `object` under its already-set parent.
    pub async fn add_object(&self, object: NewObject) -> IngestResult<i64> {
        let parent = self
            .core
            .db
            .load_object(object.parent_id)
            .await?
            .ok_or_else(|| {
                IngestError::not_found(format!("Parent {} not found", object.parent_id))
            })?;
        if !parent.is_container() {
            return Err(IngestError::invalid(format!(
                "Parent {} is not a container",
                object.parent_id
            )));
        }
        if let Some(ref_id) = object.ref_id {
            if self.core.db.load_object(ref_id).await?.is_none() {
                return Err(IngestError::not_found(format!("Referenced object {ref_id} not found")));
            }
        }
        if !object.is_virtual {
            let Some(location) = object.location.as_deref() else {
                return Err(IngestError::invalid("Non-virtual objects need a location"));
            };
            if !location.is_absolute() {
                return Err(IngestError::invalid(format!(
                    "Location {} must be absolute",
                    location.display()
                )));
            }
            if self.core.db.find_object_by_location(location).await?.is_some() {
                return Err(IngestError::invalid(format!(
                    "{} is already in the catalog",
                    location.display()
                )));
            }
        }
        self.core.reconciler().add_object(&object).await
    }

    pub async fn add_container(
        &self,
        parent_id: i64,
        title: &str,
        upnp_class: Option<&str>,
    ) -> IngestResult<i64> {
        self.core
            .reconciler()
            .chains()
            .add_container(parent_id, title, upnp_class.unwrap_or(CLASS_CONTAINER))
            .await
    }

    /// Parses `chain` (see [`parse_chain`]) and ensures every container on it.
    pub async fn add_container_chain(&self, chain: &str, last_class: Option<&str>) -> IngestResult<i64> {
        let segments = parse_chain(chain)?;
        self.ensure_chain(&segments, last_class).await
    }

    pub async fn ensure_chain(&self, segments: &[String], leaf_class: Option<&str>) -> IngestResult<i64> {
        self.core
            .reconciler()
            .chains()
            .ensure_chain(segments, leaf_class)
            .await
    }

    pub async fn ensure_path_existence(&self, path: &Path) -> IngestResult<i64> {
        if !path.is_absolute() {
            return Err(IngestError::invalid(format!(
                "Path {} must be absolute",
                path.display()
            )));
        }
        self.core
            .reconciler()
            .chains()
            .ensure_path_existence(&normalize_location(path))
            .await
    }

    /// Builds, without storing, the object the importer would create for
    /// `path`.
    pub async fn create_object_from_file(&self, path: &Path) -> IngestResult<Option<NewObject>> {
        self.core.importer.create_object_from_file(path).await
    }

    /// Makes sure the file behind `object.location` is cataloged (without
    /// running the transform), then stores `object` as a virtual reference
    /// to it.
    pub async fn add_virtual_item(&self, mut object: NewObject) -> IngestResult<i64> {
        let Some(location) = object.location.take() else {
            return Err(IngestError::invalid("Virtual item needs a file location"));
        };
        if !location.is_absolute() {
            return Err(IngestError::invalid(format!(
                "Location {} must be absolute",
                location.display()
            )));
        }
        let location = normalize_location(&location);
        let plain = DirectoryReconciler {
            transform: None,
            ..self.core.reconciler()
        };
        let real_id = plain
            .add_file_item(&location, None)
            .await?
            .ok_or_else(|| {
                IngestError::invalid(format!("{} cannot be imported", location.display()))
            })?;
        object.ref_id = Some(real_id);
        object.is_virtual = true;
        self.add_object(object).await
    }

    /// Queues a rescan of `object_id` for a registered autoscan entry.
    /// `object_id` may be invalid to mean the entry's root.
    pub async fn rescan_directory(
        &self,
        object_id: i64,
        scan_id: u32,
        scan_mode: ScanMode,
    ) -> IngestResult<TaskModel> {
        let dir = self
            .core
            .autoscan(AutoscanKey::ScanId(scan_id, scan_mode))
            .ok_or_else(|| {
                IngestError::not_found(format!(
                    "No {} autoscan with id {scan_id}",
                    scan_mode.as_str()
                ))
            })?;
        enqueue_rescan(&self.scheduler, &dir, object_id).await
    }

    /// Reports that the directory at `location` changed on disk.
    pub async fn notify_directory_changed(&self, location: &Path) -> IngestResult<Option<TaskModel>> {
        dispatch_directory_change(&self.core, &self.scheduler, location).await
    }

    pub fn get_autoscan_directory(&self, key: AutoscanKey<'_>) -> Option<AutoscanDirectory> {
        self.core.autoscan(key)
    }

    pub fn autoscan_directories(&self) -> Vec<AutoscanDirectory> {
        lock_registry(&self.core.registry).list()
    }

    /// Registers or updates an autoscan entry, persists it, arms its trigger
    /// and queues a rescan.
    pub async fn set_autoscan_directory(
        &self,
        mut dir: AutoscanDirectory,
    ) -> IngestResult<AutoscanDirectory> {
        dir.validate()?;
        dir.location = normalize_location(&dir.location);
        let outcome = lock_registry(&self.core.registry).set(dir);
        let current = outcome.current().clone();
        self.core.db.save_autoscan(&current.to_record()).await?;

        if let SetOutcome::Updated { previous, .. } = &outcome {
            self.triggers.deregister(previous);
            if previous.scan_id != current.scan_id || previous.scan_mode != current.scan_mode {
                self.scheduler
                    .invalidate_matching(TaskFilter::Rescans {
                        scan_id: previous.scan_id,
                        scan_mode: previous.scan_mode,
                    })
                    .await?;
            }
        }
        self.triggers.register(&current);
        tracing::info!(
            path = %current.location.display(),
            scan_mode = current.scan_mode.as_str(),
            scan_id = current.scan_id,
            "autoscan directory set"
        );
        enqueue_rescan(&self.scheduler, &current, current.object_id).await?;
        Ok(current)
    }

    pub async fn remove_autoscan_directory(
        &self,
        key: AutoscanKey<'_>,
    ) -> IngestResult<Option<AutoscanDirectory>> {
        let removed = lock_registry(&self.core.registry).remove(key);
        let Some(dir) = removed else {
            return Ok(None);
        };
        self.core.retire_autoscan(&dir, Some(&self.scheduler)).await?;
        Ok(Some(dir))
    }

    #[cfg(test)]
    pub(crate) fn db(&self) -> &dyn Database {
        self.core.db.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Condvar;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::content::autoscan::ScanLevel;
    use crate::content::metadata::MediaInfo;
    use crate::content::task::TaskState;
    use crate::content::transform::LayoutTransform;
    use crate::db::{INVALID_OBJECT_ID, ROOT_ID};
    use crate::error::ErrorKind;
    use crate::test_utils::{
        child_named, child_titles, start_manager, setup_test_catalog, test_options,
        wait_for_idle, write_file,
    };

    fn layout_options() -> ContentOptions {
        ContentOptions {
            transform: Some(Arc::new(LayoutTransform)),
            ..test_options()
        }
    }

    fn drain(rx: &mut broadcast::Receiver<CatalogEvent>) -> Vec<CatalogEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn container_at(manager: &ContentManager, chain: &[&str]) -> i64 {
        let mut id = ROOT_ID;
        for title in chain {
            id = manager
                .db()
                .find_child_container(id, title)
                .await
                .unwrap()
                .unwrap_or_else(|| panic!("missing container {title}"));
        }
        id
    }

    async fn scanned_autoscan(
        manager: &ContentManager,
        root: &Path,
        mode: ScanMode,
        level: ScanLevel,
    ) -> AutoscanDirectory {
        let mut dir = AutoscanDirectory::new(root, mode);
        dir.scan_level = level;
        dir.interval_secs = 3600;
        manager.set_autoscan_directory(dir).await.unwrap();
        wait_for_idle(manager).await;
        manager
            .get_autoscan_directory(AutoscanKey::Location(root))
            .unwrap()
    }

    #[tokio::test]
    async fn import_places_tracks_under_artist_and_album() {
        let media = TempDir::new().unwrap();
        let track = write_file(media.path(), "music/a.mp3", "artist=X\nalbum=Y\ntitle=Song");
        let manager = start_manager(layout_options()).await;

        manager
            .add_file(media.path(), AddFileOptions::default(), false)
            .await
            .unwrap();

        let real = manager.db().find_object_by_location(&track).await.unwrap().unwrap();
        assert_eq!(real.title, "Song");
        assert!(!real.is_virtual);
        let album = container_at(&manager, &["Audio", "Artists", "X", "Y"]).await;
        let album_obj = manager.db().load_object(album).await.unwrap().unwrap();
        assert_eq!(album_obj.upnp_class, "object.container.album.musicAlbum");
        let reference = child_named(manager.db(), album, "Song").await;
        assert_eq!(reference.ref_id, Some(real.id));
        assert_eq!(manager.db().find_references(real.id).await.unwrap().len(), 2);

        manager.load_accounting(false).await.unwrap();
        assert_eq!(manager.accounting().total_files, 1);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn rescan_drops_deleted_file() {
        let media = TempDir::new().unwrap();
        let doomed = write_file(media.path(), "a.mp3", "title=A");
        write_file(media.path(), "b.mp3", "title=B");
        let manager = start_manager(test_options()).await;
        let dir = scanned_autoscan(&manager, media.path(), ScanMode::Timed, ScanLevel::Basic).await;
        assert_ne!(dir.object_id, INVALID_OBJECT_ID);
        assert_eq!(child_titles(manager.db(), dir.object_id).await, vec!["A", "B"]);

        fs::remove_file(&doomed).unwrap();
        let mut rx = manager.subscribe();
        manager
            .rescan_directory(INVALID_OBJECT_ID, dir.scan_id, ScanMode::Timed)
            .await
            .unwrap();
        wait_for_idle(&manager).await;

        let removed: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|event| matches!(event, CatalogEvent::ObjectRemoved { .. }))
            .collect();
        assert_eq!(removed.len(), 1);
        assert_eq!(child_titles(manager.db(), dir.object_id).await, vec!["B"]);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn basic_rescan_of_unchanged_directory_is_quiet() {
        let media = TempDir::new().unwrap();
        write_file(media.path(), "a.mp3", "title=A");
        write_file(media.path(), "sub/b.mp3", "title=B");
        let manager = start_manager(test_options()).await;
        let dir = scanned_autoscan(&manager, media.path(), ScanMode::Timed, ScanLevel::Basic).await;

        let mut rx = manager.subscribe();
        manager
            .rescan_directory(INVALID_OBJECT_ID, dir.scan_id, ScanMode::Timed)
            .await
            .unwrap();
        wait_for_idle(&manager).await;

        assert!(drain(&mut rx).is_empty());
        assert_eq!(manager.db().count_items().await.unwrap(), 2);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn full_rescan_refreshes_changed_tags_once() {
        let media = TempDir::new().unwrap();
        let track = write_file(media.path(), "a.mp3", "title=A\nartist=X");
        let manager = start_manager(test_options()).await;
        let dir = scanned_autoscan(&manager, media.path(), ScanMode::Timed, ScanLevel::Full).await;

        fs::write(&track, "title=A\nartist=Someone Else").unwrap();
        let mut rx = manager.subscribe();
        manager
            .rescan_directory(INVALID_OBJECT_ID, dir.scan_id, ScanMode::Timed)
            .await
            .unwrap();
        wait_for_idle(&manager).await;

        let object = manager.db().find_object_by_location(&track).await.unwrap().unwrap();
        assert_eq!(object.metadata.get("artist").map(String::as_str), Some("Someone Else"));
        assert_eq!(drain(&mut rx), vec![CatalogEvent::ObjectUpdated { id: object.id }]);

        manager
            .rescan_directory(INVALID_OBJECT_ID, dir.scan_id, ScanMode::Timed)
            .await
            .unwrap();
        wait_for_idle(&manager).await;
        assert!(drain(&mut rx).is_empty());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn removing_a_reference_with_all_removes_the_real_object() {
        let media = TempDir::new().unwrap();
        let track = write_file(media.path(), "a.mp3", "artist=X\nalbum=Y\ntitle=Song");
        let manager = start_manager(layout_options()).await;
        manager
            .add_file(&track, AddFileOptions::default(), false)
            .await
            .unwrap();
        let real = manager.db().find_object_by_location(&track).await.unwrap().unwrap();

        let all_audio = container_at(&manager, &["Audio", "All Audio"]).await;
        let plain_ref = child_named(manager.db(), all_audio, "Song").await;
        manager.remove_object(plain_ref.id, false, false).await.unwrap();
        assert!(manager.db().load_object(real.id).await.unwrap().is_some());
        assert_eq!(manager.db().find_references(real.id).await.unwrap().len(), 1);

        let album = container_at(&manager, &["Audio", "Artists", "X", "Y"]).await;
        let album_ref = child_named(manager.db(), album, "Song").await;
        manager.remove_object(album_ref.id, true, false).await.unwrap();
        assert!(manager.db().load_object(real.id).await.unwrap().is_none());
        assert!(manager.db().find_references(real.id).await.unwrap().is_empty());
        assert_eq!(manager.db().count_items().await.unwrap(), 0);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn fixed_containers_cannot_be_removed() {
        let manager = start_manager(test_options()).await;
        let err = manager.remove_object(ROOT_ID, false, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        let err = manager.remove_object(424242, false, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        manager.shutdown().await.unwrap();
    }

    /// Blocks every extraction until released.
    #[derive(Default)]
    struct GateHandler {
        open: std::sync::Mutex<bool>,
        cond: Condvar,
        entered: AtomicUsize,
    }

    impl GateHandler {
        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.cond.notify_all();
        }

        async fn wait_entered(&self) {
            for _ in 0..500 {
                if self.entered.load(Ordering::SeqCst) > 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("no extraction started");
        }
    }

    impl MetadataHandler for GateHandler {
        fn handles(&self, _mime_type: &str) -> bool {
            true
        }

        fn extract(&self, _path: &Path, _mime_type: &str) -> Result<MediaInfo, String> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cond.wait(open).unwrap();
            }
            Ok(MediaInfo::default())
        }
    }

    #[tokio::test]
    async fn invalidated_import_leaves_catalog_untouched() {
        let media = TempDir::new().unwrap();
        let first = write_file(media.path(), "first.mp3", "");
        let second = write_file(media.path(), "later/second.mp3", "");
        let gate = Arc::new(GateHandler::default());
        let handler: Arc<dyn MetadataHandler> = gate.clone();
        let manager = start_manager(ContentOptions {
            handlers: vec![handler],
            ..test_options()
        })
        .await;

        manager
            .add_file(&first, AddFileOptions::default(), true)
            .await
            .unwrap();
        let queued = manager
            .add_file(&media.path().join("later"), AddFileOptions::default(), true)
            .await
            .unwrap()
            .unwrap();
        manager.invalidate_task(queued.id).await.unwrap();
        gate.release();
        wait_for_idle(&manager).await;

        assert!(manager.db().find_object_by_location(&first).await.unwrap().is_some());
        assert!(manager.db().find_object_by_location(&second).await.unwrap().is_none());
        assert!(
            manager
                .db()
                .find_object_by_location(&media.path().join("later"))
                .await
                .unwrap()
                .is_none()
        );
        let recent = manager.recent_tasks().await.unwrap();
        let skipped = recent.iter().find(|task| task.id == queued.id).unwrap();
        assert_eq!(skipped.state, TaskState::Skipped);
        assert!(skipped.finished_at.is_some());
        manager.shutdown().await.unwrap();
    }

    /// Starts a rescan of three new files that blocks while extracting the
    /// first one.
    async fn blocked_rescan(
        media: &Path,
    ) -> (ContentManager, Arc<GateHandler>, AutoscanDirectory, TaskModel) {
        let gate = Arc::new(GateHandler::default());
        let handler: Arc<dyn MetadataHandler> = gate.clone();
        let manager = start_manager(ContentOptions {
            handlers: vec![handler],
            ..test_options()
        })
        .await;
        let dir = scanned_autoscan(&manager, media, ScanMode::Timed, ScanLevel::Basic).await;
        for name in ["a.mp3", "b.mp3", "c.mp3"] {
            write_file(media, name, "");
        }
        let task = manager
            .rescan_directory(INVALID_OBJECT_ID, dir.scan_id, ScanMode::Timed)
            .await
            .unwrap();
        gate.wait_entered().await;
        (manager, gate, dir, task)
    }

    async fn assert_rescan_stopped_after_first_entry(
        manager: &ContentManager,
        media: &Path,
        task: &TaskModel,
    ) {
        let db = manager.db();
        assert!(db.find_object_by_location(&media.join("a.mp3")).await.unwrap().is_some());
        assert!(db.find_object_by_location(&media.join("b.mp3")).await.unwrap().is_none());
        assert!(db.find_object_by_location(&media.join("c.mp3")).await.unwrap().is_none());
        let recent = manager.recent_tasks().await.unwrap();
        let finished = recent.iter().find(|entry| entry.id == task.id).unwrap();
        assert_eq!(finished.state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn invalidated_rescan_stops_before_the_next_entry() {
        let media = TempDir::new().unwrap();
        let (manager, gate, _dir, task) = blocked_rescan(media.path()).await;

        manager.invalidate_task(task.id).await.unwrap();
        gate.release();
        wait_for_idle(&manager).await;

        assert_rescan_stopped_after_first_entry(&manager, media.path(), &task).await;
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn removing_the_autoscan_cancels_its_running_rescan() {
        let media = TempDir::new().unwrap();
        let (manager, gate, dir, task) = blocked_rescan(media.path()).await;

        let removed = manager
            .remove_autoscan_directory(AutoscanKey::ScanId(dir.scan_id, ScanMode::Timed))
            .await
            .unwrap();
        assert!(removed.is_some());
        gate.release();
        wait_for_idle(&manager).await;

        assert_rescan_stopped_after_first_entry(&manager, media.path(), &task).await;
        assert!(manager.db().load_autoscans().await.unwrap().is_empty());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn add_file_checks_its_path() {
        let media = TempDir::new().unwrap();
        let manager = start_manager(test_options()).await;

        let result = manager
            .add_file(&media.path().join("gone"), AddFileOptions::default(), false)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(manager.db().count_items().await.unwrap(), 0);

        let err = manager
            .add_file(Path::new("relative/dir"), AddFileOptions::default(), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn update_object_applies_known_fields_only() {
        let media = TempDir::new().unwrap();
        let track = write_file(media.path(), "a.mp3", "title=A\nartist=X");
        let manager = start_manager(test_options()).await;
        manager
            .add_file(&track, AddFileOptions::default(), false)
            .await
            .unwrap();
        let object = manager.db().find_object_by_location(&track).await.unwrap().unwrap();

        let mut bad = BTreeMap::new();
        bad.insert("title".to_string(), "Renamed".to_string());
        bad.insert("colour".to_string(), "blue".to_string());
        let err = manager.update_object(object.id, &bad).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        let unchanged = manager.db().load_object(object.id).await.unwrap().unwrap();
        assert_eq!(unchanged.title, "A");

        let mut rx = manager.subscribe();
        let mut good = BTreeMap::new();
        good.insert("title".to_string(), "Renamed".to_string());
        good.insert("meta:artist".to_string(), String::new());
        good.insert("meta:genre".to_string(), "Jazz".to_string());
        manager.update_object(object.id, &good).await.unwrap();

        let updated = manager.db().load_object(object.id).await.unwrap().unwrap();
        assert_eq!(updated.title, "Renamed");
        assert!(!updated.metadata.contains_key("artist"));
        assert_eq!(updated.metadata.get("genre").map(String::as_str), Some("Jazz"));
        assert!(updated.update_id > object.update_id);
        assert_eq!(drain(&mut rx), vec![CatalogEvent::ObjectUpdated { id: object.id }]);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn container_chains_honour_escapes_and_reuse_containers() {
        let manager = start_manager(test_options()).await;
        let id = manager
            .add_container_chain(r"/Audio/Artists/AC\/DC", Some("object.container.person.musicArtist"))
            .await
            .unwrap();
        let again = manager
            .add_container_chain(r"/Audio/Artists/AC\/DC", None)
            .await
            .unwrap();
        assert_eq!(id, again);

        let artists = container_at(&manager, &["Audio", "Artists"]).await;
        assert_eq!(child_titles(manager.db(), artists).await, vec!["AC/DC"]);
        let artist = manager.db().load_object(id).await.unwrap().unwrap();
        assert_eq!(artist.upnp_class, "object.container.person.musicArtist");

        let err = manager.add_container_chain("Audio//x", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn add_object_validates_parent_and_location() {
        let manager = start_manager(test_options()).await;
        let parent = manager.add_container(ROOT_ID, "Playlists", None).await.unwrap();

        let id = manager
            .add_object(NewObject::item(parent, "Stream", "object.item.audioItem"))
            .await
            .unwrap();
        let err = manager
            .add_object(NewObject::item(id, "Nested", "object.item"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        let err = manager
            .add_object(NewObject::item(9999, "Orphan", "object.item"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn convert_object_switches_kind_when_safe() {
        let manager = start_manager(test_options()).await;
        let playlists = manager.add_container(ROOT_ID, "Playlists", None).await.unwrap();
        let stream = manager
            .add_object(NewObject::item(playlists, "Stream", "object.item.audioItem"))
            .await
            .unwrap();

        let err = manager.convert_object(playlists, ObjectKind::Item).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);

        manager.convert_object(stream, ObjectKind::Container).await.unwrap();
        let converted = manager.db().load_object(stream).await.unwrap().unwrap();
        assert!(converted.is_container());
        assert_eq!(converted.upnp_class, CLASS_CONTAINER);
        assert!(converted.mime_type.is_none());
        manager
            .add_object(NewObject::item(stream, "Nested", "object.item"))
            .await
            .unwrap();

        let empty = manager.add_container(ROOT_ID, "Empty", None).await.unwrap();
        manager.convert_object(empty, ObjectKind::Item).await.unwrap();
        manager.convert_object(empty, ObjectKind::Item).await.unwrap();
        let item = manager.db().load_object(empty).await.unwrap().unwrap();
        assert!(!item.is_container());
        assert_eq!(item.upnp_class, CLASS_ITEM);

        let err = manager.convert_object(ROOT_ID, ObjectKind::Item).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        let err = manager.convert_object(9999, ObjectKind::Item).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn referenced_items_are_not_converted() {
        let media = TempDir::new().unwrap();
        let track = write_file(media.path(), "a.mp3", "artist=X\nalbum=Y\ntitle=Song");
        let manager = start_manager(layout_options()).await;
        manager
            .add_file(&track, AddFileOptions::default(), false)
            .await
            .unwrap();
        let real = manager.db().find_object_by_location(&track).await.unwrap().unwrap();
        let all_audio = container_at(&manager, &["Audio", "All Audio"]).await;
        let reference = child_named(manager.db(), all_audio, "Song").await;

        let err = manager.convert_object(real.id, ObjectKind::Container).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        let err = manager
            .convert_object(reference.id, ObjectKind::Container)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert!(!manager.db().load_object(real.id).await.unwrap().unwrap().is_container());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn virtual_item_imports_its_file_without_layout() {
        let media = TempDir::new().unwrap();
        let track = write_file(media.path(), "a.mp3", "artist=X\ntitle=Song");
        let manager = start_manager(layout_options()).await;
        let favourites = manager.add_container(ROOT_ID, "Favourites", None).await.unwrap();

        let mut favourite = NewObject::item(favourites, "Best Song", "object.item.audioItem");
        favourite.location = Some(track.clone());
        let id = manager.add_virtual_item(favourite).await.unwrap();

        let real = manager.db().find_object_by_location(&track).await.unwrap().unwrap();
        let stored = manager.db().load_object(id).await.unwrap().unwrap();
        assert_eq!(stored.ref_id, Some(real.id));
        assert!(stored.is_virtual);
        assert_eq!(stored.parent_id, favourites);
        assert!(manager.db().find_child_container(ROOT_ID, "Audio").await.unwrap().is_none());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn directory_change_rescans_the_mirrored_container() {
        let media = TempDir::new().unwrap();
        write_file(media.path(), "sub/a.mp3", "title=A");
        let manager = start_manager(test_options()).await;
        scanned_autoscan(&manager, media.path(), ScanMode::Monitored, ScanLevel::Basic).await;

        let fresh = write_file(media.path(), "sub/b.mp3", "title=B");
        let task = manager
            .notify_directory_changed(&media.path().join("sub"))
            .await
            .unwrap();
        assert!(task.is_some());
        wait_for_idle(&manager).await;
        assert!(manager.db().find_object_by_location(&fresh).await.unwrap().is_some());

        let outside = TempDir::new().unwrap();
        assert!(manager.notify_directory_changed(outside.path()).await.unwrap().is_none());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn timed_autoscan_picks_up_new_files() {
        let media = TempDir::new().unwrap();
        write_file(media.path(), "a.mp3", "title=A");
        let manager = start_manager(test_options()).await;
        let mut dir = AutoscanDirectory::new(media.path(), ScanMode::Timed);
        dir.interval_secs = 1;
        manager.set_autoscan_directory(dir).await.unwrap();
        wait_for_idle(&manager).await;

        let fresh = write_file(media.path(), "b.mp3", "title=B");
        let mut found = false;
        for _ in 0..100 {
            if manager.db().find_object_by_location(&fresh).await.unwrap().is_some() {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(found);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn removing_the_scanned_container_forgets_the_autoscan() {
        let media = TempDir::new().unwrap();
        write_file(media.path(), "a.mp3", "title=A");
        let manager = start_manager(test_options()).await;
        let dir = scanned_autoscan(&manager, media.path(), ScanMode::Timed, ScanLevel::Basic).await;

        manager.remove_object(dir.object_id, false, false).await.unwrap();
        assert!(manager.autoscan_directories().is_empty());
        assert!(manager.db().load_autoscans().await.unwrap().is_empty());
        let err = manager
            .rescan_directory(INVALID_OBJECT_ID, dir.scan_id, ScanMode::Timed)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn nested_autoscan_recovers_after_its_directory_returns() {
        let media = TempDir::new().unwrap();
        let sub = media.path().join("sub");
        write_file(media.path(), "sub/a.mp3", "title=A");
        let manager = start_manager(test_options()).await;
        let outer = scanned_autoscan(&manager, media.path(), ScanMode::Timed, ScanLevel::Basic).await;
        let inner = scanned_autoscan(&manager, &sub, ScanMode::Timed, ScanLevel::Basic).await;
        let old_container = manager.db().find_object_by_location(&sub).await.unwrap().unwrap();
        assert_eq!(inner.object_id, old_container.id);

        fs::remove_dir_all(&sub).unwrap();
        manager
            .rescan_directory(INVALID_OBJECT_ID, outer.scan_id, ScanMode::Timed)
            .await
            .unwrap();
        wait_for_idle(&manager).await;

        assert!(manager.db().load_object(old_container.id).await.unwrap().is_none());
        let detached = manager.get_autoscan_directory(AutoscanKey::Location(sub.as_path())).unwrap();
        assert_eq!(detached.scan_id, inner.scan_id);
        assert_eq!(detached.object_id, INVALID_OBJECT_ID);
        let stored = manager.db().load_autoscans().await.unwrap();
        let record = stored.iter().find(|record| record.location == sub).unwrap();
        assert_eq!(record.object_id, INVALID_OBJECT_ID);

        let fresh = write_file(media.path(), "sub/b.mp3", "title=B");
        manager
            .rescan_directory(INVALID_OBJECT_ID, inner.scan_id, ScanMode::Timed)
            .await
            .unwrap();
        wait_for_idle(&manager).await;

        let revived = manager.get_autoscan_directory(AutoscanKey::Location(sub.as_path())).unwrap();
        assert_ne!(revived.object_id, INVALID_OBJECT_ID);
        assert_ne!(revived.object_id, old_container.id);
        assert!(manager.db().find_object_by_location(&fresh).await.unwrap().is_some());
        assert_eq!(child_titles(manager.db(), revived.object_id).await, vec!["B"]);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn removing_an_autoscan_keeps_its_content() {
        let media = TempDir::new().unwrap();
        write_file(media.path(), "a.mp3", "title=A");
        let manager = start_manager(test_options()).await;
        scanned_autoscan(&manager, media.path(), ScanMode::Timed, ScanLevel::Basic).await;

        let removed = manager
            .remove_autoscan_directory(AutoscanKey::Location(media.path()))
            .await
            .unwrap();
        assert!(removed.is_some());
        assert!(manager.autoscan_directories().is_empty());
        assert_eq!(manager.db().count_items().await.unwrap(), 1);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn autoscans_survive_a_restart() {
        let media = TempDir::new().unwrap();
        write_file(media.path(), "a.mp3", "title=A");
        let db = setup_test_catalog().await;
        let first = ContentManager::start(Arc::clone(&db), test_options()).await.unwrap();
        let dir = scanned_autoscan(&first, media.path(), ScanMode::Timed, ScanLevel::Basic).await;
        first.shutdown().await.unwrap();

        let second = ContentManager::start(db, test_options()).await.unwrap();
        wait_for_idle(&second).await;
        let restored = second.autoscan_directories();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].location, media.path());
        assert_eq!(restored[0].object_id, dir.object_id);
        assert_eq!(second.accounting().total_files, 1);
        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shut_down_manager_rejects_work() {
        let media = TempDir::new().unwrap();
        let manager = start_manager(test_options()).await;
        manager.shutdown().await.unwrap();
        let err = manager
            .add_file(media.path(), AddFileOptions::default(), true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }
}
