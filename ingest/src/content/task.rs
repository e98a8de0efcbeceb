use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use serde::Serialize;

use crate::content::autoscan::ScanMode;
use crate::content::scheduler::{EnqueueOptions, Scheduler};
use crate::error::{IngestError, IngestResult};

pub type TaskId = u32;

/// Parent id of tasks that were not spawned by another task.
pub const NO_PARENT: TaskId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    AddFile,
    RemoveObject,
    LoadAccounting,
    RescanDirectory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    AddFile {
        path: PathBuf,
        recursive: bool,
        hidden: bool,
    },
    RemoveObject {
        object_id: i64,
        all: bool,
    },
    LoadAccounting,
    RescanDirectory {
        object_id: i64,
        scan_id: u32,
        scan_mode: ScanMode,
    },
}

impl TaskKind {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskKind::AddFile { .. } => TaskType::AddFile,
            TaskKind::RemoveObject { .. } => TaskType::RemoveObject,
            TaskKind::LoadAccounting => TaskType::LoadAccounting,
            TaskKind::RescanDirectory { .. } => TaskType::RescanDirectory,
        }
    }

    pub fn cancellable(&self) -> bool {
        matches!(
            self,
            TaskKind::AddFile { .. } | TaskKind::RescanDirectory { .. }
        )
    }

    pub fn describe(&self) -> String {
        match self {
            TaskKind::AddFile { path, .. } => format!("Importing {}", path.display()),
            TaskKind::RemoveObject { object_id, .. } => format!("Removing object {object_id}"),
            TaskKind::LoadAccounting => "Loading accounting".to_string(),
            TaskKind::RescanDirectory {
                object_id,
                scan_mode,
                ..
            } => format!("Scan ({}) of container {object_id}", scan_mode.as_str()),
        }
    }

    pub(crate) fn is_add_under(&self, location: &Path) -> bool {
        match self {
            TaskKind::AddFile { path, .. } => path.starts_with(location),
            _ => false,
        }
    }

    pub(crate) fn is_rescan_of(&self, target_scan: u32, target_mode: ScanMode) -> bool {
        match self {
            TaskKind::RescanDirectory {
                scan_id, scan_mode, ..
            } => *scan_id == target_scan && *scan_mode == target_mode,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Task {
    pub id: TaskId,
    pub parent_id: TaskId,
    pub kind: TaskKind,
    pub description: String,
    pub low_priority: bool,
    valid: Arc<AtomicBool>,
}

impl Task {
    pub(crate) fn new(id: TaskId, parent_id: TaskId, kind: TaskKind, low_priority: bool) -> Self {
        let description = kind.describe();
        Self {
            id,
            parent_id,
            kind,
            description,
            low_priority,
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub(crate) fn valid_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.valid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Cancelled,
    Skipped,
    Failed { error: String },
}

/// Read-only view of a task for callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskModel {
    pub id: TaskId,
    pub parent_id: TaskId,
    pub task_type: TaskType,
    pub description: String,
    pub cancellable: bool,
    pub valid: bool,
    pub low_priority: bool,
    #[serde(flatten)]
    pub state: TaskState,
    /// RFC 3339 time the task left the queue, for history entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

impl TaskModel {
    pub(crate) fn from_task(task: &Task, state: TaskState) -> Self {
        Self {
            id: task.id,
            parent_id: task.parent_id,
            task_type: task.kind.task_type(),
            description: task.description.clone(),
            cancellable: task.kind.cancellable(),
            valid: task.is_valid(),
            low_priority: task.low_priority,
            state,
            finished_at: None,
        }
    }

    pub(crate) fn finished(task: &Task, state: TaskState) -> Self {
        Self {
            finished_at: Some(current_iso_timestamp()),
            ..Self::from_task(task, state)
        }
    }
}

fn current_iso_timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Execution context handed to a running task.
#[derive(Clone)]
pub(crate) struct TaskRun {
    id: TaskId,
    valid: Arc<AtomicBool>,
    scheduler: Option<Scheduler>,
}

impl TaskRun {
    pub(crate) fn for_task(task: &Task, scheduler: Scheduler) -> Self {
        Self {
            id: task.id,
            valid: task.valid_flag(),
            scheduler: Some(scheduler),
        }
    }

    /// Context for work done synchronously on behalf of a caller.
    pub(crate) fn detached(scheduler: Option<Scheduler>) -> Self {
        Self {
            id: NO_PARENT,
            valid: Arc::new(AtomicBool::new(true)),
            scheduler,
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_valid(&self) -> IngestResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(IngestError::cancelled(format!("Task {} was invalidated", self.id)))
        }
    }

    pub(crate) fn scheduler(&self) -> Option<&Scheduler> {
        self.scheduler.as_ref()
    }

    /// Queues `kind` as a low-priority child of this run. Returns `None` when
    /// there is no scheduler to queue on.
    pub(crate) async fn spawn_child(&self, kind: TaskKind) -> IngestResult<Option<TaskModel>> {
        let Some(scheduler) = self.scheduler.as_ref() else {
            return Ok(None);
        };
        let model = scheduler
            .enqueue(
                kind,
                EnqueueOptions {
                    low_priority: true,
                    parent_id: self.id,
                    dedupe: true,
                },
            )
            .await?;
        Ok(Some(model))
    }
}

/// Internal operations the task variants execute against.
#[async_trait]
pub(crate) trait ContentOps: Send + Sync {
    async fn import_path(
        &self,
        path: &Path,
        recursive: bool,
        hidden: bool,
        run: &TaskRun,
    ) -> IngestResult<()>;

    async fn remove_object(&self, object_id: i64, all: bool, run: &TaskRun) -> IngestResult<()>;

    async fn reload_accounting(&self) -> IngestResult<()>;

    async fn rescan_directory(
        &self,
        object_id: i64,
        scan_id: u32,
        scan_mode: ScanMode,
        run: &TaskRun,
    ) -> IngestResult<()>;
}

pub(crate) async fn execute_task(
    task: &Task,
    ops: &dyn ContentOps,
    run: &TaskRun,
) -> IngestResult<()> {
    match &task.kind {
        TaskKind::AddFile {
            path,
            recursive,
            hidden,
        } => ops.import_path(path, *recursive, *hidden, run).await,
        TaskKind::RemoveObject { object_id, all } => ops.remove_object(*object_id, *all, run).await,
        TaskKind::LoadAccounting => ops.reload_accounting().await,
        TaskKind::RescanDirectory {
            object_id,
            scan_id,
            scan_mode,
        } => {
            ops.rescan_directory(*object_id, *scan_id, *scan_mode, run)
                .await
        }
    }
}
