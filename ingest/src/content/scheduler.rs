use std::{collections::VecDeque, path::PathBuf, sync::Arc};

use hashlink::LinkedHashMap;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::oneshot;

use crate::content::autoscan::ScanMode;
use crate::content::task::{
    ContentOps, NO_PARENT, Task, TaskId, TaskKind, TaskModel, TaskRun, TaskState, execute_task,
};
use crate::error::{IngestError, IngestResult};

const HISTORY_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy)]
pub(crate) struct EnqueueOptions {
    pub low_priority: bool,
    pub parent_id: TaskId,
    /// Reuse an identical task that is still waiting in the same queue.
    pub dedupe: bool,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            low_priority: false,
            parent_id: NO_PARENT,
            dedupe: false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum TaskFilter {
    AddFileUnder(PathBuf),
    Rescans { scan_id: u32, scan_mode: ScanMode },
}

impl TaskFilter {
    fn matches(&self, kind: &TaskKind) -> bool {
        match self {
            TaskFilter::AddFileUnder(location) => kind.is_add_under(location),
            TaskFilter::Rescans { scan_id, scan_mode } => kind.is_rescan_of(*scan_id, *scan_mode),
        }
    }
}

pub(crate) enum TaskQueueMessage {
    Enqueue {
        kind: TaskKind,
        options: EnqueueOptions,
        reply: oneshot::Sender<IngestResult<TaskModel>>,
    },
    CurrentTask {
        reply: oneshot::Sender<Option<TaskModel>>,
    },
    ListTasks {
        reply: oneshot::Sender<Vec<TaskModel>>,
    },
    RecentTasks {
        reply: oneshot::Sender<Vec<TaskModel>>,
    },
    Invalidate {
        task_id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    InvalidateMatching {
        filter: TaskFilter,
        reply: oneshot::Sender<Vec<TaskId>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    RunnerFinished {
        task_id: TaskId,
        result: IngestResult<()>,
    },
}

pub(crate) struct TaskQueueActor;

pub(crate) struct TaskQueueArgs {
    pub ops: Arc<dyn ContentOps>,
}

/// Two FIFO queues plus the single running slot. High priority always
/// drains before low priority.
pub(crate) struct TaskQueueState {
    high: LinkedHashMap<TaskId, Task>,
    low: LinkedHashMap<TaskId, Task>,
    current: Option<Task>,
    task_counter: TaskId,
    shutting_down: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    history: VecDeque<TaskModel>,
    runner: ActorRef<TaskRunnerMessage>,
}

impl TaskQueueState {
    fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.current
            .iter()
            .chain(self.high.values())
            .chain(self.low.values())
    }

    fn next_task_id(&mut self) -> TaskId {
        self.task_counter = self.task_counter.wrapping_add(1);
        if self.task_counter == NO_PARENT {
            self.task_counter = 1;
        }
        self.task_counter
    }

    fn record(&mut self, task: &Task, state: TaskState) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(TaskModel::finished(task, state));
    }

    fn find_waiting(&self, kind: &TaskKind, low_priority: bool) -> Option<&Task> {
        let queue = if low_priority { &self.low } else { &self.high };
        queue
            .values()
            .find(|task| task.is_valid() && &task.kind == kind)
    }

    /// Invalidates every task spawned, directly or transitively, by `root`.
    fn invalidate_descendants(&self, root: TaskId) {
        let mut frontier = vec![root];
        while let Some(parent) = frontier.pop() {
            for task in self.tasks() {
                if task.parent_id == parent && task.is_valid() {
                    task.invalidate();
                    frontier.push(task.id);
                }
            }
        }
    }

    fn pop_next(&mut self) -> Option<Task> {
        if let Some((_, task)) = self.high.pop_front() {
            return Some(task);
        }
        self.low.pop_front().map(|(_, task)| task)
    }
}

pub(crate) enum TaskRunnerMessage {
    RunTask {
        task: Task,
        reply: oneshot::Sender<IngestResult<()>>,
    },
}

pub(crate) struct TaskRunnerActor;

pub(crate) struct TaskRunnerArgs {
    pub queue: ActorRef<TaskQueueMessage>,
    pub ops: Arc<dyn ContentOps>,
}

pub(crate) struct TaskRunnerState {
    queue: ActorRef<TaskQueueMessage>,
    ops: Arc<dyn ContentOps>,
}

impl Actor for TaskQueueActor {
    type Msg = TaskQueueMessage;
    type State = TaskQueueState;
    type Arguments = TaskQueueArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let (runner, _handle) = Actor::spawn(
            None,
            TaskRunnerActor,
            TaskRunnerArgs {
                queue: myself.clone(),
                ops: args.ops,
            },
        )
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, "failed to start task runner");
            ActorProcessingErr::from("failed to start task runner")
        })?;
        Ok(TaskQueueState {
            high: LinkedHashMap::new(),
            low: LinkedHashMap::new(),
            current: None,
            task_counter: 0,
            shutting_down: false,
            shutdown_waiters: Vec::new(),
            history: VecDeque::new(),
            runner,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            TaskQueueMessage::Enqueue {
                kind,
                options,
                reply,
            } => {
                if state.shutting_down {
                    let _ = reply.send(Err(IngestError::unavailable(
                        "Task scheduler is shutting down",
                    )));
                    return Ok(());
                }
                if options.dedupe {
                    if let Some(existing) = state.find_waiting(&kind, options.low_priority) {
                        tracing::debug!(task_id = existing.id, "reusing queued task");
                        let model = TaskModel::from_task(existing, TaskState::Queued);
                        let _ = reply.send(Ok(model));
                        return Ok(());
                    }
                }
                let task_id = state.next_task_id();
                let task = Task::new(task_id, options.parent_id, kind, options.low_priority);
                let model = TaskModel::from_task(&task, TaskState::Queued);
                tracing::debug!(
                    task_id,
                    low_priority = options.low_priority,
                    description = %task.description,
                    "task queued"
                );
                if options.low_priority {
                    state.low.insert(task_id, task);
                } else {
                    state.high.insert(task_id, task);
                }
                if state.current.is_none() {
                    start_next_task(state).await;
                }
                let _ = reply.send(Ok(model));
            }
            TaskQueueMessage::CurrentTask { reply } => {
                let current = state
                    .current
                    .as_ref()
                    .map(|task| TaskModel::from_task(task, TaskState::Running));
                let _ = reply.send(current);
            }
            TaskQueueMessage::ListTasks { reply } => {
                let mut tasks = Vec::new();
                if let Some(current) = state.current.as_ref() {
                    tasks.push(TaskModel::from_task(current, TaskState::Running));
                }
                for task in state.high.values().chain(state.low.values()) {
                    tasks.push(TaskModel::from_task(task, TaskState::Queued));
                }
                let _ = reply.send(tasks);
            }
            TaskQueueMessage::RecentTasks { reply } => {
                let _ = reply.send(state.history.iter().cloned().collect());
            }
            TaskQueueMessage::Invalidate { task_id, reply } => {
                let found = match state.tasks().find(|task| task.id == task_id) {
                    Some(task) => {
                        task.invalidate();
                        true
                    }
                    None => false,
                };
                if found {
                    tracing::info!(task_id, "task invalidated");
                    state.invalidate_descendants(task_id);
                }
                let _ = reply.send(found);
            }
            TaskQueueMessage::InvalidateMatching { filter, reply } => {
                let matched: Vec<TaskId> = state
                    .tasks()
                    .filter(|task| task.is_valid() && filter.matches(&task.kind))
                    .map(|task| {
                        task.invalidate();
                        task.id
                    })
                    .collect();
                for task_id in &matched {
                    state.invalidate_descendants(*task_id);
                }
                if !matched.is_empty() {
                    tracing::info!(count = matched.len(), ?filter, "tasks invalidated");
                }
                let _ = reply.send(matched);
            }
            TaskQueueMessage::Shutdown { reply } => {
                state.shutting_down = true;
                let abandoned = state.high.len() + state.low.len();
                state.high.clear();
                state.low.clear();
                if abandoned > 0 {
                    tracing::info!(abandoned, "queued tasks abandoned at shutdown");
                }
                match state.current.as_ref() {
                    Some(current) => {
                        if current.kind.cancellable() {
                            current.invalidate();
                        }
                        state.shutdown_waiters.push(reply);
                    }
                    None => {
                        let _ = reply.send(());
                        myself.stop(None);
                    }
                }
            }
            TaskQueueMessage::RunnerFinished { task_id, result } => {
                let Some(current) = state.current.take_if(|task| task.id == task_id) else {
                    return Ok(());
                };
                let outcome = match result {
                    Ok(()) => {
                        tracing::info!(task_id, description = %current.description, "task finished");
                        TaskState::Completed
                    }
                    Err(err) if err.is_cancelled() => {
                        tracing::info!(task_id, description = %current.description, "task cancelled");
                        TaskState::Cancelled
                    }
                    Err(err) => {
                        tracing::error!(
                            error = %err,
                            task_id,
                            description = %current.description,
                            "task failed"
                        );
                        TaskState::Failed {
                            error: err.detail().to_string(),
                        }
                    }
                };
                state.record(&current, outcome);
                if state.shutting_down {
                    for waiter in state.shutdown_waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                    myself.stop(None);
                    return Ok(());
                }
                start_next_task(state).await;
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.runner.stop(None);
        Ok(())
    }
}

async fn start_next_task(state: &mut TaskQueueState) {
    while state.current.is_none() && !state.shutting_down {
        let Some(task) = state.pop_next() else {
            return;
        };
        if !task.is_valid() {
            tracing::debug!(task_id = task.id, description = %task.description, "skipping invalidated task");
            state.record(&task, TaskState::Skipped);
            continue;
        }
        let (reply, rx) = oneshot::channel();
        let handed_off = match state.runner.send_message(TaskRunnerMessage::RunTask {
            task: task.clone(),
            reply,
        }) {
            Err(_) => Err(IngestError::unavailable("Task runner unavailable")),
            Ok(()) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(IngestError::internal("Task runner dropped response")),
            },
        };
        match handed_off {
            Ok(()) => state.current = Some(task),
            Err(err) => {
                tracing::error!(
                    error = %err,
                    task_id = task.id,
                    description = %task.description,
                    "task could not be started"
                );
                state.record(
                    &task,
                    TaskState::Failed {
                        error: err.detail().to_string(),
                    },
                );
            }
        }
    }
}

impl Actor for TaskRunnerActor {
    type Msg = TaskRunnerMessage;
    type State = TaskRunnerState;
    type Arguments = TaskRunnerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(TaskRunnerState {
            queue: args.queue,
            ops: args.ops,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            TaskRunnerMessage::RunTask { task, reply } => {
                let queue = state.queue.clone();
                let ops = Arc::clone(&state.ops);
                let run = TaskRun::for_task(&task, Scheduler::from_ref(queue.clone()));
                let task_id = task.id;
                let work = tokio::spawn(async move {
                    tracing::info!(task_id = task.id, description = %task.description, "task started");
                    execute_task(&task, ops.as_ref(), &run).await
                });
                tokio::spawn(async move {
                    let result = match work.await {
                        Ok(result) => result,
                        Err(err) => {
                            tracing::error!(error = %err, task_id, "task panicked");
                            Err(IngestError::internal("Task panicked"))
                        }
                    };
                    let _ = queue.send_message(TaskQueueMessage::RunnerFinished { task_id, result });
                });
                let _ = reply.send(Ok(()));
            }
        }
        Ok(())
    }
}

/// Handle to the task queue actor.
#[derive(Clone)]
pub(crate) struct Scheduler {
    queue: ActorRef<TaskQueueMessage>,
}

impl Scheduler {
    pub(crate) async fn start(ops: Arc<dyn ContentOps>) -> IngestResult<Self> {
        let (queue, _handle) = Actor::spawn(None, TaskQueueActor, TaskQueueArgs { ops })
            .await
            .map_err(|err| {
                tracing::error!(error = ?err, "failed to start task queue");
                IngestError::internal("Failed to start task queue")
            })?;
        Ok(Self { queue })
    }

    fn from_ref(queue: ActorRef<TaskQueueMessage>) -> Self {
        Self { queue }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> TaskQueueMessage,
    ) -> IngestResult<T> {
        let (reply, rx) = oneshot::channel();
        self.queue
            .send_message(build(reply))
            .map_err(|_| IngestError::unavailable("Task queue unavailable"))?;
        rx.await
            .map_err(|_| IngestError::unavailable("Task queue dropped response"))
    }

    pub(crate) async fn enqueue(
        &self,
        kind: TaskKind,
        options: EnqueueOptions,
    ) -> IngestResult<TaskModel> {
        self.call(|reply| TaskQueueMessage::Enqueue {
            kind,
            options,
            reply,
        })
        .await?
    }

    pub(crate) async fn current_task(&self) -> IngestResult<Option<TaskModel>> {
        self.call(|reply| TaskQueueMessage::CurrentTask { reply }).await
    }

    pub(crate) async fn list_tasks(&self) -> IngestResult<Vec<TaskModel>> {
        self.call(|reply| TaskQueueMessage::ListTasks { reply }).await
    }

    pub(crate) async fn recent_tasks(&self) -> IngestResult<Vec<TaskModel>> {
        self.call(|reply| TaskQueueMessage::RecentTasks { reply }).await
    }

    pub(crate) async fn is_busy(&self) -> IngestResult<bool> {
        Ok(self.current_task().await?.is_some())
    }

    /// Marks the task and everything it spawned invalid. Unknown ids are a
    /// no-op and return `false`.
    pub(crate) async fn invalidate(&self, task_id: TaskId) -> IngestResult<bool> {
        self.call(|reply| TaskQueueMessage::Invalidate { task_id, reply })
            .await
    }

    pub(crate) async fn invalidate_matching(&self, filter: TaskFilter) -> IngestResult<Vec<TaskId>> {
        self.call(|reply| TaskQueueMessage::InvalidateMatching { filter, reply })
            .await
    }

    /// Abandons queued work, lets the running task wind down and stops the
    /// queue. Calling it on a stopped scheduler is a no-op.
    pub(crate) async fn shutdown(&self) -> IngestResult<()> {
        match self.call(|reply| TaskQueueMessage::Shutdown { reply }).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == crate::error::ErrorKind::Unavailable => Ok(()),
            Err(err) => Err(err),
        }
    }
}
