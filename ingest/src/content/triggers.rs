use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use notify::event::{AccessKind, ModifyKind};
use notify::{Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use ractor::concurrency::{Duration as RactorDuration, JoinHandle};
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::content::autoscan::{AutoscanDirectory, ScanMode};
use crate::content::manager::{ContentCore, dispatch_directory_change, dispatch_rescan};
use crate::content::scheduler::Scheduler;
use crate::error::{IngestError, IngestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherOptions {
    /// Watch monitored autoscan directories at all.
    pub enabled: bool,
    /// Poll instead of using native notifications.
    pub poll_interval_secs: Option<u64>,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: None,
        }
    }
}

pub(crate) enum TriggerMessage {
    Register(AutoscanDirectory),
    Deregister(AutoscanDirectory),
    TimerFired { scan_id: u32 },
    FsEvent(PathBuf),
}

enum WatcherHandle {
    Recommended(RecommendedWatcher),
    Poll(PollWatcher),
}

impl WatcherHandle {
    fn watch(&mut self, path: &Path, mode: RecursiveMode) -> Result<(), notify::Error> {
        match self {
            WatcherHandle::Recommended(watcher) => watcher.watch(path, mode),
            WatcherHandle::Poll(watcher) => watcher.watch(path, mode),
        }
    }
}

/// Paths an event touched, or nothing for events that cannot change a
/// directory listing.
fn event_paths(event: Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Access(AccessKind::Close(_)) => event.paths,
        EventKind::Access(_) => Vec::new(),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => event.paths,
        _ => Vec::new(),
    }
}

/// The directory whose listing changed when `path` did. A monitored root
/// maps to itself.
fn changed_directory(path: &Path, roots: &BTreeMap<PathBuf, bool>) -> PathBuf {
    if roots.contains_key(path) {
        return path.to_path_buf();
    }
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| path.to_path_buf())
}

fn start_watcher(
    actor: ActorRef<TriggerMessage>,
    roots: &BTreeMap<PathBuf, bool>,
    poll_interval_secs: Option<u64>,
) -> Result<WatcherHandle, notify::Error> {
    let handler = move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for path in event_paths(event) {
                let _ = actor.cast(TriggerMessage::FsEvent(path));
            }
        }
        Err(err) => {
            tracing::error!(error = ?err, "autoscan watcher error");
        }
    };

    let mut watcher = match poll_interval_secs {
        Some(interval) => {
            let config =
                notify::Config::default().with_poll_interval(Duration::from_secs(interval));
            WatcherHandle::Poll(PollWatcher::new(handler, config)?)
        }
        None => WatcherHandle::Recommended(RecommendedWatcher::new(
            handler,
            notify::Config::default(),
        )?),
    };
    for (root, recursive) in roots {
        let mode = if *recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        if let Err(err) = watcher.watch(root, mode) {
            tracing::warn!(error = ?err, path = %root.display(), "failed to watch autoscan directory");
        }
    }
    Ok(watcher)
}

pub(crate) struct TriggerActor;

pub(crate) struct TriggerArgs {
    pub core: Arc<ContentCore>,
    pub scheduler: Scheduler,
    pub options: WatcherOptions,
}

/// Interval timers for timed autoscans plus one watcher over every
/// monitored root.
pub(crate) struct TriggerState {
    core: Arc<ContentCore>,
    scheduler: Scheduler,
    options: WatcherOptions,
    timers: HashMap<u32, JoinHandle<()>>,
    monitored: BTreeMap<PathBuf, bool>,
    watcher: Option<WatcherHandle>,
}

impl TriggerState {
    fn rebuild_watcher(&mut self, myself: &ActorRef<TriggerMessage>) {
        self.watcher = None;
        if !self.options.enabled || self.monitored.is_empty() {
            return;
        }
        match start_watcher(myself.clone(), &self.monitored, self.options.poll_interval_secs) {
            Ok(watcher) => self.watcher = Some(watcher),
            Err(err) => tracing::error!(error = ?err, "failed to start autoscan watcher"),
        }
    }

    fn stop_timer(&mut self, scan_id: u32) {
        if let Some(timer) = self.timers.remove(&scan_id) {
            timer.abort();
        }
    }
}

impl Actor for TriggerActor {
    type Msg = TriggerMessage;
    type State = TriggerState;
    type Arguments = TriggerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(TriggerState {
            core: args.core,
            scheduler: args.scheduler,
            options: args.options,
            timers: HashMap::new(),
            monitored: BTreeMap::new(),
            watcher: None,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            TriggerMessage::Register(dir) => match dir.scan_mode {
                ScanMode::Timed => {
                    state.stop_timer(dir.scan_id);
                    let scan_id = dir.scan_id;
                    let timer = myself.send_interval(
                        RactorDuration::from_secs(dir.interval_secs),
                        move || TriggerMessage::TimerFired { scan_id },
                    );
                    state.timers.insert(scan_id, timer);
                    tracing::debug!(scan_id, interval_secs = dir.interval_secs, "autoscan timer armed");
                }
                ScanMode::Monitored => {
                    state.monitored.insert(dir.location, dir.recursive);
                    state.rebuild_watcher(&myself);
                }
            },
            TriggerMessage::Deregister(dir) => match dir.scan_mode {
                ScanMode::Timed => state.stop_timer(dir.scan_id),
                ScanMode::Monitored => {
                    if state.monitored.remove(&dir.location).is_some() {
                        state.rebuild_watcher(&myself);
                    }
                }
            },
            TriggerMessage::TimerFired { scan_id } => {
                match dispatch_rescan(&state.core, &state.scheduler, scan_id, ScanMode::Timed).await
                {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        tracing::debug!(scan_id, "dropping timer of removed autoscan");
                        state.stop_timer(scan_id);
                    }
                    Err(err) => tracing::warn!(error = %err, scan_id, "failed to queue timed rescan"),
                }
            }
            TriggerMessage::FsEvent(path) => {
                let dir = changed_directory(&path, &state.monitored);
                if let Err(err) = dispatch_directory_change(&state.core, &state.scheduler, &dir).await
                {
                    tracing::warn!(error = %err, path = %dir.display(), "failed to queue monitored rescan");
                }
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for (_, timer) in state.timers.drain() {
            timer.abort();
        }
        state.watcher = None;
        Ok(())
    }
}

/// Handle to the trigger actor.
#[derive(Clone)]
pub(crate) struct Triggers {
    actor: ActorRef<TriggerMessage>,
}

impl Triggers {
    pub(crate) async fn start(
        core: Arc<ContentCore>,
        scheduler: Scheduler,
        options: WatcherOptions,
    ) -> IngestResult<Self> {
        let args = TriggerArgs {
            core,
            scheduler,
            options,
        };
        let (actor, _handle) = Actor::spawn(None, TriggerActor, args)
            .await
            .map_err(|err| {
                tracing::error!(error = ?err, "failed to start autoscan triggers");
                IngestError::internal("Failed to start autoscan triggers")
            })?;
        Ok(Self { actor })
    }

    pub(crate) fn register(&self, dir: &AutoscanDirectory) {
        let _ = self.actor.cast(TriggerMessage::Register(dir.clone()));
    }

    pub(crate) fn deregister(&self, dir: &AutoscanDirectory) {
        let _ = self.actor.cast(TriggerMessage::Deregister(dir.clone()));
    }

    pub(crate) fn stop(&self) {
        self.actor.stop(None);
    }
}
