//! Sideload directory watcher
//!
//! A [`WatchHandle`] collects file system events in the background. The
//! [`HotReloadWatcher`] drains it on a fixed interval, keeps only archive
//! files, coalesces the events per archive and hands the resulting
//! instructions to the registry executor.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{ModifyKind, RenameMode},
};
use sideload_kernel::config::SideloadConfig;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::executor::RegistryExecutor;

/// Watcher error types
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WatchError {
    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Watch event source disconnected")]
    Disconnected,
}

/// Watch event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Modified,
    Deleted,
}

/// Watch event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: PathBuf,
}

impl WatchEvent {
    pub fn new<P: AsRef<Path>>(kind: WatchEventKind, path: P) -> Self {
        Self {
            kind,
            path: path.as_ref().to_path_buf(),
        }
    }
}

/// What to do with one archive after a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveInstruction {
    /// Tear down the archive's modules and load it again
    Reload(PathBuf),
    /// Tear down the archive's modules
    Unload(PathBuf),
}

impl ArchiveInstruction {
    pub fn path(&self) -> &Path {
        match self {
            ArchiveInstruction::Reload(path) | ArchiveInstruction::Unload(path) => path,
        }
    }
}

/// Source of pending file system events
pub trait WatchHandle: Send {
    /// Drain every pending event without blocking
    fn poll_events(&mut self) -> Result<Vec<WatchEvent>, WatchError>;
}

/// Watch configuration
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Watched sideload directory
    pub dir: PathBuf,
    /// Archive extension, without the dot
    pub extension: String,
    /// Delay before the first tick
    pub initial_delay: Duration,
    /// Interval between ticks
    pub poll_interval: Duration,
}

impl WatchConfig {
    /// Create a watch config with the default timings
    pub fn new<P: AsRef<Path>>(dir: P, extension: &str) -> Self {
        let settings = SideloadConfig::default().watch;
        Self {
            dir: dir.as_ref().to_path_buf(),
            extension: extension.trim_start_matches('.').to_string(),
            initial_delay: settings.initial_delay(),
            poll_interval: settings.poll_interval(),
        }
    }

    /// Build from the host configuration, watching `dir`
    pub fn from_config<P: AsRef<Path>>(dir: P, config: &SideloadConfig) -> Self {
        Self {
            initial_delay: config.watch.initial_delay(),
            poll_interval: config.watch.poll_interval(),
            ..Self::new(dir, &config.archive_extension)
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Whether the file name of `path` ends in the archive extension
    pub fn is_archive(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.ends_with(&format!(".{}", self.extension)))
            .unwrap_or(false)
    }

    /// Archive path as recorded by instances loaded from the directory
    pub fn archive_path(&self, path: &Path) -> Option<PathBuf> {
        path.file_name().map(|name| self.dir.join(name))
    }
}

/// Coalesce a tick's events into at most one instruction per archive
///
/// The last event for an archive decides the instruction; archives keep the
/// order in which they were first seen. Non-archive files are dropped.
pub fn coalesce(config: &WatchConfig, events: Vec<WatchEvent>) -> Vec<ArchiveInstruction> {
    let mut order: Vec<(PathBuf, WatchEventKind)> = Vec::new();

    for event in events {
        if !config.is_archive(&event.path) {
            continue;
        }
        let Some(path) = config.archive_path(&event.path) else {
            continue;
        };

        match order.iter_mut().find(|(seen, _)| *seen == path) {
            Some(entry) => entry.1 = event.kind,
            None => order.push((path, event.kind)),
        }
    }

    order
        .into_iter()
        .map(|(path, kind)| match kind {
            WatchEventKind::Created | WatchEventKind::Modified => ArchiveInstruction::Reload(path),
            WatchEventKind::Deleted => ArchiveInstruction::Unload(path),
        })
        .collect()
}

// ============================================================================
// notify-backed handle
// ============================================================================

/// Watch handle backed by the platform file system notifier
pub struct NotifyWatchHandle {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<Result<Event, notify::Error>>,
}

impl NotifyWatchHandle {
    /// Start watching `dir` (non-recursively)
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                let _ = tx.send(result);
            },
            Config::default(),
        )?;
        watcher.watch(dir.as_ref(), RecursiveMode::NonRecursive)?;

        info!("Watching sideload directory: {:?}", dir.as_ref());

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }
}

impl WatchHandle for NotifyWatchHandle {
    fn poll_events(&mut self) -> Result<Vec<WatchEvent>, WatchError> {
        let mut events = Vec::new();

        loop {
            match self.rx.try_recv() {
                Ok(Ok(event)) => events.extend(convert_event(event)),
                Ok(Err(e)) => warn!("Watch error: {}", e),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if events.is_empty() {
                        return Err(WatchError::Disconnected);
                    }
                    break;
                }
            }
        }

        Ok(events)
    }
}

fn convert_event(event: Event) -> Vec<WatchEvent> {
    let single = |kind| {
        event
            .paths
            .iter()
            .map(|path| WatchEvent::new(kind, path))
            .collect::<Vec<_>>()
    };

    match event.kind {
        EventKind::Create(_) => single(WatchEventKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => single(WatchEventKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => single(WatchEventKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to] => vec![
                WatchEvent::new(WatchEventKind::Deleted, from),
                WatchEvent::new(WatchEventKind::Created, to),
            ],
            _ => single(WatchEventKind::Modified),
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => single(WatchEventKind::Modified),
        EventKind::Remove(_) => single(WatchEventKind::Deleted),
        _ => Vec::new(),
    }
}

// ============================================================================
// Ticker
// ============================================================================

/// Periodic driver turning watch events into registry work
pub struct HotReloadWatcher {
    config: WatchConfig,
    handle: Box<dyn WatchHandle>,
}

impl HotReloadWatcher {
    pub fn new(config: WatchConfig, handle: Box<dyn WatchHandle>) -> Self {
        Self { config, handle }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Drain the handle and coalesce what it reported
    pub fn tick(&mut self) -> Vec<ArchiveInstruction> {
        match self.handle.poll_events() {
            Ok(events) => {
                if !events.is_empty() {
                    debug!("Drained {} watch events", events.len());
                }
                coalesce(&self.config, events)
            }
            Err(e) => {
                error!("Failed to read watch events: {}", e);
                Vec::new()
            }
        }
    }

    /// Tick until `shutdown` fires, handing instructions to `executor`
    pub async fn run(mut self, executor: Arc<RegistryExecutor>, mut shutdown: oneshot::Receiver<()>) {
        let start = Instant::now() + self.config.initial_delay;
        let mut interval = tokio::time::interval_at(start, self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let instructions = self.tick();
                    if instructions.is_empty() {
                        continue;
                    }
                    for instruction in &instructions {
                        info!("Detected change: {:?}", instruction);
                    }
                    if let Err(e) = executor.execute(move |lifecycle| {
                        lifecycle.apply(&instructions);
                    }) {
                        error!("Dropping watch instructions: {}", e);
                        return;
                    }
                }
                _ = &mut shutdown => {
                    info!("Sideload watcher shutting down");
                    return;
                }
            }
        }
    }
}
