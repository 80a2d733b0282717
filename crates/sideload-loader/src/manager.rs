//! Sideload manager
//!
//! Coordinates the initial load of the sideload directory, manual reloads and
//! the hot-reload watcher. Every registry mutation goes through the
//! [`RegistryExecutor`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use sideload_kernel::config::SideloadConfig;
use sideload_kernel::{HostRegistry, Scope};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::archive::{ArchiveLoader, DylibLoader};
use crate::executor::{ExecutorError, RegistryExecutor};
use crate::lifecycle::{ArchiveLifecycle, ModulesChanged};
use crate::pipeline::{BatchReport, Instantiator, LoadError};
use crate::watcher::{HotReloadWatcher, NotifyWatchHandle, WatchConfig, WatchError, WatchHandle};

/// Manager error types
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ManagerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("Not an archive path: {0:?}")]
    InvalidPath(PathBuf),

    #[error("Watcher already running")]
    AlreadyWatching,
}

/// Outcome of loading one archive during the initial load
#[derive(Debug)]
pub struct ArchiveLoad {
    pub path: PathBuf,
    pub result: Result<BatchReport, LoadError>,
}

/// Progress callback that can be sent to the registry executor
pub type SendProgress = Box<dyn FnMut(usize, usize) + Send>;

struct Ticker {
    task: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

/// Dynamic module loader for one sideload directory
pub struct SideloadManager {
    config: SideloadConfig,
    plugin_dir: PathBuf,
    registry: Arc<dyn HostRegistry>,
    executor: Arc<RegistryExecutor>,
    events: broadcast::Sender<ModulesChanged>,
    ticker: Mutex<Option<Ticker>>,
}

impl SideloadManager {
    /// Create a manager loading archives with `loader`
    ///
    /// The sideload directory is created if missing. Modules without
    /// dependencies get a child of `root` as their scope parent.
    pub fn new(
        config: SideloadConfig,
        registry: Arc<dyn HostRegistry>,
        loader: Arc<dyn ArchiveLoader>,
        root: Arc<Scope>,
    ) -> Result<Self, ManagerError> {
        std::fs::create_dir_all(&config.plugin_dir)?;
        let plugin_dir = std::fs::canonicalize(&config.plugin_dir)?;

        let (events, _) = broadcast::channel(64);
        let instantiator = Instantiator::new(registry.clone(), root);
        let lifecycle = ArchiveLifecycle::new(instantiator, loader, events.clone());
        let executor = Arc::new(RegistryExecutor::spawn(lifecycle)?);

        Ok(Self {
            config,
            plugin_dir,
            registry,
            executor,
            events,
            ticker: Mutex::new(None),
        })
    }

    /// Create a manager loading shared libraries
    pub fn with_dylib_loader(
        config: SideloadConfig,
        registry: Arc<dyn HostRegistry>,
        root: Arc<Scope>,
    ) -> Result<Self, ManagerError> {
        Self::new(config, registry, Arc::new(DylibLoader::new()), root)
    }

    pub fn config(&self) -> &SideloadConfig {
        &self.config
    }

    /// Resolved sideload directory
    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn registry(&self) -> &Arc<dyn HostRegistry> {
        &self.registry
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ModulesChanged> {
        self.events.subscribe()
    }

    /// Create the sideload directory if missing and list its archives
    pub fn ensure_sideload_dir(&self) -> Result<Vec<PathBuf>, ManagerError> {
        if !self.plugin_dir.exists() {
            std::fs::create_dir_all(&self.plugin_dir)?;
            info!("Directory for sideloading was created: {:?}", self.plugin_dir);
        }

        let mut archives: Vec<PathBuf> = std::fs::read_dir(&self.plugin_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.config.is_archive(path))
            .collect();
        archives.sort();
        Ok(archives)
    }

    /// Load every archive in the sideload directory, one batch per archive
    ///
    /// A failing archive does not affect the others, even when its load job
    /// panics. Only a stopped executor ends the load early.
    pub async fn load_initial(&self) -> Result<Vec<ArchiveLoad>, ManagerError> {
        let archives = self.ensure_sideload_dir()?;
        let mut loads = Vec::with_capacity(archives.len());

        for path in archives {
            let job_path = path.clone();
            let result = match self
                .executor
                .run(move |lifecycle| lifecycle.load_archive(&job_path, None))
                .await
            {
                Ok(result) => result,
                Err(ExecutorError::JobPanicked(msg)) => Err(LoadError::Aborted(msg)),
                Err(e) => return Err(e.into()),
            };

            if let Err(e) = &result {
                warn!("Error sideloading {:?}: {}", path, e);
            }
            loads.push(ArchiveLoad { path, result });
        }

        Ok(loads)
    }

    /// Load one archive, reporting per-module progress
    pub async fn load_archive(
        &self,
        path: &Path,
        mut progress: Option<SendProgress>,
    ) -> Result<BatchReport, ManagerError> {
        let path = self.resolve(path)?;
        let report = self
            .executor
            .run(move |lifecycle| {
                let result = lifecycle.load_archive(
                    &path,
                    progress.as_mut().map(|p| p.as_mut() as &mut dyn FnMut(usize, usize)),
                );
                if result.is_ok() {
                    lifecycle.notify_changed();
                }
                result
            })
            .await??;
        Ok(report)
    }

    /// Reload one archive now, outside the watcher
    pub async fn reload_archive(&self, path: &Path) -> Result<BatchReport, ManagerError> {
        let path = self.resolve(path)?;
        let report = self
            .executor
            .run(move |lifecycle| {
                let result = lifecycle.reload_archive(&path);
                lifecycle.notify_changed();
                result
            })
            .await??;
        Ok(report)
    }

    /// Unload one archive now, outside the watcher
    pub async fn unload_archive(&self, path: &Path) -> Result<usize, ManagerError> {
        let path = self.resolve(path)?;
        let removed = self
            .executor
            .run(move |lifecycle| {
                let removed = lifecycle.unload_archive(&path);
                lifecycle.notify_changed();
                removed
            })
            .await?;
        Ok(removed)
    }

    /// Start watching the sideload directory with the platform notifier
    pub fn start_watching(&self) -> Result<(), ManagerError> {
        let handle = NotifyWatchHandle::new(&self.plugin_dir)?;
        self.start_watching_with(Box::new(handle))
    }

    /// Start the watcher ticker on an arbitrary watch handle
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_watching_with(&self, handle: Box<dyn WatchHandle>) -> Result<(), ManagerError> {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return Err(ManagerError::AlreadyWatching);
        }

        let config = WatchConfig::from_config(&self.plugin_dir, &self.config);
        info!(
            "Starting sideload watcher (first poll in {:?}, then every {:?})",
            config.initial_delay, config.poll_interval
        );

        let watcher = HotReloadWatcher::new(config, handle);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(watcher.run(self.executor.clone(), shutdown_rx));

        *ticker = Some(Ticker { task, shutdown });
        Ok(())
    }

    /// Whether the watcher ticker is running
    pub fn is_watching(&self) -> bool {
        self.ticker
            .lock()
            .as_ref()
            .map(|t| !t.task.is_finished())
            .unwrap_or(false)
    }

    /// Stop the watcher, tear down every module and stop the executor
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        let ticker = self.ticker.lock().take();
        if let Some(ticker) = ticker {
            let _ = ticker.shutdown.send(());
            if let Err(e) = ticker.task.await {
                error!("Sideload watcher task failed: {}", e);
            }
        }

        if self.executor.is_running() {
            self.executor.run(|lifecycle| lifecycle.shutdown()).await?;
        }

        let executor = self.executor.clone();
        tokio::task::spawn_blocking(move || executor.shutdown())
            .await
            .map_err(|e| ExecutorError::JobPanicked(e.to_string()))?;

        info!("Sideload manager stopped");
        Ok(())
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf, ManagerError> {
        path.file_name()
            .map(|name| self.plugin_dir.join(name))
            .ok_or_else(|| ManagerError::InvalidPath(path.to_path_buf()))
    }
}
