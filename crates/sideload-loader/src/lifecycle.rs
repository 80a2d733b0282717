//! Archive lifecycle sequences
//!
//! Load, reload and unload of whole archives against the host registry.
//! Everything here mutates the registry and is meant to run on the registry
//! executor thread only.

use std::path::Path;
use std::sync::Arc;

use sideload_kernel::{HostRegistry, ModuleInstance};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::archive::ArchiveLoader;
use crate::pipeline::{BatchReport, Instantiator, LoadError, ProgressFn, catch_module_panic};
use crate::scanner;
use crate::watcher::ArchiveInstruction;

/// Notification that the set of loaded modules changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModulesChanged;

/// Which new instances get enabled and started after a load
enum EnablePolicy<'a> {
    /// Descriptor's enabled-by-default flag
    Descriptor,
    /// Names enabled before the reload; new names use the descriptor flag
    Restore {
        enabled: &'a [String],
        previous: &'a [String],
    },
}

/// Runs load, reload and unload sequences for archives
pub struct ArchiveLifecycle {
    registry: Arc<dyn HostRegistry>,
    instantiator: Instantiator,
    loader: Arc<dyn ArchiveLoader>,
    events: broadcast::Sender<ModulesChanged>,
}

impl ArchiveLifecycle {
    pub fn new(
        instantiator: Instantiator,
        loader: Arc<dyn ArchiveLoader>,
        events: broadcast::Sender<ModulesChanged>,
    ) -> Self {
        Self {
            registry: instantiator.registry().clone(),
            instantiator,
            loader,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<dyn HostRegistry> {
        &self.registry
    }

    /// Open, scan and instantiate one archive as its own batch
    ///
    /// Modules flagged enabled-by-default are enabled and started afterwards.
    pub fn load_archive(
        &self,
        path: &Path,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<BatchReport, LoadError> {
        info!("Side-loading archive {:?}", path);
        let report = self.open_and_instantiate(path, progress)?;
        self.enable(&report.loaded, EnablePolicy::Descriptor);
        Ok(report)
    }

    /// Replace every instance loaded from `path` with a fresh load
    ///
    /// Modules that were enabled before the reload are enabled and started
    /// again; modules new to the archive follow their descriptor.
    pub fn reload_archive(&self, path: &Path) -> Result<BatchReport, LoadError> {
        info!("Detected changes on archive {:?}", path);

        let old = self.registry.find_by_archive(path);
        let previous: Vec<String> = old.iter().map(|i| i.name().to_string()).collect();
        let enabled: Vec<String> = old
            .iter()
            .filter(|i| self.registry.is_enabled(i))
            .map(|i| i.name().to_string())
            .collect();

        // Dependents were registered after their dependencies
        for instance in old.iter().rev() {
            self.stop_and_remove(instance);
        }

        let report = self.open_and_instantiate(path, None)?;
        self.enable(
            &report.loaded,
            EnablePolicy::Restore {
                enabled: &enabled,
                previous: &previous,
            },
        );
        Ok(report)
    }

    /// Stop, disable and remove every instance loaded from `path`
    ///
    /// Returns the number of instances removed.
    pub fn unload_archive(&self, path: &Path) -> usize {
        let instances = self.registry.find_by_archive(path);
        let count = instances.len();
        for instance in instances.iter().rev() {
            self.stop_and_remove(instance);
        }
        info!("Unloaded {} modules from {:?}", count, path);
        count
    }

    /// Apply one tick's instructions in order
    ///
    /// Publishes a single [`ModulesChanged`] when at least one instruction
    /// changed the registry. Unloads and successful reloads always count. A
    /// failed reload counts only if it had already removed the archive's old
    /// instances. A panic in one instruction does not stop the others and
    /// counts as a change, since it may have left a partial teardown behind.
    pub fn apply(&self, instructions: &[ArchiveInstruction]) -> usize {
        let mut changed = false;
        for instruction in instructions {
            let outcome = catch_module_panic(|| match instruction {
                ArchiveInstruction::Reload(path) => {
                    let had_instances = !self.registry.find_by_archive(path).is_empty();
                    match self.reload_archive(path) {
                        Ok(_) => true,
                        Err(e) => {
                            error!("Failed to reload {:?}: {}", path, e);
                            had_instances
                        }
                    }
                }
                ArchiveInstruction::Unload(path) => {
                    self.unload_archive(path);
                    true
                }
            });
            changed |= outcome.unwrap_or_else(|msg| {
                error!("Panic while applying {:?}: {}", instruction, msg);
                true
            });
        }

        if changed {
            self.notify_changed();
        }
        instructions.len()
    }

    /// Publish a [`ModulesChanged`] notification
    pub fn notify_changed(&self) {
        // No subscribers is fine
        let _ = self.events.send(ModulesChanged);
    }

    /// Stop every instance and clear the registry, newest first
    pub fn shutdown(&self) {
        for instance in self.registry.instances().into_iter().rev() {
            self.stop_and_remove(&instance);
        }
    }

    fn open_and_instantiate(
        &self,
        path: &Path,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<BatchReport, LoadError> {
        let opened = self.loader.open(path).map_err(|source| LoadError::Archive {
            path: path.to_path_buf(),
            source,
        })?;

        let label = path.display().to_string();
        let classes = scanner::scan(&label, opened.candidates);
        self.instantiator.load_batch(&opened.handle, classes, progress)
    }

    fn enable(&self, instances: &[ModuleInstance], policy: EnablePolicy<'_>) {
        for instance in instances {
            let name = instance.name().to_string();
            let wanted = match &policy {
                EnablePolicy::Descriptor => instance.descriptor().enabled_by_default,
                EnablePolicy::Restore { enabled, previous } => {
                    enabled.contains(&name)
                        || (!previous.contains(&name) && instance.descriptor().enabled_by_default)
                }
            };
            if !wanted {
                continue;
            }

            if let Err(e) = self.registry.set_enabled(instance, true) {
                warn!("Failed to enable module {}: {}", name, e);
                continue;
            }
            match catch_module_panic(|| self.registry.start(instance)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to start module {}: {}", name, e),
                Err(msg) => error!("Module {} panicked while starting: {}", name, msg),
            }
        }
    }

    fn stop_and_remove(&self, instance: &ModuleInstance) {
        info!("Removing module {}", instance.name());
        if let Err(e) = self.registry.set_enabled(instance, false) {
            warn!("Failed to disable module {}: {}", instance.name(), e);
        }
        match catch_module_panic(|| self.registry.stop(instance)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to stop module {}: {}", instance.name(), e),
            Err(msg) => error!("Module {} panicked while stopping: {}", instance.name(), msg),
        }
        if let Err(e) = self.registry.remove(instance) {
            warn!("Failed to remove module {}: {}", instance.name(), e);
        }
    }
}
