//! Instantiation pipeline
//!
//! Turns one sorted batch of module classes into registered module instances.
//! Each module gets its own injection scope whose parent depends on how many
//! dependencies it declares:
//!
//! | dependencies | parent scope                                            |
//! |--------------|---------------------------------------------------------|
//! | none         | the host root scope                                     |
//! | one          | the dependency's own scope                              |
//! | several      | a composite child of the root binding every dependency  |
//!
//! Per-module failures are recorded and skipped. Cycles and fatal module
//! errors abort the batch.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;

use sideload_kernel::{
    ArchiveHandle, HostRegistry, Module, ModuleError, ModuleInstance, ModuleTypeId,
    RegistryError, Scope, panic_message,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::archive::ArchiveError;
use crate::graph::{CycleError, DependencyGraph};
use crate::scanner::ModuleClass;

/// Why a single module of a batch was skipped
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InstantiationError {
    #[error("Unmet dependency for {}: {}", .module.simple_name(), .dependency.simple_name())]
    UnmetDependency {
        module: ModuleTypeId,
        dependency: ModuleTypeId,
    },

    #[error("Failed to construct {module}: {source}")]
    ConstructionFailed {
        module: ModuleTypeId,
        #[source]
        source: ModuleError,
    },

    #[error("Failed to register {module}: {source}")]
    Registration {
        module: ModuleTypeId,
        #[source]
        source: RegistryError,
    },
}

impl InstantiationError {
    /// Type identity of the module that was skipped
    pub fn module(&self) -> &ModuleTypeId {
        match self {
            InstantiationError::UnmetDependency { module, .. }
            | InstantiationError::ConstructionFailed { module, .. }
            | InstantiationError::Registration { module, .. } => module,
        }
    }
}

/// Errors that abort a whole batch
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoadError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("Fatal error while instantiating {module}: {source}")]
    Fatal {
        module: ModuleTypeId,
        #[source]
        source: ModuleError,
    },

    #[error("Failed to open archive {path:?}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: ArchiveError,
    },

    /// The load job died before it could report
    #[error("Loading aborted: {0}")]
    Aborted(String),
}

/// Outcome of a batch that was not aborted
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Registered instances, in instantiation order
    pub loaded: Vec<ModuleInstance>,
    /// Modules that were skipped
    pub failures: Vec<InstantiationError>,
    /// Number of modules in the batch
    pub total: usize,
}

impl BatchReport {
    /// Whether every module of the batch was registered
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn loaded_names(&self) -> Vec<String> {
        self.loaded.iter().map(|i| i.name().to_string()).collect()
    }
}

/// Progress callback, invoked with `(attempted, total)` once per module
pub type ProgressFn<'a> = &'a mut dyn FnMut(usize, usize);

enum Failure {
    Skipped(InstantiationError),
    Fatal(LoadError),
}

/// Instantiates sorted batches against a host registry
#[derive(Clone)]
pub struct Instantiator {
    registry: Arc<dyn HostRegistry>,
    root: Arc<Scope>,
}

impl Instantiator {
    /// Create an instantiator whose modules hang off `root`
    pub fn new(registry: Arc<dyn HostRegistry>, root: Arc<Scope>) -> Self {
        Self { registry, root }
    }

    pub fn registry(&self) -> &Arc<dyn HostRegistry> {
        &self.registry
    }

    pub fn root_scope(&self) -> &Arc<Scope> {
        &self.root
    }

    /// Sort and instantiate one batch of module classes
    pub fn load_batch(
        &self,
        archive: &ArchiveHandle,
        classes: Vec<ModuleClass>,
        mut progress: Option<ProgressFn<'_>>,
    ) -> Result<BatchReport, LoadError> {
        let sorted = DependencyGraph::build(classes).topological_sort().map_err(|e| {
            error!("Not loading {:?}: {}", archive.path(), e);
            e
        })?;

        let total = sorted.len();
        let mut report = BatchReport {
            total,
            ..Default::default()
        };

        for (attempted, class) in sorted.iter().enumerate() {
            match self.instantiate(archive, class) {
                Ok(instance) => {
                    info!("Module sideloaded: {}", instance.name());
                    report.loaded.push(instance);
                }
                Err(Failure::Skipped(e)) => {
                    warn!("Error instantiating module: {}", e);
                    report.failures.push(e);
                }
                Err(Failure::Fatal(e)) => {
                    error!("Aborting batch from {:?}: {}", archive.path(), e);
                    return Err(e);
                }
            }

            if let Some(progress) = progress.as_mut() {
                progress(attempted + 1, total);
            }
        }

        Ok(report)
    }

    fn instantiate(
        &self,
        archive: &ArchiveHandle,
        class: &ModuleClass,
    ) -> Result<ModuleInstance, Failure> {
        let type_id = class.type_id();

        let mut dependencies = Vec::with_capacity(class.dependencies().len());
        for dependency in class.dependencies() {
            match self.registry.find_by_type(dependency) {
                Some(instance) => dependencies.push(instance),
                None => {
                    return Err(Failure::Skipped(InstantiationError::UnmetDependency {
                        module: type_id.clone(),
                        dependency: dependency.clone(),
                    }));
                }
            }
        }

        let module: Arc<dyn Module> = match catch_module_panic(|| class.construct()) {
            Ok(Ok(module)) => Arc::from(module),
            Ok(Err(e)) => return Err(self.failure(type_id, e)),
            Err(msg) => {
                return Err(self.failure(
                    type_id,
                    ModuleError::ConstructionFailed(format!("constructor panicked: {}", msg)),
                ));
            }
        };

        // Scope wiring runs `configure` of the module and its dependencies
        let parent = catch_module_panic(|| self.parent_scope(type_id, &dependencies))
            .unwrap_or_else(|msg| Err(configure_panicked(&msg)))
            .map_err(|e| self.failure(type_id, e))?;

        let scope = catch_module_panic(|| {
            parent.create_child(type_id.as_str(), |binder| {
                binder.bind_module(type_id, module.clone(), Some(archive.clone()))?;
                binder.install(module.as_ref())
            })
        })
        .unwrap_or_else(|msg| Err(configure_panicked(&msg)))
        .map_err(|e| self.failure(type_id, e))?;

        let instance = ModuleInstance::new(
            type_id.clone(),
            class.descriptor().clone(),
            module,
            scope,
            archive.clone(),
        );

        self.registry.add(instance.clone()).map_err(|source| {
            Failure::Skipped(InstantiationError::Registration {
                module: type_id.clone(),
                source,
            })
        })?;

        debug!("Loaded module {}", type_id.simple_name());
        Ok(instance)
    }

    fn parent_scope(
        &self,
        type_id: &ModuleTypeId,
        dependencies: &[ModuleInstance],
    ) -> Result<Arc<Scope>, ModuleError> {
        match dependencies {
            [] => Ok(self.root.clone()),
            [only] => Ok(only.scope().clone()),
            many => self
                .root
                .create_child(&format!("{}+deps", type_id), |binder| {
                    for dependency in many {
                        binder.bind_module(
                            dependency.type_id(),
                            dependency.module().clone(),
                            Some(dependency.archive().clone()),
                        )?;
                        binder.install(dependency.module().as_ref())?;
                    }
                    Ok(())
                }),
        }
    }

    fn failure(&self, type_id: &ModuleTypeId, source: ModuleError) -> Failure {
        if source.is_fatal() {
            Failure::Fatal(LoadError::Fatal {
                module: type_id.clone(),
                source,
            })
        } else {
            Failure::Skipped(InstantiationError::ConstructionFailed {
                module: type_id.clone(),
                source,
            })
        }
    }
}

/// Run code supplied by a module, returning the message of a panic
pub(crate) fn catch_module_panic<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

fn configure_panicked(msg: &str) -> ModuleError {
    ModuleError::ConstructionFailed(format!("configure panicked: {}", msg))
}
