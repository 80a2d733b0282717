//! Host module registry
//!
//! The host registry is the single authority on which module instances are
//! live. The loader never keeps its own list of instances; it asks the
//! registry whenever it needs to resolve a dependency or find the instances
//! owned by an archive.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::instance::ModuleInstance;
use crate::module::{ModuleError, ModuleResult, ModuleState, ModuleTypeId, panic_message};

/// Registry error types
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("Module already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Module not registered: {0}")]
    NotRegistered(String),

    #[error("Lifecycle transition failed for {name}: {source}")]
    Lifecycle {
        name: String,
        #[source]
        source: ModuleError,
    },
}

/// Boundary to the host's plugin registry
pub trait HostRegistry: Send + Sync {
    /// Snapshot of every registered instance
    fn instances(&self) -> Vec<ModuleInstance>;

    /// Register a freshly constructed instance
    fn add(&self, instance: ModuleInstance) -> Result<(), RegistryError>;

    /// Forget an instance
    fn remove(&self, instance: &ModuleInstance) -> Result<(), RegistryError>;

    /// Whether the instance is enabled
    fn is_enabled(&self, instance: &ModuleInstance) -> bool;

    /// Set the enabled flag of an instance
    fn set_enabled(&self, instance: &ModuleInstance, enabled: bool) -> Result<(), RegistryError>;

    /// Start an instance
    fn start(&self, instance: &ModuleInstance) -> Result<(), RegistryError>;

    /// Stop an instance
    fn stop(&self, instance: &ModuleInstance) -> Result<(), RegistryError>;

    /// Find the running instance with exactly this type identity
    fn find_by_type(&self, type_id: &ModuleTypeId) -> Option<ModuleInstance> {
        self.instances()
            .into_iter()
            .find(|instance| instance.type_id() == type_id)
    }

    /// Find every instance loaded from the archive at `path`
    fn find_by_archive(&self, path: &Path) -> Vec<ModuleInstance> {
        self.instances()
            .into_iter()
            .filter(|instance| instance.is_from_archive(path))
            .collect()
    }
}

struct RegistryEntry {
    instance: ModuleInstance,
    enabled: bool,
    state: ModuleState,
}

/// In-process registry driving module lifecycles directly
///
/// Rejects a second instance of a type identity that is already registered.
#[derive(Default)]
pub struct InMemoryRegistry {
    entries: RwLock<Vec<RegistryEntry>>,
}

impl InMemoryRegistry {
    /// Create a new registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Lifecycle state of an instance
    pub fn state(&self, instance: &ModuleInstance) -> Option<ModuleState> {
        let entries = self.entries.read();
        entries
            .iter()
            .find(|entry| entry.instance.ptr_eq(instance))
            .map(|entry| entry.state.clone())
    }

    /// Whether an instance is currently running
    pub fn is_running(&self, instance: &ModuleInstance) -> bool {
        self.state(instance) == Some(ModuleState::Running)
    }

    /// Number of registered instances
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Names of the registered instances, in registration order
    pub fn names(&self) -> Vec<String> {
        let entries = self.entries.read();
        entries
            .iter()
            .map(|entry| entry.instance.name().to_string())
            .collect()
    }

    /// Names of the enabled instances, in registration order
    pub fn enabled_names(&self) -> Vec<String> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| entry.instance.name().to_string())
            .collect()
    }

    /// Stop every running instance and clear the registry
    pub fn shutdown(&self) {
        for instance in self.instances().into_iter().rev() {
            if let Err(e) = self.stop(&instance) {
                warn!("Failed to stop module {} during shutdown: {}", instance.name(), e);
            }
        }
        self.entries.write().clear();
    }

    fn with_entry<R>(
        &self,
        instance: &ModuleInstance,
        f: impl FnOnce(&mut RegistryEntry) -> R,
    ) -> Result<R, RegistryError> {
        let mut entries = self.entries.write();
        entries
            .iter_mut()
            .find(|entry| entry.instance.ptr_eq(instance))
            .map(f)
            .ok_or_else(|| RegistryError::NotRegistered(instance.name().to_string()))
    }
}

impl HostRegistry for InMemoryRegistry {
    fn instances(&self) -> Vec<ModuleInstance> {
        let entries = self.entries.read();
        entries.iter().map(|entry| entry.instance.clone()).collect()
    }

    fn add(&self, instance: ModuleInstance) -> Result<(), RegistryError> {
        let mut entries = self.entries.write();

        if entries
            .iter()
            .any(|entry| entry.instance.type_id() == instance.type_id())
        {
            return Err(RegistryError::AlreadyRegistered(instance.type_id().to_string()));
        }

        info!(
            "Registering module: {} ({}) from {:?}",
            instance.name(),
            instance.type_id(),
            instance.archive().path()
        );

        entries.push(RegistryEntry {
            instance,
            enabled: false,
            state: ModuleState::Loaded,
        });
        Ok(())
    }

    fn remove(&self, instance: &ModuleInstance) -> Result<(), RegistryError> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entry| !entry.instance.ptr_eq(instance));

        if entries.len() == before {
            return Err(RegistryError::NotRegistered(instance.name().to_string()));
        }

        info!("Unregistered module: {}", instance.name());
        Ok(())
    }

    fn is_enabled(&self, instance: &ModuleInstance) -> bool {
        let entries = self.entries.read();
        entries
            .iter()
            .find(|entry| entry.instance.ptr_eq(instance))
            .map(|entry| entry.enabled)
            .unwrap_or(false)
    }

    fn set_enabled(&self, instance: &ModuleInstance, enabled: bool) -> Result<(), RegistryError> {
        self.with_entry(instance, |entry| {
            debug!(
                "Module {} enabled: {} -> {}",
                instance.name(),
                entry.enabled,
                enabled
            );
            entry.enabled = enabled;
        })
    }

    fn start(&self, instance: &ModuleInstance) -> Result<(), RegistryError> {
        if self.is_running(instance) {
            return Ok(());
        }
        // Not holding the lock while the module runs its own code
        self.with_entry(instance, |_| ())?;

        let result = guarded(|| instance.module().start_up(instance.scope()))
            .unwrap_or_else(|msg| Err(ModuleError::StartupFailed(format!("panicked: {}", msg))));
        let state = match &result {
            Ok(()) => ModuleState::Running,
            Err(e) => ModuleState::Error(e.to_string()),
        };
        self.with_entry(instance, |entry| entry.state = state)?;

        match result {
            Ok(()) => {
                info!("Started module: {}", instance.name());
                Ok(())
            }
            Err(source) => Err(RegistryError::Lifecycle {
                name: instance.name().to_string(),
                source,
            }),
        }
    }

    fn stop(&self, instance: &ModuleInstance) -> Result<(), RegistryError> {
        if !self.is_running(instance) {
            self.with_entry(instance, |_| ())?;
            return Ok(());
        }

        let result = guarded(|| instance.module().shut_down())
            .unwrap_or_else(|msg| Err(ModuleError::ShutdownFailed(format!("panicked: {}", msg))));
        let state = match &result {
            Ok(()) => ModuleState::Loaded,
            Err(e) => ModuleState::Error(e.to_string()),
        };
        self.with_entry(instance, |entry| entry.state = state)?;

        match result {
            Ok(()) => {
                info!("Stopped module: {}", instance.name());
                Ok(())
            }
            Err(source) => Err(RegistryError::Lifecycle {
                name: instance.name().to_string(),
                source,
            }),
        }
    }
}

/// Run module lifecycle code, returning the message of a panic
fn guarded(f: impl FnOnce() -> ModuleResult<()>) -> Result<ModuleResult<()>, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveHandle;
    use crate::module::{Module, ModuleDescriptor, ModuleResult};
    use crate::scope::Scope;
    use std::any::Any;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail_start: bool,
        panic_start: bool,
    }

    impl Module for Counting {
        fn start_up(&self, _scope: &Arc<Scope>) -> ModuleResult<()> {
            if self.fail_start {
                return Err(ModuleError::StartupFailed("boom".to_string()));
            }
            if self.panic_start {
                panic!("start_up exploded");
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn shut_down(&self) -> ModuleResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn instance(type_id: &str, archive: &str, module: Counting) -> ModuleInstance {
        ModuleInstance::new(
            ModuleTypeId::new(type_id),
            ModuleDescriptor::new(type_id),
            Arc::new(module),
            Scope::root(),
            ArchiveHandle::new(archive),
        )
    }

    #[test]
    fn test_add_and_find() {
        let registry = InMemoryRegistry::new();
        let a = instance("a", "/p/one.so", Counting::default());
        let b = instance("b", "/p/two.so", Counting::default());

        registry.add(a.clone()).unwrap();
        registry.add(b).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.find_by_type(&ModuleTypeId::new("a")).unwrap().ptr_eq(&a));
        assert_eq!(registry.find_by_archive(Path::new("/p/two.so")).len(), 1);
        assert!(registry.find_by_archive(Path::new("/p/three.so")).is_empty());
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let registry = InMemoryRegistry::new();
        registry
            .add(instance("a", "/p/one.so", Counting::default()))
            .unwrap();

        let err = registry
            .add(instance("a", "/p/two.so", Counting::default()))
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(_)));
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let registry = InMemoryRegistry::new();
        let a = instance("a", "/p/one.so", Counting::default());
        registry.add(a.clone()).unwrap();

        registry.set_enabled(&a, true).unwrap();
        registry.start(&a).unwrap();
        registry.start(&a).unwrap();
        assert!(registry.is_enabled(&a));
        assert!(registry.is_running(&a));

        registry.stop(&a).unwrap();
        assert_eq!(registry.state(&a), Some(ModuleState::Loaded));

        let module = a.downcast_ref::<Counting>().unwrap();
        assert_eq!(module.starts.load(Ordering::SeqCst), 1);
        assert_eq!(module.stops.load(Ordering::SeqCst), 1);

        registry.remove(&a).unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.remove(&a),
            Err(RegistryError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_failed_start_records_error_state() {
        let registry = InMemoryRegistry::new();
        let a = instance(
            "a",
            "/p/one.so",
            Counting {
                fail_start: true,
                ..Default::default()
            },
        );
        registry.add(a.clone()).unwrap();

        let err = registry.start(&a).unwrap_err();
        assert!(matches!(err, RegistryError::Lifecycle { .. }));
        assert!(matches!(registry.state(&a), Some(ModuleState::Error(_))));
    }

    #[test]
    fn test_panicking_start_records_error_state() {
        let registry = InMemoryRegistry::new();
        let a = instance(
            "a",
            "/p/one.so",
            Counting {
                panic_start: true,
                ..Default::default()
            },
        );
        registry.add(a.clone()).unwrap();

        let err = registry.start(&a).unwrap_err();
        assert!(err.to_string().contains("start_up exploded"));
        assert!(matches!(registry.state(&a), Some(ModuleState::Error(_))));

        // The registry stays usable
        registry.stop(&a).unwrap();
        registry.remove(&a).unwrap();
        assert!(registry.is_empty());
    }
}
