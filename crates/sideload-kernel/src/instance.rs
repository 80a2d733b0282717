//! Constructed module instances

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::archive::ArchiveHandle;
use crate::module::{Module, ModuleDescriptor, ModuleTypeId};
use crate::scope::Scope;

/// A constructed module together with its scope and source archive
///
/// Cheap to clone; every clone refers to the same instance. Enabled and
/// running flags are not stored here, they belong to the host registry.
#[derive(Clone)]
pub struct ModuleInstance {
    inner: Arc<InstanceInner>,
}

// Field order matters: the module and its scope are dropped before the
// archive handle that keeps their code mapped.
struct InstanceInner {
    instance_id: String,
    module: Arc<dyn Module>,
    scope: Arc<Scope>,
    type_id: ModuleTypeId,
    descriptor: ModuleDescriptor,
    archive: ArchiveHandle,
}

impl ModuleInstance {
    pub fn new(
        type_id: ModuleTypeId,
        descriptor: ModuleDescriptor,
        module: Arc<dyn Module>,
        scope: Arc<Scope>,
        archive: ArchiveHandle,
    ) -> Self {
        Self {
            inner: Arc::new(InstanceInner {
                instance_id: uuid::Uuid::now_v7().to_string(),
                module,
                scope,
                type_id,
                descriptor,
                archive,
            }),
        }
    }

    /// Unique id of this instance
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Type identity the instance was constructed from
    pub fn type_id(&self) -> &ModuleTypeId {
        &self.inner.type_id
    }

    /// Descriptor name
    pub fn name(&self) -> &str {
        &self.inner.descriptor.name
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.inner.descriptor
    }

    pub fn module(&self) -> &Arc<dyn Module> {
        &self.inner.module
    }

    /// The instance's own injection scope
    pub fn scope(&self) -> &Arc<Scope> {
        &self.inner.scope
    }

    /// Archive the instance was loaded from
    pub fn archive(&self) -> &ArchiveHandle {
        &self.inner.archive
    }

    /// Whether the instance's code came from the archive at `path`
    pub fn is_from_archive(&self, path: &Path) -> bool {
        self.inner.archive.is_from(path)
    }

    /// Downcast the module to its concrete type
    pub fn downcast_ref<T: Module>(&self) -> Option<&T> {
        self.inner.module.as_any().downcast_ref::<T>()
    }

    /// Whether both handles refer to the same instance
    pub fn ptr_eq(&self, other: &ModuleInstance) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("instance_id", &self.inner.instance_id)
            .field("type_id", &self.inner.type_id)
            .field("name", &self.inner.descriptor.name)
            .field("archive", &self.inner.archive.path())
            .finish()
    }
}
