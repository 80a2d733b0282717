//! Dependency-injection scopes
//!
//! A [`Scope`] is a frozen binding container chained to an optional parent.
//! Lookups walk the chain from the child towards the root. New scopes are
//! populated through a [`Binder`]; once created a scope never changes, so it
//! can be shared between modules without locking.
//!
//! Bindings come in two flavours:
//! - typed values keyed by their Rust type (host services, module-provided
//!   collaborators)
//! - module instances keyed by their [`ModuleTypeId`]

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::archive::ArchiveHandle;
use crate::module::{Module, ModuleResult, ModuleTypeId};

/// Scope wiring errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ScopeError {
    /// The key is already bound in this scope or one of its ancestors
    #[error("Duplicate binding for {key} in scope '{scope}'")]
    DuplicateBinding { key: String, scope: String },
}

/// Key under which a binding is stored
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindingKey {
    /// A typed value
    Type {
        id: TypeId,
        name: &'static str,
    },
    /// A module instance
    Module(ModuleTypeId),
}

impl BindingKey {
    pub fn of<T: Any>() -> Self {
        Self::Type {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn module(id: &ModuleTypeId) -> Self {
        Self::Module(id.clone())
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingKey::Type { name, .. } => write!(f, "type {}", name),
            BindingKey::Module(id) => write!(f, "module {}", id),
        }
    }
}

/// A module instance bound into a scope
///
/// Carries the archive handle so the code backing the module stays mapped for
/// as long as any scope can still hand the instance out.
#[derive(Clone)]
pub struct BoundModule {
    module: Arc<dyn Module>,
    archive: Option<ArchiveHandle>,
}

impl BoundModule {
    pub fn new(module: Arc<dyn Module>, archive: Option<ArchiveHandle>) -> Self {
        Self { module, archive }
    }

    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    pub fn archive(&self) -> Option<&ArchiveHandle> {
        self.archive.as_ref()
    }
}

impl fmt::Debug for BoundModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundModule")
            .field("archive", &self.archive)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
enum Binding {
    Value(Arc<dyn Any + Send + Sync>),
    Module(BoundModule),
}

/// Immutable binding container with a parent chain
// Field order matters: bindings (values and modules created by archive code)
// drop before the archives that keep that code mapped.
pub struct Scope {
    label: String,
    bindings: HashMap<BindingKey, Binding>,
    parent: Option<Arc<Scope>>,
    archives: Vec<ArchiveHandle>,
}

impl Scope {
    /// Create an empty root scope
    pub fn root() -> Arc<Scope> {
        Arc::new(Self {
            label: "root".to_string(),
            bindings: HashMap::new(),
            parent: None,
            archives: Vec::new(),
        })
    }

    /// Create a root scope populated by `configure`
    pub fn root_with<F, E>(configure: F) -> Result<Arc<Scope>, E>
    where
        F: FnOnce(&mut Binder) -> Result<(), E>,
    {
        let mut binder = Binder::new("root", None);
        configure(&mut binder)?;
        Ok(binder.finish())
    }

    /// Create a child scope of `self` populated by `configure`
    ///
    /// Binding a key that is already visible from `self` fails with
    /// [`ScopeError::DuplicateBinding`].
    pub fn create_child<F, E>(self: &Arc<Self>, label: &str, configure: F) -> Result<Arc<Scope>, E>
    where
        F: FnOnce(&mut Binder) -> Result<(), E>,
    {
        let mut binder = Binder::new(label, Some(self.clone()));
        configure(&mut binder)?;
        let scope = binder.finish();
        debug!(
            "Created scope '{}' (depth {}, {} bindings)",
            scope.label,
            scope.depth(),
            scope.bindings.len()
        );
        Ok(scope)
    }

    /// Scope label, used in diagnostics
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Parent scope, `None` for a root
    pub fn parent(&self) -> Option<&Arc<Scope>> {
        self.parent.as_ref()
    }

    /// Number of ancestors between this scope and its root
    pub fn depth(&self) -> usize {
        self.ancestors().count() - 1
    }

    /// Iterate over this scope followed by its ancestors
    pub fn ancestors(&self) -> impl Iterator<Item = &Scope> {
        std::iter::successors(Some(self), |scope| scope.parent.as_deref())
    }

    /// Whether `key` resolves from this scope
    pub fn contains(&self, key: &BindingKey) -> bool {
        self.lookup(key).is_some()
    }

    /// Whether `key` is bound directly in this scope, ignoring ancestors
    pub fn binds_locally(&self, key: &BindingKey) -> bool {
        self.bindings.contains_key(key)
    }

    /// Resolve a typed value
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self.lookup(&BindingKey::of::<T>())? {
            Binding::Value(value) => value.clone().downcast::<T>().ok(),
            Binding::Module(_) => None,
        }
    }

    /// Resolve a bound module instance
    pub fn module(&self, id: &ModuleTypeId) -> Option<Arc<dyn Module>> {
        self.bound_module(id).map(|bound| bound.module.clone())
    }

    /// Resolve a bound module together with its archive handle
    pub fn bound_module(&self, id: &ModuleTypeId) -> Option<&BoundModule> {
        match self.lookup(&BindingKey::module(id))? {
            Binding::Module(bound) => Some(bound),
            Binding::Value(_) => None,
        }
    }

    /// Resolve a bound module and downcast it to its concrete type
    pub fn module_as<T: Module>(&self, id: &ModuleTypeId) -> Option<&T> {
        self.bound_module(id)?.module.as_any().downcast_ref::<T>()
    }

    /// Archives this scope keeps loaded
    pub fn archives(&self) -> &[ArchiveHandle] {
        &self.archives
    }

    /// Keys bound directly in this scope
    pub fn local_keys(&self) -> Vec<BindingKey> {
        self.bindings.keys().cloned().collect()
    }

    fn lookup(&self, key: &BindingKey) -> Option<&Binding> {
        self.ancestors().find_map(|scope| scope.bindings.get(key))
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.bindings.keys().map(|k| k.to_string()).collect();
        f.debug_struct("Scope")
            .field("label", &self.label)
            .field("depth", &self.depth())
            .field("bindings", &keys)
            .finish()
    }
}

/// Collects the bindings of a scope under construction
pub struct Binder {
    label: String,
    bindings: HashMap<BindingKey, Binding>,
    parent: Option<Arc<Scope>>,
    archives: Vec<ArchiveHandle>,
}

impl Binder {
    fn new(label: &str, parent: Option<Arc<Scope>>) -> Self {
        Self {
            label: label.to_string(),
            bindings: HashMap::new(),
            parent,
            archives: Vec::new(),
        }
    }

    /// Bind a typed value
    pub fn bind<T: Any + Send + Sync>(&mut self, value: T) -> Result<&mut Self, ScopeError> {
        self.bind_arc(Arc::new(value))
    }

    /// Bind an already shared typed value
    pub fn bind_arc<T: Any + Send + Sync>(&mut self, value: Arc<T>) -> Result<&mut Self, ScopeError> {
        self.insert(BindingKey::of::<T>(), Binding::Value(value))?;
        Ok(self)
    }

    /// Bind a module instance under its type identity
    ///
    /// The archive is also kept alive by the scope itself, so values the
    /// module contributes through [`Binder::install`] never outlive its code.
    pub fn bind_module(
        &mut self,
        id: &ModuleTypeId,
        module: Arc<dyn Module>,
        archive: Option<ArchiveHandle>,
    ) -> Result<&mut Self, ScopeError> {
        if let Some(archive) = &archive {
            self.keep_alive(archive);
        }
        self.insert(
            BindingKey::module(id),
            Binding::Module(BoundModule::new(module, archive)),
        )?;
        Ok(self)
    }

    /// Keep `archive` loaded until every binding of the scope is dropped
    pub fn keep_alive(&mut self, archive: &ArchiveHandle) -> &mut Self {
        if !self.archives.iter().any(|a| a.same_archive(archive)) {
            self.archives.push(archive.clone());
        }
        self
    }

    /// Let `module` contribute its own bindings
    ///
    /// Modules loaded from an archive must be bound with
    /// [`Binder::bind_module`] (or their archive passed to
    /// [`Binder::keep_alive`]) before they are installed.
    pub fn install(&mut self, module: &dyn Module) -> ModuleResult<()> {
        module.configure(self)
    }

    /// Whether `key` is already visible to the scope being built
    pub fn is_bound(&self, key: &BindingKey) -> bool {
        self.bindings.contains_key(key)
            || self
                .parent
                .as_ref()
                .map(|parent| parent.contains(key))
                .unwrap_or(false)
    }

    fn insert(&mut self, key: BindingKey, binding: Binding) -> Result<(), ScopeError> {
        if self.is_bound(&key) {
            return Err(ScopeError::DuplicateBinding {
                key: key.to_string(),
                scope: self.label.clone(),
            });
        }
        self.bindings.insert(key, binding);
        Ok(())
    }

    fn finish(self) -> Arc<Scope> {
        Arc::new(Scope {
            label: self.label,
            bindings: self.bindings,
            parent: self.parent,
            archives: self.archives,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Greeter {
        greeting: &'static str,
    }

    impl Module for Greeter {
        fn configure(&self, binder: &mut Binder) -> ModuleResult<()> {
            binder.bind(self.greeting.to_string())?;
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug, PartialEq)]
    struct Port(u16);

    /// Stands in for a loaded library: flags itself released on drop
    struct MappedCode(Arc<AtomicBool>);

    impl Drop for MappedCode {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Value whose drop glue lives in the archive's code
    struct ArchiveValue {
        released: Arc<AtomicBool>,
        dropped_late: Arc<AtomicUsize>,
    }

    impl Drop for ArchiveValue {
        fn drop(&mut self) {
            if self.released.load(Ordering::SeqCst) {
                self.dropped_late.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    struct Provider {
        released: Arc<AtomicBool>,
        dropped_late: Arc<AtomicUsize>,
    }

    impl Module for Provider {
        fn configure(&self, binder: &mut Binder) -> ModuleResult<()> {
            binder.bind(ArchiveValue {
                released: self.released.clone(),
                dropped_late: self.dropped_late.clone(),
            })?;
            binder.bind(Port(1))?;
            binder.bind(7u64)?;
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_lookup_walks_parent_chain() {
        let root = Scope::root_with(|binder| {
            binder.bind(Port(8080))?;
            Ok::<_, ScopeError>(())
        })
        .unwrap();

        let child = root
            .create_child("child", |binder| {
                binder.bind(42u32)?;
                Ok::<_, ScopeError>(())
            })
            .unwrap();

        assert_eq!(*child.get::<Port>().unwrap(), Port(8080));
        assert_eq!(*child.get::<u32>().unwrap(), 42);
        assert!(root.get::<u32>().is_none());
        assert_eq!(child.depth(), 1);
        assert_eq!(root.depth(), 0);
    }

    #[test]
    fn test_duplicate_binding_rejected() {
        let root = Scope::root_with(|binder| {
            binder.bind(Port(1))?;
            Ok::<_, ScopeError>(())
        })
        .unwrap();

        let err = root
            .create_child("child", |binder| {
                binder.bind(Port(2))?;
                Ok::<_, ScopeError>(())
            })
            .unwrap_err();

        assert!(matches!(err, ScopeError::DuplicateBinding { .. }));

        let err = Scope::root_with(|binder| {
            binder.bind(1u8)?;
            binder.bind(2u8)?;
            Ok::<_, ScopeError>(())
        })
        .unwrap_err();
        assert!(matches!(err, ScopeError::DuplicateBinding { .. }));
    }

    #[test]
    fn test_module_binding_and_install() {
        let id = ModuleTypeId::new("test::Greeter");
        let greeter: Arc<dyn Module> = Arc::new(Greeter { greeting: "hello" });

        let scope = Scope::root()
            .create_child("greeter", |binder| {
                binder.bind_module(&id, greeter.clone(), None)?;
                binder.install(greeter.as_ref())
            })
            .unwrap();

        assert!(scope.module(&id).is_some());
        assert_eq!(scope.module_as::<Greeter>(&id).unwrap().greeting, "hello");
        assert_eq!(scope.get::<String>().unwrap().as_str(), "hello");
        assert!(scope.binds_locally(&BindingKey::module(&id)));
        // Module bindings are not visible as typed values
        assert!(scope.get::<Greeter>().is_none());
    }

    #[test]
    fn test_bindings_drop_before_their_archive() {
        let dropped_late = Arc::new(AtomicUsize::new(0));
        let id = ModuleTypeId::new("test::Provider");
        let dep = ModuleTypeId::new("test::Dependent");

        // HashMap drop order varies between maps, so repeat
        for round in 0..64 {
            let released = Arc::new(AtomicBool::new(false));
            let archive = ArchiveHandle::with_resources(
                "/plugins/a.so",
                None,
                Some(Box::new(MappedCode(released.clone()))),
            );
            let provider: Arc<dyn Module> = Arc::new(Provider {
                released: released.clone(),
                dropped_late: dropped_late.clone(),
            });

            let own = Scope::root()
                .create_child("provider", |binder| {
                    binder.bind_module(&id, provider.clone(), Some(archive.clone()))?;
                    binder.install(provider.as_ref())
                })
                .unwrap();
            let composite = Scope::root()
                .create_child("dependent+deps", |binder| {
                    binder.bind_module(&id, provider.clone(), Some(archive.clone()))?;
                    binder.install(provider.as_ref())
                })
                .unwrap();
            let child = own
                .create_child("dependent", |binder| {
                    binder.bind_module(&dep, Arc::new(Greeter { greeting: "hi" }), None)?;
                    Ok::<_, ScopeError>(())
                })
                .unwrap();

            assert_eq!(own.archives().len(), 1);
            assert_eq!(composite.archives().len(), 1);

            // The provider's instance is gone; only its scopes remain, and
            // each must keep the archive mapped on its own
            drop(provider);
            drop(archive);
            let (first, last) = if round % 2 == 0 {
                (composite, own)
            } else {
                (own, composite)
            };
            drop(child);
            drop(first);
            assert!(!released.load(Ordering::SeqCst));
            drop(last);
            assert!(released.load(Ordering::SeqCst));
        }

        assert_eq!(dropped_late.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_keep_alive_deduplicates_archives() {
        let archive = ArchiveHandle::new("/plugins/a.so");
        let scope = Scope::root()
            .create_child("two", |binder| {
                binder.bind_module(
                    &ModuleTypeId::new("a::One"),
                    Arc::new(Greeter { greeting: "1" }),
                    Some(archive.clone()),
                )?;
                binder.keep_alive(&archive);
                Ok::<_, ScopeError>(())
            })
            .unwrap();

        assert_eq!(scope.archives().len(), 1);
        assert!(scope.archives()[0].same_archive(&archive));
    }
}
