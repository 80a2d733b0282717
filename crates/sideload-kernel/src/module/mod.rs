//! Module contract
//!
//! A module is a unit of externally supplied functionality. Archives describe
//! every module they ship with an explicit [`ModuleDescriptor`] value and hand
//! the loader a [`ModuleConstructor`]; nothing about a module is discovered by
//! runtime introspection.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

pub mod error;
pub use error::{ModuleError, panic_message};

use crate::scope::{Binder, Scope};

/// Module operation result type using the typed [`ModuleError`].
pub type ModuleResult<T> = Result<T, ModuleError>;

/// No-argument construction path of a module type.
pub type ModuleConstructor = Arc<dyn Fn() -> ModuleResult<Box<dyn Module>> + Send + Sync>;

// ============================================================================
// Module identity
// ============================================================================

/// Stable identity of a loadable module type
///
/// Dependencies are declared against this identity and resolved against the
/// running instances that carry exactly the same value. A string key is used
/// instead of [`std::any::TypeId`] because type ids are not stable across
/// independently compiled archives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleTypeId(String);

impl ModuleTypeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment, used when logging (`acme::bank::Tracker` -> `Tracker`)
    pub fn simple_name(&self) -> &str {
        self.0
            .rsplit(|c: char| c == ':' || c == '.')
            .find(|segment| !segment.is_empty())
            .unwrap_or(self.0.as_str())
    }
}

impl fmt::Display for ModuleTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleTypeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ModuleTypeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Module descriptor
// ============================================================================

/// Descriptor metadata every module type must expose
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Display name, also the key used to carry the enabled flag across reloads
    pub name: String,
    /// Short human readable description
    #[serde(default)]
    pub description: String,
    /// Module version as published by its author
    #[serde(default)]
    pub version: Option<String>,
    /// Whether the module is enabled when it is first discovered
    #[serde(default = "default_enabled")]
    pub enabled_by_default: bool,
    /// Ordered list of module types this module depends on
    #[serde(default)]
    pub dependencies: Vec<ModuleTypeId>,
}

fn default_enabled() -> bool {
    true
}

impl ModuleDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            version: None,
            enabled_by_default: true,
            dependencies: Vec::new(),
        }
    }

    pub fn with_description(mut self, desc: &str) -> Self {
        self.description = desc.to_string();
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn with_enabled_by_default(mut self, enabled: bool) -> Self {
        self.enabled_by_default = enabled;
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<ModuleTypeId>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Check whether `id` is one of the declared dependencies
    pub fn depends_on(&self, id: &ModuleTypeId) -> bool {
        self.dependencies.contains(id)
    }
}

// ============================================================================
// Module state
// ============================================================================

/// Lifecycle state tracked by the host registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[non_exhaustive]
pub enum ModuleState {
    /// Registered but not started
    #[default]
    Loaded,
    /// Started and running
    Running,
    /// Last lifecycle transition failed
    Error(String),
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleState::Loaded => write!(f, "Loaded"),
            ModuleState::Running => write!(f, "Running"),
            ModuleState::Error(err) => write!(f, "Error: {}", err),
        }
    }
}

// ============================================================================
// Module trait
// ============================================================================

/// Base contract implemented by every module type
///
/// Instances are shared between the host registry and the scopes of the
/// modules depending on them, so every method takes `&self`; modules keep
/// mutable state behind their own locks.
pub trait Module: Send + Sync + 'static {
    /// Contribute bindings to the scope that owns this module.
    ///
    /// Called once for the module's own scope and once more for every
    /// composite scope built for a dependent that has several dependencies.
    fn configure(&self, binder: &mut Binder) -> ModuleResult<()> {
        let _ = binder;
        Ok(())
    }

    /// Bring the module to a running state.
    ///
    /// A module that keeps `scope` must release it in [`Module::shut_down`].
    fn start_up(&self, scope: &Arc<Scope>) -> ModuleResult<()> {
        let _ = scope;
        Ok(())
    }

    /// Tear the module down.
    fn shut_down(&self) -> ModuleResult<()> {
        Ok(())
    }

    /// Convert to Any (for downcasting)
    fn as_any(&self) -> &dyn Any;
}
