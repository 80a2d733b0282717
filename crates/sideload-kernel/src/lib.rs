//! Sideload kernel
//!
//! Shared vocabulary between the host process and independently compiled
//! module archives:
//! - the [`Module`] contract and its [`ModuleDescriptor`]
//! - dependency-injection [`Scope`]s with parent chaining
//! - [`ModuleInstance`] handles tied to the archive they came from
//! - the [`HostRegistry`] boundary and an in-memory implementation
//! - the [`RegistrationTable`] archives fill to announce their modules
//! - configuration loading for hosts

pub mod archive;
pub mod instance;
pub mod module;
pub mod registration;
pub mod registry;
pub mod scope;

#[cfg(feature = "config")]
pub mod config;

pub use archive::ArchiveHandle;
pub use instance::ModuleInstance;
pub use module::{
    Module, ModuleConstructor, ModuleDescriptor, ModuleError, ModuleResult, ModuleState,
    ModuleTypeId, panic_message,
};
pub use registration::{CandidateSymbol, RegistrationTable, SIDELOAD_API_VERSION};
pub use registry::{HostRegistry, InMemoryRegistry, RegistryError};
pub use scope::{Binder, BindingKey, BoundModule, Scope, ScopeError};
