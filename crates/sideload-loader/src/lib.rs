//! Sideload loader
//!
//! Loads independently compiled module archives into a running host:
//!
//! 1. [`archive`] opens an archive in a fresh loading context and collects
//!    the candidates it registers
//! 2. [`scanner`] keeps the candidates that are valid modules
//! 3. [`graph`] orders them so dependencies come first
//! 4. [`pipeline`] constructs each module, wires its injection scope and
//!    registers it with the host
//!
//! [`watcher`] and [`manager`] keep the registry in sync with the sideload
//! directory afterwards, running every registry change on the
//! [`executor`] thread.

pub mod archive;
pub mod executor;
pub mod graph;
pub mod lifecycle;
pub mod manager;
pub mod pipeline;
pub mod scanner;
pub mod watcher;

pub use archive::{ArchiveError, ArchiveLoader, DylibLoader, OpenedArchive};
pub use executor::{ExecutorError, RegistryExecutor};
pub use graph::{CycleError, DependencyGraph};
pub use lifecycle::{ArchiveLifecycle, ModulesChanged};
pub use manager::{ArchiveLoad, ManagerError, SideloadManager};
pub use pipeline::{BatchReport, InstantiationError, Instantiator, LoadError};
pub use scanner::{ModuleClass, ModuleSummary, scan};
pub use watcher::{
    ArchiveInstruction, HotReloadWatcher, NotifyWatchHandle, WatchConfig, WatchError, WatchEvent,
    WatchEventKind, WatchHandle, coalesce,
};

// Re-export the kernel for module authors and hosts
pub use sideload_kernel;
