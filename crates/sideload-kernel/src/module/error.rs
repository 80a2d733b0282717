//! Typed errors raised by modules.

use std::any::Any;

use thiserror::Error;

use crate::scope::ScopeError;

/// Errors that can occur while constructing or driving a module.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModuleError {
    /// The module's constructor failed.
    #[error("Module construction failed: {0}")]
    ConstructionFailed(String),

    /// The module failed while starting.
    #[error("Module startup failed: {0}")]
    StartupFailed(String),

    /// The module failed while shutting down.
    #[error("Module shutdown failed: {0}")]
    ShutdownFailed(String),

    /// A binding contributed by the module conflicts with an existing one.
    #[error("Module binding failed: {0}")]
    Binding(#[from] ScopeError),

    /// Unrecoverable failure. Never swallowed by the loader: it aborts the
    /// enclosing batch.
    #[error("Unrecoverable module failure: {0}")]
    Fatal(String),

    /// Catch-all for errors that don't fit the above categories.
    #[error("{0}")]
    Other(String),
}

impl ModuleError {
    /// Whether this error must propagate instead of being recorded and skipped
    pub fn is_fatal(&self) -> bool {
        matches!(self, ModuleError::Fatal(_))
    }
}

/// Message carried by a caught panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
