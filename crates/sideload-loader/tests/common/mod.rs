//! Common test utilities shared across `sideload-loader` integration tests.
//!
//! This module is **not** a standalone test binary. It is declared with
//! `mod common;` inside each integration test file that needs it.

pub mod memory_archive;
pub mod scripted_watch;

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use sideload_kernel::config::SideloadConfig;
use sideload_kernel::{InMemoryRegistry, Module, Scope};
use sideload_loader::SideloadManager;
use tempfile::TempDir;

use memory_archive::MemoryArchiveLoader;

/// Archive extension used by every test directory
pub const EXT: &str = "mod";

/// Module with no behaviour of its own
#[derive(Default)]
pub struct Blank;

impl Module for Blank {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A manager over a temporary sideload directory
pub struct Harness {
    pub dir: TempDir,
    pub registry: Arc<InMemoryRegistry>,
    pub loader: Arc<MemoryArchiveLoader>,
    pub manager: SideloadManager,
}

impl Harness {
    pub fn new(loader: MemoryArchiveLoader) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = SideloadConfig::default()
            .with_plugin_dir(dir.path())
            .with_archive_extension(EXT);
        config.watch.initial_delay_ms = 0;
        config.watch.poll_interval_ms = 20;

        let registry = Arc::new(InMemoryRegistry::new());
        let loader = Arc::new(loader);
        let manager =
            SideloadManager::new(config, registry.clone(), loader.clone(), Scope::root()).unwrap();

        Self {
            dir,
            registry,
            loader,
            manager,
        }
    }

    /// Create an (empty) archive file so the directory listing finds it
    pub fn touch(&self, file_name: &str) -> std::path::PathBuf {
        let path = self.manager.plugin_dir().join(file_name);
        std::fs::write(&path, b"").unwrap();
        path
    }

    pub fn path(&self, file_name: &str) -> std::path::PathBuf {
        self.manager.plugin_dir().join(file_name)
    }

    pub fn sorted_names(&self) -> Vec<String> {
        let mut names = self.registry.names();
        names.sort();
        names
    }

    pub fn sorted_enabled(&self) -> Vec<String> {
        let mut names = self.registry.enabled_names();
        names.sort();
        names
    }
}

/// Long enough for several watcher ticks
pub const SETTLE: Duration = Duration::from_millis(150);
