//! In-memory archive loader.
//!
//! [`MemoryArchiveLoader`] maps archive file names to registration functions
//! so tests can describe an archive's modules without building a shared
//! library. Every `open` counts as a fresh loading context.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use sideload_kernel::{ArchiveHandle, RegistrationTable};
use sideload_loader::{ArchiveError, ArchiveLoader, OpenedArchive};

type Register = Arc<dyn Fn(&mut RegistrationTable) + Send + Sync>;

#[derive(Default)]
pub struct MemoryArchiveLoader {
    archives: Mutex<HashMap<String, Register>>,
    opens: Mutex<HashMap<String, usize>>,
}

impl MemoryArchiveLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define (or redefine) the contents of an archive
    pub fn define<F>(&self, file_name: &str, register: F)
    where
        F: Fn(&mut RegistrationTable) + Send + Sync + 'static,
    {
        self.archives
            .lock()
            .insert(file_name.to_string(), Arc::new(register));
    }

    pub fn with<F>(self, file_name: &str, register: F) -> Self
    where
        F: Fn(&mut RegistrationTable) + Send + Sync + 'static,
    {
        self.define(file_name, register);
        self
    }

    /// Drop an archive's definition so later opens fail with `NotFound`
    pub fn forget(&self, file_name: &str) {
        self.archives.lock().remove(file_name);
    }

    /// How many times an archive was opened
    pub fn opens(&self, file_name: &str) -> usize {
        self.opens.lock().get(file_name).copied().unwrap_or(0)
    }
}

impl ArchiveLoader for MemoryArchiveLoader {
    fn open(&self, path: &Path) -> Result<OpenedArchive, ArchiveError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ArchiveError::NotFound(path.to_path_buf()))?
            .to_string();

        let register = self
            .archives
            .lock()
            .get(&name)
            .cloned()
            .ok_or_else(|| ArchiveError::NotFound(path.to_path_buf()))?;

        *self.opens.lock().entry(name).or_insert(0) += 1;

        let mut table = RegistrationTable::new();
        register(&mut table);

        Ok(OpenedArchive {
            candidates: table.into_candidates(),
            handle: ArchiveHandle::new(path),
        })
    }
}
