//! Archive loading
//!
//! Opens module archives (shared libraries) and collects the candidates they
//! register. Every open uses a fresh private copy of the file so a reload
//! never gets the previously mapped code back from the OS library cache.

use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use sha2::{Digest, Sha256};
use sideload_kernel::registration::{
    API_VERSION_SYMBOL, ApiVersionFn, CandidateSymbol, REGISTER_SYMBOL, RegisterFn,
    RegistrationTable, SIDELOAD_API_VERSION,
};
use sideload_kernel::ArchiveHandle;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::pipeline::catch_module_panic;

/// Archive load error types
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to load library: {0}")]
    LibraryLoad(String),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Archive not found: {0}")]
    NotFound(PathBuf),

    #[error("Registration function panicked: {0}")]
    RegistrationPanicked(String),
}

/// An archive opened in its own loading context
///
/// The candidates' constructors live in the archive's code, so they must be
/// dropped before the last clone of `handle`.
pub struct OpenedArchive {
    /// Candidates registered by the archive
    pub candidates: Vec<CandidateSymbol>,
    /// Handle keeping the archive's code alive
    pub handle: ArchiveHandle,
}

/// Opens module archives
pub trait ArchiveLoader: Send + Sync {
    /// Open the archive at `path` in a fresh loading context
    fn open(&self, path: &Path) -> Result<OpenedArchive, ArchiveError>;
}

/// Keeps a loaded library and its private copy alive
///
/// Field order matters: the library is unmapped before its file is deleted.
struct LoadedLibrary {
    _library: Library,
    _shadow: TempDir,
}

impl Drop for LoadedLibrary {
    fn drop(&mut self) {
        debug!("Unloading module library: {:?}", self._shadow.path());
    }
}

/// Loader for archives built with [`declare_modules!`](sideload_kernel::declare_modules)
#[derive(Debug, Clone)]
pub struct DylibLoader {
    api_version: u32,
}

impl Default for DylibLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DylibLoader {
    /// Create a loader expecting the current API version
    pub fn new() -> Self {
        Self {
            api_version: SIDELOAD_API_VERSION,
        }
    }

    /// Expected API version
    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    /// SHA-256 of the archive contents
    pub fn calculate_hash(path: &Path) -> Result<String, ArchiveError> {
        let contents = std::fs::read(path)?;
        let mut hasher = Sha256::new();
        hasher.update(&contents);
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn shadow_copy(path: &Path) -> Result<(TempDir, PathBuf), ArchiveError> {
        let file_name = path
            .file_name()
            .ok_or_else(|| ArchiveError::NotFound(path.to_path_buf()))?;
        let shadow = tempfile::Builder::new().prefix("sideload-").tempdir()?;
        let target = shadow.path().join(file_name);
        std::fs::copy(path, &target)?;
        Ok((shadow, target))
    }
}

impl ArchiveLoader for DylibLoader {
    fn open(&self, path: &Path) -> Result<OpenedArchive, ArchiveError> {
        if !path.is_file() {
            return Err(ArchiveError::NotFound(path.to_path_buf()));
        }

        info!("Loading module archive: {:?}", path);

        let hash = Self::calculate_hash(path)?;
        let (shadow, copy) = Self::shadow_copy(path)?;

        // SAFETY: loading a library runs its initialisers; archives are trusted
        // code placed in the sideload directory by the user.
        let library =
            unsafe { Library::new(&copy).map_err(|e| ArchiveError::LibraryLoad(e.to_string()))? };

        let api_version = unsafe {
            let version_fn: Symbol<ApiVersionFn> = library.get(API_VERSION_SYMBOL).map_err(|e| {
                ArchiveError::SymbolNotFound(format!("_sideload_api_version: {}", e))
            })?;
            version_fn()
        };

        if api_version != self.api_version {
            return Err(ArchiveError::VersionMismatch {
                expected: self.api_version,
                actual: api_version,
            });
        }

        let mut table = RegistrationTable::new();
        // `table` is declared after `library`, so candidates left behind by a
        // panicking registration drop while their code is still mapped.
        unsafe {
            let register_fn: Symbol<RegisterFn> = library.get(REGISTER_SYMBOL).map_err(|e| {
                ArchiveError::SymbolNotFound(format!("_sideload_register: {}", e))
            })?;
            catch_module_panic(|| register_fn(&mut table))
                .map_err(ArchiveError::RegistrationPanicked)?;
        }

        debug!(
            "Archive {:?} registered {} candidates (sha256 {})",
            path,
            table.len(),
            hash
        );

        let resources = LoadedLibrary {
            _library: library,
            _shadow: shadow,
        };
        let handle = ArchiveHandle::with_resources(path, Some(hash), Some(Box::new(resources)));

        Ok(OpenedArchive {
            candidates: table.into_candidates(),
            handle,
        })
    }
}
