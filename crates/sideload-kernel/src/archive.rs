//! Archive handles
//!
//! Every module instance remembers the archive it was loaded from. The handle
//! is the only link between a running instance and a file on disk: reload and
//! unload find their instances by comparing handle paths.

use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Shared handle to a loaded module archive
///
/// Cloning is cheap. Resources handed to [`ArchiveHandle::with_resources`]
/// (the loaded library, its private copy on disk) are released when the last
/// clone is dropped.
#[derive(Clone)]
pub struct ArchiveHandle {
    inner: Arc<ArchiveInner>,
}

struct ArchiveInner {
    path: PathBuf,
    digest: Option<String>,
    loaded_at: SystemTime,
    resources: Option<Box<dyn Any + Send + Sync>>,
}

impl ArchiveHandle {
    /// Handle for an archive with nothing to keep alive
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::with_resources(path, None, None)
    }

    /// Handle that owns the resources backing the archive's code
    pub fn with_resources<P: AsRef<Path>>(
        path: P,
        digest: Option<String>,
        resources: Option<Box<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            inner: Arc::new(ArchiveInner {
                path: path.as_ref().to_path_buf(),
                digest,
                loaded_at: SystemTime::now(),
                resources,
            }),
        }
    }

    /// Path of the archive as seen in the sideload directory
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Content digest recorded when the archive was opened
    pub fn digest(&self) -> Option<&str> {
        self.inner.digest.as_deref()
    }

    /// When the archive was opened
    pub fn loaded_at(&self) -> SystemTime {
        self.inner.loaded_at
    }

    /// Whether this handle was opened from `path` (path identity, not content)
    pub fn is_from(&self, path: &Path) -> bool {
        self.inner.path == path
    }

    /// Whether two handles refer to the same opened archive
    pub fn same_archive(&self, other: &ArchiveHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of live clones of this handle
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for ArchiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveHandle")
            .field("path", &self.inner.path)
            .field("digest", &self.inner.digest)
            .field("has_resources", &self.inner.resources.is_some())
            .finish()
    }
}
