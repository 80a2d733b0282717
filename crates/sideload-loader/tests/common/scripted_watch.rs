//! Scripted watch handle.
//!
//! Tests push events into a [`ScriptedWatch`]; the watcher drains them on its
//! next tick exactly like platform notifications.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use sideload_loader::{WatchError, WatchEvent, WatchEventKind, WatchHandle};

#[derive(Clone, Default)]
pub struct ScriptedWatch {
    pending: Arc<Mutex<Vec<WatchEvent>>>,
    polls: Arc<AtomicUsize>,
}

impl ScriptedWatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, kind: WatchEventKind, path: &Path) {
        self.pending.lock().push(WatchEvent::new(kind, path));
    }

    /// Number of times the watcher drained this handle
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn boxed(&self) -> Box<dyn WatchHandle> {
        Box::new(self.clone())
    }
}

impl WatchHandle for ScriptedWatch {
    fn poll_events(&mut self) -> Result<Vec<WatchEvent>, WatchError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(std::mem::take(&mut *self.pending.lock()))
    }
}
