//! Registry executor
//!
//! All registry mutation happens on one dedicated thread. Work is handed over
//! as closures and runs strictly in submission order, so a reload never
//! interleaves with another reload, an unload or the initial load.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use sideload_kernel::panic_message;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::lifecycle::ArchiveLifecycle;

/// Executor error types
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExecutorError {
    #[error("Registry executor has shut down")]
    Closed,

    #[error("Registry job failed: {0}")]
    JobPanicked(String),

    #[error("Failed to spawn registry executor: {0}")]
    Spawn(#[from] std::io::Error),
}

type Job = Box<dyn FnOnce(&ArchiveLifecycle) + Send>;

/// Result of one job, or the message of the panic that ended it
pub type JobResult<R> = Result<R, String>;

/// Dedicated thread owning the [`ArchiveLifecycle`]
pub struct RegistryExecutor {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RegistryExecutor {
    /// Spawn the executor thread
    pub fn spawn(lifecycle: ArchiveLifecycle) -> Result<Self, ExecutorError> {
        let (tx, rx) = mpsc::channel::<Job>();

        let thread = thread::Builder::new()
            .name("sideload-registry".to_string())
            .spawn(move || {
                debug!("Registry executor started");
                while let Ok(job) = rx.recv() {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| job(&lifecycle))) {
                        error!("Registry job panicked: {}", panic_message(payload.as_ref()));
                    }
                }
                info!("Registry executor stopped");
            })?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue `f` and return a receiver for its result
    pub fn execute<F, R>(&self, f: F) -> Result<oneshot::Receiver<JobResult<R>>, ExecutorError>
    where
        F: FnOnce(&ArchiveLifecycle) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move |lifecycle| {
            let result = catch_unwind(AssertUnwindSafe(|| f(lifecycle)))
                .map_err(|payload| panic_message(payload.as_ref()));
            if let Err(msg) = &result {
                error!("Registry job panicked: {}", msg);
            }
            let _ = result_tx.send(result);
        });

        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(ExecutorError::Closed)?;
        tx.send(job).map_err(|_| ExecutorError::Closed)?;
        Ok(result_rx)
    }

    /// Run `f` on the executor and wait for its result
    pub async fn run<F, R>(&self, f: F) -> Result<R, ExecutorError>
    where
        F: FnOnce(&ArchiveLifecycle) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.execute(f)?
            .await
            .map_err(|_| ExecutorError::JobPanicked("job dropped its result".to_string()))?
            .map_err(ExecutorError::JobPanicked)
    }

    /// Whether the executor still accepts work
    pub fn is_running(&self) -> bool {
        self.tx.lock().is_some()
    }

    /// Stop accepting work and let queued jobs finish
    ///
    /// Blocks until the executor thread exits.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("Registry executor thread panicked");
            }
        }
    }
}

impl Drop for RegistryExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::DylibLoader;
    use crate::pipeline::Instantiator;
    use sideload_kernel::{InMemoryRegistry, Scope};
    use std::sync::Arc;
    use tokio::sync::broadcast;

    fn executor() -> RegistryExecutor {
        let instantiator = Instantiator::new(Arc::new(InMemoryRegistry::new()), Scope::root());
        let (events, _) = broadcast::channel(4);
        let lifecycle = ArchiveLifecycle::new(instantiator, Arc::new(DylibLoader::new()), events);
        RegistryExecutor::spawn(lifecycle).unwrap()
    }

    #[tokio::test]
    async fn test_panicking_job_reports_message_and_executor_survives() {
        let executor = executor();

        let err = executor
            .run(|_| -> usize { panic!("job exploded") })
            .await
            .unwrap_err();
        assert!(matches!(&err, ExecutorError::JobPanicked(msg) if msg.contains("job exploded")));

        let len = executor.run(|lifecycle| lifecycle.registry().instances().len()).await;
        assert_eq!(len.unwrap(), 0);
        assert!(executor.is_running());
    }

    #[tokio::test]
    async fn test_closed_after_shutdown() {
        let executor = executor();
        executor.shutdown();

        assert!(!executor.is_running());
        assert!(matches!(
            executor.run(|_| ()).await,
            Err(ExecutorError::Closed)
        ));
    }
}
