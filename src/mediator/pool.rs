use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Task-per-job pool with an optional concurrency bound.
///
/// Jobs may be submitted from any thread; they run on the runtime the pool
/// was created with.
pub struct WorkerPool {
    name: String,
    runtime: Handle,
    limit: Option<Arc<Semaphore>>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    submitted: AtomicU64,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, bound: Option<usize>, runtime: Handle) -> Self {
        Self {
            name: name.into(),
            runtime,
            limit: bound.map(|n| Arc::new(Semaphore::new(n))),
            jobs: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit a job. Returns false once the pool is shut down.
    pub fn spawn<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            warn!(pool = %self.name, "Job rejected, pool is shut down");
            return false;
        }
        let limit = self.limit.clone();
        let handle = self.runtime.spawn(async move {
            let _permit = match limit {
                Some(sem) => match sem.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };
            job.await;
        });
        self.submitted.fetch_add(1, Ordering::Relaxed);

        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.retain(|h| !h.is_finished());
        jobs.push(handle);
        true
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> usize {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.retain(|h| !h.is_finished());
        jobs.len()
    }

    /// Stop accepting jobs and wait for the running ones to finish
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        loop {
            let pending: Vec<JoinHandle<()>> = {
                let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *jobs)
            };
            if pending.is_empty() {
                break;
            }
            for handle in pending {
                if let Err(e) = handle.await {
                    error!(pool = %self.name, error = %e, "Worker job panicked");
                }
            }
        }
        debug!(pool = %self.name, "Worker pool drained");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("bounded", &self.limit.is_some())
            .field("submitted", &self.submitted())
            .finish()
    }
}
