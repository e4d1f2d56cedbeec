//! One-shot initialization of shared engine state.

use std::future::Future;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::core::errors::Result;
use crate::mediator::MediatorContext;
use crate::model::declaration::Declaration;

/// `Idle -> Running -> Done`; `Done` is terminal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitState {
    Idle,
    Running,
    Done,
}

/// Runs a preload body at most once per instance. Concurrent callers wait for
/// the running body instead of starting their own.
#[derive(Debug)]
pub struct OneShotInitializer {
    state: Mutex<InitState>,
    done: Notify,
}

impl Default for OneShotInitializer {
    fn default() -> Self {
        Self::new()
    }
}

/// Moves the initializer to `Done` even if the preload future is dropped
struct FinishOnDrop<'a>(&'a OneShotInitializer);

impl Drop for FinishOnDrop<'_> {
    fn drop(&mut self) {
        *self.0.state.lock().unwrap_or_else(|e| e.into_inner()) = InitState::Done;
        self.0.done.notify_waiters();
    }
}

impl OneShotInitializer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InitState::Idle),
            done: Notify::new(),
        }
    }

    pub fn state(&self) -> InitState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the preload's error to the caller that ran it. Callers that
    /// waited, or arrive later, get `Ok` once the state is `Done`.
    pub async fn ensure_initialized<F, Fut>(&self, preload: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        loop {
            // registered before the state check so a concurrent finish is not missed
            let notified = self.done.notified();
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                match *state {
                    InitState::Done => return Ok(()),
                    InitState::Idle => {
                        *state = InitState::Running;
                        break;
                    }
                    InitState::Running => {}
                }
            }
            debug!("Waiting for initialization in progress");
            notified.await;
        }

        let _finish = FinishOnDrop(self);
        info!("Initialization started");
        let result = preload().await;
        match &result {
            Ok(()) => info!("Initialization complete"),
            Err(e) => warn!(error = %e, "Initialization failed, not retrying"),
        }
        result
    }
}

impl MediatorContext {
    pub(crate) async fn ensure_initialized(&self) -> Result<()> {
        self.initializer.ensure_initialized(|| self.preload()).await
    }

    /// Prerequisite types, then the bootstrap file, then whatever the engine
    /// already defines is recorded as predefined.
    async fn preload(&self) -> Result<()> {
        for type_name in &self.config.prerequisite_types {
            let resolved = self.resolver.resolve(type_name, true).await?;
            for decl in &resolved {
                self.ensure_defined(decl)?;
            }
            debug!(type_name = %type_name, loaded = resolved.len(), "Prerequisite type loaded");
        }

        if let Some(path) = &self.config.bootstrap_file {
            info!(path = %path.display(), "Running bootstrap file");
            self.engine.run_bootstrap(path).await?;
        }

        let mut registered = 0usize;
        for action in self.engine.defined_actions() {
            if !self.model.contains(&action) {
                self.model.add(Declaration::predefined(action));
                registered += 1;
            }
        }
        debug!(registered, "Engine actions recorded as predefined");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::MediatorError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_run_body_once() {
        let init = Arc::new(OneShotInitializer::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let init = init.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                init.ensure_initialized(|| async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(())
                })
                .await
                .unwrap();
                init.state()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), InitState::Done);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_reported_once_and_not_retried() {
        let init = OneShotInitializer::new();
        let first = init
            .ensure_initialized(|| async { Err(MediatorError::internal("bootstrap failed")) })
            .await;
        assert!(first.is_err());
        assert_eq!(init.state(), InitState::Done);

        let reran = AtomicUsize::new(0);
        let second = init
            .ensure_initialized(|| async {
                reran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(second.is_ok());
        assert_eq!(reran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_preload_still_finishes() {
        let init = Arc::new(OneShotInitializer::new());
        let task = {
            let init = init.clone();
            tokio::spawn(async move {
                init.ensure_initialized(|| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        task.abort();
        let _ = task.await;

        tokio::time::timeout(
            Duration::from_secs(1),
            init.ensure_initialized(|| async { Ok(()) }),
        )
        .await
        .unwrap()
        .unwrap();
    }
}
