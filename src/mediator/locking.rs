//! Locking façade: resolve a declaration's closure, read-lock every entry in
//! closure order and hand the caller a single release handle.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::core::errors::Result;
use crate::mediator::resolver::{DependencyClosure, DependencyResolver};
use crate::model::declaration::Declaration;
use crate::model::registry::{ActionModel, ModelLockGuard};

/// Every lock taken for one closure. Released once, by [`LockRelease::release`]
/// or on drop, in reverse acquisition order.
pub struct LockRelease {
    guards: Vec<ModelLockGuard>,
}

impl LockRelease {
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    pub fn release(self) {
        drop(self)
    }
}

impl Drop for LockRelease {
    fn drop(&mut self) {
        if self.guards.is_empty() {
            return;
        }
        trace!(count = self.guards.len(), "Releasing closure locks");
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

impl fmt::Debug for LockRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRelease")
            .field("locks", &self.guards.len())
            .finish()
    }
}

#[derive(Clone)]
pub struct LockingFacade {
    resolver: DependencyResolver,
}

impl LockingFacade {
    pub fn new(resolver: DependencyResolver) -> Self {
        Self { resolver }
    }

    fn model(&self) -> &Arc<dyn ActionModel> {
        self.resolver.model()
    }

    /// Read-lock every entry of `closure` in order
    pub async fn lock_closure(&self, closure: &DependencyClosure) -> LockRelease {
        let mut guards = Vec::with_capacity(closure.len());
        for decl in closure.entries() {
            guards.push(self.model().read_lock(&decl.name).await);
        }
        debug!(
            target_name = %closure.target().name,
            locks = guards.len(),
            "Closure locked"
        );
        LockRelease { guards }
    }

    /// Run `callback` with `decl`'s closure locked. The callback owns the
    /// release handle and may keep it alive past its own return, e.g. until an
    /// execution reaches a terminal status; otherwise it is released when the
    /// callback drops it. Outcomes are not interpreted here.
    pub async fn with_locked<T, F, Fut>(&self, decl: Arc<Declaration>, callback: F) -> Result<T>
    where
        F: FnOnce(DependencyClosure, LockRelease) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let closure = self.resolver.closure(decl).await?;
        let release = self.lock_closure(&closure).await;
        callback(closure, release).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::MediatorError;
    use crate::mediator::resolver::LocalOnly;
    use crate::model::declaration::Parameter;
    use crate::model::names::ActionName;
    use crate::model::registry::InMemoryActionModel;
    use std::time::Duration;

    fn name(s: &str) -> ActionName {
        ActionName::new("arm", s)
    }

    fn setup() -> (Arc<InMemoryActionModel>, LockingFacade) {
        let model = Arc::new(InMemoryActionModel::with_declarations([
            Declaration::type_decl(name("Pose")),
            Declaration::action(name("Move")).with_param(Parameter::input("to", "arm:Pose")),
        ]));
        let resolver = DependencyResolver::new(model.clone(), Arc::new(LocalOnly));
        (model, LockingFacade::new(resolver))
    }

    #[tokio::test]
    async fn test_locks_balance_on_success_and_error() {
        let (model, facade) = setup();
        let stats = model.lock_stats();
        let decl = model.get_raw(&name("Move")).unwrap();

        let held = facade
            .with_locked(decl.clone(), |closure, release| async move {
                assert_eq!(release.len(), closure.len());
                release.release();
                Ok(closure.len())
            })
            .await
            .unwrap();
        assert_eq!(held, 2);

        let err = facade
            .with_locked(decl, |_closure, _release| async move {
                Err::<(), _>(MediatorError::internal("boom"))
            })
            .await;
        assert!(err.is_err());
        assert_eq!(stats.acquired(), 4);
        assert_eq!(stats.held(), 0);
    }

    #[tokio::test]
    async fn test_resolve_failure_takes_no_locks() {
        let (model, facade) = setup();
        let broken = Arc::new(
            Declaration::action(name("Wave")).with_param(Parameter::input("h", "arm:Hand")),
        );
        let result = facade
            .with_locked(broken, |_c, _r| async move { Ok(()) })
            .await;
        assert!(matches!(result, Err(MediatorError::MissingDependency { .. })));
        assert_eq!(model.lock_stats().acquired(), 0);
    }

    #[tokio::test]
    async fn test_held_release_blocks_writer() {
        let (model, facade) = setup();
        let decl = model.get_raw(&name("Move")).unwrap();
        let release = facade
            .with_locked(decl, |_c, release| async move { Ok(release) })
            .await
            .unwrap();

        let writer = {
            let model = model.clone();
            tokio::spawn(async move { model.write_lock(&name("Pose")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        release.release();
        tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .unwrap()
            .unwrap();
    }
}
