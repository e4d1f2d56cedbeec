//! Locking action model: storage of declarations plus per-name read/write locks.
//!
//! Readers (request handling through the locking façade) share a name's lock;
//! writers (hot loading or unloading a declaration) take it exclusively.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::trace;

use crate::model::declaration::Declaration;
use crate::model::names::ActionName;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// Held lock on one declaration name; released on drop
pub struct ModelLockGuard {
    name: ActionName,
    mode: LockMode,
    _inner: Box<dyn Any + Send + Sync>,
    on_release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ModelLockGuard {
    pub fn new(
        name: ActionName,
        mode: LockMode,
        inner: impl Any + Send + Sync,
        on_release: Option<Box<dyn FnOnce() + Send + Sync>>,
    ) -> Self {
        Self {
            name,
            mode,
            _inner: Box::new(inner),
            on_release,
        }
    }

    pub fn name(&self) -> &ActionName {
        &self.name
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for ModelLockGuard {
    fn drop(&mut self) {
        trace!(name = %self.name, mode = ?self.mode, "Model lock released");
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

impl fmt::Debug for ModelLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelLockGuard")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Registry of action and type declarations
#[async_trait]
pub trait ActionModel: Send + Sync {
    /// Declaration exactly as stored
    fn get_raw(&self, name: &ActionName) -> Option<Arc<Declaration>>;

    /// Declaration with parameters inherited along its `extends` chain
    fn get_inherited(&self, name: &ActionName) -> Option<Arc<Declaration>>;

    fn add(&self, decl: Declaration) -> Arc<Declaration>;

    fn remove(&self, name: &ActionName) -> Option<Arc<Declaration>>;

    fn contains(&self, name: &ActionName) -> bool {
        self.get_raw(name).is_some()
    }

    fn names(&self) -> Vec<ActionName>;

    async fn read_lock(&self, name: &ActionName) -> ModelLockGuard;

    async fn write_lock(&self, name: &ActionName) -> ModelLockGuard;
}

/// Lock accounting for the in-memory model
#[derive(Debug, Default)]
pub struct LockStats {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl LockStats {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn held(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }
}

/// Process-local action model backed by concurrent maps
#[derive(Default)]
pub struct InMemoryActionModel {
    declarations: DashMap<ActionName, Arc<Declaration>>,
    locks: DashMap<ActionName, Arc<RwLock<()>>>,
    stats: Arc<LockStats>,
}

impl InMemoryActionModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_declarations(decls: impl IntoIterator<Item = Declaration>) -> Self {
        let model = Self::new();
        for decl in decls {
            model.add(decl);
        }
        model
    }

    pub fn lock_stats(&self) -> Arc<LockStats> {
        self.stats.clone()
    }

    fn lock_for(&self, name: &ActionName) -> Arc<RwLock<()>> {
        self.locks
            .entry(name.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn release_hook(&self) -> Option<Box<dyn FnOnce() + Send + Sync>> {
        let stats = self.stats.clone();
        Some(Box::new(move || {
            stats.released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

#[async_trait]
impl ActionModel for InMemoryActionModel {
    fn get_raw(&self, name: &ActionName) -> Option<Arc<Declaration>> {
        self.declarations.get(name).map(|d| d.clone())
    }

    fn get_inherited(&self, name: &ActionName) -> Option<Arc<Declaration>> {
        let decl = self.get_raw(name)?;
        let Some(mut parent_name) = decl.extends.clone() else {
            return Some(decl);
        };

        let mut visited = HashSet::from([name.clone()]);
        let mut inherited = Vec::new();
        loop {
            if !visited.insert(parent_name.clone()) {
                break;
            }
            let Some(parent) = self.get_raw(&parent_name) else {
                break;
            };
            let mut params = parent.parameters.clone();
            params.extend(inherited);
            inherited = params;
            match &parent.extends {
                Some(next) => parent_name = next.clone(),
                None => break,
            }
        }

        let mut flattened = (*decl).clone();
        inherited.extend(flattened.parameters);
        flattened.parameters = inherited;
        Some(Arc::new(flattened))
    }

    fn add(&self, decl: Declaration) -> Arc<Declaration> {
        let decl = Arc::new(decl);
        self.declarations.insert(decl.name.clone(), decl.clone());
        decl
    }

    fn remove(&self, name: &ActionName) -> Option<Arc<Declaration>> {
        self.declarations.remove(name).map(|(_, d)| d)
    }

    fn names(&self) -> Vec<ActionName> {
        self.declarations.iter().map(|e| e.key().clone()).collect()
    }

    async fn read_lock(&self, name: &ActionName) -> ModelLockGuard {
        let guard = self.lock_for(name).read_owned().await;
        self.stats.acquired.fetch_add(1, Ordering::SeqCst);
        trace!(name = %name, "Model read lock acquired");
        ModelLockGuard::new(name.clone(), LockMode::Read, guard, self.release_hook())
    }

    async fn write_lock(&self, name: &ActionName) -> ModelLockGuard {
        let guard = self.lock_for(name).write_owned().await;
        self.stats.acquired.fetch_add(1, Ordering::SeqCst);
        trace!(name = %name, "Model write lock acquired");
        ModelLockGuard::new(name.clone(), LockMode::Write, guard, self.release_hook())
    }
}
