//! The mediator: owns every component and wires them to the bus and engine.

pub mod constraints;
pub mod correlator;
pub mod debugger;
pub mod dispatcher;
pub mod init;
pub mod locking;
pub mod pool;
pub mod resolver;
pub mod watcher;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::bus::messages::{BusMessage, Topic};
use crate::bus::serial::SerialClient;
use crate::bus::transport::{MessageBus, SubscriptionId};
use crate::core::config::MediatorConfig;
use crate::core::errors::{MediatorError, Result};
use crate::engine::ExecutionEngine;
use crate::model::declaration::{Declaration, DeclarationKind};
use crate::model::names::{ActionName, TransactionUid};
use crate::model::registry::{ActionModel, InMemoryActionModel};

pub use constraints::ConstraintCoalescer;
pub use correlator::{ExecutionRecord, ResultCorrelator};
pub use debugger::StepController;
pub use dispatcher::RequestDispatcher;
pub use init::{InitState, OneShotInitializer};
pub use locking::{LockRelease, LockingFacade};
pub use pool::WorkerPool;
pub use resolver::{
    BusDeclarationFetcher, DeclarationFetcher, DeclarationProvider, DependencyClosure,
    DependencyResolver, LocalOnly,
};
pub use watcher::{ExecutionStatusWatcher, PendingWatch, RemoteTaskRelay};

/// State shared by every component of one mediator instance
pub(crate) struct MediatorContext {
    pub(crate) config: MediatorConfig,
    pub(crate) bus: Arc<dyn MessageBus>,
    pub(crate) engine: Arc<dyn ExecutionEngine>,
    pub(crate) model: Arc<dyn ActionModel>,
    pub(crate) resolver: DependencyResolver,
    pub(crate) locking: LockingFacade,
    pub(crate) initializer: OneShotInitializer,
    pub(crate) serials: SerialClient,
    pub(crate) runtime: Handle,
    /// Open execution records by uid
    pub(crate) records: DashMap<TransactionUid, Arc<ResultCorrelator>>,
    /// Declarations last handed to the engine
    definitions: DashMap<ActionName, Arc<Declaration>>,
}

impl MediatorContext {
    /// Bus failures are logged and swallowed; there is nobody to retry for
    pub(crate) async fn send_best_effort(&self, message: BusMessage) {
        let topic = message.topic();
        if let Err(e) = self.bus.send(message).await {
            warn!(topic = %topic, error = %e, "Bus send failed, message dropped");
        }
    }

    /// Give `decl` to the engine unless that exact declaration is already there
    ///
    /// The engine always gets the declaration as the model stores it, so a
    /// target passed with inherited parameters and the same name passed raw
    /// as a dependency count as one definition.
    pub(crate) fn ensure_defined(&self, decl: &Arc<Declaration>) -> Result<()> {
        if decl.kind == DeclarationKind::Predefined {
            return Ok(());
        }
        let raw = self.model.get_raw(&decl.name).unwrap_or_else(|| decl.clone());
        if let Some(current) = self.definitions.get(&raw.name) {
            if Arc::ptr_eq(current.value(), &raw) || current.value().as_ref() == raw.as_ref() {
                return Ok(());
            }
        }
        self.engine.add_task_definition(&raw)?;
        debug!(name = %raw.name, kind = ?raw.kind, "Definition added to engine");
        self.definitions.insert(raw.name.clone(), raw);
        Ok(())
    }

    /// Declaration with inherited parameters, fetching it if the model lacks it
    pub(crate) async fn lookup_declaration(&self, name: &ActionName) -> Result<Arc<Declaration>> {
        if let Some(decl) = self.model.get_inherited(name) {
            return Ok(decl);
        }
        self.resolver.resolve(&name.to_string(), true).await?;
        self.model
            .get_inherited(name)
            .ok_or_else(|| MediatorError::missing_dependency(name.to_string()))
    }
}

/// Builder for [`Mediator`]
pub struct MediatorBuilder {
    config: MediatorConfig,
    bus: Arc<dyn MessageBus>,
    engine: Arc<dyn ExecutionEngine>,
    model: Option<Arc<dyn ActionModel>>,
    fetcher: Option<Arc<dyn DeclarationFetcher>>,
}

impl MediatorBuilder {
    pub fn new(
        config: MediatorConfig,
        bus: Arc<dyn MessageBus>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Self {
        Self {
            config,
            bus,
            engine,
            model: None,
            fetcher: None,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn ActionModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Defaults to fetching over the bus
    pub fn with_fetcher(mut self, fetcher: Arc<dyn DeclarationFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Must be called inside a tokio runtime; the pools run on it
    pub fn build(self) -> Result<Mediator> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|e| {
            MediatorError::configuration(format!("mediator needs a tokio runtime: {}", e))
        })?;

        let model: Arc<dyn ActionModel> = match self.model {
            Some(model) => model,
            None => Arc::new(InMemoryActionModel::new()),
        };
        let fetcher: Arc<dyn DeclarationFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(BusDeclarationFetcher::new(
                self.bus.clone(),
                self.config.reply_timeout(),
            )),
        };
        let resolver = DependencyResolver::new(model.clone(), fetcher);
        let serials = SerialClient::new(self.bus.clone(), self.config.reply_timeout());

        let ctx = Arc::new(MediatorContext {
            locking: LockingFacade::new(resolver.clone()),
            resolver,
            initializer: OneShotInitializer::new(),
            serials,
            runtime: runtime.clone(),
            records: DashMap::new(),
            definitions: DashMap::new(),
            model,
            bus: self.bus,
            engine: self.engine,
            config: self.config,
        });

        let name = &ctx.config.name;
        let dispatch_pool = Arc::new(WorkerPool::new(
            format!("{}-dispatch", name),
            ctx.config.dispatch_workers,
            runtime.clone(),
        ));
        let relay_pool = Arc::new(WorkerPool::new(
            format!("{}-relay", name),
            ctx.config.relay_workers,
            runtime.clone(),
        ));
        let constraint_pool = Arc::new(WorkerPool::new(
            format!("{}-constraints", name),
            ctx.config.constraint_workers,
            runtime,
        ));

        let watcher = Arc::new(ExecutionStatusWatcher::new());
        let debugger = Arc::new(StepController::new(
            ctx.bus.clone(),
            ctx.engine.clone(),
            ctx.config.breakpoint_timeout(),
        ));
        let relay = Arc::new(RemoteTaskRelay::new(
            ctx.clone(),
            watcher.clone(),
            relay_pool.clone(),
        ));

        Ok(Mediator {
            dispatcher: Arc::new(RequestDispatcher::new(ctx.clone(), dispatch_pool.clone())),
            coalescer: Arc::new(ConstraintCoalescer::new(ctx.clone(), constraint_pool.clone())),
            ctx,
            pools: vec![dispatch_pool, relay_pool, constraint_pool],
            watcher,
            debugger,
            relay,
            relayed: Mutex::new(HashSet::new()),
            subscriptions: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

/// One mediator instance: claims the namespaces in its config and executes
/// their actions on the engine
pub struct Mediator {
    ctx: Arc<MediatorContext>,
    pools: Vec<Arc<WorkerPool>>,
    dispatcher: Arc<RequestDispatcher>,
    coalescer: Arc<ConstraintCoalescer>,
    watcher: Arc<ExecutionStatusWatcher>,
    debugger: Arc<StepController>,
    relay: Arc<RemoteTaskRelay>,
    relayed: Mutex<HashSet<ActionName>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    started: AtomicBool,
}

impl Mediator {
    pub fn builder(
        config: MediatorConfig,
        bus: Arc<dyn MessageBus>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> MediatorBuilder {
        MediatorBuilder::new(config, bus, engine)
    }

    pub fn name(&self) -> &str {
        &self.ctx.config.name
    }

    pub fn config(&self) -> &MediatorConfig {
        &self.ctx.config
    }

    pub fn model(&self) -> &Arc<dyn ActionModel> {
        &self.ctx.model
    }

    pub fn watcher(&self) -> &Arc<ExecutionStatusWatcher> {
        &self.watcher
    }

    pub fn step_controller(&self) -> &Arc<StepController> {
        &self.debugger
    }

    pub fn init_state(&self) -> InitState {
        self.ctx.initializer.state()
    }

    /// Uids of executions that have not yet reported a terminal status
    pub fn active_transactions(&self) -> Vec<TransactionUid> {
        self.ctx.records.iter().map(|e| e.key().clone()).collect()
    }

    /// Subscribe to every topic the mediator serves and install the step handler
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MediatorError::configuration(format!(
                "mediator {} already started",
                self.name()
            )));
        }
        let bus = &self.ctx.bus;
        let mut ids = vec![
            bus.subscribe(Topic::ExecuteRequest, self.dispatcher.clone())?,
            bus.subscribe(Topic::CancelRequest, self.dispatcher.clone())?,
            bus.subscribe(Topic::ExprEvalRequest, self.debugger.clone())?,
            bus.subscribe(Topic::ConstraintRequest, self.coalescer.clone())?,
        ];
        for topic in Topic::EXECUTION_STATUS {
            ids.push(bus.subscribe(topic, self.watcher.clone())?);
        }
        if self.ctx.config.serve_declarations {
            ids.push(bus.subscribe(
                Topic::DeclarationRequest,
                Arc::new(DeclarationProvider::new(self.ctx.model.clone())),
            )?);
        }
        self.ctx.engine.set_step_handler(Some(self.debugger.clone()));

        info!(
            mediator = %self.name(),
            namespaces = ?self.ctx.config.namespaces,
            subscriptions = ids.len(),
            "Mediator started"
        );
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(ids);
        Ok(())
    }

    /// Run the one-time preload now instead of on the first request
    pub async fn ensure_initialized(&self) -> Result<()> {
        self.ctx.ensure_initialized().await
    }

    /// Add or replace a declaration while no execution holds its lock
    pub async fn load_declaration(&self, decl: Declaration) -> Result<Arc<Declaration>> {
        let name = decl.name.clone();
        let _guard = self.ctx.model.write_lock(&name).await;
        let decl = self.ctx.model.add(decl);
        self.ctx.ensure_defined(&decl)?;
        info!(name = %name, kind = ?decl.kind, "Declaration loaded");
        Ok(decl)
    }

    pub async fn unload_declaration(&self, name: &ActionName) -> Option<Arc<Declaration>> {
        let _guard = self.ctx.model.write_lock(name).await;
        let removed = self.ctx.model.remove(name)?;
        if self.ctx.definitions.remove(name).is_some() {
            self.ctx.engine.remove_task_definition(name);
        }
        info!(name = %name, "Declaration unloaded");
        Some(removed)
    }

    /// Closure of `name` as the dispatcher would lock it
    pub async fn closure_for(&self, name: &ActionName) -> Result<DependencyClosure> {
        let decl = self.ctx.lookup_declaration(name).await?;
        self.ctx.resolver.closure(decl).await
    }

    /// Have the engine delegate calls to `name` to whichever mediator claims it
    pub fn relay_action(&self, name: ActionName) {
        self.ctx
            .engine
            .register_task_executor(&name, self.relay.clone());
        debug!(name = %name, "Relaying action over the bus");
        self.relayed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name);
    }

    pub fn unrelay_action(&self, name: &ActionName) -> bool {
        let removed = self
            .relayed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        if removed {
            self.ctx.engine.unregister_task_executor(name);
        }
        removed
    }

    /// Unsubscribe everything, drop relays and wait for in-flight jobs
    pub async fn shutdown(&self) {
        let ids: Vec<SubscriptionId> = std::mem::take(
            &mut *self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for id in ids {
            self.ctx.bus.unsubscribe(id);
        }
        let relayed: Vec<ActionName> = self
            .relayed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for name in relayed {
            self.ctx.engine.unregister_task_executor(&name);
        }
        self.ctx.engine.set_step_handler(None);

        for pool in &self.pools {
            pool.shutdown().await;
        }
        if !self.ctx.records.is_empty() {
            warn!(
                mediator = %self.name(),
                open = self.ctx.records.len(),
                "Shut down with executions still open"
            );
        }
        info!(mediator = %self.name(), "Mediator stopped");
    }
}

impl std::fmt::Debug for Mediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mediator")
            .field("name", &self.ctx.config.name)
            .field("namespaces", &self.ctx.config.namespaces)
            .field("active", &self.ctx.records.len())
            .finish()
    }
}
