//! Shared fixtures for the mediator integration tests: a scripted execution
//! engine, a harness that wires a mediator to an in-process bus, and helpers
//! for reading back the statuses a transaction produced.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use action_mediator::bus::{
    BusMessage, ExecuteRequest, InProcessBus, MessageBus, SerialNumberAuthority,
};
use action_mediator::core::errors::Result;
use action_mediator::engine::{
    shared_bindings, Bindings, EngineErrorCode, EngineFailure, EngineFrame, ExecutionEngine,
    FailureReason, StepCommand, StepHandler, SubTaskRequest, TaskExecutor, TaskListener, TaskStart,
};
use action_mediator::mediator::{LocalOnly, Mediator};
use action_mediator::model::{
    ActionName, Declaration, InMemoryActionModel, Parameter, TransactionUid,
};
use action_mediator::MediatorConfig;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

pub fn robot(name: &str) -> ActionName {
    ActionName::new("robot", name)
}

pub fn vision(name: &str) -> ActionName {
    ActionName::new("vision", name)
}

/// What the fake engine does when asked to start an action
#[derive(Clone)]
pub enum Script {
    /// Report success with a signature-aligned result list
    Succeed(Vec<Option<Value>>),
    /// Report a failure with the given frames
    Fail(EngineFailure, Vec<EngineFrame>),
    /// Refuse to start the task at all
    Reject(EngineFailure),
    /// Run until cancelled, then report an abort
    Hang,
    /// Call `callee` through its registered executor and finish with its result
    Delegate { callee: ActionName, args: Vec<Value> },
    /// Pause once at a breakpoint, then succeed unless told to terminate
    Breakpoint { offset: u32, args: Vec<Value> },
    /// Report success and then failure for the same task; with `racing`
    /// both callbacks run at once on separate tasks
    ReportTwice {
        results: Vec<Option<Value>>,
        failure: EngineFailure,
        racing: bool,
    },
}

#[derive(Clone, Debug)]
pub struct StepRecord {
    pub uid: TransactionUid,
    pub command: StepCommand,
    pub arguments: Vec<Value>,
}

/// Executor for actions the fake engine treats as built in
struct NativeExecutor;

impl TaskExecutor for NativeExecutor {
    fn execute(&self, request: SubTaskRequest) -> Result<()> {
        let listener = request.listener;
        let args = request.args;
        tokio::spawn(async move {
            listener.on_success(args.into_iter().map(Some).collect());
        });
        Ok(())
    }
}

/// Finishes a sub-task, then its parent with the same results
struct ChainListener {
    inner: Arc<dyn TaskListener>,
    parent: Arc<dyn TaskListener>,
}

impl TaskListener for ChainListener {
    fn on_success(&self, results: Vec<Option<Value>>) -> bool {
        self.inner.on_success(results.clone());
        self.parent.on_success(results)
    }

    fn on_failure(&self, reason: FailureReason, frames: Vec<EngineFrame>) -> bool {
        self.inner.on_failure(reason.clone(), frames.clone());
        self.parent.on_failure(reason, frames)
    }

    fn create_sub_task_listener(
        &self,
        uid: TransactionUid,
        action: ActionName,
        args: Vec<Value>,
    ) -> Arc<dyn TaskListener> {
        self.inner.create_sub_task_listener(uid, action, args)
    }

    fn transaction_uid(&self) -> Option<TransactionUid> {
        self.inner.transaction_uid()
    }
}

#[derive(Default)]
pub struct FakeEngine {
    scripts: Mutex<HashMap<ActionName, Script>>,
    executors: Mutex<HashMap<ActionName, Arc<dyn TaskExecutor>>>,
    running: Mutex<HashMap<TransactionUid, Arc<dyn TaskListener>>>,
    step_handler: Mutex<Option<Arc<dyn StepHandler>>>,
    pub definitions: Mutex<Vec<ActionName>>,
    pub removed: Mutex<Vec<ActionName>>,
    pub started: Mutex<Vec<TransactionUid>>,
    pub steps: Arc<Mutex<Vec<StepRecord>>>,
    pub predefined: Mutex<Vec<ActionName>>,
    pub bootstrap_runs: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, action: ActionName, script: Script) {
        self.scripts.lock().unwrap().insert(action, script);
    }

    /// Give `action` an executor that echoes its arguments back
    pub fn native(&self, action: ActionName) {
        self.executors
            .lock()
            .unwrap()
            .insert(action, Arc::new(NativeExecutor));
    }

    pub fn is_running(&self, uid: &TransactionUid) -> bool {
        self.running.lock().unwrap().contains_key(uid)
    }

    pub fn defined(&self) -> HashSet<ActionName> {
        self.definitions.lock().unwrap().iter().cloned().collect()
    }

    fn executor(&self, action: &ActionName) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.lock().unwrap().get(action).cloned()
    }
}

#[async_trait]
impl ExecutionEngine for FakeEngine {
    async fn start_task(&self, task: TaskStart) -> std::result::Result<(), EngineFailure> {
        self.started.lock().unwrap().push(task.uid.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&task.action)
            .cloned()
            .unwrap_or(Script::Succeed(Vec::new()));

        let listener = task.listener;
        match script {
            Script::Succeed(results) => {
                tokio::spawn(async move {
                    listener.on_success(results);
                });
            }
            Script::Fail(failure, frames) => {
                tokio::spawn(async move {
                    listener.on_failure(FailureReason::Engine(failure), frames);
                });
            }
            Script::Reject(failure) => return Err(failure),
            Script::Hang => {
                self.running.lock().unwrap().insert(task.uid, listener);
            }
            Script::Delegate { callee, args } => {
                let Some(executor) = self.executor(&callee) else {
                    return Err(EngineFailure::new(
                        EngineErrorCode::INTERNAL,
                        format!("no executor for {}", callee),
                    ));
                };
                let sub_uid = TransactionUid::generate();
                let sub = listener.create_sub_task_listener(sub_uid.clone(), callee.clone(), args.clone());
                let chained = Arc::new(ChainListener {
                    inner: sub,
                    parent: listener,
                });
                executor
                    .execute(SubTaskRequest {
                        uid: sub_uid,
                        parent_uid: Some(task.uid),
                        action: callee,
                        args,
                        stepped: task.stepped,
                        listener: chained,
                    })
                    .map_err(|e| EngineFailure::new(EngineErrorCode::INTERNAL, e.to_string()))?;
            }
            Script::ReportTwice {
                results,
                failure,
                racing,
            } => {
                if racing {
                    let other = listener.clone();
                    tokio::spawn(async move {
                        other.on_failure(FailureReason::Engine(failure), Vec::new());
                    });
                    tokio::spawn(async move {
                        listener.on_success(results);
                    });
                } else {
                    tokio::spawn(async move {
                        listener.on_success(results);
                        listener.on_failure(FailureReason::Engine(failure), Vec::new());
                    });
                }
            }
            Script::Breakpoint { offset, args } => {
                let handler = self.step_handler.lock().unwrap().clone();
                let uid = task.uid;
                let action = task.action;
                let stepped = task.stepped;
                let steps = self.steps.clone();
                tokio::spawn(async move {
                    let mut arguments = args;
                    let command = match (stepped, handler) {
                        (true, Some(handler)) => {
                            let bindings = shared_bindings(Bindings::from([(
                                "x".to_string(),
                                json!(1),
                            )]));
                            handler
                                .handle_step(&uid, &action, offset, bindings, None, &mut arguments)
                                .await
                        }
                        _ => StepCommand::Resume,
                    };
                    steps.lock().unwrap().push(StepRecord {
                        uid,
                        command,
                        arguments: arguments.clone(),
                    });
                    if command == StepCommand::Terminate {
                        listener.on_failure(
                            FailureReason::Engine(EngineFailure::aborted("terminated at breakpoint")),
                            vec![EngineFrame::new(action.to_string(), offset)],
                        );
                    } else {
                        listener.on_success(arguments.into_iter().map(Some).collect());
                    }
                });
            }
        }
        Ok(())
    }

    fn cancel_task(&self, uid: &TransactionUid) -> bool {
        let Some(listener) = self.running.lock().unwrap().remove(uid) else {
            return false;
        };
        tokio::spawn(async move {
            listener.on_failure(
                FailureReason::Engine(EngineFailure::aborted("cancelled by request")),
                Vec::new(),
            );
        });
        true
    }

    fn register_task_executor(&self, action: &ActionName, executor: Arc<dyn TaskExecutor>) {
        self.executors
            .lock()
            .unwrap()
            .insert(action.clone(), executor);
    }

    fn unregister_task_executor(&self, action: &ActionName) {
        self.executors.lock().unwrap().remove(action);
    }

    fn has_task_executor(&self, action: &ActionName) -> bool {
        self.executors.lock().unwrap().contains_key(action)
    }

    fn add_task_definition(&self, decl: &Declaration) -> std::result::Result<(), EngineFailure> {
        if decl.body.as_deref() == Some("syntax error") {
            return Err(EngineFailure::parse(format!("cannot compile {}", decl.name)));
        }
        self.definitions.lock().unwrap().push(decl.name.clone());
        Ok(())
    }

    fn remove_task_definition(&self, action: &ActionName) {
        self.removed.lock().unwrap().push(action.clone());
    }

    fn defined_actions(&self) -> Vec<ActionName> {
        self.predefined.lock().unwrap().clone()
    }

    fn set_step_handler(&self, handler: Option<Arc<dyn StepHandler>>) {
        *self.step_handler.lock().unwrap() = handler;
    }

    async fn evaluate_expression(
        &self,
        expression: &str,
        bindings: &Bindings,
    ) -> std::result::Result<Value, EngineFailure> {
        if expression.starts_with('!') {
            return Err(EngineFailure::parse(format!("cannot parse '{}'", expression)));
        }
        Ok(bindings.get(expression).cloned().unwrap_or(Value::Null))
    }

    /// `ns:Name dep1 dep2 ...`
    fn parse_procedure(&self, source: &str) -> std::result::Result<Declaration, EngineFailure> {
        let mut tokens = source.split_whitespace();
        let name = tokens
            .next()
            .ok_or_else(|| EngineFailure::parse("empty procedure"))?;
        let name = ActionName::parse(name).map_err(|e| EngineFailure::parse(e.to_string()))?;
        let mut decl = Declaration::procedure(name, source);
        for dep in tokens {
            decl = decl.with_requires(dep);
        }
        Ok(decl)
    }

    async fn merge_constraints(
        &self,
        decls: &[Arc<Declaration>],
    ) -> std::result::Result<String, EngineFailure> {
        let parts: Vec<&str> = decls
            .iter()
            .filter_map(|d| d.constraints.as_deref())
            .collect();
        if parts.contains(&"unsatisfiable") {
            return Err(EngineFailure::new(
                EngineErrorCode::REJECTED,
                "constraints cannot be satisfied together",
            ));
        }
        Ok(parts.join(" && "))
    }

    async fn run_bootstrap(&self, path: &Path) -> std::result::Result<(), EngineFailure> {
        self.bootstrap_runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        if path.to_string_lossy().contains("broken") {
            return Err(EngineFailure::new(EngineErrorCode::INTERNAL, "bootstrap failed"));
        }
        Ok(())
    }
}

/// A started mediator on its own bus with a serial authority and a monitor
pub struct Harness {
    pub bus: Arc<InProcessBus>,
    pub engine: Arc<FakeEngine>,
    pub model: Arc<InMemoryActionModel>,
    pub mediator: Mediator,
    pub monitor: UnboundedReceiver<BusMessage>,
}

pub fn config(namespaces: &[&str]) -> MediatorConfig {
    let mut config = MediatorConfig::default();
    config.name = "test-mediator".to_string();
    config.namespaces = namespaces.iter().map(|s| s.to_string()).collect();
    config.reply_timeout_ms = 1_000;
    config.breakpoint_timeout_ms = 1_000;
    config
}

impl Harness {
    /// Mediator on a fresh bus that only knows the declarations it is given
    pub async fn start(config: MediatorConfig, decls: Vec<Declaration>) -> Self {
        let bus = Arc::new(InProcessBus::new());
        SerialNumberAuthority::install(bus.as_ref()).unwrap();
        Self::start_on(bus, config, decls, true).await
    }

    /// Mediator on an existing bus. Unless `local_only`, missing declarations
    /// are fetched from peers over the bus.
    pub async fn start_on(
        bus: Arc<InProcessBus>,
        config: MediatorConfig,
        decls: Vec<Declaration>,
        local_only: bool,
    ) -> Self {
        action_mediator::init_tracing_from_config(&config);
        let engine = FakeEngine::new();
        let model = Arc::new(InMemoryActionModel::with_declarations(decls));
        let monitor = bus.monitor();
        let mut builder = Mediator::builder(config, bus.clone(), engine.clone())
            .with_model(model.clone());
        if local_only {
            builder = builder.with_fetcher(Arc::new(LocalOnly));
        }
        let mediator = builder.build().unwrap();
        mediator.start().unwrap();
        Self {
            bus,
            engine,
            model,
            mediator,
            monitor,
        }
    }

    pub async fn execute(&self, action: ActionName, in_params: Vec<Value>) -> TransactionUid {
        self.execute_with(action, in_params, false).await
    }

    pub async fn execute_with(
        &self,
        action: ActionName,
        in_params: Vec<Value>,
        stepped: bool,
    ) -> TransactionUid {
        let uid = TransactionUid::generate();
        self.bus
            .send(BusMessage::ExecuteRequest(ExecuteRequest {
                uid: uid.clone(),
                parent_uid: None,
                action,
                in_params,
                stepped,
            }))
            .await
            .unwrap();
        uid
    }

    /// Statuses for `uid`, in bus order, up to and including its terminal status
    pub async fn statuses_until_terminal(&mut self, uid: &TransactionUid) -> Vec<BusMessage> {
        collect_statuses(&mut self.monitor, uid).await
    }

    /// Wait until every execution record has been closed
    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !self.mediator.active_transactions().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("executions did not settle");
    }
}

pub fn is_status(message: &BusMessage) -> bool {
    matches!(
        message,
        BusMessage::StartExecutionStatus(_)
            | BusMessage::SuccessExecutionStatus(_)
            | BusMessage::ErrorExecutionStatus(_)
            | BusMessage::IgnoredExecutionStatus(_)
    )
}

/// Execution statuses for `uid` up to its terminal one. Declines from
/// mediators that do not own the action are skipped.
pub async fn collect_statuses(
    monitor: &mut UnboundedReceiver<BusMessage>,
    uid: &TransactionUid,
) -> Vec<BusMessage> {
    let mut seen = Vec::new();
    let finished = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(message) = monitor.recv().await {
            if !is_status(&message) || message.uid() != Some(uid) {
                continue;
            }
            let done = message.is_terminal_status();
            seen.push(message);
            if done {
                break;
            }
        }
    })
    .await;
    assert!(finished.is_ok(), "no terminal status for {uid}; saw {seen:?}");
    seen
}

/// Wait for a decline of `uid`
pub async fn wait_declined(monitor: &mut UnboundedReceiver<BusMessage>, uid: &TransactionUid) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(message) = monitor.recv().await {
            if matches!(&message, BusMessage::RequestIgnored(r) if &r.uid == uid) {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{uid} was never declined"));
}

pub fn topics(messages: &[BusMessage]) -> Vec<&'static str> {
    messages.iter().map(|m| m.topic().as_str()).collect()
}

pub fn point() -> Declaration {
    Declaration::type_decl(ActionName::new("geo", "Point"))
        .with_param(Parameter::input("x", "float"))
        .with_param(Parameter::input("y", "float"))
}
