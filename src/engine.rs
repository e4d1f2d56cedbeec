//! Execution engine collaborator.
//!
//! The engine interprets action bodies; the mediator hands it tasks, receives
//! completion callbacks through [`TaskListener`], relays delegated calls through
//! [`TaskExecutor`] and answers breakpoints through [`StepHandler`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::errors::{ExecutionError, MediatorError, Result};
use crate::model::declaration::Declaration;
use crate::model::names::{ActionName, TransactionUid};

/// Variable bindings visible at a breakpoint
pub type Bindings = BTreeMap<String, Value>;

/// Bindings shared between a paused execution and the debugger
pub type SharedBindings = Arc<Mutex<Bindings>>;

pub fn shared_bindings(bindings: Bindings) -> SharedBindings {
    Arc::new(Mutex::new(bindings))
}

/// Numeric failure code reported by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineErrorCode(pub i32);

impl EngineErrorCode {
    pub const INTERNAL: Self = Self(-1);
    /// The task was aborted, usually by a cancel request
    pub const ABORTED: Self = Self(-2);
    pub const PARSE: Self = Self(-3);
    pub const REJECTED: Self = Self(-4);
}

impl fmt::Display for EngineErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw failure object produced by the engine
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("engine failure {code}: {message}")]
pub struct EngineFailure {
    pub code: EngineErrorCode,
    pub message: String,
}

impl EngineFailure {
    pub fn new(code: EngineErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(EngineErrorCode::ABORTED, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(EngineErrorCode::PARSE, message)
    }

    pub fn is_aborted(&self) -> bool {
        self.code == EngineErrorCode::ABORTED
    }
}

impl From<EngineFailure> for MediatorError {
    fn from(failure: EngineFailure) -> Self {
        if failure.code == EngineErrorCode::PARSE {
            MediatorError::parse(failure.message)
        } else {
            MediatorError::engine(Some(failure.code.0), failure.message)
        }
    }
}

/// Whatever the engine hands to a failure callback
#[derive(Clone, Debug)]
pub enum FailureReason {
    /// Already a structured mediator error, e.g. relayed from another mediator
    Error(ExecutionError),
    Engine(EngineFailure),
    /// Any other object, rendered as text
    Other(String),
    /// The engine supplied no reason at all
    Missing,
}

impl From<EngineFailure> for FailureReason {
    fn from(failure: EngineFailure) -> Self {
        FailureReason::Engine(failure)
    }
}

impl From<ExecutionError> for FailureReason {
    fn from(error: ExecutionError) -> Self {
        FailureReason::Error(error)
    }
}

/// Engine-internal stack frame: an engine symbol plus instruction offset
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineFrame {
    pub symbol: String,
    pub offset: u32,
}

impl EngineFrame {
    pub fn new(symbol: impl Into<String>, offset: u32) -> Self {
        Self {
            symbol: symbol.into(),
            offset,
        }
    }
}

/// Engine's own step vocabulary
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StepCommand {
    Into,
    Over,
    Out,
    Resume,
    Terminate,
}

impl Default for StepCommand {
    fn default() -> Self {
        StepCommand::Over
    }
}

/// Completion callbacks for one task. Called from arbitrary engine threads.
pub trait TaskListener: Send + Sync {
    /// `results` is aligned with the action signature; only output positions
    /// are read. Returns true.
    fn on_success(&self, results: Vec<Option<Value>>) -> bool;

    /// Returns false, per the engine's calling convention.
    fn on_failure(&self, reason: FailureReason, frames: Vec<EngineFrame>) -> bool;

    /// Listener for a nested call the engine runs on behalf of this task
    fn create_sub_task_listener(
        &self,
        uid: TransactionUid,
        action: ActionName,
        args: Vec<Value>,
    ) -> Arc<dyn TaskListener>;

    fn transaction_uid(&self) -> Option<TransactionUid> {
        None
    }
}

/// A call the engine delegates to an executor registered for its action
pub struct SubTaskRequest {
    pub uid: TransactionUid,
    pub parent_uid: Option<TransactionUid>,
    pub action: ActionName,
    pub args: Vec<Value>,
    pub stepped: bool,
    pub listener: Arc<dyn TaskListener>,
}

impl fmt::Debug for SubTaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubTaskRequest")
            .field("uid", &self.uid)
            .field("parent_uid", &self.parent_uid)
            .field("action", &self.action)
            .field("args", &self.args)
            .field("stepped", &self.stepped)
            .finish()
    }
}

/// Runner for actions the engine cannot execute itself
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, request: SubTaskRequest) -> Result<()>;
}

/// Breakpoint callbacks for stepped executions
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Called when a stepped execution pauses. The engine waits for the
    /// returned command; `arguments` may be rewritten in place.
    async fn handle_step(
        &self,
        uid: &TransactionUid,
        current: &ActionName,
        offset: u32,
        bindings: SharedBindings,
        callee: Option<&ActionName>,
        arguments: &mut Vec<Value>,
    ) -> StepCommand;

    fn handle_failure(&self, uid: &TransactionUid, reason: &FailureReason);
}

/// Everything the engine needs to start one task
pub struct TaskStart {
    pub listener: Arc<dyn TaskListener>,
    pub uid: TransactionUid,
    pub action: ActionName,
    pub args: Vec<Value>,
    pub parent_listener: Option<Arc<dyn TaskListener>>,
    pub stepped: bool,
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Begin running a task; completion arrives through the listener
    async fn start_task(&self, task: TaskStart) -> std::result::Result<(), EngineFailure>;

    /// Ask the engine to abort a running task. Returns false if unknown.
    fn cancel_task(&self, uid: &TransactionUid) -> bool;

    fn register_task_executor(&self, action: &ActionName, executor: Arc<dyn TaskExecutor>);

    fn unregister_task_executor(&self, action: &ActionName);

    fn has_task_executor(&self, action: &ActionName) -> bool;

    fn add_task_definition(&self, decl: &Declaration) -> std::result::Result<(), EngineFailure>;

    fn remove_task_definition(&self, action: &ActionName);

    /// Actions the engine already knows, e.g. after running a bootstrap file
    fn defined_actions(&self) -> Vec<ActionName>;

    fn set_step_handler(&self, handler: Option<Arc<dyn StepHandler>>);

    async fn evaluate_expression(
        &self,
        expression: &str,
        bindings: &Bindings,
    ) -> std::result::Result<Value, EngineFailure>;

    /// Parse an unbound procedure body into a declaration
    fn parse_procedure(&self, source: &str) -> std::result::Result<Declaration, EngineFailure>;

    /// Merge the constraints of the given declarations into one expression
    async fn merge_constraints(
        &self,
        decls: &[Arc<Declaration>],
    ) -> std::result::Result<String, EngineFailure>;

    async fn run_bootstrap(&self, path: &Path) -> std::result::Result<(), EngineFailure>;

    /// Map an engine symbol from a stack frame back to its action name
    fn action_for_symbol(&self, symbol: &str) -> Option<ActionName> {
        ActionName::parse(symbol).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_failure_maps_to_parse_error() {
        let err: MediatorError = EngineFailure::parse("unexpected ')'").into();
        assert!(matches!(err, MediatorError::Parse { .. }));

        let err: MediatorError = EngineFailure::new(EngineErrorCode::REJECTED, "busy").into();
        match err {
            MediatorError::Engine { code, .. } => assert_eq!(code, Some(-4)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_default_step_is_over() {
        assert_eq!(StepCommand::default(), StepCommand::Over);
    }
}
