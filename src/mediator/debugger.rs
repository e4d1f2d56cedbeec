//! Step/debug controller: breakpoint round trips and expression evaluation
//! against paused executions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bus::messages::{
    BreakpointNotify, BreakpointResponse, BusMessage, DebugCommand, ExprEvalRequest,
    ExprEvalResult,
};
use crate::bus::transport::{Delivery, MessageBus, MessageHandler};
use crate::core::errors::{ExecutionError, MediatorError};
use crate::engine::{
    shared_bindings, Bindings, ExecutionEngine, FailureReason, SharedBindings, StepCommand,
    StepHandler,
};
use crate::model::names::{ActionName, TransactionUid};

impl From<DebugCommand> for StepCommand {
    fn from(command: DebugCommand) -> Self {
        match command {
            DebugCommand::StepInto => StepCommand::Into,
            DebugCommand::StepOver => StepCommand::Over,
            DebugCommand::StepOut => StepCommand::Out,
            DebugCommand::Continue => StepCommand::Resume,
            DebugCommand::Abort => StepCommand::Terminate,
        }
    }
}

pub struct StepController {
    bus: Arc<dyn MessageBus>,
    engine: Arc<dyn ExecutionEngine>,
    timeout: Duration,
    /// Live bindings of paused executions
    sessions: DashMap<TransactionUid, SharedBindings>,
}

impl StepController {
    pub fn new(bus: Arc<dyn MessageBus>, engine: Arc<dyn ExecutionEngine>, timeout: Duration) -> Self {
        Self {
            bus,
            engine,
            timeout,
            sessions: DashMap::new(),
        }
    }

    pub fn paused(&self) -> Vec<TransactionUid> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    fn apply_overrides(uid: &TransactionUid, response: &BreakpointResponse, arguments: &mut [Value]) {
        for change in &response.args {
            match arguments.get_mut(change.index) {
                Some(slot) => *slot = change.value.clone(),
                None => warn!(
                    uid = %uid,
                    index = change.index,
                    arity = arguments.len(),
                    "Argument override out of range, skipped"
                ),
            }
        }
    }

    /// Evaluate every expression in order against `bindings`; stops at the first failure
    async fn evaluate_all(
        &self,
        expressions: &[String],
        bindings: &Bindings,
    ) -> Result<Vec<Value>, ExecutionError> {
        let mut values = Vec::with_capacity(expressions.len());
        for expression in expressions {
            let value = self
                .engine
                .evaluate_expression(expression, bindings)
                .await
                .map_err(|failure| MediatorError::from(failure).to_execution_error())?;
            values.push(value);
        }
        Ok(values)
    }

    /// `None` when the request names an execution that is not paused here;
    /// another mediator on the bus may hold it.
    async fn evaluate(&self, request: ExprEvalRequest) -> Option<ExprEvalResult> {
        let bindings = match &request.procedure_uid {
            Some(uid) => match self.sessions.get(uid) {
                Some(session) => session.value().clone(),
                None => {
                    debug!(uid = %uid, "Execution not paused here, leaving evaluation to peers");
                    return None;
                }
            },
            None => shared_bindings(Bindings::new()),
        };

        let snapshot = {
            let mut live = bindings.lock().unwrap_or_else(|e| e.into_inner());
            live.extend(request.bindings_changes);
            live.clone()
        };
        Some(ExprEvalResult {
            result: self.evaluate_all(&request.expressions, &snapshot).await,
        })
    }
}

#[async_trait]
impl StepHandler for StepController {
    async fn handle_step(
        &self,
        uid: &TransactionUid,
        current: &ActionName,
        offset: u32,
        bindings: SharedBindings,
        callee: Option<&ActionName>,
        arguments: &mut Vec<Value>,
    ) -> StepCommand {
        self.sessions.insert(uid.clone(), bindings);
        let notify = BusMessage::BreakpointNotify(BreakpointNotify {
            uid: uid.clone(),
            action: current.clone(),
            offset,
            callee: callee.cloned(),
            arguments: arguments.clone(),
        });
        info!(uid = %uid, action = %current, offset, "Breakpoint hit");
        let reply = self.bus.send_and_get_reply(notify, self.timeout).await;
        self.sessions.remove(uid);

        match reply {
            Ok(BusMessage::BreakpointResponse(response)) => {
                Self::apply_overrides(uid, &response, arguments);
                let command = StepCommand::from(response.command);
                debug!(uid = %uid, command = ?command, "Resuming from breakpoint");
                command
            }
            Ok(other) => {
                warn!(uid = %uid, topic = %other.topic(), "Unexpected breakpoint reply, stepping over");
                StepCommand::default()
            }
            Err(e) => {
                warn!(uid = %uid, error = %e, "Breakpoint round trip failed, stepping over");
                StepCommand::default()
            }
        }
    }

    fn handle_failure(&self, uid: &TransactionUid, reason: &FailureReason) {
        // reported through the execution's correlator
        debug!(uid = %uid, reason = ?reason, "Failure while stepping");
    }
}

#[async_trait]
impl MessageHandler for StepController {
    async fn handle(&self, delivery: Delivery) {
        let (message, replier) = delivery.into_parts();
        let BusMessage::ExprEvalRequest(request) = message else {
            return;
        };
        let Some(replier) = replier else {
            warn!("Expression evaluation sent without reply channel");
            return;
        };
        if let Some(result) = self.evaluate(request).await {
            replier.reply(BusMessage::ExprEvalResult(result));
        }
    }
}
