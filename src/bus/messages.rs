//! Message kinds exchanged over the bus.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::ExecutionError;
use crate::model::declaration::Declaration;
use crate::model::names::{ActionName, TransactionUid};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub uid: TransactionUid,
    pub parent_uid: Option<TransactionUid>,
    pub action: ActionName,
    pub in_params: Vec<Value>,
    #[serde(default)]
    pub stepped: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub uid: TransactionUid,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartExecutionStatus {
    pub uid: TransactionUid,
    pub parent_uid: Option<TransactionUid>,
    pub action: ActionName,
    pub serial: u64,
    pub in_params: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuccessExecutionStatus {
    pub uid: TransactionUid,
    pub parent_uid: Option<TransactionUid>,
    pub in_params: Vec<Value>,
    /// Full-arity list: inputs echoed at input positions, results at output positions
    pub out_params: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorExecutionStatus {
    pub uid: TransactionUid,
    pub parent_uid: Option<TransactionUid>,
    pub error: ExecutionError,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IgnoredExecutionStatus {
    pub uid: TransactionUid,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestIgnored {
    pub uid: TransactionUid,
    pub parent_uid: Option<TransactionUid>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerialNumberRequest {
    pub uid: TransactionUid,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerialNumberResponse {
    pub uid: TransactionUid,
    pub serial: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakpointNotify {
    pub uid: TransactionUid,
    pub action: ActionName,
    pub offset: u32,
    pub callee: Option<ActionName>,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

/// Command chosen by the remote debugger
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugCommand {
    StepInto,
    StepOver,
    StepOut,
    Continue,
    Abort,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArgumentOverride {
    pub index: usize,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakpointResponse {
    pub command: DebugCommand,
    #[serde(default)]
    pub args: Vec<ArgumentOverride>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExprEvalRequest {
    pub procedure_uid: Option<TransactionUid>,
    #[serde(default)]
    pub bindings_changes: BTreeMap<String, Value>,
    pub expressions: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExprEvalResult {
    pub result: Result<Vec<Value>, ExecutionError>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstraintRequest {
    pub procedure_source: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstraintResult {
    pub result: Result<String, ExecutionError>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeclarationRequest {
    pub name: ActionName,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeclarationResponse {
    pub name: ActionName,
    pub declaration: Option<Declaration>,
}

/// Every message kind carried by the bus
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    ExecuteRequest(ExecuteRequest),
    CancelRequest(CancelRequest),
    StartExecutionStatus(StartExecutionStatus),
    SuccessExecutionStatus(SuccessExecutionStatus),
    ErrorExecutionStatus(ErrorExecutionStatus),
    IgnoredExecutionStatus(IgnoredExecutionStatus),
    RequestIgnored(RequestIgnored),
    SerialNumberRequest(SerialNumberRequest),
    SerialNumberResponse(SerialNumberResponse),
    BreakpointNotify(BreakpointNotify),
    BreakpointResponse(BreakpointResponse),
    ExprEvalRequest(ExprEvalRequest),
    ExprEvalResult(ExprEvalResult),
    ConstraintRequest(ConstraintRequest),
    ConstraintResult(ConstraintResult),
    DeclarationRequest(DeclarationRequest),
    DeclarationResponse(DeclarationResponse),
}

/// Subscription topics; one per message kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    ExecuteRequest,
    CancelRequest,
    StartExecutionStatus,
    SuccessExecutionStatus,
    ErrorExecutionStatus,
    IgnoredExecutionStatus,
    RequestIgnored,
    SerialNumberRequest,
    SerialNumberResponse,
    BreakpointNotify,
    BreakpointResponse,
    ExprEvalRequest,
    ExprEvalResult,
    ConstraintRequest,
    ConstraintResult,
    DeclarationRequest,
    DeclarationResponse,
}

impl Topic {
    /// Status topics an execution watcher listens on
    pub const EXECUTION_STATUS: [Topic; 4] = [
        Topic::StartExecutionStatus,
        Topic::SuccessExecutionStatus,
        Topic::ErrorExecutionStatus,
        Topic::IgnoredExecutionStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ExecuteRequest => "execute_request",
            Topic::CancelRequest => "cancel_request",
            Topic::StartExecutionStatus => "start_execution_status",
            Topic::SuccessExecutionStatus => "success_execution_status",
            Topic::ErrorExecutionStatus => "error_execution_status",
            Topic::IgnoredExecutionStatus => "ignored_execution_status",
            Topic::RequestIgnored => "request_ignored",
            Topic::SerialNumberRequest => "serial_number_request",
            Topic::SerialNumberResponse => "serial_number_response",
            Topic::BreakpointNotify => "breakpoint_notify",
            Topic::BreakpointResponse => "breakpoint_response",
            Topic::ExprEvalRequest => "expr_eval_request",
            Topic::ExprEvalResult => "expr_eval_result",
            Topic::ConstraintRequest => "constraint_request",
            Topic::ConstraintResult => "constraint_result",
            Topic::DeclarationRequest => "declaration_request",
            Topic::DeclarationResponse => "declaration_response",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BusMessage {
    pub fn topic(&self) -> Topic {
        match self {
            BusMessage::ExecuteRequest(_) => Topic::ExecuteRequest,
            BusMessage::CancelRequest(_) => Topic::CancelRequest,
            BusMessage::StartExecutionStatus(_) => Topic::StartExecutionStatus,
            BusMessage::SuccessExecutionStatus(_) => Topic::SuccessExecutionStatus,
            BusMessage::ErrorExecutionStatus(_) => Topic::ErrorExecutionStatus,
            BusMessage::IgnoredExecutionStatus(_) => Topic::IgnoredExecutionStatus,
            BusMessage::RequestIgnored(_) => Topic::RequestIgnored,
            BusMessage::SerialNumberRequest(_) => Topic::SerialNumberRequest,
            BusMessage::SerialNumberResponse(_) => Topic::SerialNumberResponse,
            BusMessage::BreakpointNotify(_) => Topic::BreakpointNotify,
            BusMessage::BreakpointResponse(_) => Topic::BreakpointResponse,
            BusMessage::ExprEvalRequest(_) => Topic::ExprEvalRequest,
            BusMessage::ExprEvalResult(_) => Topic::ExprEvalResult,
            BusMessage::ConstraintRequest(_) => Topic::ConstraintRequest,
            BusMessage::ConstraintResult(_) => Topic::ConstraintResult,
            BusMessage::DeclarationRequest(_) => Topic::DeclarationRequest,
            BusMessage::DeclarationResponse(_) => Topic::DeclarationResponse,
        }
    }

    /// Transaction this message concerns, if any
    pub fn uid(&self) -> Option<&TransactionUid> {
        match self {
            BusMessage::ExecuteRequest(m) => Some(&m.uid),
            BusMessage::CancelRequest(m) => Some(&m.uid),
            BusMessage::StartExecutionStatus(m) => Some(&m.uid),
            BusMessage::SuccessExecutionStatus(m) => Some(&m.uid),
            BusMessage::ErrorExecutionStatus(m) => Some(&m.uid),
            BusMessage::IgnoredExecutionStatus(m) => Some(&m.uid),
            BusMessage::RequestIgnored(m) => Some(&m.uid),
            BusMessage::SerialNumberRequest(m) => Some(&m.uid),
            BusMessage::SerialNumberResponse(m) => Some(&m.uid),
            BusMessage::BreakpointNotify(m) => Some(&m.uid),
            BusMessage::ExprEvalRequest(m) => m.procedure_uid.as_ref(),
            _ => None,
        }
    }

    /// Success, error and ignored statuses end a transaction
    pub fn is_terminal_status(&self) -> bool {
        matches!(
            self,
            BusMessage::SuccessExecutionStatus(_)
                | BusMessage::ErrorExecutionStatus(_)
                | BusMessage::IgnoredExecutionStatus(_)
        )
    }
}
