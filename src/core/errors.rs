use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::names::ActionName;

/// Unified error type for the mediator
#[derive(Debug, Error)]
pub enum MediatorError {
    /// Malformed action source or an unparseable name
    #[error("Parse error: {message}")]
    Parse {
        message: String,
        source_name: Option<String>,
    },

    /// A required type or action cannot be located locally or remotely
    #[error("Missing dependency: {name}")]
    MissingDependency {
        name: String,
        required_by: Option<String>,
    },

    /// A dependency is an action with no registered runner
    #[error("No executor registered for action {action}")]
    MissingExecutor { action: ActionName },

    /// Opaque failure surfaced by the execution engine
    #[error("Engine error: {message}")]
    Engine {
        code: Option<i32>,
        message: String,
        stack: Vec<StackFrame>,
    },

    /// Execution aborted by an explicit cancel request
    #[error("Execution of {action} was cancelled")]
    Cancelled { action: ActionName },

    /// No mediator on the bus claimed the action
    #[error("No executor available for {action}")]
    Ignored { action: ActionName },

    /// Failure reason was missing or could not be classified
    #[error("Unknown failure: {message}")]
    Unknown { message: String },

    /// Constraint merge rejected by the engine
    #[error("Constraint coalescing failed: {message}")]
    ConstraintCoalesce { message: String },

    /// Bus delivery or subscription failures
    #[error("Bus error on {topic}: {message}")]
    Bus { topic: String, message: String },

    /// A request/reply round trip did not complete in time
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        context: HashMap<String, String>,
    },
}

impl MediatorError {
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse {
            message: message.into(),
            source_name: None,
        }
    }

    pub fn missing_dependency<S: Into<String>>(name: S) -> Self {
        Self::MissingDependency {
            name: name.into(),
            required_by: None,
        }
    }

    /// Record which declaration pulled in a missing dependency
    pub fn required_by<S: Into<String>>(mut self, parent: S) -> Self {
        if let Self::MissingDependency {
            ref mut required_by,
            ..
        } = self
        {
            if required_by.is_none() {
                *required_by = Some(parent.into());
            }
        }
        self
    }

    pub fn missing_executor(action: ActionName) -> Self {
        Self::MissingExecutor { action }
    }

    pub fn engine<S: Into<String>>(code: Option<i32>, message: S) -> Self {
        Self::Engine {
            code,
            message: message.into(),
            stack: Vec::new(),
        }
    }

    pub fn cancelled(action: ActionName) -> Self {
        Self::Cancelled { action }
    }

    pub fn unknown<S: Into<String>>(message: S) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    pub fn bus<T: Into<String>, S: Into<String>>(topic: T, message: S) -> Self {
        Self::Bus {
            topic: topic.into(),
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            context: HashMap::new(),
        }
    }

    /// Add context to an internal error
    pub fn with_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        if let Self::Internal { ref mut context, .. } = self {
            context.insert(key.into(), value.into());
        }
        self
    }

    /// The wire-level kind this error is reported as
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse { .. } => ErrorKind::Parse,
            Self::MissingDependency { .. } => ErrorKind::MissingDependency,
            Self::MissingExecutor { .. } => ErrorKind::MissingExecutor,
            Self::Engine { .. } => ErrorKind::Engine,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Ignored { .. } => ErrorKind::Ignored,
            Self::ConstraintCoalesce { .. } => ErrorKind::ConstraintCoalesce,
            Self::Unknown { .. } => ErrorKind::Unknown,
            Self::Bus { .. }
            | Self::Timeout { .. }
            | Self::Configuration { .. }
            | Self::Serialization { .. }
            | Self::Internal { .. } => ErrorKind::Engine,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse",
            Self::MissingDependency { .. } => "missing_dependency",
            Self::MissingExecutor { .. } => "missing_executor",
            Self::Engine { .. } => "engine",
            Self::Cancelled { .. } => "cancelled",
            Self::Ignored { .. } => "ignored",
            Self::Unknown { .. } => "unknown",
            Self::ConstraintCoalesce { .. } => "constraint",
            Self::Bus { .. } => "bus",
            Self::Timeout { .. } => "timeout",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }

    /// Convert into the representation carried by status messages
    pub fn to_execution_error(&self) -> ExecutionError {
        let action = match self {
            Self::MissingExecutor { action }
            | Self::Cancelled { action }
            | Self::Ignored { action } => Some(action.clone()),
            _ => None,
        };
        let stack = match self {
            Self::Engine { stack, .. } => stack.clone(),
            _ => Vec::new(),
        };
        ExecutionError {
            kind: self.kind(),
            message: self.to_string(),
            action,
            stack,
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, MediatorError>;

impl From<serde_json::Error> for MediatorError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for MediatorError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<anyhow::Error> for MediatorError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string()).with_context("source", "anyhow")
    }
}

/// Error kinds reported to requesters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Parse,
    MissingDependency,
    MissingExecutor,
    Engine,
    Cancelled,
    Ignored,
    Unknown,
    ConstraintCoalesce,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::MissingDependency => "missing-dependency",
            Self::MissingExecutor => "missing-executor",
            Self::Engine => "engine",
            Self::Cancelled => "cancelled",
            Self::Ignored => "no-executor-available",
            Self::Unknown => "unknown",
            Self::ConstraintCoalesce => "constraint-coalesce",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One translated frame of an execution stack trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub action: ActionName,
    pub offset: u32,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.action, self.offset)
    }
}

/// Error representation carried over the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionName>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<StackFrame>,
}

impl ExecutionError {
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            action: None,
            stack: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: ActionName) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_stack(mut self, stack: Vec<StackFrame>) -> Self {
        self.stack = stack;
        self
    }

    /// Error synthesized when no mediator claimed an action
    pub fn no_executor(action: &ActionName) -> Self {
        MediatorError::Ignored {
            action: action.clone(),
        }
        .to_execution_error()
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        for frame in &self.stack {
            write!(f, "\n    at {}", frame)?;
        }
        Ok(())
    }
}

impl From<&MediatorError> for ExecutionError {
    fn from(err: &MediatorError) -> Self {
        err.to_execution_error()
    }
}
