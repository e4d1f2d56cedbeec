// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
    pub mod logging;
}

pub mod bus;     // Message catalogue, bus collaborator, serial numbers
pub mod engine;  // Execution engine collaborator
pub mod mediator;
pub mod model;   // Names, declarations, locking action model

// Re-exports for convenience
pub use core::config::{MediatorConfig, MediatorConfigBuilder};
pub use core::errors::{ErrorKind, ExecutionError, MediatorError, Result, StackFrame};
pub use core::logging::{init_tracing, init_tracing_from_config};

pub use bus::{BusMessage, InProcessBus, MessageBus, SerialNumberAuthority, Topic};
pub use engine::{ExecutionEngine, StepHandler, TaskExecutor, TaskListener};
pub use mediator::{DependencyClosure, Mediator, MediatorBuilder};
pub use model::{ActionModel, ActionName, Declaration, InMemoryActionModel, TransactionUid};
