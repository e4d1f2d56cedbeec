//! Action model: names, declarations and the locking registry.

pub mod declaration;
pub mod names;
pub mod registry;

pub use declaration::{Declaration, DeclarationKind, Direction, Parameter};
pub use names::{ActionName, TransactionUid, TypeRef, PRIMITIVE_TYPES};
pub use registry::{ActionModel, InMemoryActionModel, LockMode, LockStats, ModelLockGuard};
