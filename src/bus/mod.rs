//! Bus collaborator: message catalogue, transport and serial numbers.

pub mod messages;
pub mod serial;
pub mod transport;

pub use messages::*;
pub use serial::{SerialClient, SerialNumberAuthority};
pub use transport::{
    handler_fn, Delivery, InProcessBus, MessageBus, MessageHandler, Replier, SubscriptionId,
};
