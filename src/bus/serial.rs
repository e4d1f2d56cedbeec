//! Globally ordered serial numbers for audit and replay ordering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bus::messages::{BusMessage, SerialNumberRequest, SerialNumberResponse, Topic};
use crate::bus::transport::{Delivery, MessageBus, MessageHandler, SubscriptionId};
use crate::core::errors::{MediatorError, Result};
use crate::model::names::TransactionUid;

/// Answers serial number requests from a single counter. Run one per bus.
#[derive(Debug)]
pub struct SerialNumberAuthority {
    next: AtomicU64,
}

impl SerialNumberAuthority {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Subscribe a new authority to `bus`
    pub fn install(bus: &dyn MessageBus) -> Result<(Arc<Self>, SubscriptionId)> {
        let authority = Arc::new(Self::new());
        let id = bus.subscribe(Topic::SerialNumberRequest, authority.clone())?;
        Ok((authority, id))
    }

    pub fn issue(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for SerialNumberAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageHandler for SerialNumberAuthority {
    async fn handle(&self, mut delivery: Delivery) {
        let BusMessage::SerialNumberRequest(request) = &delivery.message else {
            return;
        };
        let uid = request.uid.clone();
        let Some(replier) = delivery.take_replier() else {
            warn!(uid = %uid, "Serial number request sent without reply channel");
            return;
        };
        let serial = self.issue();
        debug!(uid = %uid, serial, "Issued serial number");
        replier.reply(BusMessage::SerialNumberResponse(SerialNumberResponse {
            uid,
            serial,
        }));
    }
}

/// Client side of the serial number round trip
#[derive(Clone)]
pub struct SerialClient {
    bus: Arc<dyn MessageBus>,
    timeout: Duration,
}

impl SerialClient {
    pub fn new(bus: Arc<dyn MessageBus>, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    pub async fn next_serial(&self, uid: &TransactionUid) -> Result<u64> {
        let reply = self
            .bus
            .send_and_get_reply(
                BusMessage::SerialNumberRequest(SerialNumberRequest { uid: uid.clone() }),
                self.timeout,
            )
            .await?;
        match reply {
            BusMessage::SerialNumberResponse(response) if &response.uid == uid => {
                Ok(response.serial)
            }
            BusMessage::SerialNumberResponse(response) => Err(MediatorError::bus(
                Topic::SerialNumberResponse.as_str(),
                format!("reply for {} while waiting for {}", response.uid, uid),
            )),
            other => Err(MediatorError::bus(
                Topic::SerialNumberResponse.as_str(),
                format!("unexpected reply {}", other.topic()),
            )),
        }
    }
}
