//! Message bus collaborator and an in-process implementation.
//!
//! The mediator only needs three primitives from a bus: fire-and-forget
//! `send`, topic `subscribe`, and a `send_and_get_reply` round trip that fails
//! on timeout or when nobody answers.
//!
//! # Delivery guarantees of [`InProcessBus`]
//!
//! - Each subscription drains its own queue on one task, so a subscriber sees
//!   messages in the order they were sent.
//! - A request goes to every subscriber of its topic and the first reply
//!   answers it. A subscriber that drops its [`Replier`] declines; when all
//!   of them decline the request fails without waiting for the timeout.
//! - Messages sent with no subscriber on the topic are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::bus::messages::{BusMessage, Topic};
use crate::core::errors::{MediatorError, Result};

/// Handle returned by `subscribe`, used to unsubscribe later
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Reply channel attached to a request delivery
///
/// Every subscriber of a request gets its own `Replier`; dropping it without
/// replying leaves the answer to the others.
pub struct Replier {
    topic: Topic,
    tx: mpsc::UnboundedSender<BusMessage>,
}

impl Replier {
    /// Answer the request. Returns false when the requester already gave up
    /// or another subscriber answered first.
    pub fn reply(self, message: BusMessage) -> bool {
        let delivered = self.tx.send(message).is_ok();
        if !delivered {
            debug!(topic = %self.topic, "Requester no longer waiting for reply");
        }
        delivered
    }
}

impl std::fmt::Debug for Replier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replier").field("topic", &self.topic).finish()
    }
}

/// A message as handed to a subscriber
#[derive(Debug)]
pub struct Delivery {
    pub message: BusMessage,
    pub received_at: DateTime<Utc>,
    replier: Option<Replier>,
}

impl Delivery {
    pub fn new(message: BusMessage) -> Self {
        Self {
            message,
            received_at: Utc::now(),
            replier: None,
        }
    }

    pub fn request(message: BusMessage, replier: Replier) -> Self {
        Self {
            message,
            received_at: Utc::now(),
            replier: Some(replier),
        }
    }

    pub fn is_request(&self) -> bool {
        self.replier.is_some()
    }

    /// Detach the reply channel so it can be answered from a background job
    pub fn take_replier(&mut self) -> Option<Replier> {
        self.replier.take()
    }

    pub fn into_parts(self) -> (BusMessage, Option<Replier>) {
        (self.message, self.replier)
    }
}

/// Subscriber callback
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync,
{
    async fn handle(&self, delivery: Delivery) {
        (self.0)(delivery).await
    }
}

/// Wrap a closure returning a boxed future as a handler
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Request/response bus used by every mediator component
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget delivery to every subscriber of the message's topic
    async fn send(&self, message: BusMessage) -> Result<()>;

    fn subscribe(&self, topic: Topic, handler: Arc<dyn MessageHandler>) -> Result<SubscriptionId>;

    /// Returns false if the subscription was unknown
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Deliver a request to every subscriber and wait for the first reply
    async fn send_and_get_reply(&self, request: BusMessage, timeout: Duration)
        -> Result<BusMessage>;
}

struct Subscription {
    id: SubscriptionId,
    queue: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BusInner {
    subscriptions: DashMap<Topic, Vec<Subscription>>,
    monitors: Mutex<Vec<mpsc::UnboundedSender<BusMessage>>>,
    next_id: AtomicU64,
}

/// Bus implementation for a single process
#[derive(Clone, Default)]
pub struct InProcessBus {
    inner: Arc<BusInner>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe every message sent or requested on this bus, in send order
    pub fn monitor(&self) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .monitors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .subscriptions
            .get(&topic)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    fn notify_monitors(&self, message: &BusMessage) {
        let mut monitors = self
            .inner
            .monitors
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        monitors.retain(|tx| tx.send(message.clone()).is_ok());
    }
}

impl std::fmt::Debug for InProcessBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBus")
            .field("topics", &self.inner.subscriptions.len())
            .finish()
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn send(&self, message: BusMessage) -> Result<()> {
        let topic = message.topic();
        self.notify_monitors(&message);

        let Some(subs) = self.inner.subscriptions.get(&topic) else {
            trace!(topic = %topic, "No subscribers, message dropped");
            return Ok(());
        };
        for sub in subs.iter() {
            if sub.queue.send(Delivery::new(message.clone())).is_err() {
                warn!(topic = %topic, subscription = %sub.id, "Subscriber queue closed");
            }
        }
        Ok(())
    }

    fn subscribe(&self, topic: Topic, handler: Arc<dyn MessageHandler>) -> Result<SubscriptionId> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            MediatorError::bus(topic.as_str(), format!("subscribe needs a tokio runtime: {}", e))
        })?;

        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        runtime.spawn(async move {
            while let Some(delivery) = rx.recv().await {
                handler.handle(delivery).await;
            }
            trace!(subscription = %id, "Subscription drained");
        });

        self.inner
            .subscriptions
            .entry(topic)
            .or_default()
            .push(Subscription { id, queue: tx });
        debug!(topic = %topic, subscription = %id, "Subscribed");
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for mut entry in self.inner.subscriptions.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|s| s.id != id);
            removed |= entry.value().len() != before;
        }
        if removed {
            debug!(subscription = %id, "Unsubscribed");
        }
        removed
    }

    async fn send_and_get_reply(
        &self,
        request: BusMessage,
        timeout: Duration,
    ) -> Result<BusMessage> {
        let topic = request.topic();
        self.notify_monitors(&request);

        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let subs = self.inner.subscriptions.get(&topic);
            let subs = match subs.as_ref() {
                Some(subs) if !subs.is_empty() => subs,
                _ => return Err(MediatorError::bus(topic.as_str(), "no subscriber for request")),
            };
            let mut delivered = 0usize;
            for sub in subs.iter() {
                let replier = Replier {
                    topic,
                    tx: tx.clone(),
                };
                match sub.queue.send(Delivery::request(request.clone(), replier)) {
                    Ok(()) => delivered += 1,
                    Err(_) => {
                        warn!(topic = %topic, subscription = %sub.id, "Subscriber queue closed")
                    }
                }
            }
            if delivered == 0 {
                return Err(MediatorError::bus(topic.as_str(), "subscriber queue closed"));
            }
            trace!(topic = %topic, subscribers = delivered, "Request delivered");
        }
        // only the subscribers' repliers keep the channel open
        drop(tx);

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(reply)) => {
                self.notify_monitors(&reply);
                Ok(reply)
            }
            Ok(None) => Err(MediatorError::bus(
                topic.as_str(),
                "request dropped without a reply",
            )),
            Err(_) => Err(MediatorError::timeout(
                format!("{} round trip", topic),
                timeout,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::messages::{CancelRequest, SerialNumberRequest, SerialNumberResponse};
    use crate::model::names::TransactionUid;
    use futures::FutureExt;

    fn cancel(uid: &str) -> BusMessage {
        BusMessage::CancelRequest(CancelRequest {
            uid: TransactionUid::from(uid),
        })
    }

    #[tokio::test]
    async fn test_subscriber_sees_send_order() {
        let bus = InProcessBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(
            Topic::CancelRequest,
            handler_fn(move |d| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(d.message);
                }
                .boxed()
            }),
        )
        .unwrap();

        for i in 0..20 {
            bus.send(cancel(&format!("tx_{i}"))).await.unwrap();
        }
        for i in 0..20 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.uid().unwrap().as_str(), format!("tx_{i}"));
        }
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = InProcessBus::new();
        bus.subscribe(
            Topic::SerialNumberRequest,
            handler_fn(|mut d| {
                async move {
                    let uid = d.message.uid().cloned().unwrap();
                    if let Some(replier) = d.take_replier() {
                        replier.reply(BusMessage::SerialNumberResponse(SerialNumberResponse {
                            uid,
                            serial: 42,
                        }));
                    }
                }
                .boxed()
            }),
        )
        .unwrap();

        let reply = bus
            .send_and_get_reply(
                BusMessage::SerialNumberRequest(SerialNumberRequest {
                    uid: TransactionUid::from("tx_9"),
                }),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        match reply {
            BusMessage::SerialNumberResponse(r) => assert_eq!(r.serial, 42),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    fn serial_request(uid: &str) -> BusMessage {
        BusMessage::SerialNumberRequest(SerialNumberRequest {
            uid: TransactionUid::from(uid),
        })
    }

    /// Subscriber that answers serial requests with `serial` after `delay`
    fn answer_after(delay: Duration, serial: u64) -> Arc<dyn MessageHandler> {
        handler_fn(move |mut d| {
            async move {
                tokio::time::sleep(delay).await;
                let uid = d.message.uid().cloned().unwrap();
                if let Some(replier) = d.take_replier() {
                    replier.reply(BusMessage::SerialNumberResponse(SerialNumberResponse {
                        uid,
                        serial,
                    }));
                }
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_request_reaches_every_subscriber_first_reply_wins() {
        let bus = InProcessBus::new();
        // subscribed first, never answers
        bus.subscribe(Topic::SerialNumberRequest, handler_fn(|_| async {}.boxed()))
            .unwrap();
        bus.subscribe(
            Topic::SerialNumberRequest,
            answer_after(Duration::from_millis(150), 3),
        )
        .unwrap();
        bus.subscribe(
            Topic::SerialNumberRequest,
            answer_after(Duration::from_millis(10), 2),
        )
        .unwrap();

        let reply = bus
            .send_and_get_reply(serial_request("tx_5"), Duration::from_secs(1))
            .await
            .unwrap();
        match reply {
            BusMessage::SerialNumberResponse(r) => assert_eq!(r.serial, 2),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_declined_by_everyone_fails_fast() {
        let bus = InProcessBus::new();
        for _ in 0..2 {
            bus.subscribe(Topic::SerialNumberRequest, handler_fn(|_| async {}.boxed()))
                .unwrap();
        }

        let started = std::time::Instant::now();
        let err = bus
            .send_and_get_reply(serial_request("tx_6"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, MediatorError::Bus { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_request_without_subscriber_fails() {
        let bus = InProcessBus::new();
        let err = bus
            .send_and_get_reply(cancel("tx_1"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, MediatorError::Bus { .. }));
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let bus = InProcessBus::new();
        bus.subscribe(
            Topic::CancelRequest,
            handler_fn(|d| {
                async move {
                    // hold the replier past the deadline
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    drop(d);
                }
                .boxed()
            }),
        )
        .unwrap();
        let err = bus
            .send_and_get_reply(cancel("tx_1"), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, MediatorError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = InProcessBus::new();
        let id = bus
            .subscribe(Topic::CancelRequest, handler_fn(|_| async {}.boxed()))
            .unwrap();
        assert_eq!(bus.subscriber_count(Topic::CancelRequest), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(Topic::CancelRequest), 0);
    }

    #[tokio::test]
    async fn test_monitor_records_everything() {
        let bus = InProcessBus::new();
        let mut monitor = bus.monitor();
        bus.send(cancel("tx_a")).await.unwrap();
        bus.send(cancel("tx_b")).await.unwrap();
        assert_eq!(monitor.recv().await.unwrap().uid().unwrap().as_str(), "tx_a");
        assert_eq!(monitor.recv().await.unwrap().uid().unwrap().as_str(), "tx_b");
    }
}
