// SPDX-License-Identifier: MPL-2.0

//! Delivery of inbound messages to subscription handlers.
//!
//! Every subscription owns a bounded queue drained by its own task, so a slow
//! handler only delays its own messages. When a queue is full the message is
//! dropped with a warning and counted; the worker never waits on a handler.
//! QoS 1/2 messages have already been acknowledged at that point, so a drop
//! loses them for good.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::mqtt_serde::mqttv3::publish::MqttPublish;
use crate::mqtt_serde::QoS;
use crate::mqtt_session::topic_matches_filter;

/// An application message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    /// Set when the broker marked this as a possible redelivery
    pub dup: bool,
}

impl From<MqttPublish> for Message {
    fn from(publish: MqttPublish) -> Self {
        Message {
            topic: publish.topic_name,
            payload: publish.payload,
            qos: QoS::try_from(publish.qos).unwrap_or_default(),
            retain: publish.retain,
            dup: publish.dup,
        }
    }
}

/// Handler for the messages of one subscription.
#[async_trait]
pub trait MessageHandler: Send + 'static {
    async fn on_message(&mut self, message: Message);
}

/// Adapts a closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: FnMut(Message) + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: FnMut(Message) + Send + 'static,
{
    async fn on_message(&mut self, message: Message) {
        (self.0)(message)
    }
}

/// Forwards every message into a channel; handy for consumers that prefer a stream.
#[async_trait]
impl MessageHandler for mpsc::UnboundedSender<Message> {
    async fn on_message(&mut self, message: Message) {
        if self.send(message).is_err() {
            debug!("message receiver dropped");
        }
    }
}

struct Route {
    sender: mpsc::Sender<Message>,
    task: JoinHandle<()>,
}

/// Routes inbound messages to the handlers of matching subscriptions.
pub(crate) struct Dispatcher {
    routes: HashMap<String, Route>,
    queue_size: usize,
    dropped: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(queue_size: usize) -> Self {
        Self {
            routes: HashMap::new(),
            queue_size: queue_size.max(1),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared count of messages dropped because a handler queue was full or gone.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }

    /// Starts the dispatch task for `filter`. A previous handler for the same filter
    /// finishes its queued messages and stops.
    pub fn register(&mut self, filter: &str, handler: Box<dyn MessageHandler>) {
        let (sender, receiver) = mpsc::channel(self.queue_size);
        let task = tokio::spawn(drain(filter.to_string(), receiver, handler));
        if self
            .routes
            .insert(filter.to_string(), Route { sender, task })
            .is_some()
        {
            debug!(filter, "subscription handler replaced");
        }
    }

    /// Stops routing to `filter`; queued messages are still delivered.
    pub fn remove(&mut self, filter: &str) -> bool {
        self.routes.remove(filter).is_some()
    }

    /// Queues `message` for every matching subscription and returns how many took it.
    pub fn dispatch(&self, message: Message) -> usize {
        let mut delivered = 0;
        for (filter, route) in &self.routes {
            if !topic_matches_filter(&message.topic, filter) {
                continue;
            }
            match route.sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => self.drop_message(&message, filter, "dispatch queue full"),
                Err(TrySendError::Closed(_)) => self.drop_message(&message, filter, "dispatch task gone"),
            }
        }
        if delivered == 0 {
            debug!(topic = %message.topic, "message not delivered to any handler");
        }
        delivered
    }

    fn drop_message(&self, message: &Message, filter: &str, reason: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        if message.qos == QoS::AtMostOnce {
            warn!(topic = %message.topic, filter, reason, "QoS 0 message dropped");
        } else {
            // the broker already has its PUBACK/PUBREC and will not resend
            error!(
                topic = %message.topic,
                filter,
                qos = ?message.qos,
                reason,
                "acknowledged message dropped before reaching its handler"
            );
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Aborts every dispatch task.
    pub fn shutdown(&mut self) {
        for (_, route) in self.routes.drain() {
            route.task.abort();
        }
    }
}

async fn drain(filter: String, mut receiver: mpsc::Receiver<Message>, mut handler: Box<dyn MessageHandler>) {
    while let Some(message) = receiver.recv().await {
        handler.on_message(message).await;
    }
    debug!(filter = %filter, "dispatch task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    fn message(topic: &str, payload: &[u8]) -> Message {
        Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
        }
    }

    #[tokio::test]
    async fn test_dispatch_to_matching_routes() {
        let mut dispatcher = Dispatcher::new(8);
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        dispatcher.register("sensors/+/temp", Box::new(a_tx));
        dispatcher.register("other/#", Box::new(b_tx));

        assert_eq!(dispatcher.dispatch(message("sensors/1/temp", b"21")), 1);
        assert_eq!(a_rx.recv().await.unwrap().payload, b"21".to_vec());
        assert!(b_rx.try_recv().is_err());

        assert!(dispatcher.remove("sensors/+/temp"));
        assert_eq!(dispatcher.dispatch(message("sensors/1/temp", b"22")), 0);
    }

    struct Blocking {
        gate: Arc<Notify>,
        seen: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl MessageHandler for Blocking {
        async fn on_message(&mut self, message: Message) {
            self.gate.notified().await;
            self.seen.lock().unwrap().push(message.payload);
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let gate = Arc::new(Notify::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new(1);
        dispatcher.register(
            "t",
            Box::new(Blocking {
                gate: gate.clone(),
                seen: seen.clone(),
            }),
        );

        // first message is taken by the handler, second fills the queue
        assert_eq!(dispatcher.dispatch(message("t", b"1")), 1);
        tokio::task::yield_now().await;
        assert_eq!(dispatcher.dispatch(message("t", b"2")), 1);
        assert_eq!(dispatcher.dispatch(message("t", b"3")), 0);
        assert_eq!(dispatcher.dropped(), 1);
        let counter = dispatcher.dropped_counter();
        assert_eq!(counter.load(Ordering::Relaxed), 1);

        gate.notify_one();
        tokio::task::yield_now().await;
        gate.notify_one();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*seen.lock().unwrap(), vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut dispatcher = Dispatcher::new(4);
        dispatcher.register(
            "a/#",
            Box::new(handler_fn(move |m: Message| sink.lock().unwrap().push(m.topic))),
        );
        dispatcher.dispatch(message("a", b""));
        dispatcher.dispatch(message("a/b/c", b""));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string(), "a/b/c".to_string()]);
        assert_eq!(dispatcher.len(), 1);
        assert_eq!(dispatcher.dropped(), 0);
    }
}
