// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::mqtt_serde::QoS;
use crate::mqtt_session::ConnectionState;

use super::dispatch::{Dispatcher, Message, MessageHandler};
use super::engine::{check_topic_filter, check_topic_name, Ack, MqttEngine, MqttEvent};
use super::error::{MqttClientError, MqttClientResult};
use super::inflight::OpId;
use super::opts::ClientConfig;
use super::transport::{BoxedTransport, Connector, TcpConnector, TransportError};

const READ_BUFFER_SIZE: usize = 4096;
const INBOUND_QUEUE_SIZE: usize = 64;
const EVENT_CHANNEL_SIZE: usize = 64;

/// Lifecycle notifications published on [`MqttClient::events`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { session_present: bool },
    /// Connected and, for a resumed session, resubscribed
    Ready,
    ConnectionLost(MqttClientError),
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// These subscriptions are gone and their handlers were dropped
    SessionLost { filters: Vec<String> },
    Disconnected,
}

type Reply<T> = oneshot::Sender<MqttClientResult<T>>;

enum Command {
    Connect {
        reply: Reply<()>,
    },
    Publish {
        op: OpId,
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        reply: Reply<()>,
    },
    Subscribe {
        op: OpId,
        filter: String,
        qos: QoS,
        handler: Box<dyn MessageHandler>,
        reply: Reply<QoS>,
    },
    Unsubscribe {
        op: OpId,
        filter: String,
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    CancelReconnect,
}

/// Releases the packet id of an operation whose caller stopped waiting.
struct CancelOnDrop {
    op: OpId,
    cancel_tx: mpsc::UnboundedSender<OpId>,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.cancel_tx.send(self.op);
        }
    }
}

/// Async MQTT 3.1.1 client.
///
/// All protocol state lives in a worker task; this handle only sends commands and
/// waits for their results. Clones share the same connection; the worker stops
/// when the last clone is dropped.
///
/// ```no_run
/// # use mqttclient::{ClientConfig, MqttClient, QoS, handler_fn};
/// # async fn demo() -> mqttclient::MqttClientResult<()> {
/// let config = ClientConfig::builder().broker("tcp://localhost:1883").build()?;
/// let client = MqttClient::new(config)?;
/// client.connect().await?;
/// client
///     .subscribe("sensors/#", QoS::AtLeastOnce, handler_fn(|m| println!("{}", m.topic)))
///     .await?;
/// client.publish("sensors/1", QoS::AtLeastOnce, false, "21.5").await?;
/// client.disconnect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MqttClient {
    config: Arc<ClientConfig>,
    command_tx: mpsc::Sender<Command>,
    cancel_tx: mpsc::UnboundedSender<OpId>,
    state_rx: watch::Receiver<ConnectionState>,
    events_tx: broadcast::Sender<ClientEvent>,
    next_op: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl MqttClient {
    /// Creates a client speaking plain TCP. Must be called inside a tokio runtime.
    pub fn new(config: ClientConfig) -> MqttClientResult<Self> {
        let connector = TcpConnector::new(config.tcp_nodelay);
        Self::with_connector(config, Arc::new(connector))
    }

    /// Creates a client that opens its transports through `connector`.
    pub fn with_connector(
        mut config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> MqttClientResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let (command_tx, command_rx) = mpsc::channel(config.command_queue_size);
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let worker = ClientWorker::new(
            config.clone(),
            connector,
            command_rx,
            cancel_rx,
            state_tx,
            events_tx.clone(),
        );
        let dropped = worker.dispatcher.dropped_counter();
        tokio::spawn(worker.run());

        Ok(MqttClient {
            config,
            command_tx,
            cancel_tx,
            state_rx,
            events_tx,
            next_op: Arc::new(AtomicU64::new(1)),
            dropped,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connects and waits until the session is ready or the attempt fails.
    /// Returns immediately when already connected.
    pub async fn connect(&self) -> MqttClientResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Connect { reply }).await?;
        receive(rx).await
    }

    /// Publishes and waits for the final acknowledgement (QoS 1/2) or for the
    /// packet to be queued for writing (QoS 0).
    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Vec<u8>>,
    ) -> MqttClientResult<()> {
        check_topic_name(topic)?;
        let op = self.next_op();
        let (reply, rx) = oneshot::channel();
        let command = Command::Publish {
            op,
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retain,
            reply,
        };
        self.request(op, command, rx).await
    }

    /// Publishes with the configured default QoS and no retain flag.
    pub async fn publish_default(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> MqttClientResult<()> {
        self.publish(topic, self.config.default_qos, false, payload)
            .await
    }

    /// Like [`publish`](Self::publish) but gives up after `timeout`, releasing the
    /// packet id.
    pub async fn publish_with_timeout(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> MqttClientResult<()> {
        match tokio::time::timeout(timeout, self.publish(topic, qos, retain, payload)).await {
            Ok(result) => result,
            Err(_) => Err(MqttClientError::Timeout {
                operation: "publish".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Subscribes and returns the granted QoS. `handler` receives every matching
    /// message until the subscription is removed or the session is lost.
    pub async fn subscribe<H: MessageHandler>(
        &self,
        topic: &str,
        qos: QoS,
        handler: H,
    ) -> MqttClientResult<QoS> {
        check_topic_filter(topic)?;
        let op = self.next_op();
        let (reply, rx) = oneshot::channel();
        let command = Command::Subscribe {
            op,
            filter: topic.to_string(),
            qos,
            handler: Box::new(handler),
            reply,
        };
        self.request(op, command, rx).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> MqttClientResult<()> {
        check_topic_filter(topic)?;
        let op = self.next_op();
        let (reply, rx) = oneshot::channel();
        let command = Command::Unsubscribe {
            op,
            filter: topic.to_string(),
            reply,
        };
        self.request(op, command, rx).await
    }

    /// Graceful close. Waits up to the disconnect grace period for in-flight
    /// publishes; anything still pending afterwards fails with `OperationCancelled`.
    pub async fn disconnect(&self) -> MqttClientResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Disconnect { reply }).await?;
        receive(rx).await
    }

    /// Stops automatic reconnection for the current outage.
    pub async fn cancel_reconnect(&self) -> MqttClientResult<()> {
        self.send_command(Command::CancelReconnect).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Connected, or disconnected but still reconnecting.
    pub fn alive(&self) -> bool {
        self.state().is_alive()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events_tx.subscribe()
    }

    /// Inbound messages dropped because a subscription's handler queue was full.
    /// QoS 1/2 messages counted here were acknowledged to the broker but never handled.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn next_op(&self) -> OpId {
        self.next_op.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_command(&self, command: Command) -> MqttClientResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| MqttClientError::ChannelClosed {
                channel: "command".to_string(),
            })
    }

    async fn request<T>(
        &self,
        op: OpId,
        command: Command,
        rx: oneshot::Receiver<MqttClientResult<T>>,
    ) -> MqttClientResult<T> {
        let mut guard = CancelOnDrop {
            op,
            cancel_tx: self.cancel_tx.clone(),
            armed: true,
        };
        self.send_command(command).await?;
        let result = receive(rx).await;
        guard.armed = false;
        result
    }
}

async fn receive<T>(rx: oneshot::Receiver<MqttClientResult<T>>) -> MqttClientResult<T> {
    rx.await.unwrap_or_else(|_| {
        Err(MqttClientError::ChannelClosed {
            channel: "reply".to_string(),
        })
    })
}

enum Pending {
    Publish(Reply<()>),
    Subscribe {
        filter: String,
        handler: Box<dyn MessageHandler>,
        reply: Reply<QoS>,
    },
    Unsubscribe {
        filter: String,
        reply: Reply<()>,
    },
}

enum Inbound {
    Transport {
        generation: u64,
        result: Result<BoxedTransport, TransportError>,
    },
    Data {
        generation: u64,
        bytes: Bytes,
    },
    Closed {
        generation: u64,
        error: MqttClientError,
    },
}

/// Owns the engine and the transport. The single writer of the connection.
struct ClientWorker {
    config: Arc<ClientConfig>,
    engine: MqttEngine,
    connector: Arc<dyn Connector>,
    command_rx: mpsc::Receiver<Command>,
    cancel_rx: mpsc::UnboundedReceiver<OpId>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ClientEvent>,
    dispatcher: Dispatcher,

    pending: HashMap<OpId, Pending>,
    connect_waiters: Vec<Reply<()>>,
    disconnect_waiters: Vec<Reply<()>>,
    last_error: Option<MqttClientError>,
    // engine events not yet handled
    deferred: Vec<MqttEvent>,

    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
    // bumped per transport so messages from a closed one are ignored
    generation: u64,
    writer: Option<WriteHalf<BoxedTransport>>,
    reader: Option<JoinHandle<()>>,
    connecting: Option<JoinHandle<()>>,
}

impl ClientWorker {
    fn new(
        config: Arc<ClientConfig>,
        connector: Arc<dyn Connector>,
        command_rx: mpsc::Receiver<Command>,
        cancel_rx: mpsc::UnboundedReceiver<OpId>,
        state_tx: watch::Sender<ConnectionState>,
        events_tx: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        ClientWorker {
            engine: MqttEngine::new(config.clone()),
            dispatcher: Dispatcher::new(config.dispatch_queue_size),
            config,
            connector,
            command_rx,
            cancel_rx,
            state_tx,
            events_tx,
            pending: HashMap::new(),
            connect_waiters: Vec::new(),
            disconnect_waiters: Vec::new(),
            last_error: None,
            deferred: Vec::new(),
            inbound_tx,
            inbound_rx,
            generation: 0,
            writer: None,
            reader: None,
            connecting: None,
        }
    }

    async fn run(mut self) {
        loop {
            let deadline = self.engine.next_tick_at();
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(op) = self.cancel_rx.recv() => {
                    self.pending.remove(&op);
                    self.engine.cancel(op);
                }
                Some(inbound) = self.inbound_rx.recv() => self.handle_inbound(inbound),
                _ = sleep_until(deadline) => {
                    let events = self.engine.handle_tick(Instant::now());
                    self.deferred.extend(events);
                }
            }
            self.pump().await;
        }

        debug!("client handle dropped, worker stopping");
        self.close_transport().await;
        self.dispatcher.shutdown();
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Connect { reply } => self.handle_connect(reply, now),
            Command::Publish {
                op,
                topic,
                payload,
                qos,
                retain,
                reply,
            } => {
                // caller already gave up
                if reply.is_closed() {
                    return;
                }
                match self.engine.publish(op, &topic, payload, qos, retain, now) {
                    Ok(Some(_)) => {
                        self.pending.insert(op, Pending::Publish(reply));
                    }
                    Ok(None) => {
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Subscribe {
                op,
                filter,
                qos,
                handler,
                reply,
            } => {
                if reply.is_closed() {
                    return;
                }
                match self.engine.subscribe(op, vec![(filter.clone(), qos)], now) {
                    Ok(_) => {
                        self.pending.insert(
                            op,
                            Pending::Subscribe {
                                filter,
                                handler,
                                reply,
                            },
                        );
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Unsubscribe { op, filter, reply } => {
                if reply.is_closed() {
                    return;
                }
                match self.engine.unsubscribe(op, vec![filter.clone()], now) {
                    Ok(_) => {
                        self.pending
                            .insert(op, Pending::Unsubscribe { filter, reply });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Disconnect { reply } => {
                if self.engine.state() == ConnectionState::Disconnected {
                    let _ = reply.send(Ok(()));
                    return;
                }
                self.disconnect_waiters.push(reply);
                self.engine.disconnect(now);
            }
            Command::CancelReconnect => self.engine.cancel_reconnect(),
        }
    }

    fn handle_connect(&mut self, reply: Reply<()>, now: Instant) {
        match self.engine.state() {
            ConnectionState::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Disconnected => match self.engine.start_connect(now) {
                Ok(()) => {
                    self.last_error = None;
                    self.connect_waiters.push(reply);
                    self.spawn_connect();
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            ConnectionState::Disconnecting => {
                let _ = reply.send(Err(MqttClientError::InvalidState {
                    expected: ConnectionState::Disconnected.to_string(),
                    actual: ConnectionState::Disconnecting.to_string(),
                }));
            }
            // an attempt is under way; resolve with it
            _ => self.connect_waiters.push(reply),
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let now = Instant::now();
        match inbound {
            Inbound::Transport { generation, result } if generation == self.generation => {
                self.connecting = None;
                match result {
                    Ok(transport) => {
                        debug!("transport open, sending CONNECT");
                        let (read, write) = tokio::io::split(transport);
                        self.writer = Some(write);
                        self.reader = Some(spawn_reader(read, generation, self.inbound_tx.clone()));
                        self.engine.transport_ready(now);
                    }
                    Err(e) => self.engine.transport_failed(MqttClientError::from(e), now),
                }
            }
            Inbound::Data { generation, bytes } if generation == self.generation => {
                let events = self.engine.handle_incoming(&bytes, now);
                self.deferred.extend(events);
            }
            Inbound::Closed { generation, error } if generation == self.generation => {
                self.engine.connection_lost(error, now);
            }
            _ => trace!("message from a closed transport ignored"),
        }
    }

    /// Writes queued bytes and handles events until the engine is quiet.
    async fn pump(&mut self) {
        loop {
            let mut events = std::mem::take(&mut self.deferred);
            events.extend(self.engine.take_events());
            let outgoing = self.engine.take_outgoing();
            if events.is_empty() && outgoing.is_empty() {
                break;
            }
            if !outgoing.is_empty() {
                self.write(outgoing).await;
            }
            for event in events {
                self.handle_event(event).await;
            }
        }
    }

    async fn write(&mut self, bytes: Vec<u8>) {
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => {
                trace!(len = bytes.len(), "no transport, outgoing bytes dropped");
                return;
            }
        };
        let result = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(error = %e, "transport write failed");
            self.close_transport().await;
            self.engine
                .connection_lost(MqttClientError::from_io_error(e, "write"), Instant::now());
        }
    }

    async fn handle_event(&mut self, event: MqttEvent) {
        match event {
            MqttEvent::StateChanged(state) => {
                self.state_tx.send_replace(state);
            }
            MqttEvent::Connected {
                session_present, ..
            } => self.publish_event(ClientEvent::Connected { session_present }),
            MqttEvent::Ready => {
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.publish_event(ClientEvent::Ready);
            }
            MqttEvent::ConnectFailed(error) => {
                self.close_transport().await;
                if self.engine.state() == ConnectionState::Disconnected {
                    for waiter in self.connect_waiters.drain(..) {
                        let _ = waiter.send(Err(error.clone()));
                    }
                } else {
                    self.last_error = Some(error);
                }
            }
            MqttEvent::ReconnectNeeded => self.spawn_connect(),
            MqttEvent::ReconnectScheduled { attempt, delay } => {
                self.publish_event(ClientEvent::ReconnectScheduled { attempt, delay })
            }
            MqttEvent::ConnectionLost(error) => {
                self.close_transport().await;
                self.last_error = Some(error.clone());
                self.publish_event(ClientEvent::ConnectionLost(error));
            }
            MqttEvent::SessionLost { filters } => {
                for filter in &filters {
                    self.dispatcher.remove(filter);
                }
                self.publish_event(ClientEvent::SessionLost { filters });
            }
            MqttEvent::Acknowledged { op, ack } => self.complete(op, ack),
            MqttEvent::OperationFailed { op, error } => self.fail(op, error),
            MqttEvent::MessageReceived(publish) => {
                self.dispatcher.dispatch(Message::from(publish));
            }
            MqttEvent::PingResponse => trace!("PINGRESP"),
            MqttEvent::DisconnectReady => {
                // DISCONNECT was written by pump before this event
                self.close_transport().await;
                self.engine.finish_disconnect();
            }
            MqttEvent::Disconnected => {
                self.close_transport().await;
                let error = self
                    .last_error
                    .take()
                    .unwrap_or(MqttClientError::OperationCancelled {
                        operation: "connect".to_string(),
                    });
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(error.clone()));
                }
                for waiter in self.disconnect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.publish_event(ClientEvent::Disconnected);
            }
        }
    }

    fn complete(&mut self, op: OpId, ack: Ack) {
        match (self.pending.remove(&op), ack) {
            (Some(Pending::Publish(reply)), _) => {
                let _ = reply.send(Ok(()));
            }
            (
                Some(Pending::Subscribe {
                    filter,
                    handler,
                    reply,
                }),
                Ack::Subscribed { granted, .. },
            ) => {
                let granted = granted
                    .first()
                    .and_then(|code| QoS::try_from(*code).ok())
                    .unwrap_or_default();
                self.dispatcher.register(&filter, handler);
                info!(filter = %filter, granted = %granted, handlers = self.dispatcher.len(), "subscribed");
                let _ = reply.send(Ok(granted));
            }
            (Some(Pending::Unsubscribe { filter, reply }), _) => {
                info!(filter = %filter, "unsubscribed");
                self.dispatcher.remove(&filter);
                let _ = reply.send(Ok(()));
            }
            (Some(Pending::Subscribe { reply, .. }), other) => {
                warn!(op, ack = ?other, "unexpected acknowledgement for subscribe");
                let _ = reply.send(Err(MqttClientError::ProtocolViolation {
                    message: format!("unexpected acknowledgement {:?}", other),
                }));
            }
            (None, _) => trace!(op, "acknowledgement for an abandoned operation"),
        }
    }

    fn fail(&mut self, op: OpId, error: MqttClientError) {
        debug!(op, error = %error, "operation failed");
        match self.pending.remove(&op) {
            Some(Pending::Publish(reply)) | Some(Pending::Unsubscribe { reply, .. }) => {
                let _ = reply.send(Err(error));
            }
            Some(Pending::Subscribe { reply, .. }) => {
                let _ = reply.send(Err(error));
            }
            None => {}
        }
    }

    fn publish_event(&self, event: ClientEvent) {
        // no receivers is fine
        let _ = self.events_tx.send(event);
    }

    fn spawn_connect(&mut self) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        self.generation += 1;
        let generation = self.generation;
        let connector = self.connector.clone();
        let broker = self.config.broker.clone();
        let inbound_tx = self.inbound_tx.clone();
        debug!(broker = %broker, generation, "opening transport");
        self.connecting = Some(tokio::spawn(async move {
            let result = connector.connect(&broker).await;
            let _ = inbound_tx.send(Inbound::Transport { generation, result }).await;
        }));
    }

    async fn close_transport(&mut self) {
        self.generation += 1;
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let Some(task) = self.reader.take() {
            task.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                trace!(error = %e, "transport shutdown");
            }
        }
    }
}

fn spawn_reader(
    mut read: ReadHalf<BoxedTransport>,
    generation: u64,
    inbound_tx: mpsc::Sender<Inbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        loop {
            buffer.reserve(READ_BUFFER_SIZE);
            let inbound = match read.read_buf(&mut buffer).await {
                Ok(0) => Inbound::Closed {
                    generation,
                    error: MqttClientError::ConnectionLost {
                        reason: "connection closed by peer".to_string(),
                    },
                },
                Ok(_) => Inbound::Data {
                    generation,
                    bytes: buffer.split().freeze(),
                },
                Err(e) => Inbound::Closed {
                    generation,
                    error: MqttClientError::from_io_error(e, "read"),
                },
            };
            let closed = matches!(inbound, Inbound::Closed { .. });
            if inbound_tx.send(inbound).await.is_err() || closed {
                break;
            }
        }
    })
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
