// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::mqttv3::{
    connack::{return_code_description, MqttConnAck},
    connect::MqttConnect,
    disconnect::MqttDisconnect,
    pingreq::MqttPingReq,
    puback::MqttPubAck,
    pubcomp::MqttPubComp,
    publish::MqttPublish,
    pubrec::MqttPubRec,
    suback::{MqttSubAck, SUBACK_FAILURE},
    subscribe::{MqttSubscribe, SubscriptionTopic},
    unsubscribe::MqttUnsubscribe,
};
use crate::mqtt_serde::parser::stream::MqttParser;
use crate::mqtt_serde::{validate_topic_filter, validate_topic_name, QoS};
use crate::mqtt_session::{ClientSession, ConnectionState, SessionResumption};

use super::backoff::ReconnectPolicy;
use super::error::{MqttClientError, MqttClientResult};
use super::inflight::{Expired, InflightEntry, InflightTracker, OpId};
use super::opts::ClientConfig;

const PARSER_BUFFER_SIZE: usize = 16 * 1024;

/// Successful completion of a tracked operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Published { packet_id: u16 },
    Subscribed { packet_id: u16, granted: Vec<u8> },
    Unsubscribed { packet_id: u16 },
}

/// Events emitted by the MqttEngine to be handled by the I/O layer
#[derive(Debug, Clone, PartialEq)]
pub enum MqttEvent {
    StateChanged(ConnectionState),
    /// CONNACK accepted
    Connected {
        session_present: bool,
        resumption: SessionResumption,
    },
    /// Session usable; emitted after resubscription when the session was resumed
    Ready,
    /// The current connect attempt failed. The transport, if any, must be closed.
    ConnectFailed(MqttClientError),
    /// Open a transport for an automatic attempt
    ReconnectNeeded,
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    /// The transport must be closed.
    ConnectionLost(MqttClientError),
    /// Subscriptions the broker no longer holds
    SessionLost {
        filters: Vec<String>,
    },
    Acknowledged {
        op: OpId,
        ack: Ack,
    },
    OperationFailed {
        op: OpId,
        error: MqttClientError,
    },
    MessageReceived(MqttPublish),
    PingResponse,
    /// DISCONNECT is queued: flush, close the transport, then call `finish_disconnect`.
    DisconnectReady,
    Disconnected,
}

pub fn check_topic_name(topic: &str) -> MqttClientResult<()> {
    if topic.is_empty() {
        return Err(MqttClientError::EmptyTopic);
    }
    validate_topic_name(topic).map_err(|e| MqttClientError::invalid_topic(topic, e))
}

pub fn check_topic_filter(filter: &str) -> MqttClientResult<()> {
    if filter.is_empty() {
        return Err(MqttClientError::EmptyTopic);
    }
    validate_topic_filter(filter).map_err(|e| MqttClientError::invalid_topic(filter, e))
}

/// A "Sans-I/O" MQTT 3.1.1 client protocol engine.
///
/// The engine owns the session, the in-flight tracker and the reconnect policy and
/// never touches a socket or a clock itself.
///
/// - **Input**: bytes from the transport (`handle_incoming`), time (`handle_tick`),
///   transport outcomes (`transport_ready`, `transport_failed`, `connection_lost`)
///   and commands (`start_connect`, `publish`, `subscribe`, `unsubscribe`, `disconnect`).
/// - **Output**: bytes to write (`take_outgoing`) and events (`take_events`).
///
/// The driver sleeps until `next_tick_at` between inputs.
pub struct MqttEngine {
    config: Arc<ClientConfig>,
    session: ClientSession,
    inflight: InflightTracker,
    policy: ReconnectPolicy,

    parser: MqttParser,
    outgoing: Vec<u8>,
    events: Vec<MqttEvent>,

    last_packet_sent: Instant,
    last_packet_received: Instant,
    connect_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    // set while Disconnecting and waiting for in-flight publishes
    disconnect_deadline: Option<Instant>,
    resubscribe_id: Option<u16>,
}

impl MqttEngine {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        let now = Instant::now();
        Self {
            session: ClientSession::new(config.clean_session, config.keep_alive),
            inflight: InflightTracker::new(config.retry_interval(), config.max_retries),
            policy: ReconnectPolicy::from_config(&config),
            parser: MqttParser::new(PARSER_BUFFER_SIZE, config.max_packet_size),
            outgoing: Vec::new(),
            events: Vec::new(),
            last_packet_sent: now,
            last_packet_received: now,
            connect_deadline: None,
            reconnect_at: None,
            disconnect_deadline: None,
            resubscribe_id: None,
            config,
        }
    }

    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn is_alive(&self) -> bool {
        self.session.is_alive()
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    /// Operations waiting for an acknowledgement, including ones queued while offline.
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.policy.attempts()
    }

    pub fn take_events(&mut self) -> Vec<MqttEvent> {
        std::mem::take(&mut self.events)
    }

    /// Bytes ready to be written to the transport, in order.
    pub fn take_outgoing(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outgoing)
    }

    // --- Connection lifecycle ---

    /// Starts an explicit connect. The driver opens the transport and reports back
    /// through `transport_ready` or `transport_failed`; the connect timeout covers both
    /// the transport and the CONNACK.
    pub fn start_connect(&mut self, now: Instant) -> MqttClientResult<()> {
        let state = self.session.state();
        if state != ConnectionState::Disconnected {
            return Err(MqttClientError::InvalidState {
                expected: ConnectionState::Disconnected.to_string(),
                actual: state.to_string(),
            });
        }
        self.policy.reset();
        self.set_state(ConnectionState::Connecting { reconnect: false });
        self.connect_deadline = Some(now + self.config.connect_timeout());
        info!(broker = %self.config.broker, client_id = %self.config.client_id, "connecting");
        Ok(())
    }

    /// The transport for the current attempt is open; queues CONNECT.
    pub fn transport_ready(&mut self, now: Instant) {
        if !matches!(self.session.state(), ConnectionState::Connecting { .. }) {
            debug!(state = %self.session.state(), "transport ready outside Connecting, ignored");
            return;
        }
        self.parser.reset();
        self.outgoing.clear();
        self.last_packet_received = now;
        let connect = MqttPacket::Connect(self.connect_packet());
        self.send_logged(&connect, now);
    }

    pub fn transport_failed(&mut self, error: MqttClientError, now: Instant) {
        if matches!(self.session.state(), ConnectionState::Connecting { .. }) {
            self.fail_connect(error, now);
        } else {
            debug!(error = %error, "stale transport failure ignored");
        }
    }

    /// Reports a read/write failure or EOF on the live transport.
    pub fn connection_lost(&mut self, error: MqttClientError, now: Instant) {
        match self.session.state() {
            ConnectionState::Connecting { .. } => self.fail_connect(error, now),
            ConnectionState::Connected => {
                warn!(error = %error, "connection lost");
                self.parser.reset();
                self.outgoing.clear();
                self.inflight.pause();
                if let Some(id) = self.resubscribe_id.take() {
                    self.inflight.release(id);
                }
                self.events.push(MqttEvent::ConnectionLost(error.clone()));
                if self.session.clean_session() {
                    self.lose_session();
                }

                if self.config.auto_reconnect && !self.policy.is_cancelled() {
                    self.set_state(ConnectionState::Reconnecting);
                    self.schedule_reconnect(now);
                } else {
                    self.fail_all_inflight(|_| error.clone());
                    self.set_state(ConnectionState::Disconnected);
                    self.events.push(MqttEvent::Disconnected);
                }
            }
            ConnectionState::Disconnecting => {
                debug!(error = %error, "transport closed while disconnecting");
                self.finish_disconnect();
            }
            state => trace!(%state, "connection loss reported without a transport, ignored"),
        }
    }

    /// Stops automatic reconnection for the current outage. An attempt already in
    /// flight is left to finish. Outside an outage this does nothing.
    pub fn cancel_reconnect(&mut self) {
        match self.session.state() {
            ConnectionState::Reconnecting => {
                self.policy.cancel();
                self.give_up("reconnect cancelled");
            }
            ConnectionState::Connecting { reconnect: true } => self.policy.cancel(),
            state => debug!(%state, "no reconnect pending, cancel ignored"),
        }
    }

    /// Graceful close: refuses new sends, waits up to the grace period for in-flight
    /// publishes, then queues DISCONNECT and emits `DisconnectReady`.
    pub fn disconnect(&mut self, now: Instant) {
        match self.session.state() {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {}
            ConnectionState::Connected => {
                self.set_state(ConnectionState::Disconnecting);
                let pending = self.inflight.pending_publishes();
                if pending == 0 {
                    self.send_disconnect(now);
                } else {
                    info!(pending, grace_ms = self.config.disconnect_grace_ms, "waiting for in-flight publishes");
                    self.disconnect_deadline = Some(now + self.config.disconnect_grace());
                }
            }
            ConnectionState::Connecting { .. } | ConnectionState::Reconnecting => {
                self.set_state(ConnectionState::Disconnecting);
                self.finish_disconnect();
            }
        }
    }

    /// Completes a disconnect once the transport is closed. Whatever is still in
    /// flight fails with `OperationCancelled`.
    pub fn finish_disconnect(&mut self) {
        if self.session.state() != ConnectionState::Disconnecting {
            return;
        }
        self.disconnect_deadline = None;
        self.connect_deadline = None;
        self.reconnect_at = None;
        self.resubscribe_id = None;
        self.parser.reset();
        self.outgoing.clear();
        self.fail_all_inflight(|entry| MqttClientError::OperationCancelled {
            operation: entry.packet.name().to_ascii_lowercase(),
        });
        if self.session.clean_session() {
            let filters = self.session.clear();
            if !filters.is_empty() {
                self.events.push(MqttEvent::SessionLost { filters });
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!("disconnected");
        self.events.push(MqttEvent::Disconnected);
    }

    // --- Commands ---

    /// Sends a PUBLISH. Returns the packet id for QoS>0, which completes with
    /// `Acknowledged`/`OperationFailed`; QoS 0 is done once queued.
    ///
    /// While reconnecting with a persistent session, QoS>0 messages are queued and
    /// sent after the next CONNACK.
    pub fn publish(
        &mut self,
        op: OpId,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        now: Instant,
    ) -> MqttClientResult<Option<u16>> {
        check_topic_name(topic)?;
        let state = self.session.state();
        let online = state.is_connected();
        let queue_offline = !online
            && state.is_alive()
            && !self.session.clean_session()
            && qos != QoS::AtMostOnce;
        if !online && !queue_offline {
            return Err(MqttClientError::NotConnected);
        }

        if qos == QoS::AtMostOnce {
            let packet = MqttPublish::new(topic.to_string(), 0, payload, None, retain, false);
            self.send(&MqttPacket::Publish(packet), now)?;
            trace!(topic, "published QoS 0");
            return Ok(None);
        }

        let packet_id = self.inflight.next_packet_id()?;
        let packet = MqttPacket::Publish(MqttPublish::new(
            topic.to_string(),
            qos.as_u8(),
            payload,
            Some(packet_id),
            retain,
            false,
        ));
        let bytes = packet.to_bytes()?;
        self.inflight.track(Some(op), packet, now, online)?;
        if online {
            self.write(bytes, now);
        }
        debug!(packet_id, topic, qos = qos.as_u8(), queued = !online, "publish");
        Ok(Some(packet_id))
    }

    pub fn subscribe(
        &mut self,
        op: OpId,
        filters: Vec<(String, QoS)>,
        now: Instant,
    ) -> MqttClientResult<u16> {
        if filters.is_empty() {
            return Err(MqttClientError::EmptyTopic);
        }
        for (filter, _) in &filters {
            check_topic_filter(filter)?;
        }
        self.require_connected()?;

        let packet_id = self.inflight.next_packet_id()?;
        let topics = filters
            .into_iter()
            .map(|(filter, qos)| SubscriptionTopic::new(filter, qos.as_u8()))
            .collect();
        let packet = MqttPacket::Subscribe(MqttSubscribe::new(packet_id, topics));
        let bytes = packet.to_bytes()?;
        self.inflight.track(Some(op), packet, now, true)?;
        self.write(bytes, now);
        debug!(packet_id, "subscribe");
        Ok(packet_id)
    }

    pub fn unsubscribe(
        &mut self,
        op: OpId,
        filters: Vec<String>,
        now: Instant,
    ) -> MqttClientResult<u16> {
        if filters.is_empty() {
            return Err(MqttClientError::EmptyTopic);
        }
        for filter in &filters {
            check_topic_filter(filter)?;
        }
        self.require_connected()?;

        let packet_id = self.inflight.next_packet_id()?;
        let packet = MqttPacket::Unsubscribe(MqttUnsubscribe::new(packet_id, filters));
        let bytes = packet.to_bytes()?;
        self.inflight.track(Some(op), packet, now, true)?;
        self.write(bytes, now);
        debug!(packet_id, "unsubscribe");
        Ok(packet_id)
    }

    /// Abandons a pending operation and frees its packet id.
    pub fn cancel(&mut self, op: OpId) -> Option<u16> {
        let packet_id = self.inflight.find_by_op(op)?;
        self.inflight.release(packet_id);
        debug!(packet_id, op, "operation cancelled, packet id released");
        Some(packet_id)
    }

    // --- Input ---

    /// Feeds bytes read from the transport.
    pub fn handle_incoming(&mut self, data: &[u8], now: Instant) -> Vec<MqttEvent> {
        if !self.transport_active() {
            trace!(len = data.len(), state = %self.session.state(), "bytes without a transport, dropped");
            return self.take_events();
        }
        if !data.is_empty() {
            self.last_packet_received = now;
        }
        self.parser.feed(data);

        // a packet may close the connection; stop parsing then
        while self.transport_active() {
            match self.parser.next_packet() {
                Ok(Some(packet)) => self.handle_packet(packet, now),
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "undecodable data from broker");
                    self.connection_lost(MqttClientError::from(e), now);
                    break;
                }
            }
        }

        self.take_events()
    }

    /// Runs timers: connect timeout, reconnect delay, keepalive, retransmission and
    /// the disconnect grace period.
    pub fn handle_tick(&mut self, now: Instant) -> Vec<MqttEvent> {
        match self.session.state() {
            ConnectionState::Connecting { .. } => {
                if self.connect_deadline.is_some_and(|deadline| now >= deadline) {
                    let timeout_ms = self.config.connect_timeout_ms;
                    self.fail_connect(MqttClientError::ConnectTimeout { timeout_ms }, now);
                }
            }
            ConnectionState::Reconnecting => {
                if self.reconnect_at.is_some_and(|at| now >= at) {
                    self.reconnect_at = None;
                    if self.policy.is_cancelled() {
                        self.give_up("reconnect cancelled");
                    } else {
                        self.set_state(ConnectionState::Connecting { reconnect: true });
                        self.connect_deadline = Some(now + self.config.connect_timeout());
                        info!(attempt = self.policy.attempts(), "reconnecting");
                        self.events.push(MqttEvent::ReconnectNeeded);
                    }
                }
            }
            ConnectionState::Connected | ConnectionState::Disconnecting => self.tick_connected(now),
            ConnectionState::Disconnected => {}
        }
        self.take_events()
    }

    /// Next instant at which `handle_tick` has work to do.
    pub fn next_tick_at(&self) -> Option<Instant> {
        match self.session.state() {
            ConnectionState::Connecting { .. } => self.connect_deadline,
            ConnectionState::Reconnecting => self.reconnect_at,
            ConnectionState::Connected | ConnectionState::Disconnecting => {
                let keep_alive = self.config.keep_alive_interval();
                [
                    keep_alive.map(|ka| self.last_packet_sent + ka),
                    keep_alive.map(|ka| self.last_packet_received + ka * 3 / 2),
                    self.inflight.next_deadline(),
                    self.policy.reset_deadline(),
                    self.disconnect_deadline,
                ]
                .into_iter()
                .flatten()
                .min()
            }
            ConnectionState::Disconnected => None,
        }
    }

    // --- Internals ---

    fn transport_active(&self) -> bool {
        matches!(
            self.session.state(),
            ConnectionState::Connecting { .. }
                | ConnectionState::Connected
                | ConnectionState::Disconnecting
        )
    }

    fn require_connected(&self) -> MqttClientResult<()> {
        if self.session.is_connected() {
            Ok(())
        } else {
            Err(MqttClientError::NotConnected)
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        match self.session.transition(next) {
            Ok(_) => self.events.push(MqttEvent::StateChanged(next)),
            Err(e) => error!(error = %e, "rejected state transition"),
        }
    }

    fn connect_packet(&self) -> MqttConnect {
        let mut connect = MqttConnect::new(
            self.config.client_id.clone(),
            self.config.keep_alive,
            self.config.clean_session,
        );
        connect.will = self.config.will.as_ref().map(|will| will.to_will());
        if let Some((username, password)) = self.config.credentials() {
            connect.username = Some(username.to_string());
            connect.password = Some(password.as_bytes().to_vec());
        }
        connect
    }

    fn write(&mut self, bytes: Vec<u8>, now: Instant) {
        self.outgoing.extend_from_slice(&bytes);
        self.last_packet_sent = now;
    }

    fn send(&mut self, packet: &MqttPacket, now: Instant) -> MqttClientResult<()> {
        let bytes = packet.to_bytes()?;
        trace!(packet = packet.name(), len = bytes.len(), "queue outgoing");
        self.write(bytes, now);
        Ok(())
    }

    fn send_logged(&mut self, packet: &MqttPacket, now: Instant) {
        if let Err(e) = self.send(packet, now) {
            error!(packet = packet.name(), error = %e, "failed to encode packet");
        }
    }

    fn fail_connect(&mut self, error: MqttClientError, now: Instant) {
        let reconnect = matches!(
            self.session.state(),
            ConnectionState::Connecting { reconnect: true }
        );
        self.connect_deadline = None;
        self.parser.reset();
        self.outgoing.clear();
        warn!(error = %error, reconnect, "connect attempt failed");

        if !reconnect {
            self.set_state(ConnectionState::Disconnected);
            self.events.push(MqttEvent::ConnectFailed(error));
            return;
        }
        self.set_state(ConnectionState::Reconnecting);
        self.events.push(MqttEvent::ConnectFailed(error.clone()));
        if error.is_fatal() {
            self.give_up(&error.user_message());
        } else {
            self.schedule_reconnect(now);
        }
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        match self.policy.next_delay() {
            Some(delay) => {
                let attempt = self.policy.attempts();
                self.reconnect_at = Some(now + delay);
                info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                self.events
                    .push(MqttEvent::ReconnectScheduled { attempt, delay });
            }
            None if self.policy.is_cancelled() => self.give_up("reconnect cancelled"),
            None => self.give_up("reconnect attempts exhausted"),
        }
    }

    fn give_up(&mut self, reason: &str) {
        info!(reason, "no further reconnect attempts");
        self.reconnect_at = None;
        self.fail_all_inflight(|_| MqttClientError::ConnectionLost {
            reason: reason.to_string(),
        });
        self.set_state(ConnectionState::Disconnected);
        self.events.push(MqttEvent::Disconnected);
    }

    fn fail_all_inflight(&mut self, error: impl Fn(&InflightEntry) -> MqttClientError) {
        self.resubscribe_id = None;
        for entry in self.inflight.drain() {
            if let Some(op) = entry.op {
                self.events.push(MqttEvent::OperationFailed {
                    op,
                    error: error(&entry),
                });
            }
        }
    }

    fn lose_session(&mut self) {
        self.fail_all_inflight(|_| MqttClientError::SessionLost);
        let filters = self.session.clear();
        warn!(subscriptions = filters.len(), "session lost");
        self.events.push(MqttEvent::SessionLost { filters });
    }

    fn send_disconnect(&mut self, now: Instant) {
        self.disconnect_deadline = None;
        self.send_logged(&MqttPacket::Disconnect(MqttDisconnect::new()), now);
        self.events.push(MqttEvent::DisconnectReady);
    }

    fn check_drained(&mut self, now: Instant) {
        if self.session.state() == ConnectionState::Disconnecting
            && self.disconnect_deadline.is_some()
            && self.inflight.pending_publishes() == 0
        {
            debug!("in-flight publishes drained");
            self.send_disconnect(now);
        }
    }

    fn tick_connected(&mut self, now: Instant) {
        if let Some(keep_alive) = self.config.keep_alive_interval() {
            let dead_after = keep_alive * 3 / 2;
            if now.saturating_duration_since(self.last_packet_received) >= dead_after {
                let reason = format!("nothing received for {} ms", dead_after.as_millis());
                self.connection_lost(MqttClientError::ConnectionLost { reason }, now);
                return;
            }
            if now.saturating_duration_since(self.last_packet_sent) >= keep_alive {
                trace!("keepalive PINGREQ");
                self.send_logged(&MqttPacket::PingReq(MqttPingReq::new()), now);
            }
        }

        if self.policy.maybe_reset(now) {
            debug!("connection sustained, reconnect backoff reset");
        }

        for expired in self.inflight.poll_expired(now) {
            match expired {
                Expired::Retransmit(packet) => {
                    // an abandoned resubscribe may have dropped the connection already
                    if self.transport_active() {
                        self.send_logged(&packet, now);
                    }
                }
                Expired::Abandoned(entry, error) => self.abandon(entry, error, now),
            }
        }

        if self.session.state() == ConnectionState::Disconnecting
            && self.disconnect_deadline.is_some_and(|deadline| now >= deadline)
        {
            info!(
                pending = self.inflight.pending_publishes(),
                "disconnect grace period over"
            );
            self.send_disconnect(now);
        } else {
            self.check_drained(now);
        }
    }

    fn abandon(&mut self, entry: InflightEntry, error: MqttClientError, now: Instant) {
        if let Some(op) = entry.op {
            self.events.push(MqttEvent::OperationFailed { op, error });
        }
        if self.resubscribe_id == Some(entry.packet_id) {
            self.resubscribe_id = None;
            let reason = "resubscription not acknowledged".to_string();
            self.connection_lost(MqttClientError::ConnectionLost { reason }, now);
        }
    }

    fn complete(&mut self, entry: InflightEntry, ack: Ack) {
        debug!(packet_id = entry.packet_id, ?ack, "acknowledged");
        if let Some(op) = entry.op {
            self.events.push(MqttEvent::Acknowledged { op, ack });
        }
    }

    fn handle_packet(&mut self, packet: MqttPacket, now: Instant) {
        trace!(packet = packet.name(), "received");
        if matches!(self.session.state(), ConnectionState::Connecting { .. }) {
            match packet {
                MqttPacket::ConnAck(connack) => self.handle_connack(connack, now),
                other => {
                    let message = format!("expected CONNACK, got {}", other.name());
                    self.fail_connect(MqttClientError::ProtocolViolation { message }, now);
                }
            }
            return;
        }

        match packet {
            MqttPacket::Publish(publish) => self.handle_publish(publish, now),
            MqttPacket::PubAck(ack) => {
                if let Some(entry) = self.inflight.on_puback(ack.packet_id) {
                    self.complete(entry, Ack::Published { packet_id: ack.packet_id });
                }
            }
            MqttPacket::PubRec(rec) => {
                if let Some(pubrel) = self.inflight.on_pubrec(rec.packet_id, now) {
                    self.send_logged(&pubrel, now);
                }
            }
            MqttPacket::PubComp(comp) => {
                if let Some(entry) = self.inflight.on_pubcomp(comp.packet_id) {
                    self.complete(entry, Ack::Published { packet_id: comp.packet_id });
                }
            }
            MqttPacket::PubRel(rel) => {
                if !self.session.on_incoming_pubrel(rel.packet_id) {
                    debug!(packet_id = rel.packet_id, "PUBREL for unknown inbound id");
                }
                self.send_logged(&MqttPacket::PubComp(MqttPubComp::new(rel.packet_id)), now);
            }
            MqttPacket::SubAck(suback) => self.handle_suback(suback),
            MqttPacket::UnsubAck(unsuback) => {
                if let Some(entry) = self.inflight.on_unsuback(unsuback.packet_id) {
                    if let MqttPacket::Unsubscribe(request) = &entry.packet {
                        for filter in &request.topic_filters {
                            self.session.remove_subscription(filter);
                        }
                    }
                    self.complete(entry, Ack::Unsubscribed { packet_id: unsuback.packet_id });
                }
            }
            MqttPacket::PingResp(_) => {
                trace!("PINGRESP");
                self.events.push(MqttEvent::PingResponse);
            }
            other => {
                let message = format!("unexpected {} from broker", other.name());
                self.connection_lost(MqttClientError::ProtocolViolation { message }, now);
                return;
            }
        }
        self.check_drained(now);
    }

    fn handle_connack(&mut self, connack: MqttConnAck, now: Instant) {
        if !connack.is_accepted() {
            let error = MqttClientError::ConnectionRefused {
                return_code: connack.return_code,
                description: return_code_description(connack.return_code).to_string(),
            };
            self.fail_connect(error, now);
            return;
        }

        self.connect_deadline = None;
        self.set_state(ConnectionState::Connected);
        self.policy.on_connected(now);
        let resumption = self.session.on_connack(connack.session_present);
        info!(session_present = connack.session_present, ?resumption, "connected");
        self.events.push(MqttEvent::Connected {
            session_present: connack.session_present,
            resumption,
        });

        if resumption == SessionResumption::Lost {
            self.lose_session();
        }
        for packet in self.inflight.replay(now) {
            self.send_logged(&packet, now);
        }
        if resumption == SessionResumption::Resumed {
            match self.resubscribe(now) {
                // Ready follows the SUBACK
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => {
                    error!(error = %e, "resubscription failed");
                    self.connection_lost(e, now);
                    return;
                }
            }
        }
        self.events.push(MqttEvent::Ready);
    }

    fn resubscribe(&mut self, now: Instant) -> MqttClientResult<bool> {
        let topics: Vec<SubscriptionTopic> = self
            .session
            .subscriptions()
            .iter()
            .map(|(filter, qos)| SubscriptionTopic::new(filter, qos))
            .collect();
        if topics.is_empty() {
            return Ok(false);
        }
        let count = topics.len();
        let packet_id = self.inflight.next_packet_id()?;
        let packet = MqttPacket::Subscribe(MqttSubscribe::new(packet_id, topics));
        let bytes = packet.to_bytes()?;
        self.inflight.track(None, packet, now, true)?;
        self.write(bytes, now);
        self.resubscribe_id = Some(packet_id);
        info!(packet_id, subscriptions = count, "resubscribing");
        Ok(true)
    }

    fn handle_suback(&mut self, suback: MqttSubAck) {
        let entry = match self.inflight.on_suback(suback.packet_id) {
            Some(entry) => entry,
            None => return,
        };
        let request = match &entry.packet {
            MqttPacket::Subscribe(request) => request,
            _ => return,
        };
        if request.subscriptions.len() != suback.return_codes.len() {
            warn!(
                packet_id = suback.packet_id,
                requested = request.subscriptions.len(),
                returned = suback.return_codes.len(),
                "SUBACK return code count mismatch"
            );
        }

        let mut rejected = Vec::new();
        for (topic, &code) in request.subscriptions.iter().zip(&suback.return_codes) {
            if code == SUBACK_FAILURE {
                warn!(topic = %topic.topic_filter, "subscription rejected by broker");
                self.session.remove_subscription(&topic.topic_filter);
                rejected.push(topic.topic_filter.clone());
            } else {
                self.session.add_subscription(&topic.topic_filter, code);
            }
        }

        if self.resubscribe_id == Some(suback.packet_id) {
            self.resubscribe_id = None;
            if !rejected.is_empty() {
                self.events.push(MqttEvent::SessionLost { filters: rejected });
            }
            info!("resubscribed, session ready");
            self.events.push(MqttEvent::Ready);
            return;
        }

        match (entry.op, rejected.into_iter().next()) {
            (Some(op), Some(topic)) => self.events.push(MqttEvent::OperationFailed {
                op,
                error: MqttClientError::SubscribeFailed { topic },
            }),
            (Some(op), None) => self.events.push(MqttEvent::Acknowledged {
                op,
                ack: Ack::Subscribed {
                    packet_id: suback.packet_id,
                    granted: suback.return_codes,
                },
            }),
            (None, _) => {}
        }
    }

    fn handle_publish(&mut self, publish: MqttPublish, now: Instant) {
        match (publish.qos, publish.packet_id) {
            (0, _) => {}
            (1, Some(id)) => {
                self.send_logged(&MqttPacket::PubAck(MqttPubAck::new(id)), now);
            }
            (2, Some(id)) => {
                let first = self.session.on_incoming_qos2(id);
                self.send_logged(&MqttPacket::PubRec(MqttPubRec::new(id)), now);
                if !first {
                    debug!(packet_id = id, "duplicate QoS 2 PUBLISH acknowledged, not redelivered");
                    return;
                }
            }
            (qos, _) => {
                let message = format!("PUBLISH with QoS {} and no usable packet id", qos);
                self.connection_lost(MqttClientError::ProtocolViolation { message }, now);
                return;
            }
        }
        trace!(topic = %publish.topic_name, qos = publish.qos, "message received");
        self.events.push(MqttEvent::MessageReceived(publish));
    }
}
