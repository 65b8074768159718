// SPDX-License-Identifier: MPL-2.0

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::mqtt_client::error::{MqttClientError, MqttClientResult};
use crate::mqtt_session::subscriptions::SubscriptionTable;

/// Connection lifecycle. Exactly one value at a time; `connected`/`alive` derive from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    /// `reconnect` is true for attempts started by the reconnect policy.
    Connecting { reconnect: bool },
    Connected,
    Reconnecting,
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// True while connected or while the client is still working on getting back.
    pub fn is_alive(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::Reconnecting
                | ConnectionState::Connecting { reconnect: true }
        )
    }

    fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Disconnecting) => !matches!(self, Disconnected | Disconnecting),
            (Disconnected, Connecting { reconnect: false }) => true,
            (Connecting { .. }, Connected) => true,
            (Connecting { reconnect: false }, Disconnected) => true,
            (Connecting { reconnect: true }, Reconnecting) => true,
            (Connected, Reconnecting) => true,
            // connection lost with auto reconnect disabled
            (Connected, Disconnected) => true,
            (Reconnecting, Connecting { reconnect: true }) => true,
            (Reconnecting, Disconnected) => true,
            (Disconnecting, Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting { reconnect: false } => "Connecting",
            ConnectionState::Connecting { reconnect: true } => "Connecting (reconnect)",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Disconnecting => "Disconnecting",
        };
        f.write_str(name)
    }
}

/// What happened to session state when a CONNACK arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionResumption {
    /// First connection, or a clean session: nothing to carry over.
    New,
    /// The broker kept the session; in-flight messages and subscriptions must be replayed.
    Resumed,
    /// The client expected a stored session but the broker had none.
    Lost,
}

/// Client side session state, owned by the protocol engine.
pub struct ClientSession {
    state: ConnectionState,
    clean_session: bool,
    keep_alive: u16,
    // set after the first accepted CONNACK; a prior session can only exist after that
    established: bool,
    subscriptions: SubscriptionTable,
    // inbound QoS 2 packet ids that got PUBREC but no PUBREL yet
    incoming_qos2: HashSet<u16>,
}

impl ClientSession {
    pub fn new(clean_session: bool, keep_alive: u16) -> Self {
        ClientSession {
            state: ConnectionState::Disconnected,
            clean_session,
            keep_alive,
            established: false,
            subscriptions: SubscriptionTable::new(),
            incoming_qos2: HashSet::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn is_alive(&self) -> bool {
        self.state.is_alive()
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    /// Moves to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: ConnectionState) -> MqttClientResult<ConnectionState> {
        if !self.state.can_transition_to(&next) {
            return Err(MqttClientError::InvalidState {
                expected: format!("a state that may move to {}", next),
                actual: self.state.to_string(),
            });
        }
        let prev = self.state;
        debug!(from = %prev, to = %next, "session state transition");
        self.state = next;
        Ok(prev)
    }

    /// Records an accepted CONNACK and decides whether the previous session survived.
    pub fn on_connack(&mut self, session_present: bool) -> SessionResumption {
        let had_session = self.established && !self.clean_session;
        self.established = true;
        match (had_session, session_present) {
            (true, true) => SessionResumption::Resumed,
            (true, false) => SessionResumption::Lost,
            (false, _) => SessionResumption::New,
        }
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub fn add_subscription(&mut self, filter: &str, granted_qos: u8) {
        self.subscriptions.insert(filter, granted_qos);
    }

    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }

    /// Forgets all session state kept for the broker side and returns the dropped filters.
    pub fn clear(&mut self) -> Vec<String> {
        self.incoming_qos2.clear();
        self.subscriptions.drain()
    }

    /// Returns true when an inbound QoS 2 PUBLISH is new and must be delivered.
    /// A redelivery of an id still awaiting PUBREL is acknowledged again but not delivered.
    pub fn on_incoming_qos2(&mut self, packet_id: u16) -> bool {
        self.incoming_qos2.insert(packet_id)
    }

    /// Releases an inbound QoS 2 id. Returns false for ids that were not pending.
    pub fn on_incoming_pubrel(&mut self, packet_id: u16) -> bool {
        self.incoming_qos2.remove(&packet_id)
    }
}
