// SPDX-License-Identifier: MPL-2.0

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::MqttClientError;
use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::mqttv3::pubrel::MqttPubRel;

/// Identifies one user operation across the worker and the engine.
pub type OpId = u64;

/// Which acknowledgement an entry is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AwaitPubAck,
    AwaitPubRec,
    /// PUBREL sent
    AwaitPubComp,
    AwaitSubAck,
    AwaitUnsubAck,
}

impl Stage {
    pub fn for_packet(packet: &MqttPacket) -> Option<Stage> {
        match packet {
            MqttPacket::Publish(p) if p.qos == 1 => Some(Stage::AwaitPubAck),
            MqttPacket::Publish(p) if p.qos == 2 => Some(Stage::AwaitPubRec),
            MqttPacket::Subscribe(_) => Some(Stage::AwaitSubAck),
            MqttPacket::Unsubscribe(_) => Some(Stage::AwaitUnsubAck),
            _ => None,
        }
    }
}

/// Entry in the inflight tracker
#[derive(Debug, Clone)]
pub struct InflightEntry {
    pub packet_id: u16,
    /// Operation waiting on this entry; `None` for internal work such as resubscription.
    pub op: Option<OpId>,
    /// The request packet (PUBLISH, SUBSCRIBE or UNSUBSCRIBE)
    pub packet: MqttPacket,
    pub stage: Stage,
    /// Retransmissions so far, not counting the first send
    pub retry_count: u32,
    pub enqueued_at: Instant,
    /// `None` while the entry waits for a connection
    pub last_sent: Option<Instant>,
    // insertion order, used when replaying after a reconnect
    seq: u64,
    sent_once: bool,
}

impl InflightEntry {
    /// The packet to put on the wire for the current stage.
    fn wire_packet(&self) -> MqttPacket {
        match (&self.packet, self.stage) {
            (_, Stage::AwaitPubComp) => MqttPacket::PubRel(MqttPubRel::new(self.packet_id)),
            (MqttPacket::Publish(p), _) if self.sent_once => {
                let mut p = p.clone();
                p.dup = true;
                MqttPacket::Publish(p)
            }
            (packet, _) => packet.clone(),
        }
    }
}

/// Result of a retransmission check.
#[derive(Debug)]
pub enum Expired {
    Retransmit(MqttPacket),
    /// Retry cap exceeded; the entry has been removed.
    Abandoned(InflightEntry, MqttClientError),
}

/// Tracks every outbound operation that still waits for an acknowledgement.
///
/// - Packet ids are unique among entries and allocated smallest-first.
/// - Deadlines are kept in send order so expiry checks stop at the first live entry.
/// - Nothing is retransmitted while disconnected; entries wait for `replay`.
pub struct InflightTracker {
    entries: BTreeMap<u16, InflightEntry>,
    /// (packet id, send time) in send order; stale pairs are skipped lazily
    deadline_queue: VecDeque<(u16, Instant)>,
    retry_interval: Duration,
    max_retries: u32,
    next_seq: u64,
}

impl InflightTracker {
    pub fn new(retry_interval: Duration, max_retries: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            deadline_queue: VecDeque::new(),
            retry_interval,
            max_retries,
            next_seq: 0,
        }
    }

    /// Smallest identifier in [1, 65535] not held by an entry.
    pub fn next_packet_id(&self) -> Result<u16, MqttClientError> {
        let mut candidate: u16 = 1;
        for &used in self.entries.keys() {
            if used != candidate {
                break;
            }
            if candidate == u16::MAX {
                return Err(MqttClientError::IdentifierExhausted);
            }
            candidate += 1;
        }
        Ok(candidate)
    }

    /// Starts tracking `packet`, whose packet id must come from `next_packet_id`.
    ///
    /// With `sent` false the entry waits for the next `replay`.
    pub fn track(
        &mut self,
        op: Option<OpId>,
        packet: MqttPacket,
        now: Instant,
        sent: bool,
    ) -> Result<u16, MqttClientError> {
        let stage = Stage::for_packet(&packet).ok_or_else(|| MqttClientError::InvalidState {
            expected: "PUBLISH QoS>0, SUBSCRIBE or UNSUBSCRIBE".to_string(),
            actual: packet.name().to_string(),
        })?;
        let packet_id = packet_id_of(&packet).ok_or(MqttClientError::ProtocolViolation {
            message: format!("{} without packet identifier", packet.name()),
        })?;
        if self.entries.contains_key(&packet_id) {
            return Err(MqttClientError::InvalidState {
                expected: format!("packet id {} free", packet_id),
                actual: "in use".to_string(),
            });
        }

        let entry = InflightEntry {
            packet_id,
            op,
            packet,
            stage,
            retry_count: 0,
            enqueued_at: now,
            last_sent: sent.then_some(now),
            seq: self.next_seq,
            sent_once: sent,
        };
        self.next_seq += 1;
        if sent {
            self.deadline_queue.push_back((packet_id, now));
        }
        self.entries.insert(packet_id, entry);
        Ok(packet_id)
    }

    fn complete(&mut self, packet_id: u16, expected: Stage, ack: &str) -> Option<InflightEntry> {
        match self.entries.get(&packet_id) {
            Some(entry) if entry.stage == expected => self.entries.remove(&packet_id),
            Some(entry) => {
                warn!(packet_id, stage = ?entry.stage, "{} does not match in-flight stage, ignored", ack);
                None
            }
            None => {
                debug!(packet_id, "{} for unknown packet id, ignored", ack);
                None
            }
        }
    }

    pub fn on_puback(&mut self, packet_id: u16) -> Option<InflightEntry> {
        self.complete(packet_id, Stage::AwaitPubAck, "PUBACK")
    }

    /// Moves a QoS 2 publish to the PUBREL stage and returns the PUBREL to send.
    /// A repeated PUBREC gets the PUBREL again.
    pub fn on_pubrec(&mut self, packet_id: u16, now: Instant) -> Option<MqttPacket> {
        let entry = match self.entries.get_mut(&packet_id) {
            Some(entry) => entry,
            None => {
                debug!(packet_id, "PUBREC for unknown packet id, ignored");
                return None;
            }
        };
        match entry.stage {
            Stage::AwaitPubRec => {
                entry.stage = Stage::AwaitPubComp;
                entry.retry_count = 0;
            }
            Stage::AwaitPubComp => {}
            other => {
                warn!(packet_id, stage = ?other, "PUBREC does not match in-flight stage, ignored");
                return None;
            }
        }
        entry.last_sent = Some(now);
        self.deadline_queue.push_back((packet_id, now));
        Some(MqttPacket::PubRel(MqttPubRel::new(packet_id)))
    }

    pub fn on_pubcomp(&mut self, packet_id: u16) -> Option<InflightEntry> {
        self.complete(packet_id, Stage::AwaitPubComp, "PUBCOMP")
    }

    pub fn on_suback(&mut self, packet_id: u16) -> Option<InflightEntry> {
        self.complete(packet_id, Stage::AwaitSubAck, "SUBACK")
    }

    pub fn on_unsuback(&mut self, packet_id: u16) -> Option<InflightEntry> {
        self.complete(packet_id, Stage::AwaitUnsubAck, "UNSUBACK")
    }

    /// Drops an entry without acknowledgement, freeing its packet id.
    pub fn release(&mut self, packet_id: u16) -> Option<InflightEntry> {
        self.entries.remove(&packet_id)
    }

    pub fn find_by_op(&self, op: OpId) -> Option<u16> {
        self.entries
            .values()
            .find(|e| e.op == Some(op))
            .map(|e| e.packet_id)
    }

    /// Collects entries whose retry interval has elapsed.
    ///
    /// Entries under the retry cap are resent (PUBLISH with DUP, or PUBREL);
    /// entries at the cap are removed and reported as `DeliveryFailed`.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<Expired> {
        let mut expired = Vec::new();

        while let Some(&(pid, sent_at)) = self.deadline_queue.front() {
            if now.saturating_duration_since(sent_at) < self.retry_interval {
                break;
            }
            self.deadline_queue.pop_front();

            let entry = match self.entries.get_mut(&pid) {
                // stale pair: entry gone or resent since
                Some(entry) if entry.last_sent == Some(sent_at) => entry,
                _ => continue,
            };

            if entry.retry_count >= self.max_retries {
                let attempts = entry.retry_count + 1;
                if let Some(entry) = self.entries.remove(&pid) {
                    warn!(packet_id = pid, attempts, "giving up on in-flight packet");
                    expired.push(Expired::Abandoned(
                        entry,
                        MqttClientError::DeliveryFailed {
                            packet_id: pid,
                            attempts,
                        },
                    ));
                }
                continue;
            }

            entry.retry_count += 1;
            entry.last_sent = Some(now);
            entry.sent_once = true;
            debug!(packet_id = pid, attempt = entry.retry_count, "retransmitting");
            expired.push(Expired::Retransmit(entry.wire_packet()));
            self.deadline_queue.push_back((pid, now));
        }

        expired
    }

    /// Earliest retransmission deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline_queue
            .iter()
            .find(|(pid, sent_at)| {
                self.entries
                    .get(pid)
                    .is_some_and(|e| e.last_sent == Some(*sent_at))
            })
            .map(|&(_, sent_at)| sent_at + self.retry_interval)
    }

    /// Stops retransmission timers; entries stay until `replay` or `drain`.
    pub fn pause(&mut self) {
        self.deadline_queue.clear();
        for entry in self.entries.values_mut() {
            entry.last_sent = None;
        }
    }

    /// Packets to send on a fresh connection, in original order.
    /// Previously sent PUBLISHes carry DUP; PUBREL-stage entries resend PUBREL.
    pub fn replay(&mut self, now: Instant) -> Vec<MqttPacket> {
        let mut order: Vec<(u64, u16)> = self.entries.values().map(|e| (e.seq, e.packet_id)).collect();
        order.sort_unstable();

        let mut packets = Vec::with_capacity(order.len());
        for (_, pid) in order {
            if let Some(entry) = self.entries.get_mut(&pid) {
                packets.push(entry.wire_packet());
                entry.sent_once = true;
                entry.last_sent = Some(now);
                self.deadline_queue.push_back((pid, now));
            }
        }
        packets
    }

    /// Removes every entry, e.g. on session loss.
    pub fn drain(&mut self) -> Vec<InflightEntry> {
        self.deadline_queue.clear();
        let mut all: Vec<InflightEntry> = std::mem::take(&mut self.entries).into_values().collect();
        all.sort_by_key(|e| e.seq);
        all
    }

    /// Number of QoS>0 publishes still in flight.
    pub fn pending_publishes(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e.packet, MqttPacket::Publish(_)))
            .count()
    }

    pub fn get(&self, packet_id: u16) -> Option<&InflightEntry> {
        self.entries.get(&packet_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn packet_id_of(packet: &MqttPacket) -> Option<u16> {
    match packet {
        MqttPacket::Publish(p) => p.packet_id,
        MqttPacket::Subscribe(p) => Some(p.packet_id),
        MqttPacket::Unsubscribe(p) => Some(p.packet_id),
        _ => None,
    }
}
