// SPDX-License-Identifier: MPL-2.0

//! MQTT 3.1.1 wire format.
//!
//! Every control packet lives in its own module under [`mqttv3`] and implements
//! [`control_packet::MqttControlPacket`]. [`encode`] and [`decode`] are the pure
//! entry points; [`parser::stream::MqttParser`] buffers a byte stream on top of them.

pub mod base_data;
pub mod control_packet;
pub mod mqttv3;
pub mod parser;

use std::convert::TryFrom;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::base_data::Utf8String;
use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::parser::{ParseError, ParseOk};

//re export
pub use crate::mqtt_serde::parser::stream::MqttParser;

/// Largest value the Remaining Length field can carry (MQTT 3.1.1, 2.2.3).
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Serialize a packet into its wire representation.
pub fn encode(packet: &MqttPacket) -> Result<Vec<u8>, ParseError> {
    packet.to_bytes()
}

/// Parse one packet from the front of `buffer`.
///
/// Returns `ParseOk::Packet(packet, consumed)` for a complete frame and
/// `ParseOk::Continue(hint)` when more bytes are needed.
pub fn decode(buffer: &[u8]) -> Result<ParseOk, ParseError> {
    MqttPacket::from_bytes(buffer)
}

/// Quality of Service level of a PUBLISH or a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl Default for QoS {
    fn default() -> Self {
        QoS::AtMostOnce
    }
}

impl TryFrom<u8> for QoS {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(ParseError::InvalidQoS(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QoS{}", *self as u8)
    }
}

pub(crate) fn encode_utf8_string(s: &str) -> Result<Vec<u8>, ParseError> {
    if s.len() > u16::MAX as usize {
        return Err(ParseError::StringTooLong);
    }
    Ok(Utf8String::encode(s))
}

pub(crate) fn encode_binary_data(data: &[u8]) -> Result<Vec<u8>, ParseError> {
    if data.len() > u16::MAX as usize {
        return Err(ParseError::StringTooLong);
    }
    Ok(base_data::BinaryData::encode(data))
}

/// Validates a topic name used in PUBLISH (MQTT 3.1.1, 4.7).
///
/// Topic names must be non-empty, fit in a UTF-8 string field, and carry no wildcards.
pub fn validate_topic_name(topic: &str) -> Result<(), ParseError> {
    if topic.is_empty() {
        return Err(ParseError::MalformedPacket(
            "Topic name cannot be empty".to_string(),
        ));
    }
    if topic.len() > u16::MAX as usize {
        return Err(ParseError::StringTooLong);
    }
    if topic.contains(['+', '#']) {
        return Err(ParseError::MalformedPacket(
            "Topic name must not contain wildcard characters".to_string(),
        ));
    }
    if topic.contains('\u{0000}') {
        return Err(ParseError::MalformedPacket(
            "Topic name contains null character (U+0000)".to_string(),
        ));
    }
    Ok(())
}

/// Validates topic filter syntax used in SUBSCRIBE and UNSUBSCRIBE.
pub fn validate_topic_filter(topic_filter: &str) -> Result<(), ParseError> {
    if topic_filter.is_empty() {
        return Err(ParseError::MalformedPacket(
            "Topic filter cannot be empty".to_string(),
        ));
    }

    if topic_filter.len() > u16::MAX as usize {
        return Err(ParseError::StringTooLong);
    }

    let levels: Vec<&str> = topic_filter.split('/').collect();

    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" {
                return Err(ParseError::MalformedPacket(
                    "Multi-level wildcard (#) must be the only character in topic level"
                        .to_string(),
                ));
            }
            if i != levels.len() - 1 {
                return Err(ParseError::MalformedPacket(
                    "Multi-level wildcard (#) must be the last level in topic filter".to_string(),
                ));
            }
        }

        if level.contains('+') && *level != "+" {
            return Err(ParseError::MalformedPacket(
                "Single-level wildcard (+) must be the only character in topic level".to_string(),
            ));
        }
    }

    Ok(())
}
