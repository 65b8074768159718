// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::base_data::TwoByteInteger;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::encode_utf8_string;
use crate::mqtt_serde::parser::{
    parse_frame, parse_packet_id, parse_utf8_string, Framed, ParseError, ParseOk,
};

/// Represents a subscription to a single topic in a SUBSCRIBE packet.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct SubscriptionTopic {
    pub topic_filter: String,
    pub qos: u8,
}

impl SubscriptionTopic {
    pub fn new(topic_filter: impl Into<String>, qos: u8) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            qos,
        }
    }
}

/// Represents the SUBSCRIBE packet in MQTT v3.1.1.
///
/// The SUBSCRIBE packet is sent from the Client to the Server to create one or more Subscriptions.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttSubscribe {
    /// Correlates the SUBSCRIBE packet with its SUBACK.
    pub packet_id: u16,
    /// At least one topic filter / requested QoS pair.
    pub subscriptions: Vec<SubscriptionTopic>,
}

impl MqttSubscribe {
    /// Creates a new `MqttSubscribe` packet.
    pub fn new(packet_id: u16, subscriptions: Vec<SubscriptionTopic>) -> Self {
        Self {
            packet_id,
            subscriptions,
        }
    }
}

impl MqttControlPacket for MqttSubscribe {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::SUBSCRIBE as u8
    }

    fn flags(&self) -> u8 {
        // For SUBSCRIBE, bits 3,2,1,0 MUST be 0,0,1,0
        0x02
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        if self.packet_id == 0 {
            return Err(ParseError::ProtocolViolation(
                "SUBSCRIBE packet identifier must be non-zero".to_string(),
            ));
        }
        Ok(TwoByteInteger::encode(self.packet_id).to_vec())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        if self.subscriptions.is_empty() {
            return Err(ParseError::ProtocolViolation(
                "SUBSCRIBE must contain at least one topic filter".to_string(),
            ));
        }
        let mut payload = Vec::new();
        for sub in &self.subscriptions {
            if sub.qos > 2 {
                return Err(ParseError::InvalidQoS(sub.qos));
            }
            payload.extend(encode_utf8_string(&sub.topic_filter)?);
            payload.push(sub.qos);
        }
        Ok(payload)
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let frame = match parse_frame(buffer, ControlPacketType::SUBSCRIBE, Some(0x02))? {
            Framed::Complete(frame) => frame,
            Framed::Partial(hint) => return Ok(ParseOk::Continue(hint)),
        };
        let body = frame.body(buffer);

        let (packet_id, mut offset) = parse_packet_id(body)?;

        let mut subscriptions = Vec::new();
        while offset < body.len() {
            let (topic_filter, consumed) = parse_utf8_string(&body[offset..])?;
            offset += consumed;

            let qos = *body.get(offset).ok_or_else(|| {
                ParseError::MalformedPacket("SUBSCRIBE payload is missing QoS byte".to_string())
            })?;
            // upper six bits are reserved
            if qos > 2 {
                return Err(ParseError::InvalidQoS(qos));
            }
            offset += 1;

            subscriptions.push(SubscriptionTopic { topic_filter, qos });
        }

        if subscriptions.is_empty() {
            return Err(ParseError::ProtocolViolation(
                "SUBSCRIBE must contain at least one topic filter".to_string(),
            ));
        }

        Ok(ParseOk::Packet(
            MqttPacket::Subscribe(MqttSubscribe::new(packet_id, subscriptions)),
            frame.total_len,
        ))
    }
}
