// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::base_data::TwoByteInteger;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::encode_utf8_string;
use crate::mqtt_serde::parser::{
    parse_frame, parse_packet_id, parse_utf8_string, Framed, ParseError, ParseOk,
};

/// Represents the PUBLISH packet in MQTT v3.1.1.
///
/// A PUBLISH packet is sent from a Client to a Server or from a Server to a Client
/// to transport an application message.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttPublish {
    pub dup: bool,
    pub qos: u8,
    pub retain: bool,
    pub topic_name: String,
    /// Packet Identifier is only present for QoS levels 1 and 2.
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
}

impl MqttPublish {
    /// Creates a new `MqttPublish` packet.
    pub fn new(
        topic_name: String,
        qos: u8,
        payload: Vec<u8>,
        packet_id: Option<u16>,
        retain: bool,
        dup: bool,
    ) -> Self {
        Self {
            dup,
            qos,
            retain,
            topic_name,
            packet_id,
            payload,
        }
    }
}

impl MqttControlPacket for MqttPublish {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::PUBLISH as u8
    }

    fn flags(&self) -> u8 {
        ((self.dup as u8) << 3) | ((self.qos & 0x03) << 1) | (self.retain as u8)
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        if self.qos > 2 {
            return Err(ParseError::InvalidQoS(self.qos));
        }
        if self.qos == 0 && self.dup {
            return Err(ParseError::ProtocolViolation(
                "DUP must be 0 for QoS 0 messages".to_string(),
            ));
        }
        let mut vh = encode_utf8_string(&self.topic_name)?;
        if self.qos > 0 {
            let id = match self.packet_id {
                Some(id) if id != 0 => id,
                _ => {
                    return Err(ParseError::ProtocolViolation(
                        "non-zero packet identifier is required for QoS > 0".to_string(),
                    ))
                }
            };
            vh.extend_from_slice(&TwoByteInteger::encode(id));
        }
        Ok(vh)
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        Ok(self.payload.clone())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let frame = match parse_frame(buffer, ControlPacketType::PUBLISH, None)? {
            Framed::Complete(frame) => frame,
            Framed::Partial(hint) => return Ok(ParseOk::Continue(hint)),
        };

        let dup = (frame.flags & 0x08) > 0;
        let qos = (frame.flags & 0x06) >> 1;
        let retain = (frame.flags & 0x01) > 0;
        if qos > 2 {
            return Err(ParseError::InvalidQoS(qos));
        }

        let body = frame.body(buffer);
        let (topic_name, mut offset) = parse_utf8_string(body)?;

        let packet_id = if qos > 0 {
            let (id, consumed) = parse_packet_id(&body[offset..])?;
            if id == 0 {
                return Err(ParseError::ProtocolViolation(
                    "PUBLISH packet identifier must be non-zero".to_string(),
                ));
            }
            offset += consumed;
            Some(id)
        } else {
            None
        };

        let payload = body[offset..].to_vec();

        Ok(ParseOk::Packet(
            MqttPacket::Publish(MqttPublish {
                dup,
                qos,
                retain,
                topic_name,
                packet_id,
                payload,
            }),
            frame.total_len,
        ))
    }
}
