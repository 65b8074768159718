// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{parse_frame, parse_packet_id_body, Framed, ParseError, ParseOk};

/// Represents the PUBREC packet in MQTT v3.1.1.
///
/// First response to a QoS 2 PUBLISH.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct MqttPubRec {
    pub packet_id: u16,
}

impl MqttPubRec {
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}

impl MqttControlPacket for MqttPubRec {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::PUBREC as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        if self.packet_id == 0 {
            return Err(ParseError::ProtocolViolation(
                "PUBREC packet identifier must be non-zero".to_string(),
            ));
        }
        Ok(self.packet_id.to_be_bytes().to_vec())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let frame = match parse_frame(buffer, ControlPacketType::PUBREC, Some(0))? {
            Framed::Complete(frame) => frame,
            Framed::Partial(hint) => return Ok(ParseOk::Continue(hint)),
        };
        let packet_id = parse_packet_id_body(frame.body(buffer))?;
        Ok(ParseOk::Packet(
            MqttPacket::PubRec(MqttPubRec { packet_id }),
            frame.total_len,
        ))
    }
}
