// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{parse_frame, parse_packet_id_body, Framed, ParseError, ParseOk};

/// Represents the PUBREL packet in MQTT v3.1.1.
///
/// Response to PUBREC, the third packet of the QoS 2 exchange.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct MqttPubRel {
    pub packet_id: u16,
}

impl MqttPubRel {
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}

impl MqttControlPacket for MqttPubRel {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::PUBREL as u8
    }

    fn flags(&self) -> u8 {
        // bits 3,2,1,0 of the fixed header MUST be 0,0,1,0
        0x02
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        if self.packet_id == 0 {
            return Err(ParseError::ProtocolViolation(
                "PUBREL packet identifier must be non-zero".to_string(),
            ));
        }
        Ok(self.packet_id.to_be_bytes().to_vec())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let frame = match parse_frame(buffer, ControlPacketType::PUBREL, Some(0x02))? {
            Framed::Complete(frame) => frame,
            Framed::Partial(hint) => return Ok(ParseOk::Continue(hint)),
        };
        let packet_id = parse_packet_id_body(frame.body(buffer))?;
        Ok(ParseOk::Packet(
            MqttPacket::PubRel(MqttPubRel { packet_id }),
            frame.total_len,
        ))
    }
}
