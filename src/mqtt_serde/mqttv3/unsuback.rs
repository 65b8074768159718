// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{parse_frame, parse_packet_id_body, Framed, ParseError, ParseOk};

/// Represents the UNSUBACK packet in MQTT v3.1.1.
///
/// Sent by the Server to confirm an UNSUBSCRIBE.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct MqttUnsubAck {
    pub packet_id: u16,
}

impl MqttUnsubAck {
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}

impl MqttControlPacket for MqttUnsubAck {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::UNSUBACK as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        if self.packet_id == 0 {
            return Err(ParseError::ProtocolViolation(
                "UNSUBACK packet identifier must be non-zero".to_string(),
            ));
        }
        Ok(self.packet_id.to_be_bytes().to_vec())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let frame = match parse_frame(buffer, ControlPacketType::UNSUBACK, Some(0))? {
            Framed::Complete(frame) => frame,
            Framed::Partial(hint) => return Ok(ParseOk::Continue(hint)),
        };
        let packet_id = parse_packet_id_body(frame.body(buffer))?;
        Ok(ParseOk::Packet(
            MqttPacket::UnsubAck(MqttUnsubAck { packet_id }),
            frame.total_len,
        ))
    }
}
