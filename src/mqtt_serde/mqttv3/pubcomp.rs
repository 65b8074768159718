// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{parse_frame, parse_packet_id_body, Framed, ParseError, ParseOk};

/// Represents the PUBCOMP packet in MQTT v3.1.1.
///
/// Final packet of the QoS 2 exchange.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct MqttPubComp {
    pub packet_id: u16,
}

impl MqttPubComp {
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}

impl MqttControlPacket for MqttPubComp {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::PUBCOMP as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        if self.packet_id == 0 {
            return Err(ParseError::ProtocolViolation(
                "PUBCOMP packet identifier must be non-zero".to_string(),
            ));
        }
        Ok(self.packet_id.to_be_bytes().to_vec())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let frame = match parse_frame(buffer, ControlPacketType::PUBCOMP, Some(0))? {
            Framed::Complete(frame) => frame,
            Framed::Partial(hint) => return Ok(ParseOk::Continue(hint)),
        };
        let packet_id = parse_packet_id_body(frame.body(buffer))?;
        Ok(ParseOk::Packet(
            MqttPacket::PubComp(MqttPubComp { packet_id }),
            frame.total_len,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pubcomp() {
        let bytes = MqttPubComp::new(300).to_bytes().unwrap();
        assert_eq!(bytes, vec![0x70, 0x02, 0x01, 0x2C]);
        match MqttPubComp::from_bytes(&bytes).unwrap() {
            ParseOk::Packet(MqttPacket::PubComp(p), _) => assert_eq!(p.packet_id, 300),
            other => panic!("unexpected {:?}", other),
        }
    }
}
