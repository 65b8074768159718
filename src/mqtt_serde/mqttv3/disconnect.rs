// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{expect_empty_body, parse_frame, Framed, ParseError, ParseOk};

/// Represents the DISCONNECT packet in MQTT v3.1.1.
///
/// The final packet sent by the Client on a graceful close. The Server discards
/// the last will when it receives it.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Default)]
pub struct MqttDisconnect;

impl MqttDisconnect {
    pub fn new() -> Self {
        Self
    }
}

impl MqttControlPacket for MqttDisconnect {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::DISCONNECT as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let frame = match parse_frame(buffer, ControlPacketType::DISCONNECT, Some(0))? {
            Framed::Complete(frame) => frame,
            Framed::Partial(hint) => return Ok(ParseOk::Continue(hint)),
        };
        expect_empty_body(&frame)?;
        Ok(ParseOk::Packet(MqttPacket::Disconnect(MqttDisconnect), frame.total_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect() {
        let bytes = MqttDisconnect::new().to_bytes().unwrap();
        assert_eq!(bytes, vec![0xE0, 0x00]);
        assert_eq!(
            MqttDisconnect::from_bytes(&bytes).unwrap(),
            ParseOk::Packet(MqttPacket::Disconnect(MqttDisconnect), 2)
        );
    }
}
