// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{expect_empty_body, parse_frame, Framed, ParseError, ParseOk};

/// Represents the PINGRESP packet in MQTT v3.1.1.
///
/// The Server's answer to PINGREQ.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Default)]
pub struct MqttPingResp;

impl MqttPingResp {
    pub fn new() -> Self {
        Self
    }
}

impl MqttControlPacket for MqttPingResp {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::PINGRESP as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let frame = match parse_frame(buffer, ControlPacketType::PINGRESP, Some(0))? {
            Framed::Complete(frame) => frame,
            Framed::Partial(hint) => return Ok(ParseOk::Continue(hint)),
        };
        expect_empty_body(&frame)?;
        Ok(ParseOk::Packet(MqttPacket::PingResp(MqttPingResp), frame.total_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pingresp_deserialization() {
        match MqttPingResp::from_bytes(&[0xD0, 0x00, 0x40]).unwrap() {
            // trailing bytes belong to the next packet
            ParseOk::Packet(MqttPacket::PingResp(_), consumed) => assert_eq!(consumed, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(MqttPingResp::from_bytes(&[0xD1, 0x00]).is_err());
    }
}
