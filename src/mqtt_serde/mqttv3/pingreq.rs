// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{expect_empty_body, parse_frame, Framed, ParseError, ParseOk};

/// Represents the PINGREQ packet in MQTT v3.1.1.
///
/// Sent by the Client when it has been idle for the keepalive interval; the Server answers
/// with PINGRESP.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Default)]
pub struct MqttPingReq;

impl MqttPingReq {
    pub fn new() -> Self {
        Self
    }
}

impl MqttControlPacket for MqttPingReq {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::PINGREQ as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let frame = match parse_frame(buffer, ControlPacketType::PINGREQ, Some(0))? {
            Framed::Complete(frame) => frame,
            Framed::Partial(hint) => return Ok(ParseOk::Continue(hint)),
        };
        expect_empty_body(&frame)?;
        Ok(ParseOk::Packet(MqttPacket::PingReq(MqttPingReq), frame.total_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pingreq() {
        assert_eq!(MqttPingReq::new().to_bytes().unwrap(), vec![0xC0, 0x00]);
        assert_eq!(
            MqttPingReq::from_bytes(&[0xC0, 0x00]).unwrap(),
            ParseOk::Packet(MqttPacket::PingReq(MqttPingReq), 2)
        );
    }

    #[test]
    fn test_pingreq_partial_and_malformed() {
        assert_eq!(MqttPingReq::from_bytes(&[0xC0]).unwrap(), ParseOk::Continue(1));
        assert!(matches!(
            MqttPingReq::from_bytes(&[0xC0, 0x01, 0x00]),
            Err(ParseError::MalformedPacket(_))
        ));
    }
}
