// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{parse_frame, Framed, ParseError, ParseOk};

pub const CONNECTION_ACCEPTED: u8 = 0x00;

/// Represents the CONNACK packet in MQTT v3.1.1.
///
/// The CONNACK packet is the packet sent by the Server in response to a CONNECT packet
/// received from a Client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttConnAck {
    /// Always false when the client connected with CleanSession set to 1.
    pub session_present: bool,
    /// The return code for the connection attempt.
    pub return_code: u8,
}

impl MqttConnAck {
    /// Creates a new `MqttConnAck` packet.
    pub fn new(session_present: bool, return_code: u8) -> Self {
        Self {
            session_present,
            return_code,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.return_code == CONNECTION_ACCEPTED
    }
}

/// Human readable text for a CONNACK return code (MQTT 3.1.1, table 3.1).
pub fn return_code_description(code: u8) -> &'static str {
    match code {
        0x00 => "Connection accepted",
        0x01 => "Unacceptable protocol version",
        0x02 => "Identifier rejected",
        0x03 => "Server unavailable",
        0x04 => "Bad user name or password",
        0x05 => "Not authorized",
        _ => "Unknown return code",
    }
}

impl MqttControlPacket for MqttConnAck {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::CONNACK as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        if self.return_code > 5 {
            return Err(ParseError::ProtocolViolation(format!(
                "invalid CONNACK return code {}",
                self.return_code
            )));
        }
        if self.session_present && self.return_code != CONNECTION_ACCEPTED {
            return Err(ParseError::ProtocolViolation(
                "session present must be 0 on a refused connection".to_string(),
            ));
        }
        Ok(vec![self.session_present as u8, self.return_code])
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let frame = match parse_frame(buffer, ControlPacketType::CONNACK, Some(0))? {
            Framed::Complete(frame) => frame,
            Framed::Partial(hint) => return Ok(ParseOk::Continue(hint)),
        };
        let body = frame.body(buffer);

        if body.len() != 2 {
            return Err(ParseError::MalformedPacket(
                "CONNACK packet must have a remaining length of 2".to_string(),
            ));
        }

        if body[0] & 0xFE != 0 {
            return Err(ParseError::MalformedPacket(
                "CONNACK acknowledge flags reserved bits must be 0".to_string(),
            ));
        }
        let session_present = body[0] == 0x01;

        let return_code = body[1];
        if return_code > 5 {
            return Err(ParseError::MalformedPacket(format!(
                "invalid CONNACK return code {}",
                return_code
            )));
        }

        Ok(ParseOk::Packet(
            MqttPacket::ConnAck(MqttConnAck {
                session_present,
                return_code,
            }),
            frame.total_len,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connack_serialization() {
        let connack = MqttConnAck::new(true, 0);
        assert_eq!(connack.to_bytes().unwrap(), vec![0x20, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_connack_refused_deserialization() {
        let bytes = [0x20, 0x02, 0x00, 0x05];
        match MqttConnAck::from_bytes(&bytes).unwrap() {
            ParseOk::Packet(MqttPacket::ConnAck(p), 4) => {
                assert!(!p.session_present);
                assert!(!p.is_accepted());
                assert_eq!(return_code_description(p.return_code), "Not authorized");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_connack_invalid() {
        assert!(MqttConnAck::from_bytes(&[0x20, 0x02, 0x02, 0x00]).is_err());
        assert!(MqttConnAck::from_bytes(&[0x20, 0x02, 0x00, 0x06]).is_err());
        assert!(MqttConnAck::from_bytes(&[0x20, 0x03, 0x00, 0x00, 0x00]).is_err());
        assert!(MqttConnAck::from_bytes(&[0x21, 0x02, 0x00, 0x00]).is_err());
        assert!(MqttConnAck::new(false, 6).to_bytes().is_err());
    }

    #[test]
    fn test_connack_partial() {
        assert_eq!(
            MqttConnAck::from_bytes(&[0x20, 0x02, 0x00]).unwrap(),
            ParseOk::Continue(1)
        );
    }
}
