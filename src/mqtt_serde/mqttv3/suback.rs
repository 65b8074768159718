// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{parse_frame, parse_packet_id, Framed, ParseError, ParseOk};

pub const SUBACK_FAILURE: u8 = 0x80;

/// Represents the SUBACK packet in MQTT v3.1.1.
///
/// The SUBACK packet is sent by the Server to the Client to confirm receipt and processing
/// of a SUBSCRIBE packet.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttSubAck {
    /// The Packet Identifier from the SUBSCRIBE packet that is being acknowledged.
    pub packet_id: u16,
    /// One code per topic filter: the granted QoS, or 0x80 for failure.
    pub return_codes: Vec<u8>,
}

impl MqttSubAck {
    /// Creates a new `MqttSubAck` packet.
    pub fn new(packet_id: u16, return_codes: Vec<u8>) -> Self {
        Self {
            packet_id,
            return_codes,
        }
    }
}

fn check_return_code(code: u8) -> Result<(), ParseError> {
    if matches!(code, 0x00 | 0x01 | 0x02 | SUBACK_FAILURE) {
        Ok(())
    } else {
        Err(ParseError::MalformedPacket(format!(
            "Invalid SUBACK return code: {}",
            code
        )))
    }
}

impl MqttControlPacket for MqttSubAck {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::SUBACK as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(self.packet_id.to_be_bytes().to_vec())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        for &code in &self.return_codes {
            check_return_code(code)?;
        }
        Ok(self.return_codes.clone())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let frame = match parse_frame(buffer, ControlPacketType::SUBACK, Some(0))? {
            Framed::Complete(frame) => frame,
            Framed::Partial(hint) => return Ok(ParseOk::Continue(hint)),
        };
        let body = frame.body(buffer);

        let (packet_id, offset) = parse_packet_id(body)?;
        let return_codes = body[offset..].to_vec();
        if return_codes.is_empty() {
            return Err(ParseError::MalformedPacket(
                "SUBACK carries no return codes".to_string(),
            ));
        }
        for &code in &return_codes {
            check_return_code(code)?;
        }

        Ok(ParseOk::Packet(
            MqttPacket::SubAck(MqttSubAck::new(packet_id, return_codes)),
            frame.total_len,
        ))
    }
}
