// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::base_data::TwoByteInteger;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::encode_utf8_string;
use crate::mqtt_serde::parser::{
    parse_frame, parse_packet_id, parse_utf8_string, Framed, ParseError, ParseOk,
};

/// Represents the UNSUBSCRIBE packet in MQTT v3.1.1.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttUnsubscribe {
    pub packet_id: u16,
    pub topic_filters: Vec<String>,
}

impl MqttUnsubscribe {
    pub fn new(packet_id: u16, topic_filters: Vec<String>) -> Self {
        Self {
            packet_id,
            topic_filters,
        }
    }
}

impl MqttControlPacket for MqttUnsubscribe {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::UNSUBSCRIBE as u8
    }

    fn flags(&self) -> u8 {
        // For UNSUBSCRIBE, bits 3,2,1,0 MUST be 0,0,1,0
        0x02
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        if self.packet_id == 0 {
            return Err(ParseError::ProtocolViolation(
                "UNSUBSCRIBE packet identifier must be non-zero".to_string(),
            ));
        }
        Ok(TwoByteInteger::encode(self.packet_id).to_vec())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        if self.topic_filters.is_empty() {
            return Err(ParseError::ProtocolViolation(
                "UNSUBSCRIBE must contain at least one topic filter".to_string(),
            ));
        }
        let mut payload = Vec::new();
        for filter in &self.topic_filters {
            payload.extend(encode_utf8_string(filter)?);
        }
        Ok(payload)
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let frame = match parse_frame(buffer, ControlPacketType::UNSUBSCRIBE, Some(0x02))? {
            Framed::Complete(frame) => frame,
            Framed::Partial(hint) => return Ok(ParseOk::Continue(hint)),
        };
        let body = frame.body(buffer);

        let (packet_id, mut offset) = parse_packet_id(body)?;
        let mut topic_filters = Vec::new();
        while offset < body.len() {
            let (filter, consumed) = parse_utf8_string(&body[offset..])?;
            offset += consumed;
            topic_filters.push(filter);
        }
        if topic_filters.is_empty() {
            return Err(ParseError::ProtocolViolation(
                "UNSUBSCRIBE must contain at least one topic filter".to_string(),
            ));
        }

        Ok(ParseOk::Packet(
            MqttPacket::Unsubscribe(MqttUnsubscribe::new(packet_id, topic_filters)),
            frame.total_len,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsubscribe_serialization() {
        let unsub = MqttUnsubscribe::new(2, vec!["a/b".to_string(), "c".to_string()]);
        assert_eq!(
            unsub.to_bytes().unwrap(),
            vec![
                0xA2, 10, // fixed header
                0x00, 0x02, // packet id
                0x00, 0x03, b'a', b'/', b'b', // first filter
                0x00, 0x01, b'c', // second filter
            ]
        );
    }

    #[test]
    fn test_unsubscribe_deserialization() {
        let bytes = [0xA2, 0x07, 0x01, 0x00, 0x00, 0x03, b'x', b'/', b'#'];
        match MqttUnsubscribe::from_bytes(&bytes).unwrap() {
            ParseOk::Packet(MqttPacket::Unsubscribe(p), 9) => {
                assert_eq!(p.packet_id, 256);
                assert_eq!(p.topic_filters, vec!["x/#".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unsubscribe_invalid() {
        assert!(matches!(
            MqttUnsubscribe::from_bytes(&[0xA0, 0x05, 0x00, 0x01, 0x00, 0x01, b'a']),
            Err(ParseError::InvalidFlags { .. })
        ));
        assert!(MqttUnsubscribe::new(1, vec![]).to_bytes().is_err());
        // filter length runs past the end of the packet
        assert!(matches!(
            MqttUnsubscribe::from_bytes(&[0xA2, 0x05, 0x00, 0x01, 0x00, 0x09, b'a']),
            Err(ParseError::MalformedPacket(_))
        ));
    }
}
