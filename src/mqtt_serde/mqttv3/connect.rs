// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::base_data::{BinaryData, TwoByteInteger};
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{parse_frame, parse_utf8_string, Framed, ParseError, ParseOk};
use crate::mqtt_serde::{encode_binary_data, encode_utf8_string};

pub const PROTOCOL_NAME: &str = "MQTT";
pub const PROTOCOL_LEVEL: u8 = 4;

/// Last will message, published by the broker when the client vanishes without DISCONNECT.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Will {
    pub retain: bool,
    pub qos: u8,
    pub topic: String,
    pub message: Vec<u8>,
}

/// Represents the CONNECT packet in MQTT v3.1.1.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttConnect {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl MqttConnect {
    pub fn new(client_id: String, keep_alive: u16, clean_session: bool) -> Self {
        Self {
            clean_session,
            keep_alive,
            client_id,
            will: None,
            username: None,
            password: None,
        }
    }

    fn connect_flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.clean_session {
            flags |= 0x02;
        }
        if let Some(will) = &self.will {
            flags |= 0x04;
            flags |= (will.qos & 0x03) << 3;
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        flags
    }
}

impl MqttControlPacket for MqttConnect {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::CONNECT as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        let mut vh = encode_utf8_string(PROTOCOL_NAME)?;
        vh.push(PROTOCOL_LEVEL);
        vh.push(self.connect_flags());
        vh.extend_from_slice(&TwoByteInteger::encode(self.keep_alive));
        Ok(vh)
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        if self.password.is_some() && self.username.is_none() {
            return Err(ParseError::ProtocolViolation(
                "password requires a username".to_string(),
            ));
        }

        let mut payload = encode_utf8_string(&self.client_id)?;

        if let Some(will) = &self.will {
            if will.qos > 2 {
                return Err(ParseError::InvalidQoS(will.qos));
            }
            payload.extend(encode_utf8_string(&will.topic)?);
            payload.extend(encode_binary_data(&will.message)?);
        }

        if let Some(username) = &self.username {
            payload.extend(encode_utf8_string(username)?);
        }

        if let Some(password) = &self.password {
            payload.extend(encode_binary_data(password)?);
        }

        Ok(payload)
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let frame = match parse_frame(buffer, ControlPacketType::CONNECT, Some(0))? {
            Framed::Complete(frame) => frame,
            Framed::Partial(hint) => return Ok(ParseOk::Continue(hint)),
        };
        let body = frame.body(buffer);
        let truncated = || ParseError::MalformedPacket("CONNECT truncated".to_string());

        let (proto_name, mut offset) = parse_utf8_string(body)?;
        if proto_name != PROTOCOL_NAME {
            return Err(ParseError::MalformedPacket(format!(
                "invalid protocol name {:?}",
                proto_name
            )));
        }

        let version = *body.get(offset).ok_or_else(truncated)?;
        offset += 1;
        if version != PROTOCOL_LEVEL {
            return Err(ParseError::UnsupportedProtocolVersion(version));
        }

        let flags = *body.get(offset).ok_or_else(truncated)?;
        offset += 1;
        if (flags & 0x01) != 0 {
            return Err(ParseError::MalformedPacket(
                "CONNECT reserved flag bit is not 0".to_string(),
            ));
        }
        let clean_session = (flags & 0x02) > 0;
        let will_flag = (flags & 0x04) > 0;
        let will_qos = (flags & 0x18) >> 3;
        let will_retain = (flags & 0x20) > 0;
        let password_flag = (flags & 0x40) > 0;
        let username_flag = (flags & 0x80) > 0;

        if will_qos > 2 {
            return Err(ParseError::InvalidQoS(will_qos));
        }
        if !will_flag && (will_qos != 0 || will_retain) {
            return Err(ParseError::MalformedPacket(
                "will QoS/retain set without will flag".to_string(),
            ));
        }
        if password_flag && !username_flag {
            return Err(ParseError::MalformedPacket(
                "password flag requires username flag".to_string(),
            ));
        }

        let (keep_alive, _) =
            TwoByteInteger::decode(&body[offset.min(body.len())..]).map_err(|_| truncated())?;
        offset += 2;

        let (client_id, consumed) = parse_utf8_string(&body[offset..])?;
        offset += consumed;

        let will = if will_flag {
            let (topic, consumed) = parse_utf8_string(&body[offset..])?;
            offset += consumed;
            let (message, consumed) = BinaryData::decode(&body[offset..]).map_err(|_| truncated())?;
            offset += consumed;
            Some(Will {
                retain: will_retain,
                qos: will_qos,
                topic,
                message,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (u, consumed) = parse_utf8_string(&body[offset..])?;
            offset += consumed;
            Some(u)
        } else {
            None
        };

        let password = if password_flag {
            let (p, consumed) = BinaryData::decode(&body[offset..]).map_err(|_| truncated())?;
            offset += consumed;
            Some(p)
        } else {
            None
        };

        if offset != body.len() {
            return Err(ParseError::MalformedPacket(
                "trailing bytes after CONNECT payload".to_string(),
            ));
        }

        Ok(ParseOk::Packet(
            MqttPacket::Connect(MqttConnect {
                clean_session,
                keep_alive,
                client_id,
                will,
                username,
                password,
            }),
            frame.total_len,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_minimal_serialization() {
        let connect = MqttConnect::new("c1".to_string(), 60, true);
        let bytes = connect.to_bytes().unwrap();
        assert_eq!(
            bytes,
            vec![
                0x10, 14, // fixed header
                0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
                0x04, // level
                0x02, // clean session
                0x00, 0x3C, // keep alive
                0x00, 0x02, b'c', b'1', // client id
            ]
        );
    }

    #[test]
    fn test_connect_full_roundtrip() {
        let mut connect = MqttConnect::new("client-42".to_string(), 30, false);
        connect.will = Some(Will {
            retain: true,
            qos: 1,
            topic: "status/client-42".to_string(),
            message: b"offline".to_vec(),
        });
        connect.username = Some("user".to_string());
        connect.password = Some(b"secret".to_vec());

        let bytes = connect.to_bytes().unwrap();
        // clean=0, will=1, will qos=1, will retain=1, password=1, username=1
        assert_eq!(bytes[9], 0b1110_1100);
        match MqttConnect::from_bytes(&bytes).unwrap() {
            ParseOk::Packet(MqttPacket::Connect(parsed), len) => {
                assert_eq!(len, bytes.len());
                assert_eq!(parsed, connect);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_connect_password_without_username() {
        let mut connect = MqttConnect::new("c".to_string(), 10, true);
        connect.password = Some(b"p".to_vec());
        assert!(matches!(
            connect.to_bytes(),
            Err(ParseError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_connect_wrong_protocol_level() {
        let mut bytes = MqttConnect::new("c".to_string(), 10, true).to_bytes().unwrap();
        bytes[8] = 5;
        assert!(matches!(
            MqttConnect::from_bytes(&bytes),
            Err(ParseError::UnsupportedProtocolVersion(5))
        ));
    }

    #[test]
    fn test_connect_reserved_flag() {
        let mut bytes = MqttConnect::new("c".to_string(), 10, true).to_bytes().unwrap();
        bytes[9] |= 0x01;
        assert!(matches!(
            MqttConnect::from_bytes(&bytes),
            Err(ParseError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_connect_partial() {
        let bytes = MqttConnect::new("c".to_string(), 10, true).to_bytes().unwrap();
        assert!(matches!(
            MqttConnect::from_bytes(&bytes[..5]).unwrap(),
            ParseOk::Continue(_)
        ));
    }
}
