// SPDX-License-Identifier: MPL-2.0

use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::parser::{parse_remaining_length, ParseError, ParseOk, FIXED_HDR_LEN};
use bytes::{Buf, BytesMut};

/// A stateful parser for a stream of MQTT data.
/// It internally buffers data from a stream and yields complete packets.
#[derive(Debug)]
pub struct MqttParser {
    buffer: BytesMut,
    max_packet_size: usize,
}

impl Default for MqttParser {
    fn default() -> Self {
        Self::new(16384, 1024 * 1024)
    }
}

impl MqttParser {
    /// Creates a new, empty parser that rejects frames larger than `max_packet_size`.
    pub fn new(buffer_size: usize, max_packet_size: usize) -> Self {
        MqttParser {
            buffer: BytesMut::with_capacity(buffer_size),
            max_packet_size,
        }
    }

    /// Appends new data from the stream to the internal buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to parse a single MQTT packet from the internal buffer.
    ///
    /// - If a full packet is available, it returns `Ok(Some(MqttPacket))`,
    ///   and the corresponding bytes are removed from the buffer.
    /// - If the buffer does not contain a full packet, it returns `Ok(None)`.
    /// - If the data in the buffer is malformed, it returns `Err(ParseError)`.
    ///   The buffer is left untouched; the connection should be dropped.
    pub fn next_packet(&mut self) -> Result<Option<MqttPacket>, ParseError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        // Reject oversized frames as soon as the header announces them,
        // before buffering the whole body.
        match parse_remaining_length(&self.buffer[FIXED_HDR_LEN..]) {
            Ok((size, vbi_len)) => {
                let total = FIXED_HDR_LEN + vbi_len + size;
                if total > self.max_packet_size {
                    return Err(ParseError::PacketTooLarge {
                        size: total,
                        max: self.max_packet_size,
                    });
                }
            }
            Err(ParseError::More(_, _)) => return Ok(None),
            Err(e) => return Err(e),
        }

        match MqttPacket::from_bytes(&self.buffer)? {
            ParseOk::Packet(packet, consumed) => {
                self.buffer.advance(consumed);
                Ok(Some(packet))
            }
            ParseOk::Continue(_) => Ok(None),
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drops buffered bytes, used when a connection is replaced.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_serde::mqttv3::puback::MqttPubAck;
    use crate::mqtt_serde::mqttv3::publish::MqttPublish;

    #[test]
    fn test_byte_by_byte_feed() {
        let publish = MqttPacket::Publish(MqttPublish::new(
            "s/t".to_string(),
            1,
            b"payload".to_vec(),
            Some(3),
            false,
            false,
        ));
        let puback = MqttPacket::PubAck(MqttPubAck::new(3));
        let mut bytes = publish.to_bytes().unwrap();
        bytes.extend(puback.to_bytes().unwrap());

        let mut parser = MqttParser::default();
        let mut parsed = Vec::new();
        for b in bytes {
            parser.feed(&[b]);
            while let Some(p) = parser.next_packet().unwrap() {
                parsed.push(p);
            }
        }
        assert_eq!(parsed, vec![publish, puback]);
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_packet_too_large() {
        let mut parser = MqttParser::new(64, 16);
        // PUBLISH announcing a 200 byte body
        parser.feed(&[0x30, 0xc8, 0x01]);
        assert!(matches!(
            parser.next_packet(),
            Err(ParseError::PacketTooLarge { size: 203, max: 16 })
        ));
    }

    #[test]
    fn test_malformed_packet_type() {
        let mut parser = MqttParser::default();
        parser.feed(&[0x00, 0x00]);
        assert!(matches!(
            parser.next_packet(),
            Err(ParseError::InvalidPacketType(0))
        ));
    }

    #[test]
    fn test_reset() {
        let mut parser = MqttParser::default();
        parser.feed(&[0x30, 0x05, 0x00]);
        assert!(parser.next_packet().unwrap().is_none());
        parser.reset();
        assert_eq!(parser.buffered_len(), 0);
    }
}
