// SPDX-License-Identifier: MPL-2.0

use crate::mqtt_serde::parser::ParseError;
use crate::mqtt_serde::MAX_REMAINING_LENGTH;

pub struct TwoByteInteger;

impl TwoByteInteger {
    pub fn encode(val: u16) -> [u8; 2] {
        val.to_be_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<(u16, usize), ParseError> {
        if bytes.len() < 2 {
            return Err(ParseError::BufferTooShort);
        }
        Ok((u16::from_be_bytes([bytes[0], bytes[1]]), 2))
    }
}

/// Remaining Length encoding: 7-bit groups, continuation bit set on all but the last byte.
pub struct VariableByteInteger;

impl VariableByteInteger {
    pub const MAX_BYTES: usize = 4;

    pub fn encode(val: usize) -> Result<Vec<u8>, ParseError> {
        if val > MAX_REMAINING_LENGTH {
            return Err(ParseError::ProtocolViolation(format!(
                "remaining length {} exceeds {}",
                val, MAX_REMAINING_LENGTH
            )));
        }
        let mut bytes = Vec::with_capacity(Self::MAX_BYTES);
        let mut num = val;
        loop {
            let mut byte = (num % 128) as u8;
            num /= 128;
            if num > 0 {
                byte |= 128;
            }
            bytes.push(byte);
            if num == 0 {
                break;
            }
        }
        Ok(bytes)
    }

    /// Returns `(value, bytes_used)`.
    pub fn decode(buffer: &[u8]) -> Result<(usize, usize), ParseError> {
        let mut multiplier = 1usize;
        let mut value = 0usize;

        for i in 0..Self::MAX_BYTES {
            let byte = *buffer.get(i).ok_or_else(|| {
                ParseError::More(1, "not enough bytes for remaining length".to_string())
            })?;

            value += (byte & 127) as usize * multiplier;
            if byte & 128 == 0 {
                return Ok((value, i + 1));
            }
            multiplier *= 128;
        }

        // a fifth continuation byte would push the value past the protocol maximum
        Err(ParseError::MalformedPacket(
            "remaining length exceeds four bytes".to_string(),
        ))
    }
}

pub struct BinaryData;

impl BinaryData {
    pub fn encode(data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + data.len());
        bytes.extend_from_slice(&(data.len() as u16).to_be_bytes());
        bytes.extend_from_slice(data);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<(Vec<u8>, usize), ParseError> {
        let (len, _) = TwoByteInteger::decode(bytes)?;
        let end = 2 + len as usize;
        if bytes.len() < end {
            return Err(ParseError::BufferTooShort);
        }
        Ok((bytes[2..end].to_vec(), end))
    }
}

pub struct Utf8String;

impl Utf8String {
    pub fn encode(s: &str) -> Vec<u8> {
        BinaryData::encode(s.as_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<(String, usize), ParseError> {
        let (data, len) = BinaryData::decode(bytes)?;
        let s = String::from_utf8(data).map_err(|e| ParseError::Utf8Error(e.utf8_error()))?;
        Ok((s, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_byte_integer() {
        let encoded = TwoByteInteger::encode(12345);
        assert_eq!((12345, 2), TwoByteInteger::decode(&encoded).unwrap());
        assert!(matches!(
            TwoByteInteger::decode(&[0x01]),
            Err(ParseError::BufferTooShort)
        ));
    }

    #[test]
    fn test_variable_byte_integer_boundaries() {
        assert_eq!(VariableByteInteger::encode(0).unwrap(), vec![0x00]);
        assert_eq!(VariableByteInteger::encode(127).unwrap(), vec![0x7f]);
        assert_eq!(VariableByteInteger::encode(128).unwrap(), vec![0x80, 0x01]);
        assert_eq!(
            VariableByteInteger::encode(16_384).unwrap(),
            vec![0x80, 0x80, 0x01]
        );
        assert_eq!(
            VariableByteInteger::encode(268_435_455).unwrap(),
            vec![0xff, 0xff, 0xff, 0x7f]
        );

        assert_eq!((128, 2), VariableByteInteger::decode(&[0x80, 0x01]).unwrap());
        assert_eq!(
            (2_097_151, 3),
            VariableByteInteger::decode(&[0xff, 0xff, 0x7f]).unwrap()
        );
        assert_eq!(
            (268_435_455, 4),
            VariableByteInteger::decode(&[0xff, 0xff, 0xff, 0x7f]).unwrap()
        );
    }

    #[test]
    fn test_variable_byte_integer_too_large() {
        assert!(matches!(
            VariableByteInteger::encode(268_435_456),
            Err(ParseError::ProtocolViolation(_))
        ));
        assert!(matches!(
            VariableByteInteger::decode(&[0xff, 0xff, 0xff, 0xff, 0x01]),
            Err(ParseError::MalformedPacket(_))
        ));
        assert!(matches!(
            VariableByteInteger::decode(&[0x80, 0x80, 0x80, 0x80]),
            Err(ParseError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_variable_byte_integer_partial() {
        assert!(matches!(
            VariableByteInteger::decode(&[]),
            Err(ParseError::More(1, _))
        ));
        assert!(matches!(
            VariableByteInteger::decode(&[0xff, 0x80]),
            Err(ParseError::More(1, _))
        ));
    }

    #[test]
    fn test_utf8_string() {
        let encoded = Utf8String::encode("MQTT");
        assert_eq!(encoded, vec![0x00, 0x04, b'M', b'Q', b'T', b'T']);
        assert_eq!(
            ("MQTT".to_string(), 6),
            Utf8String::decode(&encoded).unwrap()
        );
        assert!(matches!(
            Utf8String::decode(&[0x00, 0x02, 0xc3, 0x28]),
            Err(ParseError::Utf8Error(_))
        ));
        assert!(matches!(
            Utf8String::decode(&[0x00, 0x05, b'a']),
            Err(ParseError::BufferTooShort)
        ));
    }
}
