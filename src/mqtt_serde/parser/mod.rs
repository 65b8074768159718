// SPDX-License-Identifier: MPL-2.0

use super::control_packet::{ControlPacketType, MqttPacket};
use crate::mqtt_serde::base_data::{TwoByteInteger, Utf8String, VariableByteInteger};
use std::error::Error;
use std::fmt;

pub mod stream;

pub type ParserResult = Result<ParseOk, ParseError>;

// First byte of Fixed header
pub const FIXED_HDR_LEN: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    More(usize, String), // not enough data for processing, hint for how many more bytes are needed
    MalformedPacket(String),
    ProtocolViolation(String),
    Utf8Error(std::str::Utf8Error),
    StringTooLong,
    BufferTooShort,
    InvalidPacketType(u8),
    InvalidQoS(u8),
    InvalidFlags { packet_type: u8, flags: u8 },
    UnsupportedProtocolVersion(u8),
    PacketTooLarge { size: usize, max: usize },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::More(hint, msg) => write!(f, "More data needed ({} bytes): {}", hint, msg),
            ParseError::MalformedPacket(msg) => write!(f, "Malformed packet: {}", msg),
            ParseError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            ParseError::Utf8Error(e) => write!(f, "UTF-8 Error: {}", e),
            ParseError::StringTooLong => write!(f, "String Too Long"),
            ParseError::BufferTooShort => write!(f, "Buffer Too Short"),
            ParseError::InvalidPacketType(t) => write!(f, "Invalid Packet Type {}", t),
            ParseError::InvalidQoS(q) => write!(f, "Invalid QoS {}", q),
            ParseError::InvalidFlags { packet_type, flags } => write!(
                f,
                "Invalid fixed header flags {:#06b} for packet type {}",
                flags, packet_type
            ),
            ParseError::UnsupportedProtocolVersion(v) => {
                write!(f, "Unsupported Protocol Version {}", v)
            }
            ParseError::PacketTooLarge { size, max } => {
                write!(f, "Packet of {} bytes exceeds maximum of {}", size, max)
            }
        }
    }
}

impl Error for ParseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ParseError::Utf8Error(e) => Some(e),
            _ => None,
        }
    }
}

impl ParseError {
    /// True for errors that mean the peer sent bytes that can never become a valid packet.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, ParseError::More(_, _))
    }
}

#[derive(Debug, PartialEq)]
pub enum ParseOk {
    Continue(usize),           // hint: minimum number of extra bytes needed
    Packet(MqttPacket, usize), // (packet, consumed)
}

/// Location of one complete frame inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    /// Offset of the variable header.
    pub body_start: usize,
    /// Fixed header plus remaining length.
    pub total_len: usize,
}

impl Frame {
    pub fn body<'a>(&self, buffer: &'a [u8]) -> &'a [u8] {
        &buffer[self.body_start..self.total_len]
    }
}

pub enum Framed {
    Complete(Frame),
    Partial(usize),
}

pub fn packet_type(buffer: &[u8]) -> Result<u8, ParseError> {
    if buffer.is_empty() {
        return Err(ParseError::BufferTooShort);
    }
    Ok(buffer[0] >> 4)
}

pub fn parse_remaining_length(buffer: &[u8]) -> Result<(usize, usize), ParseError> {
    VariableByteInteger::decode(buffer)
}

/// Reads the fixed header of a packet of type `expected`.
///
/// The low nibble of the first byte must equal `required_flags` unless it is `None`
/// (PUBLISH carries its own DUP/QoS/RETAIN bits).
pub fn parse_frame(
    buffer: &[u8],
    expected: ControlPacketType,
    required_flags: Option<u8>,
) -> Result<Framed, ParseError> {
    let ptype = packet_type(buffer)?;
    if ptype != expected as u8 {
        return Err(ParseError::InvalidPacketType(ptype));
    }
    let flags = buffer[0] & 0x0F;
    if let Some(required) = required_flags {
        if flags != required {
            return Err(ParseError::InvalidFlags {
                packet_type: ptype,
                flags,
            });
        }
    }

    let (size, vbi_len) = match parse_remaining_length(&buffer[FIXED_HDR_LEN..]) {
        Ok(v) => v,
        Err(ParseError::More(hint, _)) => return Ok(Framed::Partial(hint)),
        Err(e) => return Err(e),
    };
    let body_start = FIXED_HDR_LEN + vbi_len;
    let total_len = body_start + size;
    if total_len > buffer.len() {
        return Ok(Framed::Partial(total_len - buffer.len()));
    }
    Ok(Framed::Complete(Frame {
        flags,
        body_start,
        total_len,
    }))
}

// 1.5.3 UTF-8 encoded strings
pub fn parse_utf8_string(buffer: &[u8]) -> Result<(String, usize), ParseError> {
    Utf8String::decode(buffer).map_err(|e| match e {
        ParseError::BufferTooShort => {
            ParseError::MalformedPacket("string runs past end of packet".to_string())
        }
        other => other,
    })
}

pub fn parse_packet_id(buffer: &[u8]) -> Result<(u16, usize), ParseError> {
    TwoByteInteger::decode(buffer).map_err(|_| {
        ParseError::MalformedPacket("packet identifier runs past end of packet".to_string())
    })
}

/// Body of PUBACK, PUBREC, PUBREL, PUBCOMP and UNSUBACK: exactly one packet identifier.
pub fn parse_packet_id_body(body: &[u8]) -> Result<u16, ParseError> {
    if body.len() != 2 {
        return Err(ParseError::MalformedPacket(format!(
            "expected remaining length 2, got {}",
            body.len()
        )));
    }
    let (id, _) = parse_packet_id(body)?;
    if id == 0 {
        return Err(ParseError::ProtocolViolation(
            "packet identifier must be non-zero".to_string(),
        ));
    }
    Ok(id)
}

/// PINGREQ, PINGRESP and DISCONNECT carry no remaining length.
pub fn expect_empty_body(frame: &Frame) -> Result<(), ParseError> {
    if frame.total_len != frame.body_start {
        return Err(ParseError::MalformedPacket(format!(
            "expected remaining length 0, got {}",
            frame.total_len - frame.body_start
        )));
    }
    Ok(())
}
