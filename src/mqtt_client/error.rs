// SPDX-License-Identifier: MPL-2.0

//! Error types for MQTT client operations
//!
//! Errors are split by how the client reacts to them: connection errors feed the
//! reconnect policy, operation errors complete a single pending call, and
//! validation errors are returned before anything touches the network.

use crate::mqtt_client::transport::TransportError;
use crate::mqtt_serde::parser::ParseError;
use std::fmt;
use std::io;

/// Bytes of an unparsable packet kept for diagnostics.
const RAW_DATA_PREVIEW: usize = 100;

/// Error type for every MQTT client operation
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum MqttClientError {
    // ==================== Connection Errors ====================
    /// No CONNACK arrived within the connect timeout
    ConnectTimeout { timeout_ms: u64 },

    /// Broker answered CONNECT with a non-zero return code
    ConnectionRefused { return_code: u8, description: String },

    /// Connection lost unexpectedly
    ConnectionLost { reason: String },

    /// Network I/O error occurred
    NetworkError {
        #[serde(skip)]
        kind: io::ErrorKind,
        message: String,
    },

    // ==================== Protocol Errors ====================
    /// The peer broke MQTT 3.1.1; the connection is dropped
    ProtocolViolation { message: String },

    /// Failed to parse MQTT packet
    PacketParsing {
        parse_error: String,
        raw_data: Vec<u8>,
    },

    // ==================== Delivery / Session Errors ====================
    /// Retransmission cap exceeded for one operation
    DeliveryFailed { packet_id: u16, attempts: u32 },

    /// Broker did not keep the session (clean session or resumption denied)
    SessionLost,

    /// All 65535 packet identifiers are in flight
    IdentifierExhausted,

    // ==================== Input Validation ====================
    EmptyBroker,
    EmptyTopic,
    InvalidTopic { topic: String, reason: String },

    // ==================== Operation Errors ====================
    /// Operation timed out waiting for its acknowledgement
    Timeout { operation: String, timeout_ms: u64 },

    /// Operation was cancelled before completion
    OperationCancelled { operation: String },

    /// Broker answered SUBSCRIBE with 0x80
    SubscribeFailed { topic: String },

    // ==================== State Errors ====================
    /// Operation attempted in invalid connection state
    InvalidState { expected: String, actual: String },

    /// Not connected to broker
    NotConnected,

    /// Internal channel closed unexpectedly
    ChannelClosed { channel: String },

    // ==================== Configuration Errors ====================
    InvalidConfiguration { field: String, reason: String },
}

impl MqttClientError {
    /// Returns true if the error is recoverable (retry/reconnect possible)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. }
                | Self::ConnectionLost { .. }
                | Self::NetworkError { .. }
                | Self::Timeout { .. }
                | Self::DeliveryFailed { .. }
                | Self::SessionLost
                | Self::IdentifierExhausted
                | Self::NotConnected
        )
    }

    /// Returns true if the error means the connection is broken and
    /// should go through the reconnect policy.
    pub fn should_reconnect(&self) -> bool {
        match self {
            Self::ConnectionLost { .. } | Self::ConnectTimeout { .. } => true,
            Self::ProtocolViolation { .. } | Self::PacketParsing { .. } => true,
            Self::NetworkError { kind, .. } => matches!(
                kind,
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns true if retrying or reconnecting cannot help
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfiguration { .. }
                | Self::EmptyBroker
                | Self::EmptyTopic
                | Self::InvalidTopic { .. }
        ) || self.is_auth_error()
    }

    /// Refusals for bad credentials (0x04) or missing authorization (0x05)
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused {
                return_code: 0x04 | 0x05,
                ..
            }
        )
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::ConnectTimeout { timeout_ms } => {
                format!("No CONNACK from broker within {} ms", timeout_ms)
            }
            Self::ConnectionRefused {
                return_code,
                description,
            } => {
                format!(
                    "Connection refused by broker: {} (code: 0x{:02X})",
                    description, return_code
                )
            }
            Self::ConnectionLost { reason } => {
                format!("Connection to broker lost: {}", reason)
            }
            Self::NetworkError { kind, message } => {
                format!("Network error ({:?}): {}", kind, message)
            }
            Self::ProtocolViolation { message } => {
                format!("MQTT protocol violation: {}", message)
            }
            Self::PacketParsing {
                parse_error,
                raw_data,
            } => {
                let data_preview = if raw_data.len() > 20 {
                    format!(
                        "{}... ({} bytes)",
                        hex::encode(&raw_data[..20]),
                        raw_data.len()
                    )
                } else {
                    hex::encode(raw_data)
                };
                format!(
                    "Failed to parse MQTT packet: {} (data: {})",
                    parse_error, data_preview
                )
            }
            Self::DeliveryFailed {
                packet_id,
                attempts,
            } => {
                format!(
                    "Delivery of packet {} failed after {} attempts",
                    packet_id, attempts
                )
            }
            Self::SessionLost => {
                "Session state was lost. Subscriptions must be reissued.".to_string()
            }
            Self::IdentifierExhausted => {
                "All packet identifiers are in use. Wait for pending operations to complete."
                    .to_string()
            }
            Self::EmptyBroker => "Empty Broker URL".to_string(),
            Self::EmptyTopic => "Empty Subscribe Topic".to_string(),
            Self::InvalidTopic { topic, reason } => {
                format!("Invalid topic '{}': {}", topic, reason)
            }
            Self::Timeout {
                operation,
                timeout_ms,
            } => {
                format!(
                    "Operation '{}' timed out after {} ms",
                    operation, timeout_ms
                )
            }
            Self::OperationCancelled { operation } => {
                format!("Operation '{}' was cancelled", operation)
            }
            Self::SubscribeFailed { topic } => {
                format!("Broker rejected subscription to '{}'", topic)
            }
            Self::InvalidState { expected, actual } => {
                format!("Invalid state: expected {}, but was {}", expected, actual)
            }
            Self::NotConnected => "Not connected to broker. Call connect() first.".to_string(),
            Self::ChannelClosed { channel } => {
                format!("Internal channel '{}' closed unexpectedly", channel)
            }
            Self::InvalidConfiguration { field, reason } => {
                format!("Invalid configuration for '{}': {}", field, reason)
            }
        }
    }

    /// Convert from io::Error with context
    pub fn from_io_error(error: io::Error, context: &str) -> Self {
        Self::NetworkError {
            kind: error.kind(),
            message: format!("{}: {}", context, error),
        }
    }

    /// Convert from ParseError, keeping the head of the offending bytes
    pub fn from_parse_error_with_data(error: ParseError, raw_data: &[u8]) -> Self {
        let keep = raw_data.len().min(RAW_DATA_PREVIEW);
        Self::PacketParsing {
            parse_error: error.to_string(),
            raw_data: raw_data[..keep].to_vec(),
        }
    }

    pub fn invalid_topic(topic: &str, error: ParseError) -> Self {
        Self::InvalidTopic {
            topic: topic.to_string(),
            reason: error.to_string(),
        }
    }
}

impl fmt::Display for MqttClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for MqttClientError {}

impl From<io::Error> for MqttClientError {
    fn from(error: io::Error) -> Self {
        Self::NetworkError {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<TransportError> for MqttClientError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Io(e) => Self::from(e),
            TransportError::InvalidAddress(addr) => Self::InvalidConfiguration {
                field: "broker".to_string(),
                reason: format!("invalid address {}", addr),
            },
            other => Self::NetworkError {
                kind: io::ErrorKind::Other,
                message: other.to_string(),
            },
        }
    }
}

impl From<ParseError> for MqttClientError {
    fn from(error: ParseError) -> Self {
        match error {
            ParseError::ProtocolViolation(message) => Self::ProtocolViolation { message },
            too_large @ ParseError::PacketTooLarge { .. } => Self::ProtocolViolation {
                message: too_large.to_string(),
            },
            other => Self::PacketParsing {
                parse_error: other.to_string(),
                raw_data: Vec::new(),
            },
        }
    }
}

/// Type alias for Result with MqttClientError
pub type MqttClientResult<T> = Result<T, MqttClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_recoverable() {
        let recoverable_errors = vec![
            MqttClientError::ConnectionLost {
                reason: "test".to_string(),
            },
            MqttClientError::ConnectTimeout { timeout_ms: 10 },
            MqttClientError::DeliveryFailed {
                packet_id: 1,
                attempts: 4,
            },
            MqttClientError::IdentifierExhausted,
            MqttClientError::NotConnected,
        ];

        for error in recoverable_errors {
            assert!(
                error.is_recoverable(),
                "Expected {:?} to be recoverable",
                error
            );
        }
        assert!(!MqttClientError::EmptyTopic.is_recoverable());
    }

    #[test]
    fn test_should_reconnect() {
        let reconnect_errors = vec![
            MqttClientError::ConnectionLost {
                reason: "keepalive".to_string(),
            },
            MqttClientError::ProtocolViolation {
                message: "bad flags".to_string(),
            },
            MqttClientError::NetworkError {
                kind: io::ErrorKind::BrokenPipe,
                message: "test".to_string(),
            },
        ];
        for error in reconnect_errors {
            assert!(
                error.should_reconnect(),
                "Expected {:?} to trigger reconnect",
                error
            );
        }

        let no_reconnect_errors = vec![
            MqttClientError::DeliveryFailed {
                packet_id: 1,
                attempts: 4,
            },
            MqttClientError::NotConnected,
            MqttClientError::SessionLost,
        ];
        for error in no_reconnect_errors {
            assert!(
                !error.should_reconnect(),
                "Expected {:?} to not trigger reconnect",
                error
            );
        }
    }

    #[test]
    fn test_is_fatal() {
        assert!(MqttClientError::EmptyBroker.is_fatal());
        assert!(MqttClientError::ConnectionRefused {
            return_code: 0x05,
            description: "Not authorized".to_string(),
        }
        .is_fatal());
        assert!(!MqttClientError::ConnectionRefused {
            return_code: 0x03,
            description: "Server unavailable".to_string(),
        }
        .is_fatal());
    }

    #[test]
    fn test_user_message() {
        let error = MqttClientError::Timeout {
            operation: "publish".to_string(),
            timeout_ms: 5000,
        };
        assert_eq!(
            error.user_message(),
            "Operation 'publish' timed out after 5000 ms"
        );
        assert_eq!(MqttClientError::EmptyBroker.to_string(), "Empty Broker URL");
        assert_eq!(
            MqttClientError::EmptyTopic.to_string(),
            "Empty Subscribe Topic"
        );
    }

    #[test]
    fn test_parse_error_conversion() {
        let raw = vec![0xAB; 150];
        let err = MqttClientError::from_parse_error_with_data(ParseError::InvalidQoS(3), &raw);
        match &err {
            MqttClientError::PacketParsing { raw_data, .. } => assert_eq!(raw_data.len(), 100),
            other => panic!("unexpected {:?}", other),
        }
        assert!(err.user_message().contains("abababab"));

        let err: MqttClientError = ParseError::ProtocolViolation("zero id".to_string()).into();
        assert!(matches!(err, MqttClientError::ProtocolViolation { .. }));

        let err: MqttClientError = ParseError::PacketTooLarge { size: 40, max: 16 }.into();
        assert!(matches!(err, MqttClientError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        let mqtt_err = MqttClientError::from_io_error(io_err, "write_to_transport");

        match mqtt_err {
            MqttClientError::NetworkError { kind, message } => {
                assert_eq!(kind, io::ErrorKind::ConnectionReset);
                assert!(message.contains("write_to_transport"));
            }
            _ => panic!("Expected NetworkError"),
        }
    }

    #[test]
    fn test_serialize() {
        let json = serde_json::to_string(&MqttClientError::ConnectTimeout { timeout_ms: 10 })
            .unwrap();
        assert_eq!(json, "{\"ConnectTimeout\":{\"timeout_ms\":10}}");
    }
}
