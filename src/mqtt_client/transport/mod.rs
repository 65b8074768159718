// SPDX-License-Identifier: MPL-2.0

//! Transport abstraction layer for MQTT connections
//!
//! The client only needs an ordered byte stream. A [`Connector`] produces one per
//! connection attempt, so TLS or in-memory streams plug in without touching the engine.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod tcp;

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport not supported: {0}")]
    NotSupported(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Any bidirectional byte stream the client can speak MQTT over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed transport for dynamic dispatch
pub type BoxedTransport = Box<dyn Transport>;

/// Opens a fresh transport to the broker for every connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, broker: &str) -> Result<BoxedTransport, TransportError>;
}

// Re-export transport types
pub use tcp::TcpConnector;
