// SPDX-License-Identifier: MPL-2.0

//! TCP transport implementation

use super::{BoxedTransport, Connector, TransportError};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

pub const DEFAULT_PORT: u16 = 1883;

/// Plain TCP connector.
///
/// Accepts `host:port`, `tcp://host:port` or `mqtt://host:port`; the port defaults to 1883.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    nodelay: bool,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TcpConnector {
    pub fn new(nodelay: bool) -> Self {
        Self { nodelay }
    }
}

/// Strips the scheme and fills in the default port.
pub fn socket_address(broker: &str) -> Result<String, TransportError> {
    let rest = match broker.split_once("://") {
        Some(("tcp", rest)) | Some(("mqtt", rest)) => rest,
        Some((scheme, _)) => {
            return Err(TransportError::NotSupported(format!(
                "scheme '{}' needs a custom connector",
                scheme
            )))
        }
        None => broker,
    };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(TransportError::InvalidAddress(broker.to_string()));
    }

    // bracketed IPv6 literal without port, e.g. [::1]
    if rest.starts_with('[') && rest.ends_with(']') {
        return Ok(format!("{}:{}", rest, DEFAULT_PORT));
    }
    match rest.rsplit_once(':') {
        Some((host, port)) if (!host.is_empty() && !host.contains(':')) || host.ends_with(']') => {
            port.parse::<u16>()
                .map_err(|_| TransportError::InvalidAddress(broker.to_string()))?;
            Ok(rest.to_string())
        }
        Some(_) => Err(TransportError::InvalidAddress(broker.to_string())),
        None => Ok(format!("{}:{}", rest, DEFAULT_PORT)),
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, broker: &str) -> Result<BoxedTransport, TransportError> {
        let addr = socket_address(broker)?;
        debug!(%addr, "opening TCP connection");
        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            TransportError::ConnectionFailed(format!("TCP connection to {} failed: {}", addr, e))
        })?;
        stream.set_nodelay(self.nodelay)?;
        Ok(Box::new(stream))
    }
}
