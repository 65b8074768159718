// SPDX-License-Identifier: MPL-2.0

pub mod backoff;
pub mod client;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod inflight;
pub mod opts;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use client::{ClientEvent, MqttClient};
pub use dispatch::{handler_fn, FnHandler, Message, MessageHandler};
pub use engine::{Ack, MqttEngine, MqttEvent};
pub use error::{MqttClientError, MqttClientResult};
pub use inflight::{InflightTracker, OpId};
pub use opts::{ClientConfig, ClientConfigBuilder, LastWill};
pub use transport::{BoxedTransport, Connector, TcpConnector, Transport, TransportError};
