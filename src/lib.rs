// SPDX-License-Identifier: MPL-2.0

//! MQTT 3.1.1 client core.
//!
//! - [`mqtt_serde`]: packet codec and stream parser
//! - [`mqtt_session`]: connection lifecycle and subscription table
//! - [`mqtt_client`]: in-flight tracking, reconnect policy, the sans-I/O engine and
//!   the tokio client built on it

pub mod mqtt_client;
pub mod mqtt_serde;
pub mod mqtt_session;

pub use mqtt_client::{
    handler_fn, ClientConfig, ClientEvent, Connector, LastWill, Message, MessageHandler,
    MqttClient, MqttClientError, MqttClientResult, TcpConnector,
};
pub use mqtt_serde::QoS;
pub use mqtt_session::ConnectionState;
