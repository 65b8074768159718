// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::info;

use crate::mqtt_client::error::{MqttClientError, MqttClientResult};
use crate::mqtt_serde::mqttv3::connect::Will;
use crate::mqtt_serde::{validate_topic_name, QoS};

pub const CLIENT_ID_PREFIX: &str = "mqttclient_";

/// Last will published by the broker if the connection drops without DISCONNECT.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LastWill {
    pub topic: String,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

impl LastWill {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }

    pub(crate) fn to_will(&self) -> Will {
        Will {
            retain: self.retain,
            qos: self.qos.as_u8(),
            topic: self.topic.clone(),
            message: self.payload.clone(),
        }
    }
}

/// Client configuration. Fixed once a client is built; shared as `Arc<ClientConfig>`.
///
/// Durations are kept in milliseconds so the struct deserializes from flat JSON.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port`, `tcp://host:port` or `mqtt://host:port`
    pub broker: String,
    /// Generated when empty
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
    /// Seconds; 0 disables keepalive
    pub keep_alive: u16,
    pub default_qos: QoS,
    pub will: Option<LastWill>,

    pub connect_timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub max_retries: u32,

    pub auto_reconnect: bool,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Fraction of the delay added or removed at random, in [0, 1]
    pub reconnect_jitter: f64,
    /// 0 = unlimited
    pub max_reconnect_attempts: u32,

    pub disconnect_grace_ms: u64,
    pub command_queue_size: usize,
    pub dispatch_queue_size: usize,
    pub max_packet_size: usize,
    pub tcp_nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker: String::new(),
            client_id: String::new(),
            username: None,
            password: None,
            clean_session: false,
            keep_alive: 60,
            default_qos: QoS::AtMostOnce,
            will: None,
            connect_timeout_ms: 10_000,
            retry_interval_ms: 10_000,
            max_retries: 3,
            auto_reconnect: true,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
            reconnect_jitter: 0.2,
            max_reconnect_attempts: 0,
            disconnect_grace_ms: 1_000,
            command_queue_size: 256,
            dispatch_queue_size: 128,
            max_packet_size: 1024 * 1024,
            tcp_nodelay: true,
        }
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> MqttClientError {
    MqttClientError::InvalidConfiguration {
        field: field.to_string(),
        reason: reason.into(),
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Checks the settings and fills in a random client id when none was given.
    pub fn validate(&mut self) -> MqttClientResult<()> {
        if self.broker.trim().is_empty() {
            return Err(MqttClientError::EmptyBroker);
        }
        if self.client_id.is_empty() {
            info!("Empty client id, generating a random one");
            self.client_id = generate_client_id();
            info!(client_id = %self.client_id, "Generated client id");
        }
        if self.connect_timeout_ms == 0 {
            return Err(invalid("connect_timeout_ms", "must be greater than zero"));
        }
        if self.retry_interval_ms == 0 {
            return Err(invalid("retry_interval_ms", "must be greater than zero"));
        }
        if self.reconnect_base_delay_ms == 0 {
            return Err(invalid(
                "reconnect_base_delay_ms",
                "must be greater than zero",
            ));
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(invalid(
                "reconnect_max_delay_ms",
                format!(
                    "{} is below reconnect_base_delay_ms {}",
                    self.reconnect_max_delay_ms, self.reconnect_base_delay_ms
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return Err(invalid("reconnect_jitter", "must be within [0, 1]"));
        }
        if self.command_queue_size == 0 {
            return Err(invalid("command_queue_size", "must be greater than zero"));
        }
        if self.dispatch_queue_size == 0 {
            return Err(invalid("dispatch_queue_size", "must be greater than zero"));
        }
        // smallest useful frame: a CONNACK
        if self.max_packet_size < 4 {
            return Err(invalid("max_packet_size", "must be at least 4 bytes"));
        }
        if let Some(will) = &self.will {
            validate_topic_name(&will.topic)
                .map_err(|e| MqttClientError::invalid_topic(&will.topic, e))?;
        }
        Ok(())
    }

    /// Username and password are only sent when both are non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        if self.keep_alive == 0 {
            None
        } else {
            Some(Duration::from_secs(self.keep_alive as u64))
        }
    }
}

pub fn generate_client_id() -> String {
    let suffix: u64 = rand::thread_rng().gen();
    format!("{}{:016x}", CLIENT_ID_PREFIX, suffix)
}

/// Fluent builder for [`ClientConfig`]
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broker(mut self, broker: impl Into<String>) -> Self {
        self.config.broker = broker.into();
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self.config.password = Some(password.into());
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.config.clean_session = clean;
        self
    }

    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.config.keep_alive = seconds;
        self
    }

    pub fn default_qos(mut self, qos: QoS) -> Self {
        self.config.default_qos = qos;
        self
    }

    pub fn will(mut self, will: LastWill) -> Self {
        self.config.will = Some(will);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    pub fn reconnect_delay(mut self, base: Duration, max: Duration) -> Self {
        self.config.reconnect_base_delay_ms = base.as_millis() as u64;
        self.config.reconnect_max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.config.reconnect_jitter = jitter;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    pub fn disconnect_grace(mut self, grace: Duration) -> Self {
        self.config.disconnect_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn command_queue_size(mut self, size: usize) -> Self {
        self.config.command_queue_size = size;
        self
    }

    pub fn dispatch_queue_size(mut self, size: usize) -> Self {
        self.config.dispatch_queue_size = size;
        self
    }

    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.config.max_packet_size = size;
        self
    }

    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    pub fn build(self) -> MqttClientResult<ClientConfig> {
        let mut config = self.config;
        config.validate()?;
        Ok(config)
    }
}
