// SPDX-License-Identifier: MPL-2.0

//! Connects, subscribes to `goclient_sub`, publishes to `goclient_pub` and keeps
//! printing received messages until Ctrl-C.
//!
//! Environment: `MQTT_BROKER`, `MQTT_CLIENT_ID`, `MQTT_USERNAME`, `MQTT_PASSWORD`,
//! `MQTT_CLEAN_SESSION`, `RUST_LOG`.

use std::env;

use mqttclient::{handler_fn, ClientConfig, ClientEvent, Message, MqttClient, QoS};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_BROKER: &str = "tcp://test.mosquitto.org:1883";
const SUB_TOPIC: &str = "goclient_sub";
const PUB_TOPIC: &str = "goclient_pub";

fn config_from_env() -> mqttclient::MqttClientResult<ClientConfig> {
    let mut builder = ClientConfig::builder()
        .broker(env::var("MQTT_BROKER").unwrap_or_else(|_| DEFAULT_BROKER.to_string()))
        .client_id(env::var("MQTT_CLIENT_ID").unwrap_or_else(|_| "goclienttest".to_string()))
        .clean_session(
            env::var("MQTT_CLEAN_SESSION")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
        );
    if let (Ok(username), Ok(password)) = (env::var("MQTT_USERNAME"), env::var("MQTT_PASSWORD")) {
        builder = builder.credentials(username, password);
    }
    builder.build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config_from_env()?;
    let client = MqttClient::new(config)?;

    let mut events = client.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::ConnectionLost(e) => error!(error = %e, "connection lost"),
                other => info!(event = ?other, "client event"),
            }
        }
    });

    client.connect().await?;

    let granted = client
        .subscribe(
            SUB_TOPIC,
            QoS::AtMostOnce,
            handler_fn(|message: Message| {
                info!(topic = %message.topic, payload = ?message.payload, "received data");
            }),
        )
        .await?;
    info!(topic = SUB_TOPIC, granted = %granted, "subscribed");

    client
        .publish(PUB_TOPIC, QoS::AtMostOnce, false, "Hello")
        .await?;
    info!(topic = PUB_TOPIC, "published");

    tokio::signal::ctrl_c().await?;
    client.disconnect().await?;
    Ok(())
}
