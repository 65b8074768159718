// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use mqttclient::mqtt_client::transport::{BoxedTransport, Connector, TransportError};
use mqttclient::mqtt_serde::control_packet::MqttPacket;
use mqttclient::mqtt_serde::mqttv3::{
    connack::MqttConnAck, connect::MqttConnect, puback::MqttPubAck, publish::MqttPublish,
    suback::MqttSubAck, subscribe::MqttSubscribe,
};
use mqttclient::mqtt_serde::MqttParser;
use mqttclient::{
    ClientConfig, ClientEvent, ConnectionState, Message, MessageHandler, MqttClient,
    MqttClientError, QoS,
};

/// Hands the broker side of an in-memory stream to the test for every attempt.
struct DuplexConnector {
    streams: mpsc::UnboundedSender<DuplexStream>,
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, _broker: &str) -> Result<BoxedTransport, TransportError> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.streams
            .send(server)
            .map_err(|_| TransportError::ConnectionFailed("test broker gone".to_string()))?;
        Ok(Box::new(client))
    }
}

struct Broker {
    stream: DuplexStream,
    parser: MqttParser,
}

impl Broker {
    async fn accept(streams: &mut mpsc::UnboundedReceiver<DuplexStream>) -> Broker {
        Broker {
            stream: streams.recv().await.expect("connector dropped"),
            parser: MqttParser::default(),
        }
    }

    async fn recv(&mut self) -> MqttPacket {
        loop {
            if let Some(packet) = self.parser.next_packet().unwrap() {
                return packet;
            }
            let mut buf = [0u8; 1024];
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed the connection");
            self.parser.feed(&buf[..n]);
        }
    }

    async fn send(&mut self, packet: MqttPacket) {
        self.stream
            .write_all(&packet.to_bytes().unwrap())
            .await
            .unwrap();
    }

    async fn expect_connect(&mut self) -> MqttConnect {
        match self.recv().await {
            MqttPacket::Connect(connect) => connect,
            other => panic!("expected CONNECT, got {:?}", other),
        }
    }

    async fn expect_subscribe(&mut self) -> MqttSubscribe {
        match self.recv().await {
            MqttPacket::Subscribe(subscribe) => subscribe,
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        }
    }

    async fn expect_publish(&mut self) -> MqttPublish {
        match self.recv().await {
            MqttPacket::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    async fn connack(&mut self, session_present: bool) {
        self.send(MqttPacket::ConnAck(MqttConnAck::new(session_present, 0)))
            .await;
    }
}

fn config(clean_session: bool) -> ClientConfig {
    ClientConfig::builder()
        .broker("memory://broker")
        .client_id("client-test")
        .clean_session(clean_session)
        .keep_alive(0)
        .connect_timeout(Duration::from_secs(2))
        .retry_interval(Duration::from_secs(2))
        .reconnect_delay(Duration::from_secs(1), Duration::from_secs(8))
        .reconnect_jitter(0.0)
        .build()
        .unwrap()
}

fn client(config: ClientConfig) -> (MqttClient, mpsc::UnboundedReceiver<DuplexStream>) {
    let (streams, accepted) = mpsc::unbounded_channel();
    let client = MqttClient::with_connector(config, Arc::new(DuplexConnector { streams })).unwrap();
    (client, accepted)
}

async fn connected(
    client: &MqttClient,
    accepted: &mut mpsc::UnboundedReceiver<DuplexStream>,
) -> Broker {
    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    let mut broker = Broker::accept(accepted).await;
    broker.expect_connect().await;
    broker.connack(false).await;
    connecting.await.unwrap().unwrap();
    broker
}

async fn subscribed(
    client: &MqttClient,
    broker: &mut Broker,
    filter: &'static str,
) -> mpsc::UnboundedReceiver<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscribing = tokio::spawn({
        let client = client.clone();
        async move { client.subscribe(filter, QoS::AtLeastOnce, tx).await }
    });
    let request = broker.expect_subscribe().await;
    broker
        .send(MqttPacket::SubAck(MqttSubAck::new(request.packet_id, vec![1])))
        .await;
    assert_eq!(subscribing.await.unwrap().unwrap(), QoS::AtLeastOnce);
    rx
}

async fn wait_for(events: &mut broadcast::Receiver<ClientEvent>, wanted: ClientEvent) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    loop {
        let event = events.recv().await.unwrap();
        let done = event == wanted;
        seen.push(event);
        if done {
            return seen;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_against_silent_broker() {
    let (client, mut accepted) = client(config(true));
    let started = Instant::now();
    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });

    // accept the stream but never answer
    let mut broker = Broker::accept(&mut accepted).await;
    broker.expect_connect().await;

    let result = connecting.await.unwrap();
    assert_eq!(
        result,
        Err(MqttClientError::ConnectTimeout { timeout_ms: 2000 })
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2100), "{:?}", elapsed);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!client.alive());
}

#[tokio::test(start_paused = true)]
async fn test_connection_refused() {
    let (client, mut accepted) = client(config(true));
    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    let mut broker = Broker::accept(&mut accepted).await;
    broker.expect_connect().await;
    broker
        .send(MqttPacket::ConnAck(MqttConnAck::new(false, 4)))
        .await;

    let err = connecting.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        MqttClientError::ConnectionRefused { return_code: 4, .. }
    ));
    assert!(err.is_auth_error());
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_and_receive_qos1() {
    let (client, mut accepted) = client(config(true));
    let mut broker = connected(&client, &mut accepted).await;
    assert!(client.connected());

    let mut messages = subscribed(&client, &mut broker, "a/b").await;
    broker
        .send(MqttPacket::Publish(MqttPublish::new(
            "a/b".to_string(),
            1,
            b"hi".to_vec(),
            Some(10),
            false,
            false,
        )))
        .await;

    assert_eq!(
        broker.recv().await,
        MqttPacket::PubAck(MqttPubAck::new(10))
    );
    let message = messages.recv().await.unwrap();
    assert_eq!(message.topic, "a/b");
    assert_eq!(message.payload, b"hi".to_vec());
    assert_eq!(message.qos, QoS::AtLeastOnce);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(messages.try_recv().is_err());
}

/// Takes one message and then never returns.
struct Stalled(Arc<tokio::sync::Notify>);

#[async_trait]
impl MessageHandler for Stalled {
    async fn on_message(&mut self, _message: Message) {
        self.0.notified().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_handler_queue_counts_acknowledged_drop() {
    let config = ClientConfig::builder()
        .broker("memory://broker")
        .client_id("client-test")
        .keep_alive(0)
        .dispatch_queue_size(1)
        .build()
        .unwrap();
    let (client, mut accepted) = client(config);
    let mut broker = connected(&client, &mut accepted).await;

    let subscribing = tokio::spawn({
        let client = client.clone();
        let gate = Arc::new(tokio::sync::Notify::new());
        async move { client.subscribe("slow/#", QoS::AtLeastOnce, Stalled(gate)).await }
    });
    let request = broker.expect_subscribe().await;
    broker
        .send(MqttPacket::SubAck(MqttSubAck::new(request.packet_id, vec![1])))
        .await;
    subscribing.await.unwrap().unwrap();

    // first is held by the handler, second fills the queue, third is dropped
    for packet_id in 1..=3u16 {
        broker
            .send(MqttPacket::Publish(MqttPublish::new(
                "slow/1".to_string(),
                1,
                vec![packet_id as u8],
                Some(packet_id),
                false,
                false,
            )))
            .await;
        assert_eq!(
            broker.recv().await,
            MqttPacket::PubAck(MqttPubAck::new(packet_id))
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.dropped_messages(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_qos1_publish_retransmitted_with_dup() {
    let (client, mut accepted) = client(config(true));
    let mut broker = connected(&client, &mut accepted).await;

    let payload = vec![0u8, 159, 146, 150, 255];
    let publishing = tokio::spawn({
        let client = client.clone();
        let payload = payload.clone();
        async move { client.publish("r/t", QoS::AtLeastOnce, false, payload).await }
    });

    let first = broker.expect_publish().await;
    assert!(!first.dup);
    let packet_id = first.packet_id.unwrap();

    // no PUBACK; the retry interval elapses
    let second = broker.expect_publish().await;
    assert!(second.dup);
    assert_eq!(second.packet_id, Some(packet_id));
    assert_eq!(second.payload, payload);
    assert_eq!(second.topic_name, "r/t");

    broker
        .send(MqttPacket::PubAck(MqttPubAck::new(packet_id)))
        .await;
    publishing.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_publish_timeout_releases_packet_id() {
    let config = ClientConfig {
        retry_interval_ms: 60_000,
        ..config(true)
    };
    let (client, mut accepted) = client(config);
    let mut broker = connected(&client, &mut accepted).await;

    let result = client
        .publish_with_timeout("t", QoS::AtLeastOnce, false, "slow", Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(MqttClientError::Timeout { .. })));
    let first = broker.expect_publish().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let publishing = tokio::spawn({
        let client = client.clone();
        async move { client.publish("t", QoS::AtLeastOnce, false, "next").await }
    });
    let second = broker.expect_publish().await;
    assert_eq!(second.packet_id, first.packet_id);
    broker
        .send(MqttPacket::PubAck(MqttPubAck::new(second.packet_id.unwrap())))
        .await;
    publishing.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resubscribes_before_ready() {
    let (client, mut accepted) = client(config(false));
    let mut events = client.events();
    let mut old = connected(&client, &mut accepted).await;
    let mut messages = subscribed(&client, &mut old, "a/b").await;
    wait_for(&mut events, ClientEvent::Ready).await;

    // broker goes away
    drop(old);
    let mut broker = Broker::accept(&mut accepted).await;
    assert!(client.alive());
    let connect = broker.expect_connect().await;
    assert!(!connect.clean_session);
    broker.connack(true).await;

    let resubscribe = broker.expect_subscribe().await;
    let filters: Vec<&str> = resubscribe
        .subscriptions
        .iter()
        .map(|s| s.topic_filter.as_str())
        .collect();
    assert_eq!(filters, vec!["a/b"]);

    let mut before_suback = Vec::new();
    while let Ok(event) = events.try_recv() {
        before_suback.push(event);
    }
    assert!(!before_suback.contains(&ClientEvent::Ready));

    broker
        .send(MqttPacket::SubAck(MqttSubAck::new(resubscribe.packet_id, vec![1])))
        .await;
    wait_for(&mut events, ClientEvent::Ready).await;
    assert!(client.connected());

    // the handler registered before the outage still receives
    broker
        .send(MqttPacket::Publish(MqttPublish::new(
            "a/b".to_string(),
            0,
            b"again".to_vec(),
            None,
            false,
            false,
        )))
        .await;
    assert_eq!(messages.recv().await.unwrap().payload, b"again".to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_clean_session_loss_reported() {
    let (client, mut accepted) = client(config(true));
    let mut events = client.events();
    let mut broker = connected(&client, &mut accepted).await;
    let _messages = subscribed(&client, &mut broker, "a/b").await;

    drop(broker);
    let seen = wait_for(
        &mut events,
        ClientEvent::SessionLost {
            filters: vec!["a/b".to_string()],
        },
    )
    .await;
    assert!(seen
        .iter()
        .any(|e| matches!(e, ClientEvent::ConnectionLost(_))));

    let mut broker = Broker::accept(&mut accepted).await;
    broker.expect_connect().await;
    broker.connack(false).await;
    wait_for(&mut events, ClientEvent::Ready).await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect() {
    let (client, mut accepted) = client(config(true));
    let mut broker = connected(&client, &mut accepted).await;

    let disconnecting = tokio::spawn({
        let client = client.clone();
        async move { client.disconnect().await }
    });
    assert_eq!(
        broker.recv().await,
        MqttPacket::Disconnect(Default::default())
    );
    disconnecting.await.unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    assert_eq!(
        client.publish("t", QoS::AtMostOnce, false, "late").await,
        Err(MqttClientError::NotConnected)
    );
    // already disconnected
    client.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_invalid_topics_fail_fast() {
    let (client, _accepted) = client(config(true));
    assert_eq!(
        client.publish("", QoS::AtMostOnce, false, "x").await,
        Err(MqttClientError::EmptyTopic)
    );
    assert!(matches!(
        client.publish("a/#", QoS::AtMostOnce, false, "x").await,
        Err(MqttClientError::InvalidTopic { .. })
    ));
    let (tx, _rx) = mpsc::unbounded_channel::<Message>();
    assert!(matches!(
        client.subscribe("a/#/b", QoS::AtMostOnce, tx).await,
        Err(MqttClientError::InvalidTopic { .. })
    ));
}
