// SPDX-License-Identifier: MPL-2.0

// Integration tests for the MQTT 3.1.1 codec and stream parser

use mqttclient::mqtt_serde::base_data::VariableByteInteger;
use mqttclient::mqtt_serde::control_packet::MqttPacket;
use mqttclient::mqtt_serde::mqttv3::{
    connect::{MqttConnect, Will},
    disconnect::MqttDisconnect,
    pingreq::MqttPingReq,
    publish::MqttPublish,
    pubrel::MqttPubRel,
    subscribe::{MqttSubscribe, SubscriptionTopic},
};
use mqttclient::mqtt_serde::parser::{packet_type, parse_remaining_length, ParseError, ParseOk};
use mqttclient::mqtt_serde::{decode, encode, MqttParser, MAX_REMAINING_LENGTH};

fn session_packets() -> Vec<MqttPacket> {
    let mut connect = MqttConnect::new("parser-test".to_string(), 30, false);
    connect.will = Some(Will {
        retain: true,
        qos: 1,
        topic: "status/parser-test".to_string(),
        message: b"offline".to_vec(),
    });
    connect.username = Some("user".to_string());
    connect.password = Some(b"pw".to_vec());

    vec![
        MqttPacket::Connect(connect),
        MqttPacket::Publish(MqttPublish::new(
            "sensors/1/temp".to_string(),
            1,
            vec![0x00, 0xFF, 0x10, 0x20],
            Some(42),
            false,
            true,
        )),
        MqttPacket::PubRel(MqttPubRel::new(43)),
        MqttPacket::Subscribe(MqttSubscribe::new(
            44,
            vec![
                SubscriptionTopic::new("sensors/+/temp", 1),
                SubscriptionTopic::new("alerts/#", 2),
            ],
        )),
        MqttPacket::PingReq(MqttPingReq::new()),
        MqttPacket::Disconnect(MqttDisconnect::new()),
    ]
}

fn wire(packets: &[MqttPacket]) -> Vec<u8> {
    packets
        .iter()
        .flat_map(|p| encode(p).unwrap())
        .collect()
}

fn drain(parser: &mut MqttParser, out: &mut Vec<MqttPacket>) {
    while let Some(packet) = parser.next_packet().unwrap() {
        out.push(packet);
    }
}

#[test]
fn test_packet_type_extraction() {
    assert_eq!(packet_type(&[0x10, 0x00]).unwrap(), 1);
    assert_eq!(packet_type(&[0x62, 0x02]).unwrap(), 6);
    assert_eq!(packet_type(&[0xE0, 0x00]).unwrap(), 14);
    assert_eq!(packet_type(&[]), Err(ParseError::BufferTooShort));
}

#[test]
fn test_remaining_length_boundaries() {
    let cases: [(usize, &[u8]); 6] = [
        (0, &[0x00]),
        (127, &[0x7F]),
        (128, &[0x80, 0x01]),
        (16_383, &[0xFF, 0x7F]),
        (16_384, &[0x80, 0x80, 0x01]),
        (MAX_REMAINING_LENGTH, &[0xFF, 0xFF, 0xFF, 0x7F]),
    ];
    for (value, bytes) in cases {
        assert_eq!(VariableByteInteger::encode(value).unwrap(), bytes.to_vec());
        assert_eq!(parse_remaining_length(bytes).unwrap(), (value, bytes.len()));
    }
    assert!(VariableByteInteger::encode(MAX_REMAINING_LENGTH + 1).is_err());
}

#[test]
fn test_remaining_length_too_many_bytes() {
    let result = parse_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
    assert!(matches!(result, Err(ParseError::MalformedPacket(_))));
}

#[test]
fn test_remaining_length_incomplete() {
    assert!(matches!(
        parse_remaining_length(&[0x80, 0x80]),
        Err(ParseError::More(_, _))
    ));
}

#[test]
fn test_decode_partial_asks_for_more() {
    let bytes = encode(&session_packets()[1]).unwrap();
    for cut in 0..bytes.len() {
        match decode(&bytes[..cut]) {
            Ok(ParseOk::Continue(hint)) => assert!(hint > 0),
            other => panic!("cut at {}: unexpected {:?}", cut, other),
        }
    }
    match decode(&bytes).unwrap() {
        ParseOk::Packet(packet, consumed) => {
            assert_eq!(packet, session_packets()[1]);
            assert_eq!(consumed, bytes.len());
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_stream_split_at_every_offset() {
    let packets = session_packets();
    let bytes = wire(&packets);

    for split in 0..=bytes.len() {
        let mut parser = MqttParser::default();
        let mut out = Vec::new();
        parser.feed(&bytes[..split]);
        drain(&mut parser, &mut out);
        parser.feed(&bytes[split..]);
        drain(&mut parser, &mut out);
        assert_eq!(out, packets, "split at {}", split);
        assert_eq!(parser.buffered_len(), 0);
    }
}

#[test]
fn test_stream_byte_at_a_time() {
    let packets = session_packets();
    let mut parser = MqttParser::default();
    let mut out = Vec::new();
    for byte in wire(&packets) {
        parser.feed(&[byte]);
        drain(&mut parser, &mut out);
    }
    assert_eq!(out, packets);
}

#[test]
fn test_reserved_packet_types_rejected() {
    assert!(decode(&[0x00, 0x00]).is_err());
    assert!(decode(&[0xF0, 0x00]).is_err());
}

#[test]
fn test_reserved_flags_rejected() {
    // PUBREL, SUBSCRIBE and UNSUBSCRIBE require flags 0b0010
    assert!(matches!(
        decode(&[0x60, 0x02, 0x00, 0x01]),
        Err(ParseError::InvalidFlags { .. })
    ));
    assert!(matches!(
        decode(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x00]),
        Err(ParseError::InvalidFlags { .. })
    ));
    // PINGREQ carries no flags
    assert!(matches!(
        decode(&[0xC1, 0x00]),
        Err(ParseError::InvalidFlags { .. })
    ));
}

#[test]
fn test_publish_qos3_rejected() {
    let result = decode(&[0x36, 0x05, 0x00, 0x01, b'a', 0x00, 0x01]);
    assert_eq!(result, Err(ParseError::InvalidQoS(3)));
}

#[test]
fn test_oversized_frame_rejected_from_header() {
    let mut parser = MqttParser::new(64, 16);
    // PUBLISH announcing 100 body bytes; only the header is buffered
    parser.feed(&[0x30, 0x64]);
    assert_eq!(
        parser.next_packet(),
        Err(ParseError::PacketTooLarge { size: 102, max: 16 })
    );
}

#[test]
fn test_malformed_stream_reports_error() {
    let mut parser = MqttParser::default();
    // PUBACK with a three byte body
    parser.feed(&[0x40, 0x03, 0x00, 0x01, 0x00]);
    let err = parser.next_packet().unwrap_err();
    assert!(err.is_malformed());
}

#[test]
fn test_reset_discards_partial_frame() {
    let mut parser = MqttParser::default();
    parser.feed(&[0x30, 0x10, 0x00]);
    assert_eq!(parser.next_packet(), Ok(None));
    parser.reset();
    assert_eq!(parser.buffered_len(), 0);

    parser.feed(&encode(&MqttPacket::PingReq(MqttPingReq::new())).unwrap());
    assert_eq!(
        parser.next_packet(),
        Ok(Some(MqttPacket::PingReq(MqttPingReq::new())))
    );
}
