#![no_main]

use libfuzzer_sys::fuzz_target;
use mqttclient::mqtt_serde::control_packet::MqttPacket;
use mqttclient::mqtt_serde::parser::ParseOk;

// Anything that decodes and encodes again must decode to the same packet.
fuzz_target!(|data: &[u8]| {
    if let Ok(ParseOk::Packet(packet, _)) = MqttPacket::from_bytes(data) {
        if let Ok(bytes) = packet.to_bytes() {
            match MqttPacket::from_bytes(&bytes) {
                Ok(ParseOk::Packet(decoded, consumed)) => {
                    assert_eq!(packet, decoded);
                    assert_eq!(consumed, bytes.len());
                }
                other => panic!("re-encoded packet did not decode: {:?}", other),
            }
        }
    }
});
