#![no_main]

use libfuzzer_sys::fuzz_target;
use mqttclient::mqtt_serde::parser;

fuzz_target!(|data: &[u8]| {
    parser::parse_remaining_length(data).ok();
    parser::parse_utf8_string(data).ok();
    parser::parse_packet_id(data).ok();
    parser::parse_packet_id_body(data).ok();
    parser::packet_type(data).ok();
    mqttclient::mqtt_serde::validate_topic_filter(&String::from_utf8_lossy(data)).ok();
});
