#![no_main]

use libfuzzer_sys::fuzz_target;
use mqttclient::mqtt_serde::MqttParser;

// First byte picks the chunk size, the rest is fed as a byte stream.
fuzz_target!(|data: &[u8]| {
    let (chunk, stream) = match data.split_first() {
        Some((c, rest)) => (usize::from(*c).max(1), rest),
        None => return,
    };
    let mut parser = MqttParser::new(64, 4096);
    for piece in stream.chunks(chunk) {
        parser.feed(piece);
        loop {
            match parser.next_packet() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
});
