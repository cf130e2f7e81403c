#![no_main]

use keyfob_core::feature::FeaturePackage;
use keyfob_core::state::Record;
use keyfob_core::{CarRecord, DeviceState, Message, MessageLink, MessageType};
use keyfob_crypto::SharedSecret;
use keyfob_platform::mock::MockChannel;
use keyfob_platform::ByteChannel;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Raw bytes off the board link: must never panic or lose sync.
    let (mut wire, channel) = MockChannel::pair();
    let _ = wire.send(data);
    drop(wire);
    let mut link = MessageLink::new(channel, Some(SharedSecret::from_bytes([0x42; 32])));
    while let Ok(_) | Err(keyfob_core::Error::Malformed(_) | keyfob_core::Error::CorruptMessage) =
        link.receive()
    {}

    // Plaintext payload parsers.
    for kind in [MessageType::Start, MessageType::Pair, MessageType::Unlock] {
        if let Ok(message) = Message::new(kind, data.to_vec()) {
            let _ = message.feature_set();
            let _ = message.pairing_record();
            let _ = message.nonce();
        }
    }

    // Persisted records and operator packages.
    let _ = DeviceState::decode(data);
    let _ = CarRecord::decode(data);
    let _ = FeaturePackage::from_bytes(data);
});
