#![no_main]

use libfuzzer_sys::fuzz_target;
use tlsplice::negotiation::sniff::classify;
use tlsplice::Address;

fuzz_target!(|data: &[u8]| {
    // A decision, once made, must not change as more bytes arrive
    let mut decided = None;
    for end in 0..=data.len().min(8) {
        match (decided, classify(&data[..end])) {
            (None, found) => decided = found,
            (Some(before), Some(after)) => assert_eq!(before, after),
            (Some(_), None) => panic!("classification withdrawn at {} bytes", end),
        }
    }

    if let Ok(authority) = std::str::from_utf8(data) {
        if let Ok(address) = Address::parse(authority, 443) {
            assert!(!address.host.is_empty());
        }
    }
});
