#![no_main]

use libfuzzer_sys::fuzz_target;
use tlsplice::Config;

fuzz_target!(|data: &[u8]| {
    let input = match std::str::from_utf8(data) {
        Ok(s) => s,
        Err(_) => return,
    };

    // Parsing runs validation too; errors are fine
    if let Ok(config) = Config::parse(input) {
        assert!(config.bind_addr().is_ok());
        assert!(config.proxy.sniff_timeout_ms > 0);
    }
});
