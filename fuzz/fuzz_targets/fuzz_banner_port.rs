//! Fuzz target for SSH banner negotiation.
//!
//! The banner comes from the remote host; a hostile one must never panic
//! the parser or yield port 0.

#![no_main]

use libfuzzer_sys::fuzz_target;
use origin_replication::pool::ssh::parse_banner_port;

fuzz_target!(|data: &str| {
    if let Some(port) = parse_banner_port(data) {
        assert_ne!(port, 0);
    }
});
