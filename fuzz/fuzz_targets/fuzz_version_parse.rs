//! Fuzz target for version token parsing.
//!
//! Remote cursors arrive as free text. Parsing must never panic, and
//! anything that parses must print back to a token that parses to the
//! same version.

#![no_main]

use libfuzzer_sys::fuzz_target;
use origin_replication::Version;

fuzz_target!(|data: &str| {
    if let Ok(v) = data.parse::<Version>() {
        let again: Version = v.to_string().parse().expect("printed version must parse");
        assert_eq!(again, v);
    }
});
