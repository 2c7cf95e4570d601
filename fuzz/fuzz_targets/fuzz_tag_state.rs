//! Fuzz target for tombstone tag parsing.
//!
//! Any key must survive parse -> to_wire unchanged, and tombstone
//! transitions must never stack prefixes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use origin_replication::tag::{to_delete_confirmed, to_delete_intent, TaggedKey};

fuzz_target!(|data: &str| {
    let parsed = TaggedKey::parse(data);
    assert_eq!(parsed.to_wire(), data);

    let intent = to_delete_intent(data);
    assert_eq!(to_delete_intent(&intent), intent);
    assert_eq!(to_delete_intent(&to_delete_confirmed(&intent)), intent);
});
