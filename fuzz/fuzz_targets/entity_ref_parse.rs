//! Fuzz target for the `<Kind>:<id>` reference syntax.

#![no_main]

use libfuzzer_sys::fuzz_target;
use omero_transfer::ir::EntityRef;

fuzz_target!(|data: &str| {
    if let Ok(target) = data.parse::<EntityRef>() {
        let reparsed: EntityRef = target.to_string().parse().expect("display output parses");
        assert_eq!(reparsed, target);
    }
});
