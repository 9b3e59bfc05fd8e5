//! Fuzz target for metadata document parsing.
//!
//! Any document that parses must also validate and round-trip without
//! panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use omero_transfer::ir::io_json::{from_json_slice, verify_round_trip};
use omero_transfer::validation::{validate_document, ValidateOptions};

fuzz_target!(|data: &[u8]| {
    if data.len() > 10 * 1024 * 1024 {
        return;
    }

    if let Ok(document) = from_json_slice(data) {
        let _ = validate_document(&document, &ValidateOptions::default());
        let _ = verify_round_trip(&document);
    }
});
