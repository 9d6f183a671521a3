#![no_main]
use libfuzzer_sys::fuzz_target;
use pathstore_core::serialize::decode_record;

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary bytes to the record decoder.
    // Must not panic -- returning Err is fine.
    let _ = decode_record(data);
});
