#![no_main]
use libfuzzer_sys::fuzz_target;
use pathstore_core::id::ObjectId;
use pathstore_core::serialize::{decode_record, unflatten};
use pathstore_core::storable::{BuildContext, ObjectHandle};
use pathstore_core::test_utils::test_types;
use std::collections::BTreeMap;

fuzz_target!(|data: &[u8]| {
    // Records that decode must rebuild or fail cleanly, even when their
    // references and payloads are garbage.
    let Ok((id, record)) = decode_record(data) else {
        return;
    };
    let resolver: BTreeMap<ObjectId, ObjectHandle> = BTreeMap::new();
    let _ = unflatten(id, &record, &resolver, &test_types(), &BuildContext::default());
});
