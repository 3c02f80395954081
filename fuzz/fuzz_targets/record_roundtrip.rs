#![no_main]

use libfuzzer_sys::fuzz_target;
use overair::persistence::WorkflowRecord;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    // Any record that deserializes must survive a serialize/deserialize
    // round trip unchanged.
    if let Ok(record) = serde_json::from_str::<WorkflowRecord>(text) {
        let json = serde_json::to_string(&record).expect("serialize");
        let reparsed: WorkflowRecord = serde_json::from_str(&json).expect("reparse");
        assert_eq!(reparsed, record);
    }
});
