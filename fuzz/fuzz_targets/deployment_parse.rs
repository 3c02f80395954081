#![no_main]

use libfuzzer_sys::fuzz_target;
use overair::types::Deployment;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    // Parsing must never panic; accepted documents must carry a workflow
    // id and at least one file or step.
    if let Ok(deployment) = Deployment::from_json(text) {
        assert!(!deployment.workflow_id.is_empty());
        assert!(!deployment.files.is_empty() || deployment.steps.is_some());
    }
});
