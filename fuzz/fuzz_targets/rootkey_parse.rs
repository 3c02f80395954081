#![no_main]

use libfuzzer_sys::fuzz_target;
use overair_trust::RootKeyPackage;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    // Structural validation must never panic and must reject empty trust
    // sets.
    if let Ok(pkg) = RootKeyPackage::parse(text) {
        assert!(!pkg.protected.root_keys.is_empty());
    }
});
