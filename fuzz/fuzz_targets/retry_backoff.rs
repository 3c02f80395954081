#![no_main]

use libfuzzer_sys::fuzz_target;
use overair_retry::{RetryPolicy, backoff_delay, next_attempt_at};

fuzz_target!(|data: (u32, u64, u64, u64, u32, u32, u64)| {
    let (attempts, additional, initial_ms, max_secs, jitter, exponent, now) = data;

    let policy = RetryPolicy {
        additional_delay_secs: additional % 3_600,
        initial_delay_ms: initial_ms % 60_000 + 1,
        max_delay_secs: max_secs % 86_400 + 1,
        max_jitter_percent: jitter,
        max_exponent: exponent,
    };

    let delay = backoff_delay(&policy, attempts);

    // Cap law: delay never exceeds max_delay * (1 + jitter/100), with the
    // jitter percentage itself bounded at 100.
    let ceiling_ms = policy.max_delay_secs as u128 * 1_000 * 2 + 1;
    assert!(delay.as_millis() <= ceiling_ms);

    // The absolute timestamp never wraps and never precedes `now`.
    let due = next_attempt_at(&policy, attempts, now);
    assert!(due >= now);
});
