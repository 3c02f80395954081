//! Backoff scheduling for remote interactions of the update agent.
//!
//! Every retrying component (download, install, apply, post-reboot
//! resumption) asks this crate when its next attempt is due. The
//! computation is pure: given an attempt count and a policy it returns a
//! delay or an absolute epoch timestamp, with no I/O and no failure mode.
//!
//! # Example
//!
//! ```
//! use overair_retry::{RetryPolicy, backoff_delay, next_attempt_at};
//!
//! let policy = RetryPolicy::transient_network();
//! let delay = backoff_delay(&policy, 2);
//! assert!(delay.as_secs() <= policy.max_delay_secs * 2);
//!
//! let due = next_attempt_at(&policy, 2, 1_700_000_000);
//! assert!(due >= 1_700_000_000);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard bound on the exponent used in backoff computation.
pub const MAX_EXPONENT_BOUND: u32 = 9;

/// Hard bound on the jitter percentage.
pub const MAX_JITTER_PERCENT_BOUND: u32 = 100;

/// Backoff policy for one class of failure.
///
/// The delay for attempt `n` is
/// `min(max_delay_secs, 2^min(n, max_exponent) * initial_delay_ms / 1000)`
/// scaled by a random factor in `[1, 1 + max_jitter_percent/100]`, with
/// `additional_delay_secs` added on top of the backoff when converting to an
/// absolute timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Flat delay added before the exponential component.
    #[serde(default)]
    pub additional_delay_secs: u64,
    /// Base delay multiplied by the exponential factor.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Cap on the exponential component, in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Upper bound of the random jitter, as a percentage of the delay.
    #[serde(default = "default_max_jitter_percent")]
    pub max_jitter_percent: u32,
    /// Attempt count at which the exponential factor stops growing.
    #[serde(default = "default_max_exponent")]
    pub max_exponent: u32,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_secs() -> u64 {
    30 * 60
}

fn default_max_jitter_percent() -> u32 {
    60
}

fn default_max_exponent() -> u32 {
    MAX_EXPONENT_BOUND
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            additional_delay_secs: 0,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            max_jitter_percent: default_max_jitter_percent(),
            max_exponent: default_max_exponent(),
        }
    }
}

impl RetryPolicy {
    /// Aggressive policy for transient network failures.
    pub fn transient_network() -> Self {
        Self {
            additional_delay_secs: 0,
            initial_delay_ms: 500,
            max_delay_secs: 5 * 60,
            max_jitter_percent: 60,
            max_exponent: 8,
        }
    }

    /// Policy for cloud-reported throttling.
    ///
    /// The server-provided `retry-after` (seconds) becomes a floor below
    /// which no attempt is scheduled; see [`next_attempt_at_throttled`].
    pub fn cloud_throttled() -> Self {
        Self {
            additional_delay_secs: 30,
            initial_delay_ms: 2_000,
            max_delay_secs: 60 * 60,
            max_jitter_percent: 40,
            max_exponent: MAX_EXPONENT_BOUND,
        }
    }

    /// Conservative policy for resuming work after a reboot.
    pub fn post_reboot() -> Self {
        Self {
            additional_delay_secs: 60,
            initial_delay_ms: 5_000,
            max_delay_secs: 2 * 60 * 60,
            max_jitter_percent: 20,
            max_exponent: MAX_EXPONENT_BOUND,
        }
    }

    /// Exponent actually used, never above [`MAX_EXPONENT_BOUND`].
    pub fn effective_exponent(&self, attempts: u32) -> u32 {
        attempts.min(self.max_exponent).min(MAX_EXPONENT_BOUND)
    }

    /// Jitter percentage actually used, never above
    /// [`MAX_JITTER_PERCENT_BOUND`].
    pub fn effective_jitter_percent(&self) -> u32 {
        self.max_jitter_percent.min(MAX_JITTER_PERCENT_BOUND)
    }
}

/// Compute the backoff delay for the given attempt count, jitter included.
pub fn backoff_delay(policy: &RetryPolicy, attempts: u32) -> Duration {
    jittered(base_delay(policy, attempts), policy.effective_jitter_percent())
}

/// The deterministic component of the delay, before jitter.
pub fn base_delay(policy: &RetryPolicy, attempts: u32) -> Duration {
    let factor = 1u64 << policy.effective_exponent(attempts);
    let millis = factor.saturating_mul(policy.initial_delay_ms);
    let capped = millis.min(policy.max_delay_secs.saturating_mul(1_000));
    Duration::from_millis(capped)
}

/// Absolute epoch-seconds timestamp of the next attempt.
pub fn next_attempt_at(policy: &RetryPolicy, attempts: u32, now_epoch_secs: u64) -> u64 {
    let delay = backoff_delay(policy, attempts);
    now_epoch_secs
        .saturating_add(policy.additional_delay_secs)
        .saturating_add(delay.as_secs())
}

/// Like [`next_attempt_at`], but never earlier than a server-provided
/// `retry-after` interval.
pub fn next_attempt_at_throttled(
    policy: &RetryPolicy,
    attempts: u32,
    now_epoch_secs: u64,
    retry_after_secs: u64,
) -> u64 {
    let backed_off = next_attempt_at(policy, attempts, now_epoch_secs);
    backed_off.max(now_epoch_secs.saturating_add(retry_after_secs))
}

/// Scale a delay by a random factor in `[1, 1 + jitter_percent/100]`.
///
/// The thread RNG is seeded per process, so two agents restarted at the same
/// wall-clock moment do not stampede the same endpoint.
fn jittered(delay: Duration, jitter_percent: u32) -> Duration {
    if jitter_percent == 0 {
        return delay;
    }
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let unit: f64 = rng.r#gen();
    let factor = 1.0 + unit * (f64::from(jitter_percent) / 100.0);
    let millis = (delay.as_millis() as f64 * factor).round() as u64;
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter(mut policy: RetryPolicy) -> RetryPolicy {
        policy.max_jitter_percent = 0;
        policy
    }

    #[test]
    fn base_delay_doubles_until_cap() {
        let policy = no_jitter(RetryPolicy {
            additional_delay_secs: 0,
            initial_delay_ms: 1_000,
            max_delay_secs: 60,
            max_jitter_percent: 0,
            max_exponent: 9,
        });

        assert_eq!(backoff_delay(&policy, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(&policy, 5), Duration::from_secs(32));
        // 2^6 = 64s, capped at 60s.
        assert_eq!(backoff_delay(&policy, 6), Duration::from_secs(60));
        assert_eq!(backoff_delay(&policy, 60), Duration::from_secs(60));
    }

    #[test]
    fn exponent_stops_growing_at_max_exponent() {
        let policy = no_jitter(RetryPolicy {
            additional_delay_secs: 0,
            initial_delay_ms: 10,
            max_delay_secs: 24 * 60 * 60,
            max_jitter_percent: 0,
            max_exponent: 3,
        });

        assert_eq!(backoff_delay(&policy, 3), backoff_delay(&policy, 4));
        assert_eq!(backoff_delay(&policy, 3), backoff_delay(&policy, 100));
    }

    #[test]
    fn exponent_is_bounded_even_when_configured_higher() {
        let policy = RetryPolicy {
            max_exponent: 40,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.effective_exponent(50), MAX_EXPONENT_BOUND);
    }

    #[test]
    fn jitter_percent_is_bounded() {
        let policy = RetryPolicy {
            max_jitter_percent: 400,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.effective_jitter_percent(), MAX_JITTER_PERCENT_BOUND);
    }

    #[test]
    fn next_attempt_adds_flat_delay() {
        let policy = no_jitter(RetryPolicy {
            additional_delay_secs: 100,
            initial_delay_ms: 1_000,
            max_delay_secs: 60,
            max_jitter_percent: 0,
            max_exponent: 9,
        });

        assert_eq!(next_attempt_at(&policy, 0, 1_000), 1_000 + 100 + 1);
    }

    #[test]
    fn throttled_respects_server_floor() {
        let policy = no_jitter(RetryPolicy {
            additional_delay_secs: 0,
            initial_delay_ms: 1_000,
            max_delay_secs: 60,
            max_jitter_percent: 0,
            max_exponent: 9,
        });

        // Backoff says +2s, server says wait 300s.
        assert_eq!(next_attempt_at_throttled(&policy, 1, 1_000, 300), 1_300);
        // Backoff dominates once it exceeds the floor.
        assert_eq!(next_attempt_at_throttled(&policy, 6, 1_000, 5), 1_060);
    }

    #[test]
    fn jitter_stays_within_configured_band() {
        let policy = RetryPolicy {
            additional_delay_secs: 0,
            initial_delay_ms: 10_000,
            max_delay_secs: 60,
            max_jitter_percent: 50,
            max_exponent: 9,
        };

        let floor = base_delay(&policy, 0);
        let ceiling = Duration::from_millis((floor.as_millis() as f64 * 1.5).round() as u64);
        for _ in 0..200 {
            let d = backoff_delay(&policy, 0);
            assert!(d >= floor, "delay {d:?} below floor {floor:?}");
            assert!(d <= ceiling, "delay {d:?} above ceiling {ceiling:?}");
        }
    }

    #[test]
    fn presets_are_ordered_by_aggression() {
        let net = RetryPolicy::transient_network();
        let reboot = RetryPolicy::post_reboot();
        assert!(net.initial_delay_ms < reboot.initial_delay_ms);
        assert!(net.additional_delay_secs < reboot.additional_delay_secs);
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str("{}").expect("parse");
        assert_eq!(policy, RetryPolicy::default());

        let policy: RetryPolicy =
            serde_json::from_str(r#"{"initialDelayMs": 250, "maxExponent": 4}"#).expect("parse");
        assert_eq!(policy.initial_delay_ms, 250);
        assert_eq!(policy.max_exponent, 4);
    }

    proptest! {
        // Without jitter the delay is exactly the expected value, so
        // monotonicity in the attempt count is monotonicity of E[delay].
        #[test]
        fn expected_delay_is_monotone(
            a in 0u32..16,
            b in 0u32..16,
            initial in 1u64..5_000,
            cap in 1u64..3_600,
        ) {
            prop_assume!(a < b);
            let policy = RetryPolicy {
                additional_delay_secs: 0,
                initial_delay_ms: initial,
                max_delay_secs: cap,
                max_jitter_percent: 0,
                max_exponent: MAX_EXPONENT_BOUND,
            };
            prop_assert!(backoff_delay(&policy, a) <= backoff_delay(&policy, b));
        }

        #[test]
        fn delay_never_exceeds_cap_plus_jitter(
            attempts in 0u32..1_000,
            initial in 1u64..5_000,
            cap in 1u64..3_600,
            jitter in 0u32..=100,
        ) {
            let policy = RetryPolicy {
                additional_delay_secs: 0,
                initial_delay_ms: initial,
                max_delay_secs: cap,
                max_jitter_percent: jitter,
                max_exponent: MAX_EXPONENT_BOUND,
            };
            let ceiling_ms =
                (cap as f64 * 1_000.0 * (1.0 + f64::from(jitter) / 100.0)).round() as u128 + 1;
            prop_assert!(backoff_delay(&policy, attempts).as_millis() <= ceiling_ms);
        }
    }
}
