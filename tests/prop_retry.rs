//! Property checks on the backoff curve.

use std::time::Duration;

use proptest::prelude::*;

use sqs_listener::retry::{idle_jitter, Backoff};

proptest! {
    // Jitter never pushes a delay past cap + 25%.
    #[test]
    fn delay_is_bounded_by_cap_plus_jitter(
        base_ms in 1u64..5_000,
        cap_ms in 1u64..60_000,
        attempt in 0u32..40,
    ) {
        let b = Backoff::new(Duration::from_millis(base_ms), Duration::from_millis(cap_ms));
        let cap = Duration::from_millis(cap_ms);
        prop_assert!(b.delay(attempt) <= cap + cap / 4);
    }

    // Without jitter the curve is non-decreasing in the attempt number.
    #[test]
    fn delay_is_monotone_without_jitter(
        base_ms in 1u64..1_000,
        cap_ms in 1u64..60_000,
        attempt in 0u32..20,
    ) {
        let b = Backoff::new(Duration::from_millis(base_ms), Duration::from_millis(cap_ms))
            .without_jitter();
        prop_assert!(b.delay(attempt) <= b.delay(attempt + 1));
    }

    // The idle nap never exceeds its configured ceiling.
    #[test]
    fn idle_jitter_respects_ceiling(max_ms in 0u64..10_000) {
        let max = Duration::from_millis(max_ms);
        prop_assert!(idle_jitter(max) <= max);
    }
}
