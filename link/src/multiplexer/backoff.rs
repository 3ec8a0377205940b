//! Reconnect backoff curve.
//!
//! `delay = min(max_delay, max(min_base, base) * 2^min(max_exp, attempts))`
//! plus a uniform jitter in `[0, delay / 4]`.

use rand::Rng;
use std::time::Duration;

use crate::models::ConnectionOptions;
use crate::transport::FailureClass;

/// Backoff delay in whole seconds before jitter.
pub(crate) fn backoff_ceiling_secs(
    options: &ConnectionOptions,
    class: FailureClass,
    attempts: u32,
) -> u64 {
    let base = options
        .base_delay_secs(class)
        .max(options.min_base_delay_secs);
    let exponent = attempts.min(options.max_backoff_exponent).min(63);
    base.saturating_mul(1u64 << exponent)
        .min(options.max_reconnect_delay_secs)
}

/// Full reconnect delay including jitter drawn from the thread RNG.
pub(crate) fn reconnect_delay(
    options: &ConnectionOptions,
    class: FailureClass,
    attempts: u32,
) -> Duration {
    reconnect_delay_with(options, class, attempts, &mut rand::thread_rng())
}

pub(crate) fn reconnect_delay_with<R: Rng + ?Sized>(
    options: &ConnectionOptions,
    class: FailureClass,
    attempts: u32,
    rng: &mut R,
) -> Duration {
    let delay_ms = backoff_ceiling_secs(options, class, attempts).saturating_mul(1000);
    let jitter_ms = if delay_ms == 0 {
        0
    } else {
        rng.gen_range(0..=delay_ms / 4)
    };
    Duration::from_millis(delay_ms + jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_primary_curve() {
        let options = ConnectionOptions::default();
        let curve: Vec<u64> = (0..8)
            .map(|attempt| backoff_ceiling_secs(&options, FailureClass::Primary, attempt))
            .collect();
        assert_eq!(curve, vec![60, 120, 240, 480, 900, 900, 900, 900]);
    }

    #[test]
    fn test_base_is_clamped_to_minimum() {
        let options = ConnectionOptions::default().with_primary_base_delay_secs(1);
        assert_eq!(backoff_ceiling_secs(&options, FailureClass::Primary, 0), 5);
        assert_eq!(backoff_ceiling_secs(&options, FailureClass::Primary, 6), 320);
        assert_eq!(backoff_ceiling_secs(&options, FailureClass::Primary, 40), 320);
    }

    #[test]
    fn test_severity_classes_start_higher() {
        let options = ConnectionOptions::default();
        assert_eq!(backoff_ceiling_secs(&options, FailureClass::Elevated, 0), 120);
        assert_eq!(backoff_ceiling_secs(&options, FailureClass::Severe, 0), 300);
        assert_eq!(backoff_ceiling_secs(&options, FailureClass::Severe, 2), 900);
    }

    #[test]
    fn test_delay_monotonic_with_bounded_jitter() {
        let options = ConnectionOptions::default().with_primary_base_delay_secs(5);
        let mut rng = StdRng::seed_from_u64(7);
        let mut previous_ceiling = 0;
        for attempt in 0..=10 {
            let ceiling = backoff_ceiling_secs(&options, FailureClass::Primary, attempt);
            assert!(ceiling >= previous_ceiling, "attempt {} went down", attempt);
            assert!(ceiling <= 900);
            previous_ceiling = ceiling;

            for _ in 0..50 {
                let delay = reconnect_delay_with(&options, FailureClass::Primary, attempt, &mut rng);
                let floor = Duration::from_secs(ceiling);
                assert!(delay >= floor);
                assert!(delay <= floor + floor / 4);
            }
        }

        let cap = backoff_ceiling_secs(&options, FailureClass::Primary, 6);
        for attempt in 7..20 {
            assert_eq!(backoff_ceiling_secs(&options, FailureClass::Primary, attempt), cap);
        }
    }
}
