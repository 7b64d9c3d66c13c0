use std::time::Duration;

use rand::Rng;

/// The range the multiplicative jitter is drawn from.
pub const JITTER_RANGE: std::ops::Range<f64> = 0.5..1.0;

/// Computes the delay before retry number `attempt` (1-based).
///
/// The delay grows as `base * multiplier^(attempt - 1)`, is scaled by a random jitter factor in
/// [`JITTER_RANGE`] so that many callers failing together do not retry in lockstep, and is capped
/// at `max_delay`.
pub fn compute_delay(
    attempt: u32,
    base: Duration,
    multiplier: f64,
    max_delay: Duration,
) -> Duration {
    let jitter = rand::thread_rng().gen_range(JITTER_RANGE);
    delay_with_jitter(attempt, base, multiplier, max_delay, jitter)
}

/// Deterministic core of [`compute_delay`].
pub(crate) fn delay_with_jitter(
    attempt: u32,
    base: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter: f64,
) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = base.as_secs_f64() * multiplier.powi(exponent) * jitter;

    // `from_secs_f64` panics on overflow, and the cap applies anyway.
    if !secs.is_finite() || secs >= max_delay.as_secs_f64() {
        return max_delay;
    }
    Duration::from_secs_f64(secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(10);

    #[test]
    fn test_exponential_growth() {
        assert_eq!(
            delay_with_jitter(1, BASE, 2.0, MAX, 1.0),
            Duration::from_millis(100)
        );
        assert_eq!(
            delay_with_jitter(2, BASE, 2.0, MAX, 1.0),
            Duration::from_millis(200)
        );
        assert_eq!(
            delay_with_jitter(4, BASE, 2.0, MAX, 1.0),
            Duration::from_millis(800)
        );
        assert_eq!(
            delay_with_jitter(3, BASE, 2.0, MAX, 0.5),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn test_capped_at_max_delay() {
        assert_eq!(delay_with_jitter(20, BASE, 2.0, MAX, 0.9), MAX);
        assert_eq!(delay_with_jitter(u32::MAX, BASE, 2.0, MAX, 0.9), MAX);
        assert_eq!(
            delay_with_jitter(1, Duration::from_secs(60), 2.0, MAX, 0.5),
            MAX
        );
    }

    #[test]
    fn test_jitter_bounds() {
        for attempt in 1..=5 {
            let undelayed = BASE * 2u32.pow(attempt - 1);
            for _ in 0..100 {
                let delay = compute_delay(attempt, BASE, 2.0, MAX);
                assert!(delay >= undelayed / 2, "{delay:?} too short");
                assert!(delay < undelayed, "{delay:?} too long");
            }
        }
    }

    #[test]
    fn test_constant_multiplier() {
        let delay = delay_with_jitter(7, BASE, 1.0, MAX, 1.0);
        assert_eq!(delay, BASE);
    }
}
