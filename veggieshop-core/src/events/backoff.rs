//! Jittered exponential backoff shared by producer retries, outbox
//! rescheduling, and consumer retry schedules

use std::time::Duration;

use rand::Rng;

/// Exponential backoff: `min(cap, base · multiplier^(attempt-1))` with
/// multiplicative jitter in `[1 - ratio, 1 + ratio]`
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    cap: Duration,
    jitter_ratio: f64,
}

impl Backoff {
    /// The jitter ratio is clamped to `[0, 0.9]`
    pub fn new(base: Duration, multiplier: f64, cap: Duration, jitter_ratio: f64) -> Self {
        Self {
            base,
            multiplier: multiplier.max(1.0),
            cap,
            jitter_ratio: jitter_ratio.clamp(0.0, 0.9),
        }
    }

    /// Raw delay for an attempt (1-based), before jitter
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let scaled = self.base.as_secs_f64() * self.multiplier.powi(exponent as i32);
        Duration::from_secs_f64(scaled.min(self.cap.as_secs_f64()))
    }

    /// Jittered delay for an attempt (1-based)
    pub fn delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let raw = self.raw_delay(attempt);
        if self.jitter_ratio == 0.0 {
            return raw;
        }
        let factor = 1.0 + rng.random_range(-self.jitter_ratio..=self.jitter_ratio);
        Duration::from_secs_f64((raw.as_secs_f64() * factor).max(0.0))
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn backoff() -> Backoff {
        Backoff::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(10),
            0.2,
        )
    }

    #[test]
    fn test_raw_delay_doubles_until_cap() {
        let b = backoff();
        assert_eq!(b.raw_delay(1), Duration::from_millis(100));
        assert_eq!(b.raw_delay(2), Duration::from_millis(200));
        assert_eq!(b.raw_delay(3), Duration::from_millis(400));
        assert_eq!(b.raw_delay(30), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let b = backoff();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=10 {
            let raw = b.raw_delay(attempt).as_secs_f64();
            let jittered = b.delay(attempt, &mut rng).as_secs_f64();
            assert!(jittered >= raw * 0.8 - f64::EPSILON);
            assert!(jittered <= raw * 1.2 + f64::EPSILON);
        }
    }

    #[test]
    fn test_jitter_ratio_clamped() {
        let b = Backoff::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(10),
            5.0,
        );
        let mut rng = StdRng::seed_from_u64(7);
        // Ratio clamps to 0.9, so the delay never goes negative or above 1.9x
        for _ in 0..100 {
            let d = b.delay(1, &mut rng).as_secs_f64();
            assert!(d >= 0.100 * 0.1 - f64::EPSILON);
            assert!(d <= 0.100 * 1.9 + f64::EPSILON);
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let b = Backoff::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(10),
            0.0,
        );
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(b.delay(3, &mut rng), Duration::from_millis(400));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let b = backoff();
        assert_eq!(b.raw_delay(u32::MAX), Duration::from_secs(10));
    }
}
