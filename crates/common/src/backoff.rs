use std::{
    cmp,
    time::Duration,
};

/// Exponential backoff without jitter: after `k` consecutive failures the
/// delay is exactly `min(initial * 2^k, max)`, so schedules built on it are
/// reproducible in tests.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial_backoff: Duration,
    max_backoff: Duration,
    num_failures: u32,
}

impl Backoff {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            num_failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.num_failures = 0;
    }

    /// The delay for the current failure count.
    pub fn current(&self) -> Duration {
        let p = 2u32.checked_pow(self.num_failures).unwrap_or(u32::MAX);
        let backoff = self
            .initial_backoff
            .checked_mul(p)
            .unwrap_or(self.max_backoff);
        cmp::min(backoff, self.max_backoff)
    }

    /// Records a failure and returns the next delay.
    pub fn fail(&mut self) -> Duration {
        self.num_failures = self.num_failures.saturating_add(1);
        self.current()
    }

    pub fn failures(&self) -> u32 {
        self.num_failures
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::Backoff;

    #[test]
    fn test_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(300), Duration::from_secs(3600));
        assert_eq!(backoff.current(), Duration::from_secs(300));
        assert_eq!(backoff.fail(), Duration::from_secs(600));
        assert_eq!(backoff.fail(), Duration::from_secs(1200));
        assert_eq!(backoff.fail(), Duration::from_secs(2400));
        assert_eq!(backoff.fail(), Duration::from_secs(3600));
        assert_eq!(backoff.fail(), Duration::from_secs(3600));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(300));
    }

    proptest! {
        #[test]
        fn proptest_backoff_law(base_secs in 1u64..1000, cap_secs in 1u64..100_000, k in 0u32..40) {
            let base = Duration::from_secs(base_secs);
            let cap = Duration::from_secs(cap_secs);
            let mut backoff = Backoff::new(base, cap);
            for _ in 0..k {
                backoff.fail();
            }
            let expected = base
                .checked_mul(2u32.checked_pow(k).unwrap_or(u32::MAX))
                .map_or(cap, |d| d.min(cap));
            prop_assert_eq!(backoff.current(), expected);
            prop_assert_eq!(backoff.failures(), k);
        }
    }
}
