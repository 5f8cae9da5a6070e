use std::time::Duration;

use rand::Rng;

/// Delay before the next scheduled run after runs that could not reach the
/// service. Doubles per failed run up to `max`, with full jitter.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl PollBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// The regular interval while healthy, a jittered exponential delay
    /// otherwise.
    pub fn next_delay(&self, interval: Duration) -> Duration {
        if self.failures == 0 {
            return interval;
        }
        let mut rng = rand::thread_rng();
        self.delay_with_rng(&mut rng)
    }

    fn delay_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let ceiling = self.ceiling().as_millis().min(u128::from(u64::MAX)) as u64;
        let base = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        Duration::from_millis(rng.gen_range(base.min(ceiling)..=ceiling))
    }

    fn ceiling(&self) -> Duration {
        let shift = self.failures.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << shift).min(self.max)
    }
}
