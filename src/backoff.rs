use std::time::Duration;

/// Exponential delay between retries of a failing poll, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    multiplier: u32,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, multiplier: u32) -> Self {
        Self {
            base,
            max: max.max(base),
            multiplier: multiplier.max(1),
            current: None,
        }
    }

    /// Delay to wait after one more consecutive failure.
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.base,
            Some(current) => current
                .checked_mul(self.multiplier)
                .unwrap_or(self.max)
                .min(self.max),
        };
        self.current = Some(next);
        next
    }

    /// Called after a fully successful cycle.
    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<Duration> {
        self.current
    }

    pub fn base(&self) -> Duration {
        self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_until_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(30), 2);
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 30, 30, 30]);
    }

    #[test]
    fn test_delays_never_decrease() {
        let mut backoff = Backoff::new(Duration::from_millis(300), Duration::from_secs(7), 3);
        let mut previous = Duration::ZERO;
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(7));
            previous = delay;
        }
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 2);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.current(), None);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_multiplier_of_one_is_constant() {
        let mut backoff = Backoff::new(Duration::from_secs(4), Duration::from_secs(60), 1);
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    }
}
