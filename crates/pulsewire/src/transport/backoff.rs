//! Reconnect delays

use std::time::Duration;

/// Default first reconnect delay
pub const DEFAULT_INITIAL: Duration = Duration::from_secs(5);

/// Default longest reconnect delay
pub const DEFAULT_MAX: Duration = Duration::from_secs(60);

/// Exponential backoff
///
/// Each call to [`next_delay()`](Backoff::next_delay) returns the
/// current delay and doubles it, up to the maximum. A successful
/// connection should [`reset()`](Backoff::reset) it.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Backoff from `initial` to at most `max`
    ///
    /// ```
    /// use pulsewire::Backoff;
    /// use std::time::Duration;
    ///
    /// let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));
    /// assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    /// assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    /// ```
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Return the next delay and advance
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Delay which the next call will return
    pub fn peek(&self) -> Duration {
        self.current
    }

    /// Start over from the initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL, DEFAULT_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubling_to_cap() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);

        backoff.reset();
        assert_eq!(backoff.peek(), Duration::from_secs(5));
    }

    #[test]
    fn test_initial_above_max() {
        let mut backoff = Backoff::new(Duration::from_secs(90), Duration::from_secs(60));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
    }
}
