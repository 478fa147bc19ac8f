//! Pipeline counters and periodic reports

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A shared event counter
///
/// Readers see eventually-consistent values.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Zeroed counter
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Count one event
    #[inline]
    pub fn incr(&self) {
        self.add(1)
    }

    /// Count `n` events
    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// One statistics report
///
/// ```txt
/// uptime 60 s: received 120, processed 118, decoded 40, unknown 70,
/// noise 8, errors 2; 2.0 msg/s, 33.9% recognized
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Summary {
    /// Time since start
    pub uptime: Duration,
    /// Messages or bursts taken in
    pub received: u64,
    /// Messages handled to completion
    pub processed: u64,
    /// Messages which produced a device record
    pub decoded: u64,
    /// Messages no decoder claimed
    pub unknown: u64,
    /// Short hex-only messages no decoder claimed
    pub noise: u64,
    /// Failures of any kind
    pub errors: u64,
}

impl Summary {
    /// Messages received per second of uptime
    pub fn rate(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs > 0.0 {
            self.received as f64 / secs
        } else {
            0.0
        }
    }

    /// Percentage of processed messages which were decoded
    pub fn recognition_pct(&self) -> f64 {
        if self.processed > 0 {
            100.0 * self.decoded as f64 / self.processed as f64
        } else {
            0.0
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uptime {} s: received {}, processed {}, decoded {}, unknown {}, noise {}, errors {}; {:.1} msg/s, {:.1}% recognized",
            self.uptime.as_secs(),
            self.received,
            self.processed,
            self.decoded,
            self.unknown,
            self.noise,
            self.errors,
            self.rate(),
            self.recognition_pct()
        )
    }
}

/// Call `report` every `interval` until `shutdown` is set
///
/// Wakes every 100 ms to check the flag. A zero `interval`
/// returns at once without reporting.
pub fn report_every<F>(interval: Duration, shutdown: &AtomicBool, mut report: F)
where
    F: FnMut(),
{
    const TICK: Duration = Duration::from_millis(100);

    if interval.is_zero() {
        return;
    }

    let mut next = Instant::now() + interval;
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= next {
            report();
            next += interval;
        } else {
            std::thread::sleep(TICK.min(next - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_counter() {
        let c = Counter::new();
        c.incr();
        c.add(4);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn test_summary() {
        let s = Summary {
            uptime: Duration::from_secs(60),
            received: 120,
            processed: 118,
            decoded: 40,
            unknown: 70,
            noise: 8,
            errors: 2,
        };
        assert_approx_eq!(s.rate(), 2.0);
        assert_approx_eq!(s.recognition_pct(), 33.898, 1.0e-3);
        assert_eq!(
            s.to_string(),
            "uptime 60 s: received 120, processed 118, decoded 40, unknown 70, noise 8, errors 2; 2.0 msg/s, 33.9% recognized"
        );

        let empty = Summary::default();
        assert_approx_eq!(empty.rate(), 0.0);
        assert_approx_eq!(empty.recognition_pct(), 0.0);
    }

    #[test]
    fn test_report_every() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let count = Arc::new(Counter::new());

        let worker = {
            let shutdown = shutdown.clone();
            let count = count.clone();
            std::thread::spawn(move || {
                report_every(Duration::from_millis(20), &shutdown, || count.incr())
            })
        };
        std::thread::sleep(Duration::from_millis(150));
        shutdown.store(true, Ordering::Relaxed);
        worker.join().unwrap();
        assert!(count.get() >= 2);

        // disabled
        report_every(Duration::ZERO, &AtomicBool::new(false), || panic!("called"));
    }
}
