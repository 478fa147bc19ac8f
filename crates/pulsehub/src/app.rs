//! Broker loop
//!
//! ```txt
//!              ┌──────────────── main thread ─────────────────┐
//!   signals ─► │ QueueConsumer ─► ServerPipeline ─► send ─► ack │
//!              └────────────────────────┬─────────────────────┘
//!                          detected ◄───┤
//!                          unknown  ◄───┘
//! ```
//!
//! One connection both consumes and publishes. A delivery is
//! acknowledged only after every result it produced has been
//! published. When the connection fails, the consumer is dropped,
//! unacknowledged deliveries return to the broker, and the
//! connection is re-established with exponential backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use pulsewire::server::serve_queue;
use pulsewire::transport::backoff::{DEFAULT_INITIAL, DEFAULT_MAX};
use pulsewire::{AmqpTransport, Backoff, Publisher, ServerPipeline, TransportError};

/// Broker loop settings
#[derive(Clone, Debug)]
pub struct ServeOptions {
    /// Queue to consume
    pub queue: String,
    /// Longest wait for a delivery before checking for shutdown
    pub poll: Duration,
    /// First reconnect delay
    pub reconnect_initial: Duration,
    /// Largest reconnect delay
    pub reconnect_max: Duration,
}

impl ServeOptions {
    /// Default timing for `queue`
    pub fn new<S: Into<String>>(queue: S) -> Self {
        Self {
            queue: queue.into(),
            poll: Duration::from_millis(100),
            reconnect_initial: DEFAULT_INITIAL,
            reconnect_max: DEFAULT_MAX,
        }
    }
}

/// Consume, decode and publish until shutdown
///
/// Returns the number of deliveries acknowledged.
pub fn serve(
    transport: &mut AmqpTransport,
    opts: &ServeOptions,
    pipeline: &ServerPipeline,
    shutdown: &AtomicBool,
) -> u64 {
    let mut backoff = Backoff::new(opts.reconnect_initial, opts.reconnect_max);
    let mut handled = 0u64;

    while !shutdown.load(Ordering::Relaxed) {
        match consume(transport, opts, pipeline, shutdown) {
            Ok(n) => {
                handled += n;
                break;
            }
            Err(e) => warn!("server: connection lost: {}", e),
        }

        transport.disconnect();
        while !shutdown.load(Ordering::Relaxed) {
            let delay = backoff.next_delay();
            info!("server: reconnecting in {} s", delay.as_secs_f32());
            if !sleep_unless(delay, shutdown) {
                return handled;
            }
            match transport.reconnect() {
                Ok(()) => {
                    pipeline.stats().reconnections.incr();
                    backoff.reset();
                    break;
                }
                Err(e) => warn!("server: reconnect failed: {}", e),
            }
        }
    }
    handled
}

// Runs one consumer until shutdown (Ok) or failure (Err)
fn consume(
    transport: &AmqpTransport,
    opts: &ServeOptions,
    pipeline: &ServerPipeline,
    shutdown: &AtomicBool,
) -> Result<u64, TransportError> {
    let mut consumer = transport.consumer(&opts.queue)?;
    let result = serve_queue(
        &mut consumer,
        pipeline,
        |msg| transport.send(msg),
        opts.poll,
        shutdown,
    );

    debug!("server: cancelling consumer on \"{}\"", consumer.queue());
    consumer.cancel();
    result
}

// Sleep for `delay` in short ticks. False if shut down meanwhile.
fn sleep_unless(delay: Duration, shutdown: &AtomicBool) -> bool {
    const TICK: Duration = Duration::from_millis(100);

    let end = Instant::now() + delay;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= end {
            return true;
        }
        std::thread::sleep(TICK.min(end - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options() {
        let opts = ServeOptions::new("asn1_signals");
        assert_eq!(opts.queue, "asn1_signals");
        assert!(opts.reconnect_initial <= opts.reconnect_max);
    }

    #[test]
    fn test_sleep_unless() {
        let shutdown = AtomicBool::new(false);
        assert!(sleep_unless(Duration::from_millis(10), &shutdown));
        shutdown.store(true, Ordering::Relaxed);
        assert!(!sleep_unless(Duration::from_secs(60), &shutdown));
    }
}
