//! Client pipeline: bursts to the `signals` route
//!
//! ```txt
//! detector thread                     publisher thread
//! ---------------                     ----------------
//! Burst -> ClientPipeline -> OutQueue -> run_publisher -> broker
//!                                (1024, drops oldest)
//! ```
//!
//! The detector thread encodes each burst and hands it to a
//! bounded [`OutQueue`]. A single publisher thread owns the
//! transport connection. It reconnects with exponential backoff
//! and drains the queue at shutdown.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

#[cfg(not(test))]
use log::{debug, info, warn};

#[cfg(test)]
use std::{println as debug, println as info, println as warn};

use crate::analyze::PulseAnalysis;
use crate::decoder::Dispatcher;
use crate::detect::Burst;
use crate::envelope::{Message, SignalMessage};
use crate::json::{pulse_to_json, time_now};
use crate::pulse::PD_MIN_PULSES;
use crate::rfraw;
use crate::stats::{Counter, Summary};
use crate::transport::{Backoff, ContentType, Outgoing, Publisher, Route};

/// Default capacity of the outgoing queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default time allowed to drain the outgoing queue at shutdown
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_PACKAGE_ID: AtomicU32 = AtomicU32::new(1);

/// Next package id of this process
///
/// Ids increase by one with every call, from any thread.
pub fn next_package_id() -> u32 {
    NEXT_PACKAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Client settings
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Encoding of published bursts
    pub content_type: ContentType,
    /// Also decode bursts locally and publish device records
    pub local_decode: bool,
    /// Log a pulse analysis of every burst
    pub analyze: bool,
    /// Capacity of the outgoing queue
    pub queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            content_type: ContentType::Json,
            local_decode: false,
            analyze: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Client counters
#[derive(Debug)]
pub struct ClientStats {
    /// Bursts taken from the detector
    pub signals_processed: Counter,
    /// Bursts accepted by the broker
    pub signals_sent: Counter,
    /// Device records accepted by the broker
    pub devices_sent: Counter,
    /// Device records decoded locally
    pub devices_decoded: Counter,
    /// Messages dropped on the way to the broker
    pub send_errors: Counter,
    /// Bursts which could not be encoded
    pub encode_errors: Counter,
    /// Successful reconnections
    pub reconnections: Counter,
    started: Instant,
}

impl ClientStats {
    /// Zeroed counters, starting the uptime clock
    pub fn new() -> Self {
        Self {
            signals_processed: Counter::new(),
            signals_sent: Counter::new(),
            devices_sent: Counter::new(),
            devices_decoded: Counter::new(),
            send_errors: Counter::new(),
            encode_errors: Counter::new(),
            reconnections: Counter::new(),
            started: Instant::now(),
        }
    }

    /// Report of the counters so far
    pub fn summary(&self) -> Summary {
        Summary {
            uptime: self.started.elapsed(),
            received: self.signals_processed.get(),
            processed: self.signals_sent.get(),
            decoded: self.devices_decoded.get(),
            unknown: 0,
            noise: 0,
            errors: self.send_errors.get() + self.encode_errors.get(),
        }
    }
}

impl Default for ClientStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes bursts for publication
pub struct ClientPipeline {
    config: ClientConfig,
    dispatcher: Option<Dispatcher>,
    stats: Arc<ClientStats>,
}

impl ClientPipeline {
    /// New pipeline, counting into `stats`
    pub fn new(config: ClientConfig, stats: Arc<ClientStats>) -> Self {
        Self {
            config,
            dispatcher: None,
            stats,
        }
    }

    /// Decode locally with `dispatcher`
    ///
    /// Only used if local decoding is enabled.
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Settings
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Counters
    pub fn stats(&self) -> &Arc<ClientStats> {
        &self.stats
    }

    /// Encode `burst` for the `signals` route
    ///
    /// Assigns the burst a new package id. Returns `None`, and
    /// counts an encoding error, if the burst can be sent neither
    /// as a pulse array nor as rfraw hex.
    pub fn handle_burst(&self, burst: &Burst) -> Option<Outgoing> {
        self.encode_burst(burst, next_package_id(), &time_now())
    }

    /// Encode `burst` and, if enabled, its local decodes
    pub fn process(&self, burst: &Burst) -> Vec<Outgoing> {
        let package_id = next_package_id();
        let time = time_now();
        let mut out: Vec<Outgoing> = self
            .encode_burst(burst, package_id, &time)
            .into_iter()
            .collect();
        if self.config.local_decode {
            out.extend(self.decode_local(burst, package_id, &time));
        }
        out
    }

    /// Device records decoded locally from `burst`
    pub fn decode_local(&self, burst: &Burst, package_id: u32, time: &str) -> Vec<Outgoing> {
        let dispatcher = match &self.dispatcher {
            Some(d) => d,
            None => return Vec::new(),
        };

        let found = dispatcher.dispatch(&burst.pulse);
        self.stats.devices_decoded.add(found.records.len() as u64);
        found
            .records
            .iter()
            .filter_map(|record| {
                match Outgoing::detected(record, self.config.content_type, Some(package_id), Some(time))
                {
                    Ok(msg) => Some(msg),
                    Err(e) => {
                        warn!("client: unable to encode \"{}\": {}", record.model, e);
                        self.stats.encode_errors.incr();
                        None
                    }
                }
            })
            .collect()
    }

    fn encode_burst(&self, burst: &Burst, package_id: u32, time: &str) -> Option<Outgoing> {
        self.stats.signals_processed.incr();
        let data = &burst.pulse;

        if self.config.analyze {
            info!("{}", PulseAnalysis::new(data));
        }

        let body = match self.config.content_type {
            ContentType::Asn1 => SignalMessage::from_pulse(data, package_id)
                .map(|msg| msg.with_timestamp(time))
                .and_then(|msg| Message::Signal(msg).encode())
                .map_err(|e| e.to_string()),
            ContentType::Json => {
                let hex = rfraw::encode(data);
                if data.num_pulses() < PD_MIN_PULSES && hex.is_none() {
                    Err(format!(
                        "{} pulses and no rfraw representation",
                        data.num_pulses()
                    ))
                } else {
                    pulse_to_json(data, package_id, hex.as_deref(), Some(time))
                        .map(String::into_bytes)
                        .map_err(|e| e.to_string())
                }
            }
        };

        match body {
            Ok(body) => {
                debug!(
                    "client: burst {} with {} pulses ({}), {} bytes",
                    package_id,
                    data.num_pulses(),
                    burst.modulation,
                    body.len()
                );
                Some(Outgoing::new(Route::Signals, self.config.content_type, body))
            }
            Err(e) => {
                warn!("client: dropping burst {}: {}", package_id, e);
                self.stats.encode_errors.incr();
                None
            }
        }
    }
}

/// Bounded queue to the publisher
///
/// When the queue is full, the oldest message is dropped to make
/// room and counted as a send error.
#[derive(Clone)]
pub struct OutQueue {
    tx: Sender<Outgoing>,
    rx: Receiver<Outgoing>,
    stats: Arc<ClientStats>,
}

impl OutQueue {
    /// Queue holding up to `capacity` messages
    pub fn new(capacity: usize, stats: Arc<ClientStats>) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx, stats }
    }

    /// Enqueue, dropping the oldest message if full
    pub fn push(&self, msg: Outgoing) {
        let mut msg = msg;
        loop {
            match self.tx.try_send(msg) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if self.rx.try_recv().is_ok() {
                        self.stats.send_errors.incr();
                        debug!("client: queue full; dropped oldest message");
                    }
                    msg = back;
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.stats.send_errors.incr();
                    return;
                }
            }
        }
    }

    /// Consumer end, for the publisher
    pub fn receiver(&self) -> Receiver<Outgoing> {
        self.rx.clone()
    }

    /// Messages waiting
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True if nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Publisher thread timing
#[derive(Clone, Debug)]
pub struct PublisherConfig {
    /// First reconnect delay
    pub reconnect_initial: Duration,
    /// Largest reconnect delay
    pub reconnect_max: Duration,
    /// Time allowed to empty the queue at shutdown
    pub drain_timeout: Duration,
    /// How often to check for shutdown while idle
    pub poll: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            reconnect_initial: crate::transport::backoff::DEFAULT_INITIAL,
            reconnect_max: crate::transport::backoff::DEFAULT_MAX,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            poll: Duration::from_millis(100),
        }
    }
}

/// Publish everything from `rx` until shutdown
///
/// A failed publish counts a send error, drops the message and
/// the connection, and schedules a reconnect. Messages wait in
/// the queue while disconnected. Once `shutdown` is set, or every
/// sender is gone, the queue is drained for up to
/// `drain_timeout`. Whatever is left is counted as send errors.
/// The publisher is disconnected on return.
pub fn run_publisher<P>(
    publisher: &mut P,
    rx: &Receiver<Outgoing>,
    stats: &ClientStats,
    shutdown: &AtomicBool,
    config: &PublisherConfig,
) where
    P: Publisher + ?Sized,
{
    let mut backoff = Backoff::new(config.reconnect_initial, config.reconnect_max);
    let mut connected = true;
    let mut retry_at = Instant::now();
    let mut deadline: Option<Instant> = None;

    loop {
        let now = Instant::now();
        if deadline.is_none() && shutdown.load(Ordering::Relaxed) {
            debug!("publisher: draining {} queued message(s)", rx.len());
            deadline = Some(now + config.drain_timeout);
        }
        if let Some(end) = deadline {
            if now >= end || rx.is_empty() {
                break;
            }
        }

        let wait = match deadline {
            Some(end) => config.poll.min(end.saturating_duration_since(now)),
            None => config.poll,
        };

        if !connected {
            if now < retry_at {
                std::thread::sleep(wait.min(retry_at - now));
                continue;
            }
            match publisher.reconnect() {
                Ok(()) => {
                    connected = true;
                    backoff.reset();
                    stats.reconnections.incr();
                    info!("publisher: reconnected; {} message(s) queued", rx.len());
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        "publisher: reconnect failed: {}; retrying in {} s",
                        e,
                        delay.as_secs_f32()
                    );
                    retry_at = Instant::now() + delay;
                }
            }
            continue;
        }

        match rx.recv_timeout(wait) {
            Ok(msg) => match publisher.publish(&msg) {
                Ok(()) => match msg.route {
                    Route::Signals => stats.signals_sent.incr(),
                    _ => stats.devices_sent.incr(),
                },
                Err(e) => {
                    stats.send_errors.incr();
                    publisher.disconnect();
                    connected = false;
                    let delay = backoff.next_delay();
                    warn!(
                        "publisher: publish failed: {}; reconnecting in {} s",
                        e,
                        delay.as_secs_f32()
                    );
                    retry_at = Instant::now() + delay;
                }
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let left = rx.try_iter().count() as u64;
    if left > 0 {
        warn!("publisher: {} message(s) not sent before shutdown", left);
        stats.send_errors.add(left);
    }
    publisher.disconnect();
}
