//! In-process broker

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{Consumer, ContentType, Envelope, Outgoing, Publisher, Route, TransportError};

/// In-process stand-in for the broker
///
/// Routes messages exactly like the AMQP topology: every
/// [`Route`] fans out to its JSON queue and its ASN.1 queue.
/// Clones share the same queues, so one clone can publish from a
/// worker thread while another inspects the results.
///
/// Failures may be scripted with [`fail_next()`](Loopback::fail_next)
/// and [`fail_reconnects()`](Loopback::fail_reconnects).
#[derive(Clone, Debug, Default)]
pub struct Loopback {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, VecDeque<Envelope>>,
    disconnected: bool,
    fail_publishes: usize,
    fail_reconnects: usize,
    reconnections: u64,
    published: u64,
    acked: u64,
}

impl Loopback {
    /// New, connected loopback with empty queues
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publishes, dropping the connection
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_publishes = n;
    }

    /// Fail the next `n` reconnection attempts
    pub fn fail_reconnects(&self, n: usize) {
        self.lock().fail_reconnects = n;
    }

    /// True if connected
    pub fn is_connected(&self) -> bool {
        !self.lock().disconnected
    }

    /// Number of successful reconnections
    pub fn reconnections(&self) -> u64 {
        self.lock().reconnections
    }

    /// Number of messages accepted
    pub fn published(&self) -> u64 {
        self.lock().published
    }

    /// Number of deliveries acknowledged by consumers
    pub fn acked(&self) -> u64 {
        self.lock().acked
    }

    /// Consumer on `queue`
    pub fn consumer(&self, queue: &str) -> LoopbackConsumer {
        LoopbackConsumer {
            broker: self.clone(),
            queue: queue.to_owned(),
        }
    }

    /// Number of messages waiting in `queue`
    pub fn len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(VecDeque::len).unwrap_or(0)
    }

    /// Take the oldest message from `queue`
    pub fn get(&self, queue: &str) -> Option<Envelope> {
        self.lock().queues.get_mut(queue).and_then(VecDeque::pop_front)
    }

    /// Take the oldest message of `route` on the `content_type`
    /// topology
    pub fn get_route(&self, route: Route, content_type: ContentType) -> Option<Envelope> {
        self.get(route.queue(content_type))
    }

    /// Take every message from `queue`
    pub fn drain(&self, queue: &str) -> Vec<Envelope> {
        self.lock()
            .queues
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Place a message directly on `queue`, bypassing routing
    pub fn inject(&self, queue: &str, content_type: Option<&str>, body: Vec<u8>) {
        let env = Envelope {
            queue: queue.to_owned(),
            content_type: content_type.map(str::to_owned),
            body,
        };
        self.lock()
            .queues
            .entry(queue.to_owned())
            .or_default()
            .push_back(env);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Publisher for Loopback {
    fn publish(&mut self, msg: &Outgoing) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(TransportError::NotConnected);
        }
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            state.disconnected = true;
            return Err(TransportError::Closed("loopback failure".to_owned()));
        }

        for content_type in [ContentType::Json, ContentType::Asn1] {
            let queue = msg.route.queue(content_type);
            state
                .queues
                .entry(queue.to_owned())
                .or_default()
                .push_back(Envelope {
                    queue: queue.to_owned(),
                    content_type: Some(msg.content_type.mime().to_owned()),
                    body: msg.body.clone(),
                });
        }
        state.published += 1;
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.fail_reconnects > 0 {
            state.fail_reconnects -= 1;
            state.disconnected = true;
            return Err(TransportError::Connect {
                addr: "loopback".to_owned(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            });
        }
        state.disconnected = false;
        state.reconnections += 1;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.lock().disconnected = true;
    }
}

/// Consumer on one [`Loopback`] queue
///
/// A delivery whose handler fails goes back to the head of the
/// queue.
#[derive(Clone, Debug)]
pub struct LoopbackConsumer {
    broker: Loopback,
    queue: String,
}

impl Consumer for LoopbackConsumer {
    fn consume<F>(&mut self, timeout: Duration, handler: F) -> Result<usize, TransportError>
    where
        F: FnOnce(&Envelope) -> Result<(), TransportError>,
    {
        let next = {
            let mut state = self.broker.lock();
            if state.disconnected {
                return Err(TransportError::NotConnected);
            }
            state.queues.get_mut(&self.queue).and_then(VecDeque::pop_front)
        };
        let env = match next {
            Some(env) => env,
            None => {
                std::thread::sleep(timeout);
                return Ok(0);
            }
        };

        // the lock is released: handlers may publish
        match handler(&env) {
            Ok(()) => {
                self.broker.lock().acked += 1;
                Ok(1)
            }
            Err(e) => {
                self.broker
                    .lock()
                    .queues
                    .entry(self.queue.clone())
                    .or_default()
                    .push_front(env);
                Err(e)
            }
        }
    }
}
