//! Message transport
//!
//! Bursts and device records travel through one durable direct
//! exchange, `rtl_433` by default. Each message is published
//! with a routing key naming its [`Route`], and every route is
//! bound to two queues: one for the JSON topology and one for
//! the ASN.1 topology.
//!
//! ```txt
//!                      +-- signals ---> [signals]  [asn1_signals]
//! publisher --> rtl_433 -- detected --> [detected] [asn1_detected]
//!                      +-- unknown ---> [unknown]  [asn1_unknown]
//! ```
//!
//! Both queues of a route receive every message, whatever its
//! content type. Consumers must look at the content type of
//! each [`Envelope`].

use std::io;
use std::time::Duration;

use strum_macros::{Display, EnumIter, IntoStaticStr};
use thiserror::Error;

use crate::envelope::{DetectedMessage, EnvelopeError, Message};
use crate::json::detected_to_json;
use crate::record::DeviceRecord;

mod amqp;
pub mod backoff;
mod loopback;
pub mod url;

pub use self::amqp::{AmqpTransport, QueueConsumer};
pub use self::backoff::Backoff;
pub use self::loopback::{Loopback, LoopbackConsumer};
pub use self::url::{Scheme, TransportUrl, UrlError};

/// MIME type of JSON payloads
pub const MIME_JSON: &str = "application/json";

/// MIME type of ASN.1 UPER payloads
pub const MIME_ASN1: &str = "application/octet-stream";

/// Payload encoding
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum ContentType {
    /// Legacy JSON objects
    #[strum(serialize = "application/json")]
    Json,
    /// ASN.1 UPER envelopes
    #[strum(serialize = "application/octet-stream")]
    Asn1,
}

impl ContentType {
    /// MIME type
    pub fn mime(self) -> &'static str {
        match self {
            ContentType::Json => MIME_JSON,
            ContentType::Asn1 => MIME_ASN1,
        }
    }

    /// Recognize a MIME type, ignoring any parameters
    pub fn from_mime(mime: &str) -> Option<ContentType> {
        let base = mime.split(';').next().unwrap_or("").trim();
        if base.eq_ignore_ascii_case(MIME_JSON) || base.eq_ignore_ascii_case("text/json") {
            Some(ContentType::Json)
        } else if base.eq_ignore_ascii_case(MIME_ASN1) {
            Some(ContentType::Asn1)
        } else {
            None
        }
    }

    /// Guess from the payload: JSON objects start with `{`
    pub fn sniff(body: &[u8]) -> ContentType {
        match body.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') => ContentType::Json,
            _ => ContentType::Asn1,
        }
    }
}

/// Well-known message routes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Route {
    /// Raw bursts from clients
    Signals,
    /// Decoded device records
    Detected,
    /// Bursts no decoder claimed
    Unknown,
}

impl Route {
    /// Routing key
    pub fn key(self) -> &'static str {
        self.into()
    }

    /// Queue of this route on the given topology
    pub fn queue(self, content_type: ContentType) -> &'static str {
        match (self, content_type) {
            (Route::Signals, ContentType::Json) => "signals",
            (Route::Detected, ContentType::Json) => "detected",
            (Route::Unknown, ContentType::Json) => "unknown",
            (Route::Signals, ContentType::Asn1) => "asn1_signals",
            (Route::Detected, ContentType::Asn1) => "asn1_detected",
            (Route::Unknown, ContentType::Asn1) => "asn1_unknown",
        }
    }
}

/// A received message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Queue it was read from
    pub queue: String,
    /// Declared MIME type, if any
    pub content_type: Option<String>,
    /// Payload
    pub body: Vec<u8>,
}

impl Envelope {
    /// Payload encoding
    ///
    /// Uses the declared MIME type, or sniffs the body if there
    /// is none or it is not recognized.
    pub fn kind(&self) -> ContentType {
        self.content_type
            .as_deref()
            .and_then(ContentType::from_mime)
            .unwrap_or_else(|| ContentType::sniff(&self.body))
    }
}

/// A message to publish
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outgoing {
    /// Destination
    pub route: Route,
    /// Payload encoding
    pub content_type: ContentType,
    /// Payload
    pub body: Vec<u8>,
}

impl Outgoing {
    /// New message
    pub fn new(route: Route, content_type: ContentType, body: Vec<u8>) -> Self {
        Self {
            route,
            content_type,
            body,
        }
    }

    /// A decoded device, for the `detected` route
    ///
    /// JSON records are flat objects. ASN.1 records are UPER
    /// `DetectedMessage` envelopes.
    pub fn detected(
        record: &DeviceRecord,
        content_type: ContentType,
        package_id: Option<u32>,
        time: Option<&str>,
    ) -> Result<Outgoing, EnvelopeError> {
        let body = match content_type {
            ContentType::Json => detected_to_json(record, package_id, time).into_bytes(),
            ContentType::Asn1 => {
                Message::Detected(DetectedMessage::from_record(record, package_id, time))
                    .encode()?
            }
        };
        Ok(Outgoing::new(Route::Detected, content_type, body))
    }
}

/// Transport failure
#[derive(Error, Debug)]
pub enum TransportError {
    /// The broker could not be reached
    #[error("unable to reach broker at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The broker refused the AMQP handshake
    #[error("broker refused login to {addr}: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: amiquip::Error,
    },

    /// The exchange or a queue could not be declared or bound
    #[error("unable to declare {what}: {source}")]
    Topology {
        what: String,
        #[source]
        source: amiquip::Error,
    },

    /// An established connection failed
    #[error("AMQP error: {0}")]
    Amqp(#[from] amiquip::Error),

    /// There is no connection
    #[error("not connected")]
    NotConnected,

    /// The connection or consumer was closed
    #[error("connection closed: {0}")]
    Closed(String),
}

impl TransportError {
    /// True if reconnecting cannot help
    ///
    /// Refused logins and topology conflicts need an operator.
    /// Everything else is worth another try.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Handshake { .. } | TransportError::Topology { .. }
        )
    }
}

/// Transport settings
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Broker and exchange
    pub url: TransportUrl,
    /// TCP and handshake timeout (ms)
    pub connect_timeout_ms: u64,
    /// AMQP heartbeat (s), zero to disable
    pub heartbeat_s: u16,
    /// Declare the exchange and queues on connect
    pub declare: bool,
    /// Unacknowledged deliveries per consumer
    pub prefetch: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: TransportUrl {
                scheme: Scheme::Amqp,
                username: url::DEFAULT_CREDENTIAL.to_owned(),
                password: url::DEFAULT_CREDENTIAL.to_owned(),
                host: "localhost".to_owned(),
                port: url::DEFAULT_PORT,
                vhost: url::DEFAULT_VHOST.to_owned(),
                exchange: url::DEFAULT_EXCHANGE.to_owned(),
            },
            connect_timeout_ms: 5000,
            heartbeat_s: 30,
            declare: true,
            prefetch: 16,
        }
    }
}

impl TransportConfig {
    /// Settings for `url`, otherwise default
    pub fn new(url: TransportUrl) -> Self {
        Self {
            url,
            ..Self::default()
        }
    }
}

/// Sink for outgoing messages
///
/// The transport connection is owned by one publishing thread.
/// Implementations report a lost connection as an error from
/// [`publish()`](Publisher::publish) and recover only when told
/// to [`reconnect()`](Publisher::reconnect).
pub trait Publisher {
    /// Publish one message
    fn publish(&mut self, msg: &Outgoing) -> Result<(), TransportError>;

    /// Drop any connection and open a new one
    fn reconnect(&mut self) -> Result<(), TransportError>;

    /// Close the connection
    fn disconnect(&mut self);
}

/// Source of deliveries from one queue
///
/// A delivery is acknowledged only once its handler succeeds.
/// If the handler fails, the delivery goes back to the queue and
/// the handler's error is returned.
pub trait Consumer {
    /// Wait up to `timeout` for one delivery and handle it
    ///
    /// Returns the number of deliveries acknowledged, which is
    /// zero if the timeout elapsed.
    fn consume<F>(&mut self, timeout: Duration, handler: F) -> Result<usize, TransportError>
    where
        F: FnOnce(&Envelope) -> Result<(), TransportError>;
}
