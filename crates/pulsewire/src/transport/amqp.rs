//! AMQP broker connection

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use amiquip::{
    AmqpProperties, Channel, Connection, ConsumerMessage, ConsumerOptions,
    ExchangeDeclareOptions, ExchangeType, FieldTable, Publish, QueueDeclareOptions,
};
use strum::IntoEnumIterator;

#[cfg(not(test))]
use log::{debug, info, warn};

#[cfg(test)]
use std::{println as debug, println as info, println as warn};

use super::{
    Consumer, ContentType, Envelope, Outgoing, Publisher, Route, TransportConfig, TransportError,
};

/// A connection and channel to an AMQP broker
///
/// Connecting happens in three phases, and the phase that fails
/// determines the error:
///
/// 1. TCP connect: [`TransportError::Connect`], worth retrying
/// 2. AMQP login: [`TransportError::Handshake`], fatal
/// 3. Exchange and queue declarations:
///    [`TransportError::Topology`], fatal
///
/// Publishing borrows the transport immutably, so one connection
/// may publish while a [`QueueConsumer`] is open on it.
pub struct AmqpTransport {
    config: TransportConfig,
    link: Option<Link>,
    reconnections: u64,
}

struct Link {
    connection: Connection,
    channel: Channel,
}

impl AmqpTransport {
    /// Connect and declare the topology
    pub fn connect(config: TransportConfig) -> Result<Self, TransportError> {
        let link = open_link(&config)?;
        Ok(Self {
            config,
            link: Some(link),
            reconnections: 0,
        })
    }

    /// Transport settings
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// True if there is an open channel
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Number of successful reconnections
    pub fn reconnections(&self) -> u64 {
        self.reconnections
    }

    /// Publish one message
    pub fn send(&self, msg: &Outgoing) -> Result<(), TransportError> {
        let link = self.link.as_ref().ok_or(TransportError::NotConnected)?;
        let properties = AmqpProperties::default()
            .with_content_type(msg.content_type.mime().into())
            .with_delivery_mode(2);
        link.channel.basic_publish(
            self.config.url.exchange.as_str(),
            Publish::with_properties(&msg.body, msg.route.key(), properties),
        )?;
        Ok(())
    }

    /// Start consuming `queue`
    pub fn consumer(&self, queue: &str) -> Result<QueueConsumer<'_>, TransportError> {
        let link = self.link.as_ref().ok_or(TransportError::NotConnected)?;
        link.channel.qos(0, self.config.prefetch, false)?;
        let consumer = link
            .channel
            .basic_consume(queue, ConsumerOptions::default())?;
        info!("consuming from queue \"{}\"", queue);
        Ok(QueueConsumer {
            channel: &link.channel,
            consumer: Some(consumer),
            queue: queue.to_owned(),
        })
    }

    /// Close the channel and connection
    pub fn close(&mut self) {
        if let Some(link) = self.link.take() {
            if let Err(e) = link.channel.close() {
                debug!("closing channel: {}", e);
            }
            if let Err(e) = link.connection.close() {
                debug!("closing connection: {}", e);
            }
            info!("disconnected from {}", self.config.url);
        }
    }
}

impl Publisher for AmqpTransport {
    fn publish(&mut self, msg: &Outgoing) -> Result<(), TransportError> {
        self.send(msg)
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        self.close();
        let link = open_link(&self.config)?;
        self.link = Some(link);
        self.reconnections += 1;
        info!(
            "reconnected to {} ({} reconnections)",
            self.config.url, self.reconnections
        );
        Ok(())
    }

    fn disconnect(&mut self) {
        self.close()
    }
}

impl Drop for AmqpTransport {
    fn drop(&mut self) {
        self.close()
    }
}

/// Consumer on one queue
///
/// Borrows the channel of its [`AmqpTransport`]. Each delivery is
/// acknowledged after its handler succeeds, and returned to the
/// queue if the handler fails.
pub struct QueueConsumer<'a> {
    channel: &'a Channel,
    consumer: Option<amiquip::Consumer<'a>>,
    queue: String,
}

impl<'a> QueueConsumer<'a> {
    /// Queue name
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop consuming
    ///
    /// Unacknowledged deliveries return to the queue.
    pub fn cancel(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            if let Err(e) = consumer.cancel() {
                debug!("cancelling consumer on \"{}\": {}", self.queue, e);
            }
        }
    }
}

impl<'a> Consumer for QueueConsumer<'a> {
    fn consume<F>(&mut self, timeout: Duration, handler: F) -> Result<usize, TransportError>
    where
        F: FnOnce(&Envelope) -> Result<(), TransportError>,
    {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| TransportError::Closed("consumer cancelled".to_owned()))?;

        match consumer.receiver().recv_timeout(timeout) {
            Ok(ConsumerMessage::Delivery(mut delivery)) => {
                let content_type = delivery
                    .properties
                    .content_type()
                    .as_ref()
                    .map(|s| s.as_str().to_owned());
                let envelope = Envelope {
                    queue: self.queue.clone(),
                    content_type,
                    body: std::mem::take(&mut delivery.body),
                };
                match handler(&envelope) {
                    Ok(()) => {
                        delivery.ack(self.channel)?;
                        Ok(1)
                    }
                    Err(e) => {
                        if let Err(nack) = delivery.nack(self.channel, true) {
                            debug!("requeueing delivery on \"{}\": {}", self.queue, nack);
                        }
                        Err(e)
                    }
                }
            }
            Ok(ConsumerMessage::ServerClosedChannel(e))
            | Ok(ConsumerMessage::ServerClosedConnection(e)) => Err(TransportError::Amqp(e)),
            Ok(_) => Err(TransportError::Closed(format!(
                "consumer on \"{}\" stopped",
                self.queue
            ))),
            Err(e) if e.is_timeout() => Ok(0),
            Err(_) => Err(TransportError::Closed(format!(
                "consumer on \"{}\" disconnected",
                self.queue
            ))),
        }
    }
}

impl<'a> Drop for QueueConsumer<'a> {
    fn drop(&mut self) {
        self.cancel()
    }
}

fn open_link(config: &TransportConfig) -> Result<Link, TransportError> {
    let addr = config.url.address();
    let timeout = Duration::from_millis(config.connect_timeout_ms.max(1));
    probe(&addr, timeout)?;

    let mut connection =
        Connection::insecure_open(&config.url.amqp_url(config.heartbeat_s, config.connect_timeout_ms))
            .map_err(|source| TransportError::Handshake {
                addr: addr.clone(),
                source,
            })?;
    let channel = connection
        .open_channel(None)
        .map_err(|source| TransportError::Handshake {
            addr: addr.clone(),
            source,
        })?;
    info!("connected to {}", config.url);

    if config.declare {
        declare_topology(&channel, &config.url.exchange)?;
    }

    Ok(Link {
        connection,
        channel,
    })
}

// A plain TCP connect tells an unreachable broker apart from a
// refused login.
fn probe(addr: &str, timeout: Duration) -> Result<(), TransportError> {
    let connect_err = |source| TransportError::Connect {
        addr: addr.to_owned(),
        source,
    };

    let mut last = std::io::Error::new(std::io::ErrorKind::NotFound, "no address");
    for sockaddr in addr.to_socket_addrs().map_err(connect_err)? {
        match TcpStream::connect_timeout(&sockaddr, timeout) {
            Ok(_) => return Ok(()),
            Err(e) => {
                debug!("connect {}: {}", sockaddr, e);
                last = e;
            }
        }
    }
    warn!("broker {} unreachable: {}", addr, last);
    Err(connect_err(last))
}

fn declare_topology(channel: &Channel, exchange: &str) -> Result<(), TransportError> {
    let topology = |what: String| move |source| TransportError::Topology { what, source };

    channel
        .exchange_declare(
            ExchangeType::Direct,
            exchange,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
        )
        .map_err(topology(format!("exchange \"{}\"", exchange)))?;

    for content_type in [ContentType::Json, ContentType::Asn1] {
        for route in Route::iter() {
            let queue = route.queue(content_type);
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                )
                .map_err(topology(format!("queue \"{}\"", queue)))?;
            channel
                .queue_bind(queue, exchange, route.key(), FieldTable::new())
                .map_err(topology(format!(
                    "binding \"{}\" -> \"{}\"",
                    route.key(),
                    queue
                )))?;
        }
    }

    debug!("declared exchange \"{}\" with six queues", exchange);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::TcpListener;

    use crate::transport::TransportUrl;

    #[test]
    fn test_probe_refused() {
        // bind and drop to find a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let addr = format!("127.0.0.1:{}", port);
        let err = probe(&addr, Duration::from_millis(500)).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_connect_unreachable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = TransportUrl::parse(&format!("amqp://127.0.0.1:{}", port)).unwrap();
        let mut config = TransportConfig::new(url);
        config.connect_timeout_ms = 500;
        match AmqpTransport::connect(config) {
            Err(TransportError::Connect { addr, .. }) => {
                assert_eq!(addr, format!("127.0.0.1:{}", port))
            }
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("connected to nothing"),
        }
    }
}
