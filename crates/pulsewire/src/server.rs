//! Server pipeline: `signals` to `detected` and `unknown`
//!
//! Each received [`Envelope`] is parsed according to its content
//! type, expanded from rfraw hex if it carries no pulse array,
//! and run through the [`Dispatcher`]. Every device record is
//! published to the `detected` route in the content type of the
//! input. Messages which no decoder claimed go to `unknown`,
//! except short hex-only bursts, which are counted as noise.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(not(test))]
use log::{debug, info, warn};

#[cfg(test)]
use std::{println as debug, println as info, println as warn};

use crate::analyze::PulseAnalysis;
use crate::decoder::Dispatcher;
use crate::envelope::{DecodedSignal, Message};
use crate::json::{json_to_pulse, time_now};
use crate::pulse::{Modulation, PulseData};
use crate::rfraw;
use crate::stats::{Counter, Summary};
use crate::transport::{Consumer, ContentType, Envelope, Outgoing, Route, TransportError};

/// Server settings
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Republish unclaimed messages to the `unknown` route
    pub publish_unknown: bool,
    /// Log a pulse analysis of every burst
    pub analyze: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            publish_unknown: true,
            analyze: false,
        }
    }
}

/// Server counters
#[derive(Debug)]
pub struct ServerStats {
    /// Messages taken from the broker
    pub signals_received: Counter,
    /// Messages which produced at least one device record
    pub devices_decoded: Counter,
    /// Device records handed to the publisher
    pub records_published: Counter,
    /// Messages no decoder claimed
    pub unknown_signals: Counter,
    /// Short hex-only messages no decoder claimed
    pub short_signal_noise: Counter,
    /// Messages which could not be parsed as signals
    pub decode_errors: Counter,
    /// Device records which could not be encoded
    pub encode_errors: Counter,
    /// Decoder failures
    pub errors: Counter,
    /// Messages lost on the way to the broker
    pub send_errors: Counter,
    /// Successful reconnections
    pub reconnections: Counter,
    started: Instant,
}

impl ServerStats {
    /// Zeroed counters, starting the uptime clock
    pub fn new() -> Self {
        Self {
            signals_received: Counter::new(),
            devices_decoded: Counter::new(),
            records_published: Counter::new(),
            unknown_signals: Counter::new(),
            short_signal_noise: Counter::new(),
            decode_errors: Counter::new(),
            encode_errors: Counter::new(),
            errors: Counter::new(),
            send_errors: Counter::new(),
            reconnections: Counter::new(),
            started: Instant::now(),
        }
    }

    /// Report of the counters so far
    pub fn summary(&self) -> Summary {
        let received = self.signals_received.get();
        Summary {
            uptime: self.started.elapsed(),
            received,
            processed: received.saturating_sub(self.decode_errors.get()),
            decoded: self.devices_decoded.get(),
            unknown: self.unknown_signals.get(),
            noise: self.short_signal_noise.get(),
            errors: self.decode_errors.get()
                + self.encode_errors.get()
                + self.errors.get()
                + self.send_errors.get(),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes received bursts into device records
#[derive(Clone)]
pub struct ServerPipeline {
    config: ServerConfig,
    dispatcher: Dispatcher,
    stats: Arc<ServerStats>,
}

impl ServerPipeline {
    /// New pipeline over `dispatcher`, counting into `stats`
    pub fn new(config: ServerConfig, dispatcher: Dispatcher, stats: Arc<ServerStats>) -> Self {
        Self {
            config,
            dispatcher,
            stats,
        }
    }

    /// Counters
    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Handle one received message
    ///
    /// Returns the messages to publish: one per device record,
    /// or the original message for the `unknown` route. Messages
    /// which cannot be parsed are counted and dropped.
    pub fn handle(&self, env: &Envelope) -> Vec<Outgoing> {
        self.stats.signals_received.incr();
        let content_type = env.kind();

        let signal = match self.parse(env, content_type) {
            Some(signal) => signal,
            None => return Vec::new(),
        };

        let (data, from_hex) = match expand(signal.pulse, signal.hex.as_deref(), signal.modulation) {
            Ok(expanded) => expanded,
            Err(e) => {
                warn!("server: dropping message from \"{}\": {}", env.queue, e);
                self.stats.decode_errors.incr();
                return Vec::new();
            }
        };

        if self.config.analyze {
            info!("{}", PulseAnalysis::new(&data));
        }

        let found = self.dispatcher.dispatch(&data);
        self.stats.errors.add(found.errors as u64);

        let mut out = Vec::with_capacity(found.records.len());
        if found.is_decoded() {
            self.stats.devices_decoded.incr();
            let time = signal.timestamp.unwrap_or_else(time_now);
            for record in &found.records {
                match Outgoing::detected(record, content_type, signal.package_id, Some(&time)) {
                    Ok(msg) => {
                        self.stats.records_published.incr();
                        out.push(msg);
                    }
                    Err(e) => {
                        warn!("server: unable to encode \"{}\": {}", record.model, e);
                        self.stats.encode_errors.incr();
                    }
                }
            }
            debug!(
                "server: {} record(s) from {} pulses{}",
                found.records.len(),
                data.num_pulses(),
                if found.fallback { " (OOK fallback)" } else { "" }
            );
        } else if from_hex {
            self.stats.short_signal_noise.incr();
            debug!(
                "server: hex-only burst of {} pulses not decoded; counted as noise",
                data.num_pulses()
            );
        } else {
            self.stats.unknown_signals.incr();
            debug!(
                "server: burst of {} pulses not decoded after {} attempt(s)",
                data.num_pulses(),
                found.attempted
            );
            if self.config.publish_unknown {
                out.push(Outgoing::new(Route::Unknown, content_type, env.body.clone()));
            }
        }
        out
    }

    /// Handle one received message and publish its results
    ///
    /// Returns the number published. Stops at the first failed
    /// publish, which is counted as a send error.
    pub fn process<F>(&self, env: &Envelope, mut send: F) -> Result<usize, TransportError>
    where
        F: FnMut(&Outgoing) -> Result<(), TransportError>,
    {
        let out = self.handle(env);
        for msg in &out {
            if let Err(e) = send(msg) {
                warn!("server: unable to publish to \"{}\": {}", msg.route, e);
                self.stats.send_errors.incr();
                return Err(e);
            }
        }
        Ok(out.len())
    }

    fn parse(&self, env: &Envelope, content_type: ContentType) -> Option<DecodedSignal> {
        let parsed = match content_type {
            ContentType::Json => json_to_pulse(&env.body).map_err(|e| e.to_string()),
            ContentType::Asn1 => match Message::decode(&env.body) {
                Ok(Message::Signal(msg)) => msg.to_pulse().map_err(|e| e.to_string()),
                Ok(other) => Err(format!("expected a signal, got a {} envelope", kind_of(&other))),
                Err(e) => Err(e.to_string()),
            },
        };

        match parsed {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(
                    "server: undecodable {} message from \"{}\": {}",
                    content_type, env.queue, e
                );
                self.stats.decode_errors.incr();
                None
            }
        }
    }
}

/// Consume, decode and publish until shutdown
///
/// Each delivery is handled in full, and all of its results
/// published with `send`, before it is acknowledged. A failed
/// publish returns the delivery to the queue and ends the loop
/// with the error; the caller should reconnect. Returns the
/// number of deliveries acknowledged.
pub fn serve_queue<C, F>(
    consumer: &mut C,
    pipeline: &ServerPipeline,
    mut send: F,
    poll: Duration,
    shutdown: &AtomicBool,
) -> Result<u64, TransportError>
where
    C: Consumer,
    F: FnMut(&Outgoing) -> Result<(), TransportError>,
{
    let mut handled = 0u64;
    while !shutdown.load(Ordering::Relaxed) {
        handled += consumer.consume(poll, |env| pipeline.process(env, &mut send).map(drop))? as u64;
    }
    debug!("server: {} deliveries handled before shutdown", handled);
    Ok(handled)
}

// A message without pulses is rebuilt from its rfraw hex,
// keeping the sender's metadata
fn expand(
    pulse: PulseData,
    hex: Option<&str>,
    modulation: Modulation,
) -> Result<(PulseData, bool), String> {
    if !pulse.is_empty() {
        return Ok((pulse, false));
    }

    let hex = hex.ok_or_else(|| "no pulses and no rfraw hex".to_owned())?;
    let mut out = rfraw::decode(hex).map_err(|e| e.to_string())?;
    out.centerfreq_hz = pulse.centerfreq_hz;
    out.freq1_hz = pulse.freq1_hz;
    out.freq2_hz = pulse.freq2_hz;
    out.rssi_db = pulse.rssi_db;
    out.snr_db = pulse.snr_db;
    out.noise_db = pulse.noise_db;
    out.range_db = pulse.range_db;
    out.depth_bits = pulse.depth_bits;
    out.offset = pulse.offset;
    out.start_ago = pulse.start_ago;
    out.end_ago = pulse.end_ago;
    out.ook_low_estimate = pulse.ook_low_estimate;
    out.ook_high_estimate = pulse.ook_high_estimate;
    out.fsk_f1_est = pulse.fsk_f1_est;
    out.fsk_f2_est = pulse.fsk_f2_est;
    if modulation == Modulation::Fsk && out.fsk_f2_est == 0 {
        out.fsk_f2_est = -1;
    }
    Ok((out, true))
}

fn kind_of(msg: &Message) -> &'static str {
    match msg {
        Message::Signal(_) => "signal",
        Message::Detected(_) => "detected",
        Message::Status(_) => "status",
        Message::Config(_) => "config",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::decoder::Registry;
    use crate::envelope::{DetectedMessage, SignalMessage};
    use crate::flex::FlexDecoder;
    use crate::json::pulse_to_json;
    use crate::record::DeviceRecord;
    use crate::transport::{Loopback, Publisher, MIME_ASN1, MIME_JSON};

    // PWM at 1 µs/sample: short pulse 1, long pulse 0
    fn pwm(rows: &[&[u8]], bits: usize) -> PulseData {
        let mut widths = Vec::new();
        for row in rows {
            for i in 0..bits {
                let one = (row[i / 8] >> (7 - i % 8)) & 1 == 1;
                widths.push(if one { 400 } else { 800 });
                widths.push(if i + 1 == bits {
                    5000
                } else if one {
                    800
                } else {
                    400
                });
            }
        }
        PulseData::from_pairs(1_000_000, &widths).unwrap()
    }

    fn pipeline(spec: &str, config: ServerConfig) -> ServerPipeline {
        let mut registry = Registry::new();
        registry.register(Box::new(FlexDecoder::parse(spec).unwrap()));
        ServerPipeline::new(
            config,
            Dispatcher::new(registry),
            Arc::new(ServerStats::new()),
        )
    }

    fn remote() -> ServerPipeline {
        pipeline(
            "n=remote,m=OOK_PWM,s=400,l=800,g=2000,r=10000,bits>=16,repeats>=2",
            ServerConfig::default(),
        )
    }

    fn envelope(mime: &str, body: Vec<u8>) -> Envelope {
        Envelope {
            queue: "signals".to_owned(),
            content_type: Some(mime.to_owned()),
            body,
        }
    }

    #[test]
    fn test_json_decoded() {
        let server = remote();
        let data = pwm(&[&[0xa5, 0x3c], &[0xa5, 0x3c]], 16);
        let body = pulse_to_json(&data, 42, None, Some("2024-05-01 12:00:00"))
            .unwrap()
            .into_bytes();

        let out = server.handle(&envelope(MIME_JSON, body));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].route, Route::Detected);
        assert_eq!(out[0].content_type, ContentType::Json);
        let json: serde_json::Value = serde_json::from_slice(&out[0].body).unwrap();
        assert_eq!(json["model"], "remote");
        assert_eq!(json["data"], "A53C");
        assert_eq!(json["package_id"], 42);
        assert_eq!(json["time"], "2024-05-01 12:00:00");

        let stats = server.stats();
        assert_eq!(stats.signals_received.get(), 1);
        assert_eq!(stats.devices_decoded.get(), 1);
        assert_eq!(stats.unknown_signals.get(), 0);
    }

    #[test]
    fn test_asn1_decoded() {
        let server = remote();
        let data = pwm(&[&[0xa5, 0x3c], &[0xa5, 0x3c]], 16);
        let body = Message::Signal(SignalMessage::from_pulse(&data, 9).unwrap())
            .encode()
            .unwrap();

        let out = server.handle(&envelope(MIME_ASN1, body));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content_type, ContentType::Asn1);
        match Message::decode(&out[0].body).unwrap() {
            Message::Detected(msg) => {
                assert_eq!(msg.device.model, "remote");
                assert_eq!(msg.package_id, Some(9));
                assert!(msg.timestamp.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown() {
        let server = remote();
        let data = pwm(&[&[0xa5, 0x3c]], 16);
        let body = pulse_to_json(&data, 1, None, None).unwrap().into_bytes();
        let env = envelope(MIME_JSON, body.clone());

        let out = server.handle(&env);
        assert_eq!(out, vec![Outgoing::new(Route::Unknown, ContentType::Json, body)]);
        assert_eq!(server.stats().unknown_signals.get(), 1);

        let quiet = pipeline(
            "n=remote,m=OOK_PWM,s=400,l=800,r=10000,bits>=16,repeats>=2",
            ServerConfig {
                publish_unknown: false,
                analyze: true,
            },
        );
        assert!(quiet.handle(&env).is_empty());
        assert_eq!(quiet.stats().unknown_signals.get(), 1);
    }

    #[test]
    fn test_hex_only() {
        let short = pwm(&[&[0xa5]], 8);
        let hex = rfraw::encode(&short).unwrap();
        let body = format!(
            "{{\"mod\":\"OOK\",\"count\":0,\"rate_Hz\":250000,\"freq_Hz\":433920000,\"hex_string\":\"{}\"}}",
            hex
        )
        .into_bytes();

        // decodable from hex
        let server = pipeline(
            "n=short,m=OOK_PWM,s=400,l=800,r=4000,bits>=8",
            ServerConfig::default(),
        );
        let out = server.handle(&envelope(MIME_JSON, body.clone()));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].route, Route::Detected);
        assert_eq!(server.stats().short_signal_noise.get(), 0);

        // not decodable: noise, never unknown
        let server = remote();
        assert!(server.handle(&envelope(MIME_JSON, body)).is_empty());
        assert_eq!(server.stats().short_signal_noise.get(), 1);
        assert_eq!(server.stats().unknown_signals.get(), 0);
    }

    #[test]
    fn test_expand_keeps_metadata() {
        let short = pwm(&[&[0xa5]], 8);
        let hex = rfraw::encode(&short).unwrap();
        let mut meta = PulseData::new(250_000).unwrap();
        meta.centerfreq_hz = 868.3e6;
        meta.rssi_db = -7.5;

        let (data, from_hex) = expand(meta, Some(&hex), Modulation::Fsk).unwrap();
        assert!(from_hex);
        assert_eq!(data.num_pulses(), 8);
        assert_eq!(data.sample_rate(), rfraw::RFRAW_SAMPLE_RATE);
        assert_eq!(data.centerfreq_hz, 868.3e6);
        assert_eq!(data.rssi_db, -7.5);
        assert_eq!(data.fsk_f2_est, -1);
        assert_eq!(data.modulation(), Modulation::Fsk);

        let empty = PulseData::new(250_000).unwrap();
        assert!(expand(empty, None, Modulation::Ook).is_err());
    }

    #[test]
    fn test_malformed() {
        let server = remote();
        assert!(server
            .handle(&envelope(MIME_JSON, b"{\"pulses\": \"nope\"".to_vec()))
            .is_empty());

        let data = pwm(&[&[0xa5, 0x3c], &[0xa5, 0x3c]], 16);
        let mut body = Message::Signal(SignalMessage::from_pulse(&data, 9).unwrap())
            .encode()
            .unwrap();
        body.truncate(body.len() - 1);
        assert!(server.handle(&envelope(MIME_ASN1, body)).is_empty());

        assert_eq!(server.stats().decode_errors.get(), 2);
        assert_eq!(server.stats().signals_received.get(), 2);
        assert_eq!(server.stats().summary().processed, 0);
    }

    #[test]
    fn test_other_envelopes() {
        let server = remote();
        let record = DeviceRecord::new("Acme-Sensor").with_id("12");
        let body = Message::Detected(DetectedMessage::from_record(&record, Some(3), None))
            .encode()
            .unwrap();

        assert!(server.handle(&envelope(MIME_ASN1, body)).is_empty());
        let stats = server.stats();
        assert_eq!(stats.signals_received.get(), 1);
        assert_eq!(stats.decode_errors.get(), 1);
        assert_eq!(stats.summary().processed, 0);
    }

    #[test]
    fn test_process_publish_failure() {
        let server = remote();
        let data = pwm(&[&[0xa5, 0x3c], &[0xa5, 0x3c]], 16);
        let body = pulse_to_json(&data, 5, None, None).unwrap().into_bytes();
        let env = envelope(MIME_JSON, body);

        let err = server.process(&env, |_| Err(TransportError::NotConnected));
        assert!(matches!(err, Err(TransportError::NotConnected)));
        assert_eq!(server.stats().send_errors.get(), 1);

        let mut sent = Vec::new();
        let n = server
            .process(&env, |m| {
                sent.push(m.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(sent[0].route, Route::Detected);
    }

    #[test]
    fn test_serve_queue_acks_after_publish() {
        let server = remote();
        let broker = Loopback::new();
        let mut out = broker.clone();
        let data = pwm(&[&[0xa5, 0x3c], &[0xa5, 0x3c]], 16);
        for id in 0..3 {
            let body = pulse_to_json(&data, id, None, None).unwrap().into_bytes();
            broker.inject("signals", Some(MIME_JSON), body);
        }
        let mut consumer = broker.consumer("signals");
        let poll = Duration::from_millis(1);

        // the broker drops the connection on the first result
        broker.fail_next(1);
        let running = AtomicBool::new(false);
        let err = serve_queue(&mut consumer, &server, |m| out.publish(m), poll, &running);
        assert!(err.is_err());
        assert_eq!(broker.acked(), 0);
        assert_eq!(broker.len("signals"), 3);
        assert_eq!(broker.len("detected"), 0);
        assert_eq!(server.stats().send_errors.get(), 1);

        // after reconnecting, every delivery is redelivered
        out.reconnect().unwrap();
        for _ in 0..3 {
            let n = consumer
                .consume(poll, |env| server.process(env, |m| out.publish(m)).map(drop))
                .unwrap();
            assert_eq!(n, 1);
        }
        assert_eq!(broker.acked(), 3);
        assert_eq!(broker.len("signals"), 0);
        assert_eq!(broker.len("detected"), 3);
        assert_eq!(server.stats().signals_received.get(), 4);
        assert_eq!(server.stats().devices_decoded.get(), 4);

        // stopped before the first poll
        let stopped = AtomicBool::new(true);
        assert_eq!(
            serve_queue(&mut consumer, &server, |m| out.publish(m), poll, &stopped).unwrap(),
            0
        );
    }
}
