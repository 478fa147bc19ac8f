//! # pulsewire: ISM-band pulse capture and routing
//!
//! This crate splits an rtl_433-style receiver in two. A *client*
//! finds radio bursts in I/Q samples and publishes them, as pulse
//! timings, to an AMQP broker. A *server* consumes the bursts,
//! runs them through a registry of device decoders, and publishes
//! what it recognizes.
//!
//! ```txt
//!  I/Q ─► PulseDetector ─► Burst ─► ClientPipeline ─► signals
//!                                                        │
//!  detected ◄─ Outgoing ◄─ Dispatcher ◄─ ServerPipeline ◄┘
//!  unknown  ◄─┘
//! ```
//!
//! ## Bursts
//!
//! A burst is a [`PulseData`]: alternating pulse and gap widths,
//! in samples, plus level and frequency estimates. Bursts travel
//! in one of two encodings:
//!
//! * ASN.1 UPER [`Message`] envelopes (`application/octet-stream`)
//! * legacy flat JSON objects (`application/json`), see [`json`]
//!
//! Bursts of 16 pulses or more carry every width. Shorter bursts
//! are compressed to [`rfraw`] hex, which clusters the widths into
//! at most eight bins.
//!
//! ## Detection
//!
//! ```
//! use pulsewire::{IqFrame, PulseDetectorBuilder, SampleFormat};
//!
//! let mut detector = PulseDetectorBuilder::new(250_000)
//!     .with_center_frequency(433.92e6)
//!     .build();
//!
//! // silence yields no bursts
//! let frame = IqFrame::from_bytes(SampleFormat::Cu8, &[127u8; 4096]).unwrap();
//! assert!(detector.process(&frame).is_empty());
//! ```
//!
//! ## Decoding
//!
//! Decoders implement [`Decoder`]. They are registered, in
//! dispatch order, with a [`Registry`], and run by a
//! [`Dispatcher`]. Generic decoders may be described with a
//! [`FlexSpec`] string such as
//!
//! ```txt
//! n=doorbell,m=OOK_PWM,s=400,l=800,r=8000,bits>=24
//! ```
//!
//! ## Transport
//!
//! [`AmqpTransport`] talks to the broker. The [`Publisher`] and
//! [`Consumer`] traits are the seams between the pipelines and
//! the connection; the in-process [`Loopback`] broker implements
//! both for tests.

mod baseband;
mod bitbuffer;
mod level;
mod per;
mod pulse;
mod record;
mod slicer;

pub mod analyze;
pub mod client;
pub mod decoder;
pub mod detect;
pub mod envelope;
pub mod flex;
pub mod iq;
pub mod json;
pub mod rfraw;
pub mod server;
pub mod stats;
pub mod transport;

pub use analyze::{Guess, PulseAnalysis};
pub use bitbuffer::BitBuffer;
pub use client::{ClientConfig, ClientPipeline, ClientStats, OutQueue, PublisherConfig};
pub use decoder::{DecodeError, Decoder, Dispatch, Dispatcher, Registry, RegistryError};
pub use detect::{Burst, FskMode, PulseDetector, PulseDetectorBuilder};
pub use envelope::{DecodedSignal, EnvelopeError, Message, SignalMessage};
pub use flex::{FlexDecoder, FlexError, FlexSpec};
pub use iq::{FileInfo, IqError, IqFrame, IqReader, SampleFormat};
pub use level::{FrameVerdict, LevelTracker};
pub use per::PerError;
pub use pulse::{Modulation, PulseData, PulseError, PD_MAX, PD_MIN_PULSES};
pub use record::{DeviceRecord, FieldValue};
pub use rfraw::RfrawError;
pub use server::{ServerConfig, ServerPipeline, ServerStats};
pub use slicer::{Coding, Timing};
pub use stats::{Counter, Summary};
pub use transport::{
    AmqpTransport, Backoff, Consumer, ContentType, Envelope, Loopback, LoopbackConsumer, Outgoing,
    Publisher, QueueConsumer, Route, TransportConfig, TransportError, TransportUrl, UrlError,
};
