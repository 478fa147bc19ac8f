//! Decoder registry and dispatch
//!
//! A [`Decoder`] turns one burst into zero or more
//! [`DeviceRecord`]s. The [`Registry`] holds decoders in dispatch
//! order, each with a stable protocol number starting from 1.
//! It is assembled once at startup and then shared, read-only,
//! by a [`Dispatcher`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

#[cfg(not(test))]
use log::{debug, error, trace};

#[cfg(test)]
use std::{println as debug, println as error, println as trace};

use crate::pulse::{Modulation, PulseData};
use crate::record::DeviceRecord;
use crate::slicer::{Coding, Timing};

pub mod devices;

/// Why a decoder produced nothing
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Wrong number of bits or rows
    #[error("message length mismatch")]
    AbortLength,

    /// Preamble or sync not found
    #[error("no message start found")]
    AbortEarly,

    /// Checksum or CRC mismatch
    #[error("integrity check failed")]
    FailMic,

    /// Field values out of range
    #[error("implausible field values")]
    FailSanity,

    /// The decoder itself failed
    #[error("decoder failure: {0}")]
    Internal(String),
}

impl DecodeError {
    /// True if the burst simply was not for this decoder
    pub fn is_rejection(&self) -> bool {
        !matches!(self, DecodeError::Internal(_))
    }
}

/// Error managing the registry
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// No decoder has this protocol number
    #[error("unknown decoder number {0}")]
    UnknownDecoder(usize),
}

/// A device decoder
///
/// Implementations receive the burst as an explicit argument
/// and must not keep state between calls. They may be invoked
/// from any thread.
pub trait Decoder: Send + Sync {
    /// Unique display name
    fn name(&self) -> &str;

    /// Line coding, which also fixes the modulation family
    fn coding(&self) -> Coding;

    /// Nominal timing
    fn timing(&self) -> Timing;

    /// Decode one burst
    fn decode(&self, data: &PulseData) -> Result<Vec<DeviceRecord>, DecodeError>;

    /// Modulation family
    fn modulation(&self) -> Modulation {
        self.coding().modulation()
    }
}

/// Registry listing entry
#[derive(Clone, Debug, PartialEq)]
pub struct DecoderInfo {
    /// Protocol number
    pub number: usize,
    /// Display name
    pub name: String,
    /// Line coding
    pub coding: Coding,
    /// True if dispatch will use it
    pub enabled: bool,
}

#[derive(Clone)]
struct Entry {
    number: usize,
    enabled: bool,
    decoder: Arc<dyn Decoder>,
}

/// Ordered set of decoders
///
/// Protocol numbers are assigned in registration order and
/// never change. Dispatch order starts out the same, but
/// [`promote()`](Registry::promote) can move a decoder to the
/// front.
#[derive(Clone, Default)]
pub struct Registry {
    entries: Vec<Entry>,
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an enabled decoder; returns its protocol number
    pub fn register(&mut self, decoder: Box<dyn Decoder>) -> usize {
        let number = self.entries.len() + 1;
        debug!("registry: [{}] {}", number, decoder.name());
        self.entries.push(Entry {
            number,
            enabled: true,
            decoder: Arc::from(decoder),
        });
        number
    }

    /// Enable a decoder by protocol number
    pub fn enable(&mut self, number: usize) -> Result<(), RegistryError> {
        self.entry_mut(number)?.enabled = true;
        Ok(())
    }

    /// Disable a decoder by protocol number
    pub fn disable(&mut self, number: usize) -> Result<(), RegistryError> {
        self.entry_mut(number)?.enabled = false;
        Ok(())
    }

    /// Disable every decoder
    pub fn disable_all(&mut self) {
        for e in &mut self.entries {
            e.enabled = false;
        }
    }

    /// Move a decoder to the front of the dispatch order
    pub fn promote(&mut self, number: usize) -> Result<(), RegistryError> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.number == number)
            .ok_or(RegistryError::UnknownDecoder(number))?;
        let entry = self.entries.remove(pos);
        self.entries.insert(0, entry);
        Ok(())
    }

    /// Apply `-R` style selectors
    ///
    /// * `0` disables everything
    /// * `-n` disables decoder `n`
    /// * `n` enables decoder `n`. The first positive selector
    ///   disables every decoder not explicitly selected, and the
    ///   selected decoders dispatch in the order given.
    pub fn select(&mut self, selectors: &[i64]) -> Result<(), RegistryError> {
        let positive: Vec<usize> = selectors
            .iter()
            .filter(|s| **s > 0)
            .map(|s| *s as usize)
            .collect();
        if !positive.is_empty() {
            self.disable_all();
            for number in positive.iter().rev() {
                self.enable(*number)?;
                self.promote(*number)?;
            }
        }

        for sel in selectors {
            match *sel {
                0 => self.disable_all(),
                n if n < 0 => self.disable(n.unsigned_abs() as usize)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Every decoder, in protocol number order
    pub fn list(&self) -> Vec<DecoderInfo> {
        let mut out: Vec<DecoderInfo> = self
            .entries
            .iter()
            .map(|e| DecoderInfo {
                number: e.number,
                name: e.decoder.name().to_owned(),
                coding: e.decoder.coding(),
                enabled: e.enabled,
            })
            .collect();
        out.sort_by_key(|d| d.number);
        out
    }

    /// Number of registered decoders
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no decoders are registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of enabled decoders
    pub fn num_enabled(&self) -> usize {
        self.entries.iter().filter(|e| e.enabled).count()
    }

    /// Enabled decoders of one family, in dispatch order
    fn enabled_for(&self, class: Modulation) -> impl Iterator<Item = &Arc<dyn Decoder>> + '_ {
        self.entries
            .iter()
            .filter(move |e| e.enabled && e.decoder.modulation() == class)
            .map(|e| &e.decoder)
    }

    fn entry_mut(&mut self, number: usize) -> Result<&mut Entry, RegistryError> {
        self.entries
            .iter_mut()
            .find(|e| e.number == number)
            .ok_or(RegistryError::UnknownDecoder(number))
    }
}

/// Records from one burst
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dispatch {
    /// Every record emitted, in dispatch order
    pub records: Vec<DeviceRecord>,
    /// Decoders invoked
    pub attempted: usize,
    /// Decoders which failed internally or panicked
    pub errors: usize,
    /// True if an FSK burst was retried with OOK decoders
    pub fallback: bool,
}

impl Dispatch {
    /// True if any decoder claimed the burst
    pub fn is_decoded(&self) -> bool {
        !self.records.is_empty()
    }
}

/// Runs bursts through a shared [`Registry`]
///
/// Clones share the registry and the error counter.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    fsk_fallback: bool,
    errors: Arc<AtomicU64>,
}

impl Dispatcher {
    /// Dispatcher over a finished registry
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
            fsk_fallback: true,
            errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Retry undecoded FSK bursts with OOK decoders
    pub fn with_fsk_fallback(mut self, on: bool) -> Self {
        self.fsk_fallback = on;
        self
    }

    /// The registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Decoder failures so far, across all clones
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Decode one burst
    ///
    /// Every enabled decoder of the burst's modulation family
    /// runs, in order. All records are kept. A failing or
    /// panicking decoder is counted and skipped.
    pub fn dispatch(&self, data: &PulseData) -> Dispatch {
        let class = data.modulation();
        let mut out = Dispatch::default();
        self.run_class(class, data, &mut out);

        if self.fsk_fallback && class == Modulation::Fsk && out.records.is_empty() {
            trace!("dispatch: no FSK decoder matched; retrying as OOK");
            out.fallback = true;
            self.run_class(Modulation::Ook, data, &mut out);
        }
        out
    }

    fn run_class(&self, class: Modulation, data: &PulseData, out: &mut Dispatch) {
        for decoder in self.registry.enabled_for(class) {
            out.attempted += 1;
            let result = panic::catch_unwind(AssertUnwindSafe(|| decoder.decode(data)));
            match result {
                Ok(Ok(records)) => {
                    if !records.is_empty() {
                        debug!(
                            "dispatch: {} decoded {} record(s)",
                            decoder.name(),
                            records.len()
                        );
                    }
                    out.records.extend(records);
                }
                Ok(Err(e)) if e.is_rejection() => {
                    trace!("dispatch: {}: {}", decoder.name(), e);
                }
                Ok(Err(e)) => {
                    error!("dispatch: {}: {}", decoder.name(), e);
                    out.errors += 1;
                    self.errors.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    error!("dispatch: decoder {} panicked", decoder.name());
                    out.errors += 1;
                    self.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}
