//! ASN.1 unaligned packed encoding rules (UPER)
//!
//! [`BitWriter`] and [`BitReader`] implement the subset of
//! ITU-T X.691 *unaligned* PER needed by the
//! [message envelope](crate::envelope):
//!
//! * constrained whole numbers, as the minimum number of bits
//!   which can represent the range
//! * semi-constrained and unconstrained `INTEGER`, as a length
//!   determinant followed by the minimum number of octets
//! * `REAL`, in the binary form of X.690 §8.5
//! * `BOOLEAN`, `ENUMERATED` and `CHOICE` indices, with or without
//!   an extension marker
//! * `OCTET STRING`, `UTF8String`, `VisibleString` (and hence
//!   `GeneralizedTime`), with or without a `SIZE` constraint
//! * `SEQUENCE` preambles: extension bit, optional-field bitmap,
//!   and skipping of unknown extension additions
//!
//! Nothing is octet-aligned. Fragmented lengths (16K and up) are
//! not supported; no field in the envelope can be that large.

use thiserror::Error;

/// Largest length which can be encoded without fragmentation
pub const MAX_LENGTH: usize = 16383;

/// Error encoding or decoding UPER
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum PerError {
    /// The buffer ended before the value did
    #[error("unexpected end of data at bit {0}")]
    Truncated(usize),

    /// A value lies outside its constraint
    #[error("value {value} outside constraint {lb}..={ub}")]
    OutOfRange {
        /// The value
        value: i64,
        /// Lower bound
        lb: i64,
        /// Upper bound
        ub: i64,
    },

    /// A length would need fragmentation
    #[error("length {0} exceeds the unfragmented maximum")]
    TooLong(usize),

    /// An integer does not fit in 64 bits
    #[error("integer of {0} octets does not fit")]
    IntegerOverflow(usize),

    /// A `REAL` uses a form this codec does not read
    #[error("unsupported REAL encoding 0x{0:02x}")]
    UnsupportedReal(u8),

    /// A string is not valid for its type
    #[error("invalid character string")]
    InvalidString,

    /// A choice or enumeration index outside the root, with
    /// no way to skip it
    #[error("unknown alternative {0}")]
    UnknownAlternative(u64),
}

/// Bits needed for a constrained whole number with `range` values
#[inline]
fn range_bits(range: u64) -> u32 {
    if range <= 1 {
        0
    } else {
        64 - (range - 1).leading_zeros()
    }
}

/// Writes UPER bit fields, most significant bit first
#[derive(Clone, Debug, Default)]
pub struct BitWriter {
    buf: Vec<u8>,
    bits: usize,
}

impl BitWriter {
    /// Empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bits written so far
    #[inline]
    pub fn bit_len(&self) -> usize {
        self.bits
    }

    /// Finish and return the encoding
    ///
    /// The final octet is padded with zero bits. An empty
    /// encoding becomes a single zero octet, per X.691 §11.1.
    pub fn into_bytes(mut self) -> Vec<u8> {
        if self.buf.is_empty() {
            self.buf.push(0);
        }
        self.buf
    }

    /// Append the low `nbits` of `value`
    pub fn write_bits(&mut self, value: u64, nbits: u32) {
        for i in (0..nbits).rev() {
            self.write_bool((value >> i) & 1 == 1);
        }
    }

    /// Append one bit
    pub fn write_bool(&mut self, bit: bool) {
        let byte = self.bits / 8;
        if byte == self.buf.len() {
            self.buf.push(0);
        }
        if bit {
            self.buf[byte] |= 0x80 >> (self.bits % 8);
        }
        self.bits += 1;
    }

    /// Append whole octets
    pub fn write_octets(&mut self, data: &[u8]) {
        for b in data {
            self.write_bits(*b as u64, 8);
        }
    }

    /// Integer with both bounds: `lb ≤ value ≤ ub`
    pub fn write_constrained(&mut self, value: i64, lb: i64, ub: i64) -> Result<(), PerError> {
        if value < lb || value > ub {
            return Err(PerError::OutOfRange { value, lb, ub });
        }
        let range = (ub as i128 - lb as i128 + 1) as u64;
        self.write_bits((value as i128 - lb as i128) as u64, range_bits(range));
        Ok(())
    }

    /// Unconstrained length determinant
    pub fn write_length(&mut self, len: usize) -> Result<(), PerError> {
        if len < 128 {
            self.write_bits(len as u64, 8);
        } else if len <= MAX_LENGTH {
            self.write_bits(0b10 << 14 | len as u64, 16);
        } else {
            return Err(PerError::TooLong(len));
        }
        Ok(())
    }

    /// Length constrained by `SIZE(lb..ub)`
    pub fn write_constrained_length(
        &mut self,
        len: usize,
        lb: usize,
        ub: usize,
    ) -> Result<(), PerError> {
        if ub > MAX_LENGTH {
            if len < lb {
                return Err(PerError::OutOfRange {
                    value: len as i64,
                    lb: lb as i64,
                    ub: ub as i64,
                });
            }
            return self.write_length(len);
        }
        self.write_constrained(len as i64, lb as i64, ub as i64)
    }

    /// Unconstrained `INTEGER`
    pub fn write_integer(&mut self, value: i64) -> Result<(), PerError> {
        let bytes = value.to_be_bytes();
        // shortest two's complement form that keeps the sign bit
        let mut start = 0;
        while start < 7 {
            let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        self.write_length(8 - start)?;
        self.write_octets(&bytes[start..]);
        Ok(())
    }

    /// Semi-constrained `INTEGER (lb..MAX)`
    pub fn write_semi_constrained(&mut self, value: i64, lb: i64) -> Result<(), PerError> {
        if value < lb {
            return Err(PerError::OutOfRange {
                value,
                lb,
                ub: i64::MAX,
            });
        }
        let offset = (value as i128 - lb as i128) as u64;
        let bytes = offset.to_be_bytes();
        let start = bytes.iter().position(|b| *b != 0).unwrap_or(7);
        self.write_length(8 - start)?;
        self.write_octets(&bytes[start..]);
        Ok(())
    }

    /// `REAL`, base 2
    pub fn write_real(&mut self, value: f64) -> Result<(), PerError> {
        let contents = real_contents(value);
        self.write_length(contents.len())?;
        self.write_octets(&contents);
        Ok(())
    }

    /// Index into a `CHOICE` or `ENUMERATED` of `count` root items
    ///
    /// If `extensible`, the extension bit (always zero) comes first.
    pub fn write_index(&mut self, index: usize, count: usize, extensible: bool) -> Result<(), PerError> {
        if extensible {
            self.write_bool(false);
        }
        self.write_constrained(index as i64, 0, count as i64 - 1)
    }

    /// `SEQUENCE` preamble
    ///
    /// Writes the extension bit (zero: no additions) if
    /// `extensible`, followed by one presence bit per optional
    /// field.
    pub fn write_preamble(&mut self, extensible: bool, present: &[bool]) {
        if extensible {
            self.write_bool(false);
        }
        for p in present {
            self.write_bool(*p);
        }
    }

    /// `OCTET STRING` with an optional `SIZE(lb..ub)` constraint
    pub fn write_octet_string(
        &mut self,
        data: &[u8],
        size: Option<(usize, usize)>,
    ) -> Result<(), PerError> {
        match size {
            Some((lb, ub)) => {
                if data.len() > ub {
                    return Err(PerError::OutOfRange {
                        value: data.len() as i64,
                        lb: lb as i64,
                        ub: ub as i64,
                    });
                }
                self.write_constrained_length(data.len(), lb, ub)?
            }
            None => self.write_length(data.len())?,
        }
        self.write_octets(data);
        Ok(())
    }

    /// `UTF8String`
    pub fn write_utf8(&mut self, text: &str) -> Result<(), PerError> {
        self.write_octet_string(text.as_bytes(), None)
    }

    /// `VisibleString`, seven bits per character
    pub fn write_visible(&mut self, text: &str) -> Result<(), PerError> {
        if !text.bytes().all(|c| (0x20..=0x7e).contains(&c)) {
            return Err(PerError::InvalidString);
        }
        self.write_length(text.len())?;
        for c in text.bytes() {
            self.write_bits(c as u64, 7);
        }
        Ok(())
    }
}

/// Reads UPER bit fields, most significant bit first
#[derive(Clone, Debug)]
pub struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    /// Read from `buf`
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bits consumed so far
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bits remaining
    #[inline]
    pub fn remaining(&self) -> usize {
        (self.buf.len() * 8).saturating_sub(self.pos)
    }

    /// Read one bit
    pub fn read_bool(&mut self) -> Result<bool, PerError> {
        let byte = self
            .buf
            .get(self.pos / 8)
            .ok_or(PerError::Truncated(self.pos))?;
        let bit = byte & (0x80 >> (self.pos % 8)) != 0;
        self.pos += 1;
        Ok(bit)
    }

    /// Read `nbits` (≤ 64) as an unsigned number
    pub fn read_bits(&mut self, nbits: u32) -> Result<u64, PerError> {
        if nbits as usize > self.remaining() {
            return Err(PerError::Truncated(self.pos));
        }
        let mut out = 0u64;
        for _ in 0..nbits {
            out = (out << 1) | self.read_bool()? as u64;
        }
        Ok(out)
    }

    /// Read `count` whole octets
    pub fn read_octets(&mut self, count: usize) -> Result<Vec<u8>, PerError> {
        if count * 8 > self.remaining() {
            return Err(PerError::Truncated(self.pos));
        }
        (0..count).map(|_| Ok(self.read_bits(8)? as u8)).collect()
    }

    /// Integer with both bounds
    pub fn read_constrained(&mut self, lb: i64, ub: i64) -> Result<i64, PerError> {
        let range = (ub as i128 - lb as i128 + 1) as u64;
        let offset = self.read_bits(range_bits(range))?;
        let value = lb as i128 + offset as i128;
        if value > ub as i128 {
            return Err(PerError::OutOfRange {
                value: value as i64,
                lb,
                ub,
            });
        }
        Ok(value as i64)
    }

    /// Unconstrained length determinant
    pub fn read_length(&mut self) -> Result<usize, PerError> {
        if !self.read_bool()? {
            return Ok(self.read_bits(7)? as usize);
        }
        if !self.read_bool()? {
            return Ok(self.read_bits(14)? as usize);
        }
        Err(PerError::TooLong(MAX_LENGTH + 1))
    }

    /// Length constrained by `SIZE(lb..ub)`
    pub fn read_constrained_length(&mut self, lb: usize, ub: usize) -> Result<usize, PerError> {
        if ub > MAX_LENGTH {
            let len = self.read_length()?;
            if len < lb {
                return Err(PerError::OutOfRange {
                    value: len as i64,
                    lb: lb as i64,
                    ub: ub as i64,
                });
            }
            return Ok(len);
        }
        Ok(self.read_constrained(lb as i64, ub as i64)? as usize)
    }

    /// Unconstrained `INTEGER`
    pub fn read_integer(&mut self) -> Result<i64, PerError> {
        let len = self.read_length()?;
        if len == 0 || len > 8 {
            return Err(PerError::IntegerOverflow(len));
        }
        let octets = self.read_octets(len)?;
        let mut value: i64 = if octets[0] & 0x80 != 0 { -1 } else { 0 };
        for b in octets {
            value = (value << 8) | b as i64;
        }
        Ok(value)
    }

    /// Semi-constrained `INTEGER (lb..MAX)`
    pub fn read_semi_constrained(&mut self, lb: i64) -> Result<i64, PerError> {
        let len = self.read_length()?;
        if len == 0 || len > 8 {
            return Err(PerError::IntegerOverflow(len));
        }
        let mut offset = 0u64;
        for b in self.read_octets(len)? {
            offset = (offset << 8) | b as u64;
        }
        let value = lb as i128 + offset as i128;
        if value > i64::MAX as i128 {
            return Err(PerError::IntegerOverflow(len));
        }
        Ok(value as i64)
    }

    /// `REAL`
    pub fn read_real(&mut self) -> Result<f64, PerError> {
        let len = self.read_length()?;
        let contents = self.read_octets(len)?;
        parse_real(&contents)
    }

    /// Index into a `CHOICE` or `ENUMERATED` of `count` root items
    ///
    /// Extended alternatives cannot be interpreted and are
    /// reported as [`PerError::UnknownAlternative`].
    pub fn read_index(&mut self, count: usize, extensible: bool) -> Result<usize, PerError> {
        if extensible && self.read_bool()? {
            let ext = self.read_normally_small()?;
            return Err(PerError::UnknownAlternative(count as u64 + ext));
        }
        Ok(self.read_constrained(0, count as i64 - 1)? as usize)
    }

    /// `SEQUENCE` preamble
    ///
    /// Returns whether extension additions follow the root
    /// components, and the presence bit of each of `optional`
    /// fields. Call [`skip_extensions()`](BitReader::skip_extensions)
    /// after the root components if the first value is true.
    pub fn read_preamble(
        &mut self,
        extensible: bool,
        optional: usize,
    ) -> Result<(bool, Vec<bool>), PerError> {
        let extended = extensible && self.read_bool()?;
        let present = (0..optional)
            .map(|_| self.read_bool())
            .collect::<Result<Vec<bool>, PerError>>()?;
        Ok((extended, present))
    }

    /// Skip the extension additions of a `SEQUENCE`
    ///
    /// Each addition is an open type: a length and that many
    /// octets, which are discarded.
    pub fn skip_extensions(&mut self) -> Result<usize, PerError> {
        let count = self.read_normally_small()? as usize + 1;
        let present = (0..count)
            .map(|_| self.read_bool())
            .collect::<Result<Vec<bool>, PerError>>()?;
        let mut skipped = 0;
        for _ in present.into_iter().filter(|p| *p) {
            let len = self.read_length()?;
            self.read_octets(len)?;
            skipped += 1;
        }
        Ok(skipped)
    }

    fn read_normally_small(&mut self) -> Result<u64, PerError> {
        if !self.read_bool()? {
            return self.read_bits(6);
        }
        Ok(self.read_semi_constrained(0)? as u64)
    }

    /// `OCTET STRING` with an optional `SIZE(lb..ub)` constraint
    pub fn read_octet_string(&mut self, size: Option<(usize, usize)>) -> Result<Vec<u8>, PerError> {
        let len = match size {
            Some((lb, ub)) => self.read_constrained_length(lb, ub)?,
            None => self.read_length()?,
        };
        self.read_octets(len)
    }

    /// `UTF8String`
    pub fn read_utf8(&mut self) -> Result<String, PerError> {
        String::from_utf8(self.read_octet_string(None)?).map_err(|_| PerError::InvalidString)
    }

    /// `VisibleString`
    pub fn read_visible(&mut self) -> Result<String, PerError> {
        let len = self.read_length()?;
        if len * 7 > self.remaining() {
            return Err(PerError::Truncated(self.pos));
        }
        let mut out = String::with_capacity(len);
        for _ in 0..len {
            let c = self.read_bits(7)? as u8;
            if !(0x20..=0x7e).contains(&c) {
                return Err(PerError::InvalidString);
            }
            out.push(c as char);
        }
        Ok(out)
    }
}

// X.690 §8.5 contents octets, binary form, base 2, no scaling
fn real_contents(value: f64) -> Vec<u8> {
    if value == 0.0 {
        return if value.is_sign_negative() {
            vec![0x43]
        } else {
            Vec::new()
        };
    }
    if value.is_nan() {
        return vec![0x42];
    }
    if value.is_infinite() {
        return vec![if value > 0.0 { 0x40 } else { 0x41 }];
    }

    let bits = value.to_bits();
    let negative = bits >> 63 == 1;
    let raw_exp = ((bits >> 52) & 0x7ff) as i64;
    let fraction = bits & ((1u64 << 52) - 1);

    // value = mantissa · 2^exponent
    let (mut mantissa, mut exponent) = if raw_exp == 0 {
        (fraction, -1074i64)
    } else {
        (fraction | (1u64 << 52), raw_exp - 1075)
    };
    let tz = mantissa.trailing_zeros();
    mantissa >>= tz;
    exponent += tz as i64;

    let exp_bytes = exponent.to_be_bytes();
    let exp_octets: &[u8] = if (-128..=127).contains(&exponent) {
        &exp_bytes[7..]
    } else {
        &exp_bytes[6..]
    };

    let mut out = Vec::with_capacity(10);
    let mut first = 0x80u8;
    if negative {
        first |= 0x40;
    }
    first |= (exp_octets.len() - 1) as u8;
    out.push(first);
    out.extend_from_slice(exp_octets);

    let mant_bytes = mantissa.to_be_bytes();
    let start = mant_bytes.iter().position(|b| *b != 0).unwrap_or(7);
    out.extend_from_slice(&mant_bytes[start..]);
    out
}

fn parse_real(contents: &[u8]) -> Result<f64, PerError> {
    let first = match contents.first() {
        None => return Ok(0.0),
        Some(b) => *b,
    };

    match first {
        0x40 => return Ok(f64::INFINITY),
        0x41 => return Ok(f64::NEG_INFINITY),
        0x42 => return Ok(f64::NAN),
        0x43 => return Ok(-0.0),
        _ => {}
    }

    // binary, base 2 only
    if first & 0x80 == 0 || first & 0x30 != 0 {
        return Err(PerError::UnsupportedReal(first));
    }
    let scale = ((first >> 2) & 0x3) as i32;
    let exp_len = match first & 0x3 {
        3 => {
            return Err(PerError::UnsupportedReal(first));
        }
        n => n as usize + 1,
    };
    if contents.len() < 1 + exp_len + 1 {
        return Err(PerError::Truncated(contents.len() * 8));
    }

    let exp_octets = &contents[1..1 + exp_len];
    let mut exponent: i64 = if exp_octets[0] & 0x80 != 0 { -1 } else { 0 };
    for b in exp_octets {
        exponent = (exponent << 8) | *b as i64;
    }

    let mant_octets = &contents[1 + exp_len..];
    if mant_octets.len() > 8 {
        return Err(PerError::IntegerOverflow(mant_octets.len()));
    }
    let mut mantissa = 0u64;
    for b in mant_octets {
        mantissa = (mantissa << 8) | *b as u64;
    }

    let magnitude = ldexp(mantissa as f64, exponent + scale as i64);
    Ok(if first & 0x40 != 0 {
        -magnitude
    } else {
        magnitude
    })
}

// x · 2^exp without overflowing the intermediate power
fn ldexp(mut x: f64, mut exp: i64) -> f64 {
    while exp > 1000 {
        x *= 2f64.powi(1000);
        exp -= 1000;
    }
    while exp < -1000 {
        x *= 2f64.powi(-1000);
        exp += 1000;
    }
    x * 2f64.powi(exp as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_range_bits() {
        assert_eq!(range_bits(1), 0);
        assert_eq!(range_bits(2), 1);
        assert_eq!(range_bits(3), 2);
        assert_eq!(range_bits(4), 2);
        assert_eq!(range_bits(256), 8);
        assert_eq!(range_bits(257), 9);
        assert_eq!(range_bits(10_000_000), 24);
    }

    #[test]
    fn test_constrained() {
        let mut w = BitWriter::new();
        w.write_constrained(3, 0, 7).unwrap();
        w.write_constrained(16, 16, 65535).unwrap();
        assert_eq!(w.bit_len(), 3 + 16);
        assert!(w.write_constrained(8, 0, 7).is_err());
        let bytes = w.into_bytes();
        assert_eq!(bytes, vec![0x60, 0x00, 0x00]);

        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_constrained(0, 7).unwrap(), 3);
        assert_eq!(r.read_constrained(16, 65535).unwrap(), 16);
    }

    #[test]
    fn test_integer_octets() {
        // X.691 examples: minimal two's complement octets
        let mut w = BitWriter::new();
        w.write_integer(0).unwrap();
        w.write_integer(127).unwrap();
        w.write_integer(128).unwrap();
        w.write_integer(-128).unwrap();
        w.write_integer(-129).unwrap();
        assert_eq!(
            w.into_bytes(),
            vec![0x01, 0x00, 0x01, 0x7f, 0x02, 0x00, 0x80, 0x01, 0x80, 0x02, 0xff, 0x7f]
        );

        let mut w = BitWriter::new();
        for v in [i64::MIN, -10916, -1, 433_920_000, i64::MAX] {
            w.write_integer(v).unwrap();
        }
        let bytes = w.into_bytes();
        let mut r = BitReader::new(&bytes);
        for v in [i64::MIN, -10916, -1, 433_920_000, i64::MAX] {
            assert_eq!(r.read_integer().unwrap(), v);
        }
    }

    #[test]
    fn test_length_determinant() {
        let mut w = BitWriter::new();
        w.write_length(5).unwrap();
        w.write_length(300).unwrap();
        assert!(w.write_length(MAX_LENGTH + 1).is_err());
        let bytes = w.into_bytes();
        assert_eq!(bytes, vec![0x05, 0x81, 0x2c]);

        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_length().unwrap(), 5);
        assert_eq!(r.read_length().unwrap(), 300);
        assert!(matches!(r.read_length(), Err(PerError::Truncated(_))));
    }

    #[test]
    fn test_real() {
        assert!(real_contents(0.0).is_empty());
        assert_eq!(real_contents(1.0), vec![0x80, 0x00, 0x01]);
        assert_eq!(real_contents(-0.5), vec![0xc0, 0xff, 0x01]);

        for v in [1.0f64, -0.5, -42.25, 13.7f32 as f64, 1.0e-300, 6.02e23, -0.0] {
            let mut w = BitWriter::new();
            w.write_real(v).unwrap();
            let bytes = w.into_bytes();
            let got = BitReader::new(&bytes).read_real().unwrap();
            assert_eq!(got.to_bits(), v.to_bits());
        }

        let mut w = BitWriter::new();
        w.write_real(f64::NAN).unwrap();
        let bytes = w.into_bytes();
        assert!(BitReader::new(&bytes).read_real().unwrap().is_nan());

        // decimal forms are refused
        assert_eq!(parse_real(&[0x03, b'1']), Err(PerError::UnsupportedReal(0x03)));
        assert_approx_eq!(parse_real(&[0x80, 0xfe, 0x03]).unwrap(), 0.75f64);
    }

    #[test]
    fn test_strings() {
        let mut w = BitWriter::new();
        w.write_visible("20240101000000Z").unwrap();
        w.write_utf8("Acurite-Tower").unwrap();
        w.write_octet_string(&[0xaa, 0xb1], Some((1, 512))).unwrap();
        assert!(w.write_visible("tab\t").is_err());
        assert!(w.write_octet_string(&[0u8; 513], Some((1, 512))).is_err());
        // 8 + 15·7 bits, then 8 + 13·8 bits, then 9 + 16 bits
        assert_eq!(w.bit_len(), 8 + 105 + 8 + 104 + 9 + 16);

        let bytes = w.into_bytes();
        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_visible().unwrap(), "20240101000000Z");
        assert_eq!(r.read_utf8().unwrap(), "Acurite-Tower");
        assert_eq!(r.read_octet_string(Some((1, 512))).unwrap(), vec![0xaa, 0xb1]);
    }

    #[test]
    fn test_extensions() {
        // hand-built sequence with one unknown extension addition
        let mut w = BitWriter::new();
        w.write_bool(true); // extension bit
        w.write_bool(true); // one optional field, present
        w.write_constrained(5, 0, 15).unwrap();
        w.write_bool(false); // normally small: count - 1 = 0
        w.write_bits(0, 6);
        w.write_bool(true); // addition present
        w.write_length(2).unwrap();
        w.write_octets(&[0xde, 0xad]);
        w.write_constrained(1, 0, 1).unwrap();
        let bytes = w.into_bytes();

        let mut r = BitReader::new(&bytes);
        let (extended, present) = r.read_preamble(true, 1).unwrap();
        assert!(extended);
        assert_eq!(present, vec![true]);
        assert_eq!(r.read_constrained(0, 15).unwrap(), 5);
        assert_eq!(r.skip_extensions().unwrap(), 1);
        assert_eq!(r.read_constrained(0, 1).unwrap(), 1);
    }

    #[test]
    fn test_index() {
        let mut w = BitWriter::new();
        w.write_index(2, 4, true).unwrap();
        w.write_index(4, 5, false).unwrap();
        let bytes = w.into_bytes();
        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_index(4, true).unwrap(), 2);
        assert_eq!(r.read_index(5, false).unwrap(), 4);

        // an extended alternative
        let bytes = vec![0b1000_0000];
        assert_eq!(
            BitReader::new(&bytes).read_index(4, true),
            Err(PerError::UnknownAlternative(4))
        );
    }
}
