//! Rows of sliced bits

use std::fmt;

/// Maximum bytes per row
pub const BITBUF_COLS: usize = 128;

/// Maximum number of rows
pub const BITBUF_ROWS: usize = 50;

/// Bits sliced from one burst
///
/// Bits are packed MSB first into rows. A slicer starts a new
/// row whenever it sees a gap long enough to separate two
/// repeats of a message. Bits beyond [`BITBUF_COLS`] bytes in a
/// row, or rows beyond [`BITBUF_ROWS`], are discarded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitBuffer {
    rows: Vec<Vec<u8>>,
    bits: Vec<usize>,
}

impl BitBuffer {
    /// Empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer with one row holding the first `len` bits of `bytes`
    pub fn from_row(bytes: &[u8], len: usize) -> Self {
        let mut out = Self::new();
        for i in 0..len.min(bytes.len() * 8) {
            out.add_bit(bit_at(bytes, i));
        }
        out
    }

    /// Append a bit to the current row
    pub fn add_bit(&mut self, bit: bool) {
        if self.rows.is_empty() {
            self.rows.push(Vec::new());
            self.bits.push(0);
        }

        let row = self.rows.len() - 1;
        let len = self.bits[row];
        if len >= BITBUF_COLS * 8 {
            return;
        }
        if len % 8 == 0 {
            self.rows[row].push(0);
        }
        if bit {
            self.rows[row][len / 8] |= 0x80 >> (len % 8);
        }
        self.bits[row] = len + 1;
    }

    /// Append `count` copies of `bit`
    pub fn add_bits(&mut self, bit: bool, count: usize) {
        for _ in 0..count.min(BITBUF_COLS * 8) {
            self.add_bit(bit);
        }
    }

    /// Close the current row
    ///
    /// Has no effect if the current row is empty.
    pub fn add_row(&mut self) {
        if self.rows.len() >= BITBUF_ROWS {
            return;
        }
        match self.bits.last() {
            Some(0) | None => {}
            Some(_) => {
                self.rows.push(Vec::new());
                self.bits.push(0);
            }
        }
    }

    /// Number of rows with at least one bit
    pub fn num_rows(&self) -> usize {
        self.bits.iter().filter(|b| **b > 0).count()
    }

    /// True if there are no bits
    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    /// Iterate `(bytes, bit_length)` of non-empty rows
    pub fn rows(&self) -> impl Iterator<Item = (&[u8], usize)> + '_ {
        self.rows
            .iter()
            .zip(self.bits.iter())
            .filter(|(_, bits)| **bits > 0)
            .map(|(row, bits)| (row.as_slice(), *bits))
    }

    /// Bytes and bit length of non-empty row `index`
    pub fn row(&self, index: usize) -> Option<(&[u8], usize)> {
        self.rows().nth(index)
    }

    /// Invert every bit
    pub fn invert(&mut self) {
        for (row, bits) in self.rows.iter_mut().zip(self.bits.iter()) {
            for b in row.iter_mut() {
                *b = !*b;
            }
            clear_tail(row, *bits);
        }
    }

    /// Index of a row repeated at least `min_repeats` times
    ///
    /// Only rows of at least `min_bits` are considered. Repeats
    /// need not be adjacent.
    pub fn find_repeated_row(&self, min_repeats: usize, min_bits: usize) -> Option<usize> {
        let rows: Vec<_> = self.rows().collect();
        (0..rows.len()).find(|&i| {
            rows[i].1 >= min_bits && rows.iter().filter(|r| **r == rows[i]).count() >= min_repeats
        })
    }

    /// Number of rows identical to row `index`
    pub fn count_repeats(&self, index: usize) -> usize {
        match self.row(index) {
            Some(want) => self.rows().filter(|r| *r == want).count(),
            None => 0,
        }
    }

    /// Hex text of each non-empty row
    pub fn rows_hex(&self) -> Vec<String> {
        self.rows().map(|(row, _)| crate::record::hex_upper(row)).collect()
    }
}

impl fmt::Display for BitBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (row, bits)) in self.rows().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "[{:02}] {{{}}} {}", i, bits, crate::record::hex_upper(row))?;
        }
        Ok(())
    }
}

/// Bit `index` of `bytes`, MSB first
#[inline]
pub fn bit_at(bytes: &[u8], index: usize) -> bool {
    bytes
        .get(index / 8)
        .map(|b| b & (0x80 >> (index % 8)) != 0)
        .unwrap_or(false)
}

/// Find `pattern` in the first `len` bits of `bytes`
///
/// Searches for the first `pattern_bits` bits of `pattern`,
/// starting at bit `start`. Returns the bit position of the
/// match, or `len` if there is none.
pub fn search(bytes: &[u8], len: usize, start: usize, pattern: &[u8], pattern_bits: usize) -> usize {
    let pattern_bits = pattern_bits.min(pattern.len() * 8);
    if pattern_bits == 0 || len < pattern_bits {
        return len;
    }

    (start..=len - pattern_bits)
        .find(|&pos| (0..pattern_bits).all(|i| bit_at(bytes, pos + i) == bit_at(pattern, i)))
        .unwrap_or(len)
}

/// Copy `count` bits from bit `pos` into MSB-aligned bytes
pub fn extract_bytes(bytes: &[u8], pos: usize, count: usize) -> Vec<u8> {
    let mut out = vec![0u8; (count + 7) / 8];
    for i in 0..count {
        if bit_at(bytes, pos + i) {
            out[i / 8] |= 0x80 >> (i % 8);
        }
    }
    out
}

/// Manchester-decode bit pairs starting at bit `start`
///
/// The pair `10` is a one and `01` is a zero. Decoding stops
/// at the end of the row, at the first invalid pair, or after
/// `max_bits` output bits. Returns the decoded bits and the
/// position after the last pair consumed.
pub fn manchester_decode(bytes: &[u8], len: usize, start: usize, max_bits: usize) -> (BitBuffer, usize) {
    let mut out = BitBuffer::new();
    let mut pos = start;
    let mut count = 0;
    while pos + 1 < len && count < max_bits {
        match (bit_at(bytes, pos), bit_at(bytes, pos + 1)) {
            (true, false) => out.add_bit(true),
            (false, true) => out.add_bit(false),
            _ => break,
        }
        pos += 2;
        count += 1;
    }
    (out, pos)
}

/// CRC-8, MSB first, with the given `poly` and `init`
pub fn crc8(bytes: &[u8], poly: u8, init: u8) -> u8 {
    let mut crc = init;
    for b in bytes {
        crc ^= b;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ poly
            } else {
                crc << 1
            };
        }
    }
    crc
}

// zero the bits past the row length
fn clear_tail(row: &mut [u8], bits: usize) {
    if bits % 8 != 0 {
        if let Some(last) = row.last_mut() {
            *last &= 0xffu8 << (8 - bits % 8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_bits_and_rows() {
        let mut bb = BitBuffer::new();
        assert!(bb.is_empty());
        bb.add_row();
        assert_eq!(bb.num_rows(), 0);

        for bit in [true, false, true, true, false, false, true, false, true] {
            bb.add_bit(bit);
        }
        bb.add_row();
        bb.add_row();
        bb.add_bits(true, 4);

        assert_eq!(bb.num_rows(), 2);
        assert_eq!(bb.row(0), Some((&[0xb2u8, 0x80][..], 9)));
        assert_eq!(bb.row(1), Some((&[0xf0u8][..], 4)));
        assert_eq!(bb.rows_hex(), vec!["B280".to_owned(), "F0".to_owned()]);
        assert_eq!(format!("{}", bb), "[00] {9} B280\n[01] {4} F0");

        bb.invert();
        assert_eq!(bb.row(0), Some((&[0x4du8, 0x00][..], 9)));
        assert_eq!(bb.row(1), Some((&[0x00u8][..], 4)));
    }

    #[test]
    fn test_row_limits() {
        let mut bb = BitBuffer::new();
        bb.add_bits(true, BITBUF_COLS * 8 + 50);
        assert_eq!(bb.row(0).unwrap().1, BITBUF_COLS * 8);

        let mut bb = BitBuffer::new();
        for _ in 0..BITBUF_ROWS + 5 {
            bb.add_bit(true);
            bb.add_row();
        }
        assert_eq!(bb.num_rows(), BITBUF_ROWS);
    }

    #[test]
    fn test_repeats() {
        let mut bb = BitBuffer::new();
        for row in [[0xaau8, 0x55], [0x12, 0x34], [0xaa, 0x55], [0xaa, 0x55]] {
            for i in 0..16 {
                bb.add_bit(bit_at(&row, i));
            }
            bb.add_row();
        }
        assert_eq!(bb.find_repeated_row(3, 16), Some(0));
        assert_eq!(bb.find_repeated_row(4, 16), None);
        assert_eq!(bb.find_repeated_row(1, 17), None);
        assert_eq!(bb.count_repeats(1), 1);
        assert_eq!(bb.count_repeats(9), 0);
    }

    #[test]
    fn test_search_and_extract() {
        let row = [0x55u8, 0x2d, 0xd4, 0xa5];
        assert_eq!(search(&row, 32, 0, &[0x2d, 0xd4], 16), 8);
        assert_eq!(search(&row, 32, 9, &[0x2d, 0xd4], 16), 32);
        // unaligned
        assert_eq!(search(&row, 32, 0, &[0xb7], 8), 10);
        assert_eq!(extract_bytes(&row, 10, 8), vec![0xb7]);
        assert_eq!(extract_bytes(&row, 28, 6), vec![0x50]);
    }

    #[test]
    fn test_manchester() {
        // 10 01 10 10 | 01 11
        let row = [0x9au8, 0x70];
        let (bits, end) = manchester_decode(&row, 12, 0, 100);
        assert_eq!(bits.row(0), Some((&[0xb0u8][..], 5)));
        assert_eq!(end, 10);

        let (bits, end) = manchester_decode(&row, 12, 0, 2);
        assert_eq!(bits.row(0), Some((&[0x80u8][..], 2)));
        assert_eq!(end, 4);
    }

    #[test]
    fn test_crc8() {
        // CRC-8/SMBUS check value
        assert_eq!(crc8(b"123456789", 0x07, 0x00), 0xf4);
        assert_eq!(crc8(&[], 0x07, 0x5a), 0x5a);
    }
}
