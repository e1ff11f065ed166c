//! Bit-level I/O for the bucket codec
//!
//! Bits are packed MSB first. Both sides track a single bit cursor; the
//! unused low bits of the last byte are always zero.

/// Append-only bit sink
#[derive(Debug, Clone, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    bits: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            bits: 0,
        }
    }

    #[inline]
    pub fn write_bit(&mut self, bit: bool) {
        let offset = self.bits % 8;
        if offset == 0 {
            self.bytes.push(0);
        }
        if bit {
            if let Some(last) = self.bytes.last_mut() {
                *last |= 0x80 >> offset;
            }
        }
        self.bits += 1;
    }

    /// Append `count` zero bits
    pub fn write_zeros(&mut self, count: usize) {
        let total = self.bits + count;
        self.bytes.resize((total + 7) / 8, 0);
        self.bits = total;
    }

    /// Append the low `width` bits of `value`, most significant first
    #[inline]
    pub fn write_bits(&mut self, value: u128, width: usize) {
        debug_assert!(width <= 128);
        for shift in (0..width).rev() {
            self.write_bit((value >> shift) & 1 == 1);
        }
    }

    /// Bytes written so far; the writer stays usable
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    /// Consume the writer, returning its zero padded bytes
    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }

    /// Size in bytes, counting a partially filled last byte
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Number of bits written
    pub fn bit_len(&self) -> usize {
        self.bits
    }
}

/// Bit cursor over a byte slice
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    /// Next bit, `None` once the slice is exhausted
    #[inline]
    pub fn read_bit(&mut self) -> Option<bool> {
        let byte = *self.data.get(self.cursor / 8)?;
        let bit = byte & (0x80 >> (self.cursor % 8)) != 0;
        self.cursor += 1;
        Some(bit)
    }

    /// Next `width` bits as an unsigned integer; `None` if fewer remain
    #[inline]
    pub fn read_bits(&mut self, width: usize) -> Option<u128> {
        debug_assert!(width <= 128);
        if width > self.remaining() {
            return None;
        }
        let mut value = 0u128;
        for _ in 0..width {
            value = (value << 1) | u128::from(self.read_bit()?);
        }
        Some(value)
    }

    /// Bits left to read
    pub fn remaining(&self) -> usize {
        self.data.len() * 8 - self.cursor
    }

    /// Bits consumed so far
    pub fn position(&self) -> usize {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_widths() {
        let mut writer = BitWriter::new();
        writer.write_bit(true);
        writer.write_zeros(2);
        writer.write_bits(0b1100_0011, 8);
        writer.write_bits(u64::MAX as u128 + 9, 70);
        assert_eq!(writer.bit_len(), 81);

        let data = writer.finish();
        assert_eq!(data.len(), 11);

        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bit(), Some(true));
        assert_eq!(reader.read_bits(2), Some(0));
        assert_eq!(reader.read_bits(8), Some(0b1100_0011));
        assert_eq!(reader.read_bits(70), Some(u64::MAX as u128 + 9));
        assert_eq!(reader.position(), 81);
        assert_eq!(reader.remaining(), 7);
        assert_eq!(reader.read_bits(8), None);
    }

    #[test]
    fn test_snapshot_keeps_writer_open() {
        let mut writer = BitWriter::new();
        writer.write_bits(0b101, 3);
        assert_eq!(writer.to_bytes(), vec![0b1010_0000]);

        writer.write_bits(0b11111, 5);
        assert_eq!(writer.to_bytes(), vec![0b1011_1111]);
        assert_eq!(writer.len(), 1);

        writer.write_bit(true);
        assert_eq!(writer.to_bytes(), vec![0b1011_1111, 0b1000_0000]);
    }
}
