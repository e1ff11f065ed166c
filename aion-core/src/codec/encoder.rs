//! Delta encoder for bucket streams

use super::bitstream::BitWriter;

/// Writes a sequence of i64 values as signed Exp-Golomb coded deltas.
///
/// Each value is stored as the difference to the previous one; the first
/// difference is taken against the baseline given at construction.
#[derive(Debug, Clone)]
pub struct BucketEncoder {
    writer: BitWriter,
    baseline: i64,
    last: i64,
    count: usize,
}

impl BucketEncoder {
    /// Create a new encoder seeded with `baseline`
    pub fn new(baseline: i64) -> Self {
        Self {
            writer: BitWriter::with_capacity(64),
            baseline,
            last: baseline,
            count: 0,
        }
    }

    /// Encode the next value of the sequence
    pub fn write_int(&mut self, next: i64) {
        let delta = next.wrapping_sub(self.last);
        write_signed(&mut self.writer, delta);
        self.last = next;
        self.count += 1;
    }

    /// Batch-write values in order
    pub fn write(&mut self, values: &[i64]) {
        for v in values {
            self.write_int(*v);
        }
    }

    /// Closed, byte-aligned copy of the stream written so far.
    ///
    /// The encoder remains usable, so a hot bucket can be read while it still
    /// accepts entries.
    pub fn snapshot(&self) -> Vec<u8> {
        self.writer.to_bytes()
    }

    /// Close the stream and return its bytes
    pub fn finish(self) -> Vec<u8> {
        self.writer.finish()
    }

    /// Seed value of the delta chain
    pub fn baseline(&self) -> i64 {
        self.baseline
    }

    /// Last value written (the baseline when nothing was written)
    pub fn last(&self) -> i64 {
        self.last
    }

    /// Number of values written
    pub fn count(&self) -> usize {
        self.count
    }

    /// Encoded size in bytes after closing
    pub fn encoded_len(&self) -> usize {
        self.writer.len()
    }
}

/// Signed Exp-Golomb: map the delta onto 0, 1, -1, 2, -2, ... and write
/// `code + 1` as (bit length - 1) zeros followed by its binary form.
#[inline]
fn write_signed(writer: &mut BitWriter, delta: i64) {
    let code: u128 = if delta > 0 {
        2 * (delta as u128) - 1
    } else {
        2 * (delta as i128).unsigned_abs()
    };
    let value = code + 1;
    let bits = (128 - value.leading_zeros()) as usize;
    writer.write_zeros(bits - 1);
    writer.write_bits(value, bits);
}
