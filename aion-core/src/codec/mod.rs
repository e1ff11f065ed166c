//! Bucket codec
//!
//! Compresses slowly varying i64 sequences (Unix-second timestamps and
//! fixed-point scaled values) as a delta chain. Every delta is written with a
//! signed Exp-Golomb code, so small changes cost few bits:
//!
//! | delta | code  |
//! |-------|-------|
//! | 0     | `1`   |
//! | +1    | `010` |
//! | -1    | `011` |
//! | +2    | `00100` |
//!
//! Streams carry no framing. A closed stream is zero padded to a byte
//! boundary and the decoder treats that padding as end of stream, so the
//! reader either knows the value count or reads until `None`.

mod bitstream;
mod decoder;
mod encoder;

pub use bitstream::{BitReader, BitWriter};
pub use decoder::BucketDecoder;
pub use encoder::BucketEncoder;

use crate::Result;

/// Encode a whole slice against `baseline` and close the stream
pub fn encode(baseline: i64, values: &[i64]) -> Vec<u8> {
    let mut encoder = BucketEncoder::new(baseline);
    encoder.write(values);
    encoder.finish()
}

/// Decode a closed stream written against `baseline`
pub fn decode(baseline: i64, data: &[u8]) -> Result<Vec<i64>> {
    BucketDecoder::new(baseline, data).decode_all()
}
