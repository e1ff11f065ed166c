//! Delta decoder for bucket streams

use super::bitstream::BitReader;
use crate::{AionError, Result};

/// Longest zero prefix a valid code word can carry (65-bit words)
const MAX_PREFIX: usize = 64;

/// Reads back a stream written by [`super::BucketEncoder`].
///
/// The stream has no length header: `read` returns `Ok(None)` once only
/// padding remains.
pub struct BucketDecoder<'a> {
    reader: BitReader<'a>,
    last: i64,
    decoded: usize,
}

impl<'a> BucketDecoder<'a> {
    /// Create a decoder seeded with the same baseline as the encoder
    pub fn new(baseline: i64, data: &'a [u8]) -> Self {
        Self {
            reader: BitReader::new(data),
            last: baseline,
            decoded: 0,
        }
    }

    /// Decode the next absolute value, or `None` at end of stream
    pub fn read(&mut self) -> Result<Option<i64>> {
        let delta = match self.read_signed()? {
            Some(delta) => delta,
            None => return Ok(None),
        };
        self.last = self.last.wrapping_add(delta);
        self.decoded += 1;
        Ok(Some(self.last))
    }

    /// Fill `out` with as many values as remain; returns how many were read
    pub fn read_into(&mut self, out: &mut [i64]) -> Result<usize> {
        for (i, slot) in out.iter_mut().enumerate() {
            match self.read()? {
                Some(v) => *slot = v,
                None => return Ok(i),
            }
        }
        Ok(out.len())
    }

    /// Decode every remaining value
    pub fn decode_all(&mut self) -> Result<Vec<i64>> {
        let mut values = Vec::new();
        while let Some(v) = self.read()? {
            values.push(v);
        }
        Ok(values)
    }

    /// Number of values decoded so far
    pub fn decoded(&self) -> usize {
        self.decoded
    }

    fn read_signed(&mut self) -> Result<Option<i64>> {
        let mut zeros = 0usize;
        loop {
            match self.reader.read_bit() {
                Some(true) => break,
                Some(false) => {
                    zeros += 1;
                    if zeros > MAX_PREFIX {
                        return Err(AionError::Codec(format!(
                            "code prefix longer than {} bits at bit {}",
                            MAX_PREFIX,
                            self.reader.position()
                        )));
                    }
                }
                // Trailing zeros shorter than a byte are closing padding
                None if zeros < 8 => return Ok(None),
                None => {
                    return Err(AionError::Codec(format!(
                        "stream ends inside a {}-bit code prefix",
                        zeros
                    )))
                }
            }
        }

        let suffix = self.reader.read_bits(zeros).ok_or_else(|| {
            AionError::Codec(format!(
                "stream truncated inside a code word after {} values",
                self.decoded
            ))
        })?;
        let code = ((1u128 << zeros) | suffix) - 1;

        let delta = if code & 1 == 1 {
            ((code + 1) / 2) as i64
        } else {
            (-((code / 2) as i128)) as i64
        };
        Ok(Some(delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BucketEncoder;

    const START: i64 = 21;

    #[test]
    fn test_encode_decode_roundtrip() {
        let values = [22, 23, 24, 27, 25, 20, 21, 22];
        let mut encoder = BucketEncoder::new(START);
        encoder.write(&values);
        let data = encoder.finish();

        let mut decoder = BucketDecoder::new(START, &data);
        let decoded = decoder.decode_all().unwrap();
        assert_eq!(decoded, values);
        assert_eq!(decoder.decoded(), values.len());
    }

    #[test]
    fn test_large_numbers() {
        let baseline = 1_409_336_945_224_193;
        let values = [
            1_409_337_152_104_649,
            1_409_337_156_864_482,
            1_409_337_159_111_547,
            1_409_337_161_269_084,
        ];
        let mut encoder = BucketEncoder::new(baseline);
        encoder.write(&values);
        let data = encoder.finish();

        let mut decoder = BucketDecoder::new(baseline, &data);
        let mut buf = [0i64; 1];
        let mut overall = Vec::new();
        while decoder.read_into(&mut buf).unwrap() > 0 {
            overall.push(buf[0]);
        }
        assert_eq!(overall, values);
    }

    #[test]
    fn test_extremes_roundtrip() {
        let values = [i64::MIN, i64::MAX, 0, i64::MIN, -1, i64::MAX];
        let mut encoder = BucketEncoder::new(0);
        encoder.write(&values);
        let data = encoder.finish();

        let decoded = BucketDecoder::new(0, &data).decode_all().unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_snapshot_is_decodable_while_open() {
        let mut encoder = BucketEncoder::new(0);
        encoder.write(&[31, 32]);
        let first = encoder.snapshot();
        encoder.write_int(30);

        assert_eq!(BucketDecoder::new(0, &first).decode_all().unwrap(), vec![31, 32]);
        assert_eq!(
            BucketDecoder::new(0, &encoder.snapshot()).decode_all().unwrap(),
            vec![31, 32, 30]
        );
    }

    #[test]
    fn test_empty_stream() {
        let mut decoder = BucketDecoder::new(5, &[]);
        assert_eq!(decoder.read().unwrap(), None);
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let mut encoder = BucketEncoder::new(0);
        encoder.write_int(1 << 40);
        let mut data = encoder.finish();
        data.truncate(data.len() - 3);

        let result = BucketDecoder::new(0, &data).decode_all();
        assert!(matches!(result, Err(AionError::Codec(_))));
    }

    #[test]
    fn test_zero_run_is_an_error() {
        let data = [0u8; 16];
        let result = BucketDecoder::new(0, &data).read();
        assert!(matches!(result, Err(AionError::Codec(_))));
    }
}
