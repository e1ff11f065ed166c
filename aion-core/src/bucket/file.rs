//! File-backed bucket repository
//!
//! One directory per partition (`<series-uuid>-<durationSecs>`) and one file
//! per bucket (`<startUnixSecs>.bucket`). A bucket file is framed as:
//!
//! - 4 bytes: magic `AION`
//! - 1 byte: format version
//! - 1 byte: flags (bit 0: LZ4 compressed payload)
//! - 4 bytes: payload length
//! - N bytes: payload (bincode encoded streams)
//! - 4 bytes: CRC32 of everything before it
//!
//! Files are written to a temporary name and renamed into place, so readers
//! never observe a half-written bucket.

use super::repository::{first_start, select, BucketRepository};
use crate::types::from_unix_seconds;
use crate::{AionError, BucketKey, EncodedAttribute, Result, SeriesId, TimeRange, Timestamp};
use bytes::{Buf, BufMut, BytesMut};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const MAGIC: &[u8; 4] = b"AION";
const FORMAT_VERSION: u8 = 1;
const FLAG_LZ4: u8 = 0b0000_0001;
const HEADER_LEN: usize = 4 + 1 + 1 + 4;
const BUCKET_SUFFIX: &str = ".bucket";

/// Repository storing each bucket in its own checksummed file
pub struct FileRepository {
    dir: PathBuf,
    compression: bool,
}

impl FileRepository {
    /// Open (creating if needed) a repository rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>, compression: bool) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!("Opened bucket repository at {}", dir.display());
        Ok(Self { dir, compression })
    }

    /// Root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn partition_dir(&self, series: SeriesId, duration: Duration) -> PathBuf {
        // '|' of the partition key is not portable in file names
        self.dir.join(format!("{}-{}", series, duration.as_secs()))
    }

    fn bucket_path(&self, key: &BucketKey) -> PathBuf {
        self.partition_dir(key.series, key.duration)
            .join(format!("{}{}", key.sort_key(), BUCKET_SUFFIX))
    }

    /// Frame streams into the on-disk format
    fn encode(&self, attributes: &[EncodedAttribute]) -> Result<BytesMut> {
        let payload = bincode::serialize(attributes).map_err(|e| AionError::InvalidFormat(e.to_string()))?;
        let (flags, payload) = if self.compression {
            (FLAG_LZ4, lz4_flex::compress_prepend_size(&payload))
        } else {
            (0, payload)
        };

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len() + 4);
        buf.put_slice(MAGIC);
        buf.put_u8(FORMAT_VERSION);
        buf.put_u8(flags);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        Ok(buf)
    }

    /// Validate and unframe a bucket file
    fn decode(data: &[u8]) -> Result<Vec<EncodedAttribute>> {
        if data.len() < HEADER_LEN + 4 {
            return Err(AionError::InvalidFormat("Bucket file too short".into()));
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        let expected = (&trailer[..]).get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(AionError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let mut magic = [0u8; 4];
        cursor.copy_to_slice(&mut magic);
        if &magic != MAGIC {
            return Err(AionError::InvalidFormat("Bad bucket file magic".into()));
        }
        let version = cursor.get_u8();
        if version != FORMAT_VERSION {
            return Err(AionError::InvalidFormat(format!(
                "Unsupported bucket format version: {}",
                version
            )));
        }
        let flags = cursor.get_u8();
        let len = cursor.get_u32_le() as usize;
        if cursor.remaining() != len {
            return Err(AionError::InvalidFormat(format!(
                "Bucket payload length {} does not match file ({} bytes)",
                len,
                cursor.remaining()
            )));
        }

        let payload = if flags & FLAG_LZ4 != 0 {
            lz4_flex::decompress_size_prepended(cursor).map_err(|e| AionError::Compression(e.to_string()))?
        } else {
            cursor.to_vec()
        };
        bincode::deserialize(&payload).map_err(|e| AionError::InvalidFormat(e.to_string()))
    }
}

impl BucketRepository for FileRepository {
    fn put(&self, key: &BucketKey, attributes: &[EncodedAttribute]) -> Result<()> {
        let path = self.bucket_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let framed = self.encode(attributes)?;

        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&framed)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        debug!("Wrote bucket {} ({} bytes)", key, framed.len());
        Ok(())
    }

    fn get(&self, key: &BucketKey, attributes: &[String]) -> Result<Option<Vec<EncodedAttribute>>> {
        let data = match fs::read(self.bucket_path(key)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let encoded = Self::decode(&data)?;
        Ok(Some(select(encoded, attributes)))
    }

    fn starts(&self, series: SeriesId, duration: Duration, range: &TimeRange) -> Result<Vec<Timestamp>> {
        let first = first_start(range, duration).timestamp();
        let last = range.end.timestamp();

        let dir = self.partition_dir(series, duration);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut starts = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(BUCKET_SUFFIX) else {
                continue;
            };
            match stem.parse::<i64>() {
                Ok(secs) if (first..=last).contains(&secs) => starts.push(secs),
                Ok(_) => {}
                Err(_) => warn!("Ignoring unexpected file {} in {}", name, dir.display()),
            }
        }
        starts.sort_unstable();
        starts.into_iter().map(from_unix_seconds).collect()
    }
}
