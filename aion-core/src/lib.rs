//! Aion Core - Tiered Time-Series Storage Engine
//!
//! Ingests timestamped numeric samples per series, compresses them into
//! fixed-duration buckets and rolls them up through a chain of storage tiers.
//!
//! # Architecture
//!
//! - **Codec**: signed Exp-Golomb delta coding of i64 streams
//! - **Aggregators**: raw, count, min, max, avg, tmin, tmax
//! - **Filter**: per-series windows folding entries into one rolled-up entry
//! - **Buckets**: in-memory builder (hot) in front of a repository (cold)
//! - **Levels**: filter + store pairs wired into a cascade by [`Aion`]
//!
//! ```no_run
//! use aion_core::{Aion, AionConfig, Entry, TimeRange};
//! use chrono::Utc;
//! use uuid::Uuid;
//!
//! let aion = Aion::from_config(&AionConfig::default())?;
//! let series = Uuid::new_v4();
//! let now = Utc::now();
//! aion.put(series, &Entry::single(now, "raw", 21.5))?;
//! aion.query(0, series, TimeRange::new(now, now), &[], &mut |entry| {
//!     println!("{:?}", entry);
//!     Ok(())
//! })?;
//! # Ok::<(), aion_core::AionError>(())
//! ```

pub mod aggregate;
pub mod bucket;
pub mod codec;
pub mod filter;
pub mod query;
pub mod storage;
pub mod tags;

mod error;
mod types;

pub use error::{AionError, Result};
pub use storage::{Aion, AionConfig, Level, LevelConfig, RepositoryConfig, StoreConfig};
pub use types::*;

/// Aion version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Bucket duration of the raw tier (1 minute)
    pub const DEFAULT_BUCKET_DURATION_SECS: u64 = 60;

    /// Bucket duration of rollup tiers (1 hour)
    pub const DEFAULT_ROLLUP_BUCKET_DURATION_SECS: u64 = 3600;

    /// Decimal digits kept by the fixed-point conversion
    pub const DEFAULT_PRECISION: u32 = 1;

    /// Entries buffered between a query producer and its consumer
    pub const QUERY_CHANNEL_CAPACITY: usize = 1024;
}
