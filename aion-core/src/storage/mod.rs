//! Storage tiers - levels, their configuration and the orchestrator

mod engine;
mod level;

pub use engine::Aion;
pub use level::Level;

use crate::{AionError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine configuration: the ordered tiers, finest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AionConfig {
    pub levels: Vec<LevelConfig>,
}

impl AionConfig {
    /// Parse a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| AionError::Config(e.to_string()))
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| AionError::Config(e.to_string()))
    }
}

impl Default for AionConfig {
    /// Raw entries in memory, rolled up per minute into hourly buckets
    fn default() -> Self {
        Self {
            levels: vec![
                LevelConfig {
                    granularity_secs: 0,
                    aggregators: vec!["raw".to_string()],
                    store: StoreConfig::Memory {
                        duration_secs: crate::config::DEFAULT_BUCKET_DURATION_SECS,
                        precision: crate::config::DEFAULT_PRECISION,
                        backfill: false,
                    },
                },
                LevelConfig {
                    granularity_secs: 60,
                    aggregators: ["min", "max", "avg", "count"].iter().map(|s| s.to_string()).collect(),
                    store: StoreConfig::Bucket {
                        duration_secs: crate::config::DEFAULT_ROLLUP_BUCKET_DURATION_SECS,
                        precision: crate::config::DEFAULT_PRECISION,
                        repository: RepositoryConfig::Memory,
                    },
                },
            ],
        }
    }
}

/// One tier: a window granularity, its aggregators and its store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelConfig {
    /// Aggregation window in seconds; 0 passes every entry through
    #[serde(default)]
    pub granularity_secs: u64,
    /// Aggregator names (raw, count, min, max, avg, tmin, tmax)
    pub aggregators: Vec<String>,
    pub store: StoreConfig,
}

fn default_precision() -> u32 {
    crate::config::DEFAULT_PRECISION
}

fn default_compression() -> bool {
    true
}

/// Store of a tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Buckets kept in memory only
    Memory {
        duration_secs: u64,
        #[serde(default = "default_precision")]
        precision: u32,
        /// Fill missing buckets from the next level's store on query
        #[serde(default)]
        backfill: bool,
    },
    /// Open buckets in memory, closed buckets in a repository
    Bucket {
        duration_secs: u64,
        #[serde(default = "default_precision")]
        precision: u32,
        repository: RepositoryConfig,
    },
}

impl StoreConfig {
    /// Bucket duration in seconds
    pub fn duration_secs(&self) -> u64 {
        match self {
            StoreConfig::Memory { duration_secs, .. } | StoreConfig::Bucket { duration_secs, .. } => {
                *duration_secs
            }
        }
    }
}

/// Cold tier backend of a bucket store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RepositoryConfig {
    Memory,
    File {
        dir: PathBuf,
        #[serde(default = "default_compression")]
        compression: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let json = r#"{
            "levels": [
                {
                    "granularity_secs": 0,
                    "aggregators": ["raw"],
                    "store": { "type": "memory", "duration_secs": 60, "backfill": true }
                },
                {
                    "aggregators": ["raw"],
                    "store": {
                        "type": "bucket",
                        "duration_secs": 3600,
                        "precision": 2,
                        "repository": { "type": "file", "dir": "/var/lib/aion" }
                    }
                }
            ]
        }"#;
        let config = AionConfig::from_json(json).unwrap();
        assert_eq!(config.levels.len(), 2);
        assert_eq!(
            config.levels[0].store,
            StoreConfig::Memory {
                duration_secs: 60,
                precision: 1,
                backfill: true
            }
        );
        assert_eq!(config.levels[1].granularity_secs, 0);
        assert_eq!(
            config.levels[1].store,
            StoreConfig::Bucket {
                duration_secs: 3600,
                precision: 2,
                repository: RepositoryConfig::File {
                    dir: PathBuf::from("/var/lib/aion"),
                    compression: true
                }
            }
        );
    }

    #[test]
    fn test_default_roundtrips_through_json() {
        let config = AionConfig::default();
        let json = config.to_json().unwrap();
        assert_eq!(AionConfig::from_json(&json).unwrap(), config);
        assert_eq!(config.levels[1].store.duration_secs(), 3600);
    }

    #[test]
    fn test_malformed_config() {
        assert!(matches!(
            AionConfig::from_json(r#"{"levels": [{"aggregators": ["raw"]}]}"#),
            Err(AionError::Config(_))
        ));
        assert!(AionConfig::from_json(r#"{"levels": [{"aggregators": [], "store": {"type": "disk"}}]}"#).is_err());
    }
}
