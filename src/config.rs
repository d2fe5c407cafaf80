//! Feed and reconciliation configuration.

use crate::error::{FeedError, Result};
use serde::{Deserialize, Serialize};

/// Largest number of keys a single batch query may carry.
pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// Window within which two matching messages are treated as one event.
pub const DEFAULT_MERGE_WINDOW_SECS: i64 = 60;

/// Ids shorter than this look server-assigned; longer ones look like
/// locally generated UUIDs.
pub const DEFAULT_SERVER_ID_MAX_LEN: usize = 32;

/// Configuration for a membership feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Max keys per dependent query.
    /// Default: 10
    pub chunk_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl FeedConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(FeedError::InvalidConfig(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for near-duplicate reconciliation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Candidates closer than this (in seconds) to the last kept entry merge.
    /// Default: 60
    pub merge_window_secs: i64,

    /// Ids strictly shorter than this are considered server-assigned.
    /// Default: 32
    pub server_id_max_len: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            merge_window_secs: DEFAULT_MERGE_WINDOW_SECS,
            server_id_max_len: DEFAULT_SERVER_ID_MAX_LEN,
        }
    }
}

impl ReconcileConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        if config.merge_window_secs < 0 {
            return Err(FeedError::InvalidConfig(
                "merge_window_secs must not be negative".to_string(),
            ));
        }
        Ok(config)
    }
}
