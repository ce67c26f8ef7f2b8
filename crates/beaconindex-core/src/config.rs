//! Sync service configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::ChainClock;
use crate::error::IndexerError;
use crate::types::Epoch;

/// How committee writes for one epoch are grouped into transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// One transaction per committee. A failure part-way through an epoch
    /// leaves the committees already committed in place; the epoch is
    /// re-upserted on the next run.
    #[default]
    PerCommittee,
    /// One transaction for all committees of an epoch plus its progress
    /// update.
    PerEpoch,
}

/// Configuration for a committee sync service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Metadata key for this handler's progress.
    pub handler_id: String,
    /// First epoch to ingest when no progress has been recorded.
    pub start_epoch: Epoch,
    /// Unix timestamp of the chain's genesis.
    pub genesis_time: i64,
    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
    pub commit_mode: CommitMode,
    /// Upper bound on a single upstream fetch (milliseconds). `None` = no bound.
    pub fetch_timeout_ms: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            handler_id: "beaconcommittees.standard".into(),
            start_epoch: 0,
            // mainnet
            genesis_time: 1_606_824_023,
            seconds_per_slot: 12,
            slots_per_epoch: 32,
            commit_mode: CommitMode::PerCommittee,
            fetch_timeout_ms: None,
        }
    }
}

impl SyncConfig {
    /// Parse a JSON config document; missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self, IndexerError> {
        let config: Self =
            serde_json::from_str(s).map_err(|e| IndexerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.handler_id.is_empty() {
            return Err(IndexerError::Config("handler_id must not be empty".into()));
        }
        self.clock().map(|_| ())
    }

    pub fn clock(&self) -> Result<ChainClock, IndexerError> {
        ChainClock::new(self.genesis_time, self.seconds_per_slot, self.slots_per_epoch)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }
}
