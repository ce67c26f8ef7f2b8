//! Beacon committee fetcher.
//!
//! Wraps the upstream chain-node client (anything implementing
//! [`CommitteesProvider`]) and adds epoch → slot mapping and an optional
//! per-call timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use beaconindex_core::clock::ChainClock;
use beaconindex_core::error::IndexerError;
use beaconindex_core::types::{BeaconCommittee, Epoch, Slot};

/// Upstream capability: committee assignments from a chain node.
#[async_trait]
pub trait CommitteesProvider: Send + Sync {
    /// All committees of the epoch that contains `slot`.
    async fn beacon_committees(&self, slot: Slot) -> Result<Vec<BeaconCommittee>, IndexerError>;
}

#[async_trait]
impl<T: CommitteesProvider + ?Sized> CommitteesProvider for Arc<T> {
    async fn beacon_committees(&self, slot: Slot) -> Result<Vec<BeaconCommittee>, IndexerError> {
        (**self).beacon_committees(slot).await
    }
}

/// Fetches the committees for whole epochs from a [`CommitteesProvider`].
pub struct CommitteeFetcher<C> {
    client: C,
    timeout: Option<Duration>,
}

impl<C: CommitteesProvider> CommitteeFetcher<C> {
    pub fn new(client: C) -> Self {
        Self { client, timeout: None }
    }

    /// Bound every upstream call by `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetch all committees active at `epoch` with a single upstream call.
    ///
    /// Every failure, including a timeout, is reported as
    /// [`IndexerError::Upstream`].
    pub async fn committees_for_epoch(
        &self,
        clock: &ChainClock,
        epoch: Epoch,
    ) -> Result<Vec<BeaconCommittee>, IndexerError> {
        let slot = clock.first_slot_of_epoch(epoch);
        let call = self.client.beacon_committees(slot);
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| IndexerError::Upstream(format!("request timed out after {limit:?}")))
                .and_then(|r| r),
            None => call.await,
        };
        result.map_err(|e| match e {
            IndexerError::Upstream(_) => e.context("failed to fetch beacon committees"),
            other => IndexerError::Upstream(format!("failed to fetch beacon committees: {other}")),
        })
    }
}

/// Convert a beacon-API committees response (`{"data": [...]}` or the bare
/// array) into committees. Integers may be quoted, as the API encodes them.
pub fn committees_from_json(v: &Value) -> Result<Vec<BeaconCommittee>, IndexerError> {
    let entries = v
        .get("data")
        .unwrap_or(v)
        .as_array()
        .ok_or_else(|| IndexerError::Upstream("committees response is not an array".into()))?;

    entries
        .iter()
        .map(|entry| {
            let validators = entry["validators"]
                .as_array()
                .ok_or_else(|| IndexerError::Upstream("committee without validators".into()))?;
            Ok(BeaconCommittee {
                slot: json_u64(&entry["slot"], "slot")?,
                index: json_u64(&entry["index"], "index")?,
                committee: validators
                    .iter()
                    .map(|v| json_u64(v, "validator"))
                    .collect::<Result<_, _>>()?,
            })
        })
        .collect()
}

fn json_u64(v: &Value, field: &str) -> Result<u64, IndexerError> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
    .ok_or_else(|| IndexerError::Upstream(format!("invalid {field}: {v}")))
}
