//! Fluent builder API for creating committee sync services.
//!
//! # Example
//!
//! ```rust,no_run
//! use beaconindex_committees::ServiceBuilder;
//! use beaconindex_core::config::CommitMode;
//!
//! let config = ServiceBuilder::new()
//!     .start_epoch(194_048)
//!     .commit_mode(CommitMode::PerEpoch)
//!     .fetch_timeout_ms(10_000)
//!     .build_config();
//! ```

use std::sync::Arc;

use beaconindex_core::config::{CommitMode, SyncConfig};
use beaconindex_core::error::IndexerError;
use beaconindex_core::monitor::{Monitor, NullMonitor};
use beaconindex_core::store::ChainDb;
use beaconindex_core::types::Epoch;

use crate::fetcher::CommitteesProvider;
use crate::service::BeaconCommitteesService;

/// Fluent builder for [`SyncConfig`] and [`BeaconCommitteesService`].
#[derive(Default)]
pub struct ServiceBuilder {
    config: SyncConfig,
    monitor: Option<Arc<dyn Monitor>>,
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handler ID (used as the progress metadata key).
    pub fn handler_id(mut self, id: impl Into<String>) -> Self {
        self.config.handler_id = id.into();
        self
    }

    /// Set the first epoch to ingest when no progress is stored.
    pub fn start_epoch(mut self, epoch: Epoch) -> Self {
        self.config.start_epoch = epoch;
        self
    }

    /// Set the chain genesis as a Unix timestamp.
    pub fn genesis_time(mut self, ts: i64) -> Self {
        self.config.genesis_time = ts;
        self
    }

    pub fn seconds_per_slot(mut self, secs: u64) -> Self {
        self.config.seconds_per_slot = secs;
        self
    }

    pub fn slots_per_epoch(mut self, n: u64) -> Self {
        self.config.slots_per_epoch = n;
        self
    }

    pub fn commit_mode(mut self, mode: CommitMode) -> Self {
        self.config.commit_mode = mode;
        self
    }

    /// Bound each upstream fetch in milliseconds.
    pub fn fetch_timeout_ms(mut self, ms: u64) -> Self {
        self.config.fetch_timeout_ms = Some(ms);
        self
    }

    /// Observability sink; defaults to [`NullMonitor`].
    pub fn monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Build the `SyncConfig`.
    pub fn build_config(self) -> SyncConfig {
        self.config
    }

    /// Build a service over `client` and `db`.
    pub fn build<C: CommitteesProvider>(
        self,
        client: C,
        db: Arc<dyn ChainDb>,
    ) -> Result<BeaconCommitteesService<C>, IndexerError> {
        let monitor = self.monitor.unwrap_or_else(|| Arc::new(NullMonitor));
        BeaconCommitteesService::new(self.config, client, db, monitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use beaconindex_core::types::{BeaconCommittee, Slot};
    use beaconindex_storage::InMemoryStorage;

    struct NoCommittees;

    #[async_trait]
    impl CommitteesProvider for NoCommittees {
        async fn beacon_committees(&self, _slot: Slot) -> Result<Vec<BeaconCommittee>, IndexerError> {
            Ok(vec![])
        }
    }

    #[test]
    fn builder_defaults() {
        let cfg = ServiceBuilder::new().build_config();
        assert_eq!(cfg.handler_id, "beaconcommittees.standard");
        assert_eq!(cfg.slots_per_epoch, 32);
        assert_eq!(cfg.commit_mode, CommitMode::PerCommittee);
        assert_eq!(cfg.fetch_timeout_ms, None);
    }

    #[test]
    fn builder_custom() {
        let cfg = ServiceBuilder::new()
            .handler_id("beaconcommittees.gnosis")
            .genesis_time(1_638_993_340)
            .seconds_per_slot(5)
            .slots_per_epoch(16)
            .start_epoch(100)
            .commit_mode(CommitMode::PerEpoch)
            .fetch_timeout_ms(2_500)
            .build_config();

        assert_eq!(cfg.handler_id, "beaconcommittees.gnosis");
        assert_eq!(cfg.seconds_per_slot, 5);
        assert_eq!(cfg.slots_per_epoch, 16);
        assert_eq!(cfg.start_epoch, 100);
        assert_eq!(cfg.commit_mode, CommitMode::PerEpoch);
        assert_eq!(cfg.fetch_timeout_ms, Some(2_500));
    }

    #[test]
    fn build_rejects_invalid_clock() {
        let result = ServiceBuilder::new()
            .slots_per_epoch(0)
            .build(NoCommittees, Arc::new(InMemoryStorage::new()));
        assert!(matches!(result, Err(IndexerError::Config(_))));
    }

    #[tokio::test]
    async fn built_service_uses_configured_epoch_size() {
        let svc = ServiceBuilder::new()
            .genesis_time(0)
            .slots_per_epoch(16)
            .build(NoCommittees, Arc::new(InMemoryStorage::new()))
            .unwrap();
        assert_eq!(svc.clock().slot_to_epoch(33), 2);
        let outcome = svc.on_head_updated(32, true).await;
        assert_eq!(
            outcome,
            crate::service::SyncOutcome::Synced { processed: vec![0, 1, 2] }
        );
    }
}
