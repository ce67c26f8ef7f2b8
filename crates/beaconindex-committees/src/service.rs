//! Beacon committee sync service.
//!
//! Driven by chain-head notifications. On every epoch transition the service
//! catches up from the epoch after the last one it fully ingested to the
//! epoch of the new head:
//!
//! 1. Skip if another run is in progress (single-flight).
//! 2. Load progress metadata.
//! 3. For each pending epoch: fetch committees → upsert → advance progress.
//! 4. Stop at the first failing epoch; the next trigger resumes there.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use beaconindex_core::clock::ChainClock;
use beaconindex_core::config::{CommitMode, SyncConfig};
use beaconindex_core::error::IndexerError;
use beaconindex_core::monitor::Monitor;
use beaconindex_core::progress::{ProgressManager, ProgressMetadata};
use beaconindex_core::store::ChainDb;
use beaconindex_core::types::{BeaconCommittee, Epoch, Slot};

use crate::fetcher::{CommitteeFetcher, CommitteesProvider};

/// Result of a single trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// The head update did not start a new epoch; nothing was done.
    NotEpochTransition,
    /// Another run held the activity guard; nothing was done.
    AlreadyRunning,
    /// Every pending epoch was ingested (possibly none).
    Synced { processed: Vec<Epoch> },
    /// The run stopped early. `failed_epoch` is `None` when progress
    /// metadata could not be read.
    Stalled {
        processed: Vec<Epoch>,
        failed_epoch: Option<Epoch>,
        reason: String,
    },
}

/// Keeps stored beacon committees in step with the chain head.
pub struct BeaconCommitteesService<C: CommitteesProvider> {
    config: SyncConfig,
    clock: ChainClock,
    fetcher: CommitteeFetcher<C>,
    db: Arc<dyn ChainDb>,
    progress: ProgressManager,
    monitor: Arc<dyn Monitor>,
    activity: Mutex<()>,
}

impl<C: CommitteesProvider> BeaconCommitteesService<C> {
    pub fn new(
        config: SyncConfig,
        client: C,
        db: Arc<dyn ChainDb>,
        monitor: Arc<dyn Monitor>,
    ) -> Result<Self, IndexerError> {
        config.validate()?;
        let clock = config.clock()?;
        let fetcher = CommitteeFetcher::new(client).with_timeout(config.fetch_timeout());
        let progress = ProgressManager::new(db.clone(), config.handler_id.clone());
        Ok(Self {
            config,
            clock,
            fetcher,
            db,
            progress,
            monitor,
            activity: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn clock(&self) -> &ChainClock {
        &self.clock
    }

    /// Progress as currently stored.
    pub async fn progress(&self) -> Result<ProgressMetadata, IndexerError> {
        self.progress.load().await
    }

    /// React to a new chain head at `slot`.
    pub async fn on_head_updated(&self, slot: Slot, epoch_transition: bool) -> SyncOutcome {
        if !epoch_transition {
            tracing::trace!(slot, "Not an epoch transition; ignoring");
            return SyncOutcome::NotEpochTransition;
        }
        let target = self.clock.slot_to_epoch(slot);
        tracing::trace!(slot, epoch = target, "Handling epoch transition");
        self.run_guarded(target).await
    }

    /// Catch up to the epoch the wall clock is currently in, e.g. on startup
    /// before the first head notification arrives.
    pub async fn catch_up(&self) -> SyncOutcome {
        self.run_guarded(self.clock.current_epoch()).await
    }

    async fn run_guarded(&self, target: Epoch) -> SyncOutcome {
        let Ok(_guard) = self.activity.try_lock() else {
            tracing::debug!(handler = %self.config.handler_id, "Another committee update is running");
            return SyncOutcome::AlreadyRunning;
        };

        let md = match self.progress.load().await {
            Ok(md) => md,
            Err(e) => {
                tracing::error!(error = %e, "Failed to obtain metadata");
                return SyncOutcome::Stalled {
                    processed: Vec::new(),
                    failed_epoch: None,
                    reason: e.to_string(),
                };
            }
        };

        self.catch_up_to(&md, target).await
    }

    async fn catch_up_to(&self, md: &ProgressMetadata, target: Epoch) -> SyncOutcome {
        let from = md.next_epoch(self.config.start_epoch);
        if from > target {
            tracing::debug!(last = ?md.last_processed_epoch, target, "Beacon committees up to date");
            return SyncOutcome::Synced { processed: Vec::new() };
        }

        let mut processed = Vec::new();
        for epoch in from..=target {
            if let Err(e) = self.sync_epoch(epoch).await {
                tracing::warn!(
                    epoch,
                    error = %e,
                    transient = e.is_transient(),
                    "Failed to update beacon committees; will retry on next trigger"
                );
                return SyncOutcome::Stalled {
                    processed,
                    failed_epoch: Some(epoch),
                    reason: e.to_string(),
                };
            }
            processed.push(epoch);
        }

        tracing::info!(from, to = target, "Beacon committees caught up");
        SyncOutcome::Synced { processed }
    }

    /// Ingest one epoch and record it as processed. The monitor is signalled
    /// only once the progress update is persisted.
    async fn sync_epoch(&self, epoch: Epoch) -> Result<(), IndexerError> {
        self.update_beacon_committees_for_epoch(epoch).await?;
        if self.config.commit_mode == CommitMode::PerCommittee {
            self.progress.advance(epoch).await?;
        }
        tracing::trace!(epoch, "Updated metadata");
        self.monitor.epoch_processed(&self.config.handler_id, epoch);
        Ok(())
    }

    async fn update_beacon_committees_for_epoch(&self, epoch: Epoch) -> Result<(), IndexerError> {
        tracing::trace!(epoch, "Updating beacon committees");
        let committees = self.fetcher.committees_for_epoch(&self.clock, epoch).await?;

        match self.config.commit_mode {
            CommitMode::PerCommittee => {
                for committee in &committees {
                    self.write_committee(committee).await?;
                }
            }
            CommitMode::PerEpoch => self.write_epoch(epoch, &committees).await?,
        }

        tracing::debug!(epoch, committees = committees.len(), "Stored beacon committees");
        Ok(())
    }

    async fn write_committee(&self, committee: &BeaconCommittee) -> Result<(), IndexerError> {
        let mut tx = self
            .db
            .begin_tx()
            .await
            .map_err(|e| e.context("failed to begin transaction"))?;
        if let Err(e) = tx.set_beacon_committee(committee).await {
            let _ = tx.rollback().await;
            return Err(e.context("failed to set beacon committee"));
        }
        tx.commit()
            .await
            .map_err(|e| e.context("failed to commit transaction"))
    }

    /// All committees of `epoch` plus its progress update in one transaction.
    async fn write_epoch(
        &self,
        epoch: Epoch,
        committees: &[BeaconCommittee],
    ) -> Result<(), IndexerError> {
        let mut tx = self
            .db
            .begin_tx()
            .await
            .map_err(|e| e.context("failed to begin transaction"))?;

        let staged = async {
            for committee in committees {
                tx.set_beacon_committee(committee)
                    .await
                    .map_err(|e| e.context("failed to set beacon committee"))?;
            }
            self.progress.advance_in(tx.as_mut(), epoch).await?;
            Ok::<_, IndexerError>(())
        }
        .await;

        if let Err(e) = staged {
            let _ = tx.rollback().await;
            return Err(e);
        }
        tx.commit()
            .await
            .map_err(|e| e.context("failed to commit transaction"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use beaconindex_core::monitor::NullMonitor;
    use beaconindex_core::store::{CommitteeStore, StoreTransaction};
    use beaconindex_storage::InMemoryStorage;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    // ─── Mocks ───────────────────────────────────────────────────────────────

    /// Two slots × two committees per epoch; fails for slots in `failing`.
    #[derive(Clone, Default)]
    struct MockProvider {
        calls: Arc<StdMutex<Vec<Slot>>>,
        failing: Arc<StdMutex<HashSet<Slot>>>,
    }

    impl MockProvider {
        fn fail_at(&self, slot: Slot) {
            self.failing.lock().unwrap().insert(slot);
        }
        fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }
        fn calls(&self) -> Vec<Slot> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommitteesProvider for MockProvider {
        async fn beacon_committees(&self, slot: Slot) -> Result<Vec<BeaconCommittee>, IndexerError> {
            self.calls.lock().unwrap().push(slot);
            if self.failing.lock().unwrap().contains(&slot) {
                return Err(IndexerError::Upstream("503 Service Unavailable".into()));
            }
            let mut committees = Vec::new();
            for offset in 0..2 {
                for index in 0..2 {
                    committees.push(BeaconCommittee {
                        slot: slot + offset,
                        index,
                        committee: vec![slot * 10 + index, slot * 10 + index + 1],
                    });
                }
            }
            Ok(committees)
        }
    }

    /// Blocks inside the upstream call until released.
    struct GatedProvider {
        inner: MockProvider,
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl CommitteesProvider for GatedProvider {
        async fn beacon_committees(&self, slot: Slot) -> Result<Vec<BeaconCommittee>, IndexerError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.beacon_committees(slot).await
        }
    }

    struct StuckProvider;

    #[async_trait]
    impl CommitteesProvider for StuckProvider {
        async fn beacon_committees(&self, _slot: Slot) -> Result<Vec<BeaconCommittee>, IndexerError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct RecordingMonitor {
        epochs: StdMutex<Vec<Epoch>>,
    }

    impl Monitor for RecordingMonitor {
        fn epoch_processed(&self, _handler: &str, epoch: Epoch) {
            self.epochs.lock().unwrap().push(epoch);
        }
    }

    /// In-memory storage that can fail the Nth commit or every metadata read.
    #[derive(Clone, Default)]
    struct FlakyDb {
        inner: InMemoryStorage,
        commits: Arc<AtomicUsize>,
        fail_commit: Arc<StdMutex<Option<usize>>>,
        fail_metadata: Arc<AtomicBool>,
        metadata_reads: Arc<AtomicUsize>,
    }

    impl FlakyDb {
        fn fail_commit_number(&self, n: usize) {
            self.commits.store(0, Ordering::SeqCst);
            *self.fail_commit.lock().unwrap() = Some(n);
        }
        fn heal(&self) {
            *self.fail_commit.lock().unwrap() = None;
            self.fail_metadata.store(false, Ordering::SeqCst);
        }
    }

    struct FlakyTx {
        inner: Box<dyn StoreTransaction>,
        commits: Arc<AtomicUsize>,
        fail_commit: Arc<StdMutex<Option<usize>>>,
    }

    #[async_trait]
    impl StoreTransaction for FlakyTx {
        async fn set_block(&mut self, block: &beaconindex_core::Block) -> Result<(), IndexerError> {
            self.inner.set_block(block).await
        }
        async fn set_beacon_committee(&mut self, committee: &BeaconCommittee) -> Result<(), IndexerError> {
            self.inner.set_beacon_committee(committee).await
        }
        async fn set_metadata(&mut self, key: &str, value: &serde_json::Value) -> Result<(), IndexerError> {
            self.inner.set_metadata(key, value).await
        }
        async fn commit(&mut self) -> Result<(), IndexerError> {
            let n = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
            let fail = *self.fail_commit.lock().unwrap() == Some(n);
            if fail {
                let _ = self.inner.rollback().await;
                return Err(IndexerError::Storage("disk I/O error".into()));
            }
            self.inner.commit().await
        }
        async fn rollback(&mut self) -> Result<(), IndexerError> {
            self.inner.rollback().await
        }
    }

    #[async_trait]
    impl ChainDb for FlakyDb {
        async fn begin_tx(&self) -> Result<Box<dyn StoreTransaction>, IndexerError> {
            Ok(Box::new(FlakyTx {
                inner: self.inner.begin_tx().await?,
                commits: self.commits.clone(),
                fail_commit: self.fail_commit.clone(),
            }))
        }
        async fn metadata(&self, key: &str) -> Result<Option<serde_json::Value>, IndexerError> {
            self.metadata_reads.fetch_add(1, Ordering::SeqCst);
            if self.fail_metadata.load(Ordering::SeqCst) {
                return Err(IndexerError::Storage("connection refused".into()));
            }
            self.inner.metadata(key).await
        }
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    fn config(mode: CommitMode) -> SyncConfig {
        SyncConfig {
            genesis_time: 0,
            commit_mode: mode,
            ..SyncConfig::default()
        }
    }

    fn service<C: CommitteesProvider>(
        client: C,
        db: &FlakyDb,
        mode: CommitMode,
        monitor: Arc<dyn Monitor>,
    ) -> BeaconCommitteesService<C> {
        BeaconCommitteesService::new(config(mode), client, Arc::new(db.clone()), monitor).unwrap()
    }

    async fn seed_progress(db: &FlakyDb, epoch: Epoch) {
        ProgressManager::new(Arc::new(db.inner.clone()), "beaconcommittees.standard")
            .advance(epoch)
            .await
            .unwrap();
    }

    async fn last_processed(db: &FlakyDb) -> Option<Epoch> {
        ProgressManager::new(Arc::new(db.inner.clone()), "beaconcommittees.standard")
            .load()
            .await
            .unwrap()
            .last_processed_epoch
    }

    // ─── Tests ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ignores_non_transition_heads() {
        let provider = MockProvider::default();
        let db = FlakyDb::default();
        let svc = service(provider.clone(), &db, CommitMode::PerCommittee, Arc::new(NullMonitor));

        assert_eq!(svc.on_head_updated(417, false).await, SyncOutcome::NotEpochTransition);
        assert!(provider.calls().is_empty());
        assert_eq!(db.metadata_reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn first_run_starts_at_start_epoch() {
        let provider = MockProvider::default();
        let db = FlakyDb::default();
        let svc = service(provider.clone(), &db, CommitMode::PerCommittee, Arc::new(NullMonitor));

        let outcome = svc.on_head_updated(64, true).await;
        assert_eq!(outcome, SyncOutcome::Synced { processed: vec![0, 1, 2] });
        assert_eq!(provider.calls(), vec![0, 32, 64]);
        assert_eq!(db.inner.committee_count(), 12);
        assert_eq!(last_processed(&db).await, Some(2));
    }

    #[tokio::test]
    async fn configured_start_epoch_is_honoured() {
        let provider = MockProvider::default();
        let db = FlakyDb::default();
        let cfg = SyncConfig { start_epoch: 5, ..config(CommitMode::PerCommittee) };
        let svc = BeaconCommitteesService::new(cfg, provider.clone(), Arc::new(db.clone()), Arc::new(NullMonitor))
            .unwrap();

        let outcome = svc.on_head_updated(6 * 32, true).await;
        assert_eq!(outcome, SyncOutcome::Synced { processed: vec![5, 6] });
        assert_eq!(provider.calls(), vec![160, 192]);
    }

    #[tokio::test]
    async fn stops_at_failing_epoch_and_resumes() {
        let provider = MockProvider::default();
        let db = FlakyDb::default();
        let monitor = Arc::new(RecordingMonitor::default());
        let svc = service(provider.clone(), &db, CommitMode::PerCommittee, monitor.clone());
        seed_progress(&db, 10).await;
        provider.fail_at(384);

        let outcome = svc.on_head_updated(416, true).await;
        match outcome {
            SyncOutcome::Stalled { processed, failed_epoch, reason } => {
                assert_eq!(processed, vec![11]);
                assert_eq!(failed_epoch, Some(12));
                assert!(reason.contains("503"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // Epoch 13 was never attempted.
        assert_eq!(provider.calls(), vec![352, 384]);
        assert_eq!(last_processed(&db).await, Some(11));

        provider.heal();
        let outcome = svc.on_head_updated(416, true).await;
        assert_eq!(outcome, SyncOutcome::Synced { processed: vec![12, 13] });
        assert_eq!(provider.calls(), vec![352, 384, 384, 416]);
        assert_eq!(last_processed(&db).await, Some(13));
        assert_eq!(*monitor.epochs.lock().unwrap(), vec![11, 12, 13]);
    }

    #[tokio::test]
    async fn up_to_date_does_no_upstream_io() {
        let provider = MockProvider::default();
        let db = FlakyDb::default();
        let svc = service(provider.clone(), &db, CommitMode::PerCommittee, Arc::new(NullMonitor));
        seed_progress(&db, 13).await;

        assert_eq!(svc.on_head_updated(416, true).await, SyncOutcome::Synced { processed: vec![] });
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn partial_epoch_is_reupserted() {
        let provider = MockProvider::default();
        let db = FlakyDb::default();
        let svc = service(provider.clone(), &db, CommitMode::PerCommittee, Arc::new(NullMonitor));
        seed_progress(&db, 10).await;
        db.fail_commit_number(3);

        let outcome = svc.on_head_updated(352, true).await;
        assert!(matches!(outcome, SyncOutcome::Stalled { failed_epoch: Some(11), .. }));
        // Two committees landed before the failure; progress did not move.
        assert_eq!(db.inner.committee_count(), 2);
        assert_eq!(last_processed(&db).await, Some(10));

        db.heal();
        assert_eq!(svc.on_head_updated(352, true).await, SyncOutcome::Synced { processed: vec![11] });
        assert_eq!(db.inner.committee_count(), 4);
        assert_eq!(last_processed(&db).await, Some(11));
        let c = db.inner.beacon_committee_by_slot_and_index(352, 1).await.unwrap().unwrap();
        assert_eq!(c.committee, vec![3521, 3522]);
    }

    #[tokio::test]
    async fn monitor_waits_for_persisted_progress() {
        let provider = MockProvider::default();
        let db = FlakyDb::default();
        let monitor = Arc::new(RecordingMonitor::default());
        let svc = service(provider.clone(), &db, CommitMode::PerCommittee, monitor.clone());
        seed_progress(&db, 10).await;
        // Four committee commits succeed, the progress commit fails.
        db.fail_commit_number(5);

        let outcome = svc.on_head_updated(352, true).await;
        assert!(matches!(outcome, SyncOutcome::Stalled { failed_epoch: Some(11), .. }));
        assert_eq!(db.inner.committee_count(), 4);
        assert_eq!(last_processed(&db).await, Some(10));
        assert!(monitor.epochs.lock().unwrap().is_empty());

        db.heal();
        assert_eq!(svc.on_head_updated(352, true).await, SyncOutcome::Synced { processed: vec![11] });
        assert_eq!(*monitor.epochs.lock().unwrap(), vec![11]);
    }

    #[tokio::test]
    async fn per_epoch_mode_is_atomic() {
        let provider = MockProvider::default();
        let db = FlakyDb::default();
        let svc = service(provider.clone(), &db, CommitMode::PerEpoch, Arc::new(NullMonitor));
        seed_progress(&db, 10).await;
        db.fail_commit_number(1);

        let outcome = svc.on_head_updated(352, true).await;
        assert!(matches!(outcome, SyncOutcome::Stalled { failed_epoch: Some(11), .. }));
        assert_eq!(db.inner.committee_count(), 0);
        assert_eq!(last_processed(&db).await, Some(10));

        db.heal();
        assert_eq!(svc.on_head_updated(352, true).await, SyncOutcome::Synced { processed: vec![11] });
        assert_eq!(db.inner.committee_count(), 4);
        assert_eq!(last_processed(&db).await, Some(11));
    }

    #[tokio::test]
    async fn metadata_failure_stalls_and_releases_guard() {
        let provider = MockProvider::default();
        let db = FlakyDb::default();
        let svc = service(provider.clone(), &db, CommitMode::PerCommittee, Arc::new(NullMonitor));
        db.fail_metadata.store(true, Ordering::SeqCst);

        let outcome = svc.on_head_updated(32, true).await;
        assert!(matches!(outcome, SyncOutcome::Stalled { failed_epoch: None, .. }));
        assert!(provider.calls().is_empty());

        db.heal();
        assert_eq!(svc.on_head_updated(32, true).await, SyncOutcome::Synced { processed: vec![0, 1] });
    }

    #[tokio::test]
    async fn concurrent_trigger_is_skipped() {
        let inner = MockProvider::default();
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let provider = GatedProvider {
            inner: inner.clone(),
            entered: entered.clone(),
            release: release.clone(),
        };
        let db = FlakyDb::default();
        let svc = Arc::new(service(provider, &db, CommitMode::PerCommittee, Arc::new(NullMonitor)));

        let first = tokio::spawn({
            let svc = svc.clone();
            async move { svc.on_head_updated(0, true).await }
        });
        entered.notified().await;
        let reads_before = db.metadata_reads.load(Ordering::SeqCst);

        assert_eq!(svc.on_head_updated(0, true).await, SyncOutcome::AlreadyRunning);
        assert_eq!(db.metadata_reads.load(Ordering::SeqCst), reads_before);

        release.notify_one();
        assert_eq!(first.await.unwrap(), SyncOutcome::Synced { processed: vec![0] });
        assert_eq!(inner.calls(), vec![0]);
    }

    #[tokio::test]
    async fn fetch_timeout_stalls_epoch() {
        let db = FlakyDb::default();
        let cfg = SyncConfig {
            fetch_timeout_ms: Some(20),
            ..config(CommitMode::PerCommittee)
        };
        let svc = BeaconCommitteesService::new(cfg, StuckProvider, Arc::new(db.clone()), Arc::new(NullMonitor))
            .unwrap();

        let outcome = svc.on_head_updated(0, true).await;
        assert!(matches!(outcome, SyncOutcome::Stalled { failed_epoch: Some(0), .. }));
        assert_eq!(last_processed(&db).await, None);
    }

    #[tokio::test]
    async fn catch_up_targets_wall_clock_epoch() {
        let provider = MockProvider::default();
        let db = FlakyDb::default();
        // Three epochs and a bit after genesis.
        let genesis = chrono::Utc::now().timestamp() - (12 * 32 * 3 + 6);
        let cfg = SyncConfig { genesis_time: genesis, ..SyncConfig::default() };
        let svc = BeaconCommitteesService::new(cfg, provider.clone(), Arc::new(db.clone()), Arc::new(NullMonitor))
            .unwrap();

        assert_eq!(svc.catch_up().await, SyncOutcome::Synced { processed: vec![0, 1, 2, 3] });
        assert_eq!(svc.progress().await.unwrap().last_processed_epoch, Some(3));
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let outcome = SyncOutcome::Stalled {
            processed: vec![11],
            failed_epoch: Some(12),
            reason: "upstream error: 503".into(),
        };
        let v = serde_json::to_value(&outcome).unwrap();
        assert_eq!(v["outcome"], "stalled");
        assert_eq!(v["failed_epoch"], 12);
    }
}
