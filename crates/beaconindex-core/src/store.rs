//! Storage traits: the transactional writer and the read surfaces used by
//! ingestion handlers and the canonicalisation process.
//!
//! Implementations live in `beaconindex-storage` (memory, SQLite, Postgres).

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::types::{BeaconCommittee, Block, CommitteeIndex, Root, Slot};

/// Highest slot a backend persists. SQL backends store slots as signed 64-bit
/// integers and use `i64::MAX` as the open upper bound of range scans.
pub const MAX_STORABLE_SLOT: Slot = (i64::MAX - 1) as Slot;

/// Widest range [`BlockStore::empty_slots`] will enumerate.
pub const MAX_EMPTY_SLOTS_SPAN: u64 = 1 << 20;

/// Reject a write for a slot no backend can represent.
pub fn check_storable_slot(slot: Slot) -> Result<(), IndexerError> {
    if slot > MAX_STORABLE_SLOT {
        return Err(IndexerError::Storage(format!("slot {slot} exceeds {MAX_STORABLE_SLOT}")));
    }
    Ok(())
}

/// Reject an `empty_slots` range too wide to enumerate.
pub fn check_empty_slots_range(min_slot: Slot, max_slot: Slot) -> Result<(), IndexerError> {
    if max_slot > i64::MAX as Slot {
        return Err(IndexerError::Storage(format!("slot {max_slot} out of range")));
    }
    if max_slot.saturating_sub(min_slot) >= MAX_EMPTY_SLOTS_SPAN {
        return Err(IndexerError::Storage(format!(
            "empty slot range [{min_slot}, {max_slot}] spans more than {MAX_EMPTY_SLOTS_SPAN} slots"
        )));
    }
    Ok(())
}

/// Clamp a slot bound to the signed column range of SQL backends.
pub fn slot_bound(slot: Slot) -> i64 {
    i64::try_from(slot).unwrap_or(i64::MAX)
}

/// A unit of work against the chain database.
///
/// Dropping a transaction without calling [`commit`](Self::commit) discards
/// its writes. Any call after `commit` or `rollback` fails with
/// [`IndexerError::TransactionClosed`].
#[async_trait]
pub trait StoreTransaction: Send {
    /// Upsert a block keyed on `(slot, root)`.
    ///
    /// On conflict the proposer index, graffiti, RANDAO reveal, state root,
    /// canonicality and eth1 fields are refreshed; slot, root, body root and
    /// parent root keep their first-inserted values.
    async fn set_block(&mut self, block: &Block) -> Result<(), IndexerError>;

    /// Upsert a committee keyed on `(slot, index)`, replacing its members.
    async fn set_beacon_committee(&mut self, committee: &BeaconCommittee) -> Result<(), IndexerError>;

    /// Upsert the metadata document stored under `key`.
    async fn set_metadata(&mut self, key: &str, value: &serde_json::Value) -> Result<(), IndexerError>;

    async fn commit(&mut self) -> Result<(), IndexerError>;

    async fn rollback(&mut self) -> Result<(), IndexerError>;
}

/// Entry point to a chain database: transaction acquisition and metadata.
#[async_trait]
pub trait ChainDb: Send + Sync {
    async fn begin_tx(&self) -> Result<Box<dyn StoreTransaction>, IndexerError>;

    /// Read the committed metadata document stored under `key`.
    async fn metadata(&self, key: &str) -> Result<Option<serde_json::Value>, IndexerError>;
}

/// Read surface over stored blocks.
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn blocks_by_slot(&self, slot: Slot) -> Result<Vec<Block>, IndexerError>;

    async fn block_by_root(&self, root: &Root) -> Result<Option<Block>, IndexerError>;

    /// Children of `parent_root`; more than one when the chain forked.
    async fn blocks_by_parent_root(&self, parent_root: &Root) -> Result<Vec<Block>, IndexerError>;

    /// Blocks with `min_slot <= slot < max_slot`, ordered by slot.
    async fn blocks_for_slot_range(&self, min_slot: Slot, max_slot: Slot) -> Result<Vec<Block>, IndexerError>;

    /// Slots in `[min_slot, max_slot]` (inclusive) without any stored block.
    ///
    /// Fails when the range covers more than [`MAX_EMPTY_SLOTS_SPAN`] slots or
    /// reaches past `i64::MAX`.
    async fn empty_slots(&self, min_slot: Slot, max_slot: Slot) -> Result<Vec<Slot>, IndexerError>;

    /// Roots of blocks with `min_slot <= slot < max_slot` whose canonicality
    /// is still unknown, ordered by slot.
    async fn indeterminate_blocks(&self, min_slot: Slot, max_slot: Slot) -> Result<Vec<Root>, IndexerError>;

    /// The highest-slot block marked canonical, if any.
    async fn latest_canonical_block(&self) -> Result<Option<Block>, IndexerError>;
}

/// Read surface over stored beacon committees.
#[async_trait]
pub trait CommitteeStore: Send + Sync {
    async fn beacon_committee_by_slot_and_index(
        &self,
        slot: Slot,
        index: CommitteeIndex,
    ) -> Result<Option<BeaconCommittee>, IndexerError>;

    /// Committees with `min_slot <= slot < max_slot`, ordered by slot then index.
    async fn beacon_committees_for_slot_range(
        &self,
        min_slot: Slot,
        max_slot: Slot,
    ) -> Result<Vec<BeaconCommittee>, IndexerError>;
}
