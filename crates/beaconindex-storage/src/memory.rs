//! In-memory storage backend.
//!
//! Stores blocks, committees and metadata in RAM. Transactions stage their
//! writes and apply them under a single lock on commit, so readers never see
//! a half-applied transaction. Useful for tests and ephemeral indexers.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use beaconindex_core::error::IndexerError;
use beaconindex_core::store::{
    check_empty_slots_range, check_storable_slot, BlockStore, ChainDb, CommitteeStore,
    StoreTransaction,
};
use beaconindex_core::types::{BeaconCommittee, Block, Canonicality, CommitteeIndex, Root, Slot};

const MAX_ROOT: Root = Root([0xff; 32]);

#[derive(Default)]
struct State {
    blocks: BTreeMap<(Slot, Root), Block>,
    committees: BTreeMap<(Slot, CommitteeIndex), BeaconCommittee>,
    metadata: HashMap<String, serde_json::Value>,
}

impl State {
    fn upsert_block(&mut self, block: Block) {
        match self.blocks.get_mut(&(block.slot, block.root)) {
            Some(existing) => {
                existing.proposer_index = block.proposer_index;
                existing.graffiti = block.graffiti;
                existing.randao_reveal = block.randao_reveal;
                existing.state_root = block.state_root;
                existing.canonical = block.canonical;
                existing.eth1_block_hash = block.eth1_block_hash;
                existing.eth1_deposit_count = block.eth1_deposit_count;
                existing.eth1_deposit_root = block.eth1_deposit_root;
            }
            None => {
                self.blocks.insert((block.slot, block.root), block);
            }
        }
    }
}

enum Write {
    Block(Block),
    Committee(BeaconCommittee),
    Metadata(String, serde_json::Value),
}

/// In-memory chain database.
///
/// Cheaply cloneable; clones share the same data. All data is lost when the
/// last clone is dropped.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<State>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, IndexerError> {
        self.state
            .lock()
            .map_err(|_| IndexerError::Storage("memory store lock poisoned".into()))
    }

    /// Total number of stored blocks.
    pub fn block_count(&self) -> usize {
        self.lock().map(|s| s.blocks.len()).unwrap_or_default()
    }

    /// Total number of stored committees.
    pub fn committee_count(&self) -> usize {
        self.lock().map(|s| s.committees.len()).unwrap_or_default()
    }
}

/// Transaction over [`InMemoryStorage`].
pub struct MemoryTransaction {
    state: Arc<Mutex<State>>,
    staged: Vec<Write>,
    finished: bool,
}

impl MemoryTransaction {
    fn stage(&mut self, write: Write) -> Result<(), IndexerError> {
        if self.finished {
            return Err(IndexerError::TransactionClosed);
        }
        self.staged.push(write);
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn set_block(&mut self, block: &Block) -> Result<(), IndexerError> {
        check_storable_slot(block.slot)?;
        self.stage(Write::Block(block.clone()))
    }

    async fn set_beacon_committee(&mut self, committee: &BeaconCommittee) -> Result<(), IndexerError> {
        check_storable_slot(committee.slot)?;
        self.stage(Write::Committee(committee.clone()))
    }

    async fn set_metadata(&mut self, key: &str, value: &serde_json::Value) -> Result<(), IndexerError> {
        self.stage(Write::Metadata(key.to_string(), value.clone()))
    }

    async fn commit(&mut self) -> Result<(), IndexerError> {
        if self.finished {
            return Err(IndexerError::TransactionClosed);
        }
        self.finished = true;
        let mut state = self
            .state
            .lock()
            .map_err(|_| IndexerError::Storage("memory store lock poisoned".into()))?;
        for write in self.staged.drain(..) {
            match write {
                Write::Block(block) => state.upsert_block(block),
                Write::Committee(committee) => {
                    state.committees.insert((committee.slot, committee.index), committee);
                }
                Write::Metadata(key, value) => {
                    state.metadata.insert(key, value);
                }
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), IndexerError> {
        if self.finished {
            return Err(IndexerError::TransactionClosed);
        }
        self.finished = true;
        self.staged.clear();
        Ok(())
    }
}

#[async_trait]
impl ChainDb for InMemoryStorage {
    async fn begin_tx(&self) -> Result<Box<dyn StoreTransaction>, IndexerError> {
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            staged: Vec::new(),
            finished: false,
        }))
    }

    async fn metadata(&self, key: &str) -> Result<Option<serde_json::Value>, IndexerError> {
        Ok(self.lock()?.metadata.get(key).cloned())
    }
}

#[async_trait]
impl BlockStore for InMemoryStorage {
    async fn blocks_by_slot(&self, slot: Slot) -> Result<Vec<Block>, IndexerError> {
        let state = self.lock()?;
        Ok(state
            .blocks
            .range((slot, Root::ZERO)..=(slot, MAX_ROOT))
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn block_by_root(&self, root: &Root) -> Result<Option<Block>, IndexerError> {
        let state = self.lock()?;
        Ok(state.blocks.values().find(|b| &b.root == root).cloned())
    }

    async fn blocks_by_parent_root(&self, parent_root: &Root) -> Result<Vec<Block>, IndexerError> {
        let state = self.lock()?;
        Ok(state
            .blocks
            .values()
            .filter(|b| &b.parent_root == parent_root)
            .cloned()
            .collect())
    }

    async fn blocks_for_slot_range(&self, min_slot: Slot, max_slot: Slot) -> Result<Vec<Block>, IndexerError> {
        if min_slot >= max_slot {
            return Ok(vec![]);
        }
        let state = self.lock()?;
        Ok(state
            .blocks
            .range((min_slot, Root::ZERO)..(max_slot, Root::ZERO))
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn empty_slots(&self, min_slot: Slot, max_slot: Slot) -> Result<Vec<Slot>, IndexerError> {
        if min_slot > max_slot {
            return Ok(vec![]);
        }
        check_empty_slots_range(min_slot, max_slot)?;
        let state = self.lock()?;
        let occupied: BTreeSet<Slot> = state
            .blocks
            .range((min_slot, Root::ZERO)..=(max_slot, MAX_ROOT))
            .map(|((slot, _), _)| *slot)
            .collect();
        Ok((min_slot..=max_slot).filter(|s| !occupied.contains(s)).collect())
    }

    async fn indeterminate_blocks(&self, min_slot: Slot, max_slot: Slot) -> Result<Vec<Root>, IndexerError> {
        if min_slot >= max_slot {
            return Ok(vec![]);
        }
        let state = self.lock()?;
        Ok(state
            .blocks
            .range((min_slot, Root::ZERO)..(max_slot, Root::ZERO))
            .filter(|(_, b)| b.canonical.is_indeterminate())
            .map(|((_, root), _)| *root)
            .collect())
    }

    async fn latest_canonical_block(&self) -> Result<Option<Block>, IndexerError> {
        let state = self.lock()?;
        Ok(state
            .blocks
            .values()
            .rev()
            .find(|b| b.canonical == Canonicality::Canonical)
            .cloned())
    }
}

#[async_trait]
impl CommitteeStore for InMemoryStorage {
    async fn beacon_committee_by_slot_and_index(
        &self,
        slot: Slot,
        index: CommitteeIndex,
    ) -> Result<Option<BeaconCommittee>, IndexerError> {
        Ok(self.lock()?.committees.get(&(slot, index)).cloned())
    }

    async fn beacon_committees_for_slot_range(
        &self,
        min_slot: Slot,
        max_slot: Slot,
    ) -> Result<Vec<BeaconCommittee>, IndexerError> {
        if min_slot >= max_slot {
            return Ok(vec![]);
        }
        let state = self.lock()?;
        Ok(state
            .committees
            .range((min_slot, 0)..(max_slot, 0))
            .map(|(_, c)| c.clone())
            .collect())
    }
}
