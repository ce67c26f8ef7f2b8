//! Chain clock — maps wall-clock time, slots and epochs onto each other.

use chrono::Utc;

use crate::error::IndexerError;
use crate::types::{Epoch, Slot};

/// Stateless slot/epoch arithmetic for a chain with a fixed genesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainClock {
    genesis_time: i64,
    seconds_per_slot: u64,
    slots_per_epoch: u64,
}

impl ChainClock {
    /// Create a clock; both durations must be non-zero.
    pub fn new(
        genesis_time: i64,
        seconds_per_slot: u64,
        slots_per_epoch: u64,
    ) -> Result<Self, IndexerError> {
        if seconds_per_slot == 0 {
            return Err(IndexerError::Config("seconds_per_slot must be non-zero".into()));
        }
        if slots_per_epoch == 0 {
            return Err(IndexerError::Config("slots_per_epoch must be non-zero".into()));
        }
        Ok(Self {
            genesis_time,
            seconds_per_slot,
            slots_per_epoch,
        })
    }

    pub fn slot_to_epoch(&self, slot: Slot) -> Epoch {
        slot / self.slots_per_epoch
    }

    pub fn first_slot_of_epoch(&self, epoch: Epoch) -> Slot {
        epoch.saturating_mul(self.slots_per_epoch)
    }

    /// The slot in progress at `timestamp` (unix seconds); 0 before genesis.
    pub fn slot_at(&self, timestamp: i64) -> Slot {
        if timestamp <= self.genesis_time {
            return 0;
        }
        (timestamp - self.genesis_time) as u64 / self.seconds_per_slot
    }

    pub fn current_slot(&self) -> Slot {
        self.slot_at(Utc::now().timestamp())
    }

    pub fn current_epoch(&self) -> Epoch {
        self.slot_to_epoch(self.current_slot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mainnet() -> ChainClock {
        ChainClock::new(1_606_824_023, 12, 32).unwrap()
    }

    #[test]
    fn slot_epoch_mapping() {
        let clock = mainnet();
        assert_eq!(clock.slot_to_epoch(0), 0);
        assert_eq!(clock.slot_to_epoch(31), 0);
        assert_eq!(clock.slot_to_epoch(32), 1);
        assert_eq!(clock.first_slot_of_epoch(13), 416);
    }

    #[test]
    fn slot_at_time() {
        let clock = mainnet();
        assert_eq!(clock.slot_at(0), 0); // before genesis
        assert_eq!(clock.slot_at(1_606_824_023 + 11), 0);
        assert_eq!(clock.slot_at(1_606_824_023 + 12), 1);
        assert_eq!(clock.slot_at(1_606_824_023 + 12 * 64), 64);
    }

    #[test]
    fn zero_durations_rejected() {
        assert!(ChainClock::new(0, 0, 32).is_err());
        assert!(ChainClock::new(0, 12, 0).is_err());
    }
}
