//! beaconindex-core — foundation for the beacon-chain indexing engine.
//!
//! # Architecture
//!
//! ```text
//! head update → BeaconCommitteesService (single-flight catch-up)
//!                      ├── ChainClock        (slot ↔ epoch)
//!                      ├── ProgressManager   (last processed epoch)
//!                      ├── CommitteeFetcher  (upstream client)
//!                      ├── ChainDb           (transactional writer)
//!                      └── Monitor           (observability port)
//!
//! canonicalisation process → BlockStore (empty slots, indeterminate blocks)
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod progress;
pub mod store;
pub mod types;

pub use clock::ChainClock;
pub use config::{CommitMode, SyncConfig};
pub use error::IndexerError;
pub use logging::{init_tracing, LogConfig};
pub use monitor::{Monitor, NullMonitor, OtelMonitor};
pub use progress::{ProgressManager, ProgressMetadata};
pub use store::{BlockStore, ChainDb, CommitteeStore, StoreTransaction};
pub use types::{BeaconCommittee, Block, Canonicality, Epoch, Root, Slot};
