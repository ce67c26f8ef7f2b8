//! beaconindex-committees — beacon committee fetcher and catch-up sync service.

pub mod builder;
pub mod fetcher;
pub mod service;

pub use builder::ServiceBuilder;
pub use fetcher::{committees_from_json, CommitteeFetcher, CommitteesProvider};
pub use service::{BeaconCommitteesService, SyncOutcome};
