//! Error types for the beaconindex pipeline.

use thiserror::Error;

/// Errors that can occur while ingesting or querying chain data.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// The upstream chain-node client failed (transient or permanent).
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// Progress metadata could not be read, written or decoded.
    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The transaction was already committed or rolled back.
    #[error("transaction already finished")]
    TransactionClosed,

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the next head update is expected to clear the error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::Storage(_))
    }

    /// Prefix the error message with the operation that was being performed.
    pub fn context(self, op: &str) -> Self {
        match self {
            Self::Upstream(m) => Self::Upstream(format!("{op}: {m}")),
            Self::Storage(m) => Self::Storage(format!("{op}: {m}")),
            Self::Metadata(m) => Self::Metadata(format!("{op}: {m}")),
            Self::Config(m) => Self::Config(format!("{op}: {m}")),
            Self::Other(m) => Self::Other(format!("{op}: {m}")),
            Self::TransactionClosed => Self::Storage(format!("{op}: transaction already finished")),
        }
    }
}
