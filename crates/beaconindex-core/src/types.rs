//! Shared types for the indexing pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IndexerError;

/// Position of a block in the chain (one per fixed time unit).
pub type Slot = u64;
/// Fixed-size group of consecutive slots.
pub type Epoch = u64;
pub type ValidatorIndex = u64;
pub type CommitteeIndex = u64;

// ─── Root ────────────────────────────────────────────────────────────────────

/// A 32-byte hash tree root.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Root(pub [u8; 32]);

impl Root {
    pub const ZERO: Root = Root([0; 32]);

    /// Build a root from a 32-byte slice (e.g. a BLOB column).
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IndexerError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            IndexerError::Storage(format!("expected 32-byte root, got {} bytes", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Root {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Root({self})")
    }
}

impl FromStr for Root {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| IndexerError::Other(format!("invalid root hex: {e}")))?;
        Self::from_slice(&bytes).map_err(|_| IndexerError::Other(format!("root must be 32 bytes: 0x{s}")))
    }
}

impl Serialize for Root {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Root {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ─── Canonicality ────────────────────────────────────────────────────────────

/// Whether a block is part of the agreed chain history.
///
/// Every block starts out [`Canonicality::Unknown`]; the canonicalisation
/// process later resolves it to `Canonical` or `NonCanonical`. Persisted as a
/// nullable boolean column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Canonicality {
    #[default]
    Unknown,
    Canonical,
    NonCanonical,
}

impl Canonicality {
    /// Column representation: `NULL` for unknown.
    pub fn to_column(self) -> Option<bool> {
        match self {
            Self::Unknown => None,
            Self::Canonical => Some(true),
            Self::NonCanonical => Some(false),
        }
    }

    pub fn from_column(value: Option<bool>) -> Self {
        match value {
            None => Self::Unknown,
            Some(true) => Self::Canonical,
            Some(false) => Self::NonCanonical,
        }
    }

    /// Returns `true` while fork choice has not decided this block.
    pub fn is_indeterminate(self) -> bool {
        self == Self::Unknown
    }
}

impl fmt::Display for Canonicality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Canonical => write!(f, "canonical"),
            Self::NonCanonical => write!(f, "non-canonical"),
        }
    }
}

// ─── Block ───────────────────────────────────────────────────────────────────

/// A beacon block as stored by the indexer. Unique on `(slot, root)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub root: Root,
    /// Raw graffiti bytes as proposed.
    #[serde(with = "hex_bytes")]
    pub graffiti: Vec<u8>,
    /// Raw RANDAO reveal signature bytes.
    #[serde(with = "hex_bytes")]
    pub randao_reveal: Vec<u8>,
    pub body_root: Root,
    pub parent_root: Root,
    pub state_root: Root,
    pub canonical: Canonicality,
    /// Execution-layer block hash voted for by this block.
    #[serde(with = "hex_bytes")]
    pub eth1_block_hash: Vec<u8>,
    pub eth1_deposit_count: u64,
    pub eth1_deposit_root: Root,
}

// ─── BeaconCommittee ─────────────────────────────────────────────────────────

/// Validators assigned to attest at `slot` under committee `index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconCommittee {
    pub slot: Slot,
    pub index: CommitteeIndex,
    /// Ordered validator indices; position is the attestation bit.
    pub committee: Vec<ValidatorIndex>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
