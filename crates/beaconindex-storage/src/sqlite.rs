//! SQLite storage backend for BeaconIndex.
//!
//! Persists blocks, beacon committees and handler metadata to a single SQLite
//! file. Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use beaconindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./index.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};
use tracing::debug;

use beaconindex_core::error::IndexerError;
use beaconindex_core::store::{
    check_empty_slots_range, check_storable_slot, slot_bound, BlockStore, ChainDb,
    CommitteeStore, StoreTransaction,
};
use beaconindex_core::types::{BeaconCommittee, Block, Canonicality, CommitteeIndex, Root, Slot};

const BLOCK_COLUMNS: &str = "slot, proposer_index, root, graffiti, randao_reveal, body_root,
    parent_root, state_root, canonical, eth1_block_hash, eth1_deposit_count, eth1_deposit_root";

fn storage_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// SQLite-backed chain database.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./index.db"`) or a full
    /// SQLite URL (`"sqlite:./index.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Limited to a single pooled connection that is never recycled, since
    /// every SQLite connection to `:memory:` is a separate database.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and indexes, enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS t_blocks (
                slot               INTEGER NOT NULL,
                proposer_index     INTEGER NOT NULL,
                root               BLOB    NOT NULL,
                graffiti           BLOB    NOT NULL,
                randao_reveal      BLOB    NOT NULL,
                body_root          BLOB    NOT NULL,
                parent_root        BLOB    NOT NULL,
                state_root         BLOB    NOT NULL,
                canonical          BOOLEAN,
                eth1_block_hash    BLOB    NOT NULL,
                eth1_deposit_count INTEGER NOT NULL,
                eth1_deposit_root  BLOB    NOT NULL,
                UNIQUE (slot, root)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_blocks_root ON t_blocks (root);")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_blocks_parent_root ON t_blocks (parent_root);")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        // Worklist of the canonicalisation process
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_blocks_indeterminate
             ON t_blocks (slot) WHERE canonical IS NULL;",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS t_beacon_committees (
                slot            INTEGER NOT NULL,
                committee_index INTEGER NOT NULL,
                committee       TEXT    NOT NULL,
                PRIMARY KEY (slot, committee_index)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS t_metadata (
                key   TEXT NOT NULL PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!("SqliteStorage schema initialized");
        Ok(())
    }

    /// Get the underlying connection pool (for custom queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_blocks(&self, sql: &str, binds: &[i64]) -> Result<Vec<Block>, IndexerError> {
        let mut query = sqlx::query(sql);
        for b in binds {
            query = query.bind(*b);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(storage_err)?;
        rows.iter().map(block_from_row).collect()
    }
}

fn block_from_row(row: &SqliteRow) -> Result<Block, IndexerError> {
    let root = |name: &str| -> Result<Root, IndexerError> {
        let bytes: Vec<u8> = row.try_get(name).map_err(storage_err)?;
        Root::from_slice(&bytes)
    };
    Ok(Block {
        slot: row.try_get::<i64, _>("slot").map_err(storage_err)? as u64,
        proposer_index: row.try_get::<i64, _>("proposer_index").map_err(storage_err)? as u64,
        root: root("root")?,
        graffiti: row.try_get("graffiti").map_err(storage_err)?,
        randao_reveal: row.try_get("randao_reveal").map_err(storage_err)?,
        body_root: root("body_root")?,
        parent_root: root("parent_root")?,
        state_root: root("state_root")?,
        canonical: Canonicality::from_column(row.try_get("canonical").map_err(storage_err)?),
        eth1_block_hash: row.try_get("eth1_block_hash").map_err(storage_err)?,
        eth1_deposit_count: row.try_get::<i64, _>("eth1_deposit_count").map_err(storage_err)? as u64,
        eth1_deposit_root: root("eth1_deposit_root")?,
    })
}

fn committee_from_row(row: &SqliteRow) -> Result<BeaconCommittee, IndexerError> {
    let members: String = row.try_get("committee").map_err(storage_err)?;
    Ok(BeaconCommittee {
        slot: row.try_get::<i64, _>("slot").map_err(storage_err)? as u64,
        index: row.try_get::<i64, _>("committee_index").map_err(storage_err)? as u64,
        committee: serde_json::from_str(&members)
            .map_err(|e| IndexerError::Storage(format!("decode committee members: {e}")))?,
    })
}

// ─── Transactions ────────────────────────────────────────────────────────────

/// Open transaction against [`SqliteStorage`]. Rolls back on drop unless
/// committed.
pub struct SqliteTx {
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
}

impl SqliteTx {
    fn conn(&mut self) -> Result<&mut SqliteConnection, IndexerError> {
        self.tx.as_deref_mut().ok_or(IndexerError::TransactionClosed)
    }
}

#[async_trait]
impl StoreTransaction for SqliteTx {
    async fn set_block(&mut self, block: &Block) -> Result<(), IndexerError> {
        check_storable_slot(block.slot)?;
        sqlx::query(
            "INSERT INTO t_blocks (slot, proposer_index, root, graffiti, randao_reveal, body_root,
                                 parent_root, state_root, canonical, eth1_block_hash,
                                 eth1_deposit_count, eth1_deposit_root)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (slot, root) DO UPDATE SET
                proposer_index     = excluded.proposer_index,
                graffiti           = excluded.graffiti,
                randao_reveal      = excluded.randao_reveal,
                state_root         = excluded.state_root,
                canonical          = excluded.canonical,
                eth1_block_hash    = excluded.eth1_block_hash,
                eth1_deposit_count = excluded.eth1_deposit_count,
                eth1_deposit_root  = excluded.eth1_deposit_root",
        )
        .bind(block.slot as i64)
        .bind(block.proposer_index as i64)
        .bind(block.root.as_bytes())
        .bind(block.graffiti.as_slice())
        .bind(block.randao_reveal.as_slice())
        .bind(block.body_root.as_bytes())
        .bind(block.parent_root.as_bytes())
        .bind(block.state_root.as_bytes())
        .bind(block.canonical.to_column())
        .bind(block.eth1_block_hash.as_slice())
        .bind(block.eth1_deposit_count as i64)
        .bind(block.eth1_deposit_root.as_bytes())
        .execute(self.conn()?)
        .await
        .map_err(storage_err)?;

        debug!(slot = block.slot, root = %block.root, "block stored");
        Ok(())
    }

    async fn set_beacon_committee(&mut self, committee: &BeaconCommittee) -> Result<(), IndexerError> {
        check_storable_slot(committee.slot)?;
        let members = serde_json::to_string(&committee.committee)
            .map_err(|e| IndexerError::Storage(format!("encode committee members: {e}")))?;

        sqlx::query(
            "INSERT INTO t_beacon_committees (slot, committee_index, committee)
             VALUES (?, ?, ?)
             ON CONFLICT (slot, committee_index) DO UPDATE SET committee = excluded.committee",
        )
        .bind(committee.slot as i64)
        .bind(committee.index as i64)
        .bind(&members)
        .execute(self.conn()?)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn set_metadata(&mut self, key: &str, value: &serde_json::Value) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT INTO t_metadata (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value.to_string())
        .execute(self.conn()?)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn commit(&mut self) -> Result<(), IndexerError> {
        let tx = self.tx.take().ok_or(IndexerError::TransactionClosed)?;
        tx.commit()
            .await
            .map_err(|e| IndexerError::Storage(format!("commit: {e}")))
    }

    async fn rollback(&mut self) -> Result<(), IndexerError> {
        let tx = self.tx.take().ok_or(IndexerError::TransactionClosed)?;
        tx.rollback()
            .await
            .map_err(|e| IndexerError::Storage(format!("rollback: {e}")))
    }
}

// ─── ChainDb / query impls ───────────────────────────────────────────────────

#[async_trait]
impl ChainDb for SqliteStorage {
    async fn begin_tx(&self) -> Result<Box<dyn StoreTransaction>, IndexerError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| IndexerError::Storage(format!("begin: {e}")))?;
        Ok(Box::new(SqliteTx { tx: Some(tx) }))
    }

    async fn metadata(&self, key: &str) -> Result<Option<serde_json::Value>, IndexerError> {
        let row = sqlx::query("SELECT value FROM t_metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        row.map(|r| {
            let text: String = r.try_get("value").map_err(storage_err)?;
            serde_json::from_str(&text)
                .map_err(|e| IndexerError::Metadata(format!("decode metadata '{key}': {e}")))
        })
        .transpose()
    }
}

#[async_trait]
impl BlockStore for SqliteStorage {
    async fn blocks_by_slot(&self, slot: Slot) -> Result<Vec<Block>, IndexerError> {
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM t_blocks WHERE slot = ?");
        self.fetch_blocks(&sql, &[slot_bound(slot)]).await
    }

    async fn block_by_root(&self, root: &Root) -> Result<Option<Block>, IndexerError> {
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM t_blocks WHERE root = ? LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(root.as_bytes())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn blocks_by_parent_root(&self, parent_root: &Root) -> Result<Vec<Block>, IndexerError> {
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM t_blocks WHERE parent_root = ? ORDER BY slot");
        let rows = sqlx::query(&sql)
            .bind(parent_root.as_bytes())
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(block_from_row).collect()
    }

    async fn blocks_for_slot_range(&self, min_slot: Slot, max_slot: Slot) -> Result<Vec<Block>, IndexerError> {
        let sql = format!(
            "SELECT {BLOCK_COLUMNS} FROM t_blocks WHERE slot >= ? AND slot < ? ORDER BY slot, root"
        );
        self.fetch_blocks(&sql, &[slot_bound(min_slot), slot_bound(max_slot)]).await
    }

    async fn empty_slots(&self, min_slot: Slot, max_slot: Slot) -> Result<Vec<Slot>, IndexerError> {
        if min_slot > max_slot {
            return Ok(vec![]);
        }
        check_empty_slots_range(min_slot, max_slot)?;
        let rows = sqlx::query(
            "WITH RECURSIVE series(slot) AS (
                SELECT ?
                UNION ALL
                SELECT slot + 1 FROM series WHERE slot < ?
             )
             SELECT series.slot AS slot
             FROM series
             LEFT JOIN t_blocks ON t_blocks.slot = series.slot
             WHERE t_blocks.slot IS NULL
             ORDER BY series.slot",
        )
        .bind(slot_bound(min_slot))
        .bind(slot_bound(max_slot))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|r| r.try_get::<i64, _>("slot").map(|s| s as u64).map_err(storage_err))
            .collect()
    }

    async fn indeterminate_blocks(&self, min_slot: Slot, max_slot: Slot) -> Result<Vec<Root>, IndexerError> {
        let rows = sqlx::query(
            "SELECT root FROM t_blocks
             WHERE slot >= ? AND slot < ? AND canonical IS NULL
             ORDER BY slot",
        )
        .bind(slot_bound(min_slot))
        .bind(slot_bound(max_slot))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|r| {
                let bytes: Vec<u8> = r.try_get("root").map_err(storage_err)?;
                Root::from_slice(&bytes)
            })
            .collect()
    }

    async fn latest_canonical_block(&self) -> Result<Option<Block>, IndexerError> {
        let sql = format!(
            "SELECT {BLOCK_COLUMNS} FROM t_blocks WHERE canonical = 1 ORDER BY slot DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(block_from_row).transpose()
    }
}

#[async_trait]
impl CommitteeStore for SqliteStorage {
    async fn beacon_committee_by_slot_and_index(
        &self,
        slot: Slot,
        index: CommitteeIndex,
    ) -> Result<Option<BeaconCommittee>, IndexerError> {
        let row = sqlx::query(
            "SELECT slot, committee_index, committee FROM t_beacon_committees
             WHERE slot = ? AND committee_index = ?",
        )
        .bind(slot_bound(slot))
        .bind(index as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.as_ref().map(committee_from_row).transpose()
    }

    async fn beacon_committees_for_slot_range(
        &self,
        min_slot: Slot,
        max_slot: Slot,
    ) -> Result<Vec<BeaconCommittee>, IndexerError> {
        let rows = sqlx::query(
            "SELECT slot, committee_index, committee FROM t_beacon_committees
             WHERE slot >= ? AND slot < ?
             ORDER BY slot, committee_index",
        )
        .bind(slot_bound(min_slot))
        .bind(slot_bound(max_slot))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(committee_from_row).collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
