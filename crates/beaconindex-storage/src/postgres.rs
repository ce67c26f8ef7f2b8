//! PostgreSQL storage backend for BeaconIndex.
//!
//! Persists blocks, beacon committees and handler metadata to PostgreSQL.
//! Uses `sqlx` with connection pooling for production deployments where
//! several handlers share the same tables.
//!
//! # Feature Flag
//! Requires the `postgres` feature:
//! ```toml
//! beaconindex-storage = { version = "0.1", features = ["postgres"] }
//! ```
//!
//! # Schema
//! The storage creates these tables automatically on first connect:
//! - `t_blocks` — blocks keyed by (slot, root) with a nullable canonical flag
//! - `t_beacon_committees` — validator assignments keyed by (slot, index)
//! - `t_metadata` — per-handler JSON progress documents

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, info};

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

// ─── Connection options ────────────────────────────────────────────────────────

/// Connection options for the Postgres storage backend.
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: u32,
    /// Minimum number of idle connections to keep open (default: 1)
    pub min_connections: u32,
    /// Connection timeout in seconds (default: 30)
    pub connect_timeout_secs: u64,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 30,
        }
    }
}

// ─── PostgresStorage ─────────────────────────────────────────────────────────

/// PostgreSQL-backed chain database.
///
/// Thread-safe and cheaply cloneable — wraps a connection pool internally.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect to a PostgreSQL database and initialize the schema.
    ///
    /// The URL format follows libpq convention:
    /// `postgresql://[user[:password]@][host][:port][/dbname]`
    pub async fn connect(database_url: &str) -> Result<Self, IndexerError> {
        Self::connect_with_options(database_url, PostgresOptions::default()).await
    }

    /// Connect with custom pool options.
    pub async fn connect_with_options(
        database_url: &str,
        opts: PostgresOptions,
    ) -> Result<Self, IndexerError> {
        let pool = PgPoolOptions::new()
            .max_connections(opts.max_connections)
            .min_connections(opts.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(opts.connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| IndexerError::Storage(format!("postgres connect: {e}")))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        info!("PostgresStorage connected and schema initialized");
        Ok(storage)
    }

    /// Create tables and indexes if they don't already exist.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS t_blocks (
                slot               BIGINT  NOT NULL,
                proposer_index     BIGINT  NOT NULL,
                root               BYTEA   NOT NULL,
                graffiti           BYTEA   NOT NULL,
                randao_reveal      BYTEA   NOT NULL,
                body_root          BYTEA   NOT NULL,
                parent_root        BYTEA   NOT NULL,
                state_root         BYTEA   NOT NULL,
                canonical          BOOLEAN,
                eth1_block_hash    BYTEA   NOT NULL,
                eth1_deposit_count BIGINT  NOT NULL,
                eth1_deposit_root  BYTEA   NOT NULL,
                UNIQUE (slot, root)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS i_blocks_root ON t_blocks(root)",
            "CREATE INDEX IF NOT EXISTS i_blocks_parent_root ON t_blocks(parent_root)",
            "CREATE INDEX IF NOT EXISTS i_blocks_indeterminate ON t_blocks(slot) WHERE canonical IS NULL",
        ] {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS t_beacon_committees (
                slot            BIGINT   NOT NULL,
                committee_index BIGINT   NOT NULL,
                committee       BIGINT[] NOT NULL,
                PRIMARY KEY (slot, committee_index)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS t_metadata (
                key   TEXT  PRIMARY KEY,
                value JSONB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!("PostgresStorage schema initialized");
        Ok(())
    }

    /// Get the underlying connection pool (for custom queries).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn block_from_row(row: &PgRow) -> Result<Block, IndexerError> {
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

fn committee_from_row(row: &PgRow) -> Result<BeaconCommittee, IndexerError> {
    let members: Vec<i64> = row.try_get("committee").map_err(storage_err)?;
    Ok(BeaconCommittee {
        slot: row.try_get::<i64, _>("slot").map_err(storage_err)? as u64,
        index: row.try_get::<i64, _>("committee_index").map_err(storage_err)? as u64,
        committee: members.into_iter().map(|v| v as u64).collect(),
    })
}

// ─── Transactions ────────────────────────────────────────────────────────────

/// Open transaction against [`PostgresStorage`]. Rolls back on drop unless
/// committed.
pub struct PostgresTx {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresTx {
    fn conn(&mut self) -> Result<&mut PgConnection, IndexerError> {
        self.tx.as_deref_mut().ok_or(IndexerError::TransactionClosed)
    }
}

#[async_trait]
impl StoreTransaction for PostgresTx {
    async fn set_block(&mut self, block: &Block) -> Result<(), IndexerError> {
        check_storable_slot(block.slot)?;
        sqlx::query(
            "INSERT INTO t_blocks (slot, proposer_index, root, graffiti, randao_reveal, body_root,
                                   parent_root, state_root, canonical, eth1_block_hash,
                                   eth1_deposit_count, eth1_deposit_root)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
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

        Ok(())
    }

    async fn set_beacon_committee(&mut self, committee: &BeaconCommittee) -> Result<(), IndexerError> {
        check_storable_slot(committee.slot)?;
        let members: Vec<i64> = committee.committee.iter().map(|v| *v as i64).collect();
        sqlx::query(
            "INSERT INTO t_beacon_committees (slot, committee_index, committee)
             VALUES ($1, $2, $3)
             ON CONFLICT (slot, committee_index) DO UPDATE SET committee = excluded.committee",
        )
        .bind(committee.slot as i64)
        .bind(committee.index as i64)
        .bind(members)
        .execute(self.conn()?)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn set_metadata(&mut self, key: &str, value: &serde_json::Value) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT INTO t_metadata (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
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
impl ChainDb for PostgresStorage {
    async fn begin_tx(&self) -> Result<Box<dyn StoreTransaction>, IndexerError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| IndexerError::Storage(format!("begin: {e}")))?;
        Ok(Box::new(PostgresTx { tx: Some(tx) }))
    }

    async fn metadata(&self, key: &str) -> Result<Option<serde_json::Value>, IndexerError> {
        let row = sqlx::query("SELECT value FROM t_metadata WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        row.map(|r| r.try_get::<serde_json::Value, _>("value").map_err(storage_err))
            .transpose()
    }
}

#[async_trait]
impl BlockStore for PostgresStorage {
    async fn blocks_by_slot(&self, slot: Slot) -> Result<Vec<Block>, IndexerError> {
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM t_blocks WHERE slot = $1");
        let rows = sqlx::query(&sql)
            .bind(slot_bound(slot))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(block_from_row).collect()
    }

    async fn block_by_root(&self, root: &Root) -> Result<Option<Block>, IndexerError> {
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM t_blocks WHERE root = $1 LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(root.as_bytes())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn blocks_by_parent_root(&self, parent_root: &Root) -> Result<Vec<Block>, IndexerError> {
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM t_blocks WHERE parent_root = $1 ORDER BY slot");
        let rows = sqlx::query(&sql)
            .bind(parent_root.as_bytes())
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(block_from_row).collect()
    }

    async fn blocks_for_slot_range(&self, min_slot: Slot, max_slot: Slot) -> Result<Vec<Block>, IndexerError> {
        let sql = format!(
            "SELECT {BLOCK_COLUMNS} FROM t_blocks WHERE slot >= $1 AND slot < $2 ORDER BY slot, root"
        );
        let rows = sqlx::query(&sql)
            .bind(slot_bound(min_slot))
            .bind(slot_bound(max_slot))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(block_from_row).collect()
    }

    async fn empty_slots(&self, min_slot: Slot, max_slot: Slot) -> Result<Vec<Slot>, IndexerError> {
        if min_slot > max_slot {
            return Ok(vec![]);
        }
        check_empty_slots_range(min_slot, max_slot)?;
        let rows = sqlx::query(
            "SELECT missed
             FROM generate_series($1::BIGINT, $2::BIGINT, 1) missed
             LEFT JOIN t_blocks ON missed = t_blocks.slot
             WHERE t_blocks.slot IS NULL
             ORDER BY missed",
        )
        .bind(slot_bound(min_slot))
        .bind(slot_bound(max_slot))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|r| r.try_get::<i64, _>("missed").map(|s| s as u64).map_err(storage_err))
            .collect()
    }

    async fn indeterminate_blocks(&self, min_slot: Slot, max_slot: Slot) -> Result<Vec<Root>, IndexerError> {
        let rows = sqlx::query(
            "SELECT root FROM t_blocks
             WHERE slot >= $1 AND slot < $2 AND canonical IS NULL
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
            "SELECT {BLOCK_COLUMNS} FROM t_blocks WHERE canonical = true ORDER BY slot DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(block_from_row).transpose()
    }
}

#[async_trait]
impl CommitteeStore for PostgresStorage {
    async fn beacon_committee_by_slot_and_index(
        &self,
        slot: Slot,
        index: CommitteeIndex,
    ) -> Result<Option<BeaconCommittee>, IndexerError> {
        let row = sqlx::query(
            "SELECT slot, committee_index, committee FROM t_beacon_committees
             WHERE slot = $1 AND committee_index = $2",
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
             WHERE slot >= $1 AND slot < $2
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

#[cfg(test)]
mod tests {
    // Integration tests require a running PostgreSQL instance.
    // Set DATABASE_URL environment variable to enable.
    // Example: DATABASE_URL=postgresql://localhost/beaconindex_test cargo test --features postgres

    use super::*;

    fn block(slot: Slot, root: u8, parent: u8) -> Block {
        Block {
            slot,
            proposer_index: 1,
            root: Root([root; 32]),
            graffiti: vec![],
            randao_reveal: vec![0u8; 96],
            body_root: Root::ZERO,
            parent_root: Root([parent; 32]),
            state_root: Root::ZERO,
            canonical: Canonicality::Unknown,
            eth1_block_hash: vec![],
            eth1_deposit_count: 0,
            eth1_deposit_root: Root::ZERO,
        }
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn test_postgres_canonical_queries() {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for integration tests");
        let store = PostgresStorage::connect(&url).await.unwrap();
        let base = 9_000_000_000u64; // clear of any real data

        let mut tx = store.begin_tx().await.unwrap();
        for b in [block(base, 0xa1, 0xa0), block(base + 2, 0xa2, 0xa1), block(base + 4, 0xa3, 0xa1)] {
            tx.set_block(&b).await.unwrap();
        }
        tx.commit().await.unwrap();

        assert_eq!(
            store.empty_slots(base, base + 5).await.unwrap(),
            vec![base + 1, base + 3, base + 5]
        );
        assert_eq!(store.indeterminate_blocks(base, base + 5).await.unwrap().len(), 3);
        assert_eq!(store.blocks_by_parent_root(&Root([0xa1; 32])).await.unwrap().len(), 2);

        sqlx::query("DELETE FROM t_blocks WHERE slot >= $1")
            .bind(base as i64)
            .execute(store.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn test_postgres_committee_and_metadata() {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for integration tests");
        let store = PostgresStorage::connect(&url).await.unwrap();

        let mut tx = store.begin_tx().await.unwrap();
        tx.set_beacon_committee(&BeaconCommittee { slot: 416, index: 3, committee: vec![10, 2, 7] })
            .await
            .unwrap();
        tx.set_metadata("test.handler", &serde_json::json!({"last_processed_epoch": 13}))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let c = store.beacon_committee_by_slot_and_index(416, 3).await.unwrap().unwrap();
        assert_eq!(c.committee, vec![10, 2, 7]);
        let md = store.metadata("test.handler").await.unwrap().unwrap();
        assert_eq!(md["last_processed_epoch"], 13);
    }
}
