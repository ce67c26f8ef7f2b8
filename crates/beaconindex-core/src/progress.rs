//! Progress metadata — the last epoch a handler fully ingested.
//!
//! Each handler kind persists one metadata document under its own key. On
//! every trigger the handler resumes from the stored value rather than from
//! scratch, so missed notifications and restarts are recovered by catch-up.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::store::{ChainDb, StoreTransaction};
use crate::types::Epoch;

/// Persisted progress for one handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMetadata {
    /// Last epoch whose data was fully committed; `None` before the first run.
    pub last_processed_epoch: Option<Epoch>,
    /// Unix timestamp of the last update.
    #[serde(default)]
    pub updated_at: i64,
}

impl ProgressMetadata {
    /// First epoch still to be processed.
    pub fn next_epoch(&self, start_epoch: Epoch) -> Epoch {
        match self.last_processed_epoch {
            Some(epoch) => epoch + 1,
            None => start_epoch,
        }
    }
}

/// Reads and advances the progress metadata of a single handler.
pub struct ProgressManager {
    db: Arc<dyn ChainDb>,
    handler_id: String,
}

impl ProgressManager {
    pub fn new(db: Arc<dyn ChainDb>, handler_id: impl Into<String>) -> Self {
        Self {
            db,
            handler_id: handler_id.into(),
        }
    }

    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    /// Load the stored progress (default when none was ever saved).
    pub async fn load(&self) -> Result<ProgressMetadata, IndexerError> {
        let value = self
            .db
            .metadata(&self.handler_id)
            .await
            .map_err(|e| IndexerError::Metadata(format!("failed to read metadata: {e}")))?;
        match value {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| IndexerError::Metadata(format!("failed to decode metadata: {e}"))),
            None => Ok(ProgressMetadata::default()),
        }
    }

    /// Record `epoch` as processed within the caller's transaction.
    pub async fn advance_in(
        &self,
        tx: &mut dyn StoreTransaction,
        epoch: Epoch,
    ) -> Result<ProgressMetadata, IndexerError> {
        let md = ProgressMetadata {
            last_processed_epoch: Some(epoch),
            updated_at: chrono::Utc::now().timestamp(),
        };
        let value = serde_json::to_value(&md)
            .map_err(|e| IndexerError::Metadata(format!("failed to encode metadata: {e}")))?;
        tx.set_metadata(&self.handler_id, &value)
            .await
            .map_err(|e| e.context("failed to set metadata"))?;
        Ok(md)
    }

    /// Record `epoch` as processed in a transaction of its own.
    pub async fn advance(&self, epoch: Epoch) -> Result<ProgressMetadata, IndexerError> {
        let mut tx = self
            .db
            .begin_tx()
            .await
            .map_err(|e| e.context("failed to begin transaction for metadata"))?;
        let md = match self.advance_in(tx.as_mut(), epoch).await {
            Ok(md) => md,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        };
        tx.commit()
            .await
            .map_err(|e| e.context("failed to commit metadata"))?;
        tracing::debug!(handler = %self.handler_id, epoch, "Advanced progress");
        Ok(md)
    }
}
