//! Batch Deleter: purges a connector's rows in bounded batches.
//!
//! Each batch is its own statement, so progress already committed survives a
//! crash or a cancellation between batches.

use std::sync::Arc;

use paysync_core::cancel::CancelFlag;
use paysync_core::error::Result;
use paysync_core::traits::{Heartbeat, Storage};
use paysync_core::types::{ConnectorId, EntityKind};

pub const DEFAULT_BATCH_SIZE: u32 = 1000;

pub struct BatchDeleter {
    storage: Arc<dyn Storage>,
    batch_size: u32,
    heartbeat: Arc<dyn Heartbeat>,
    cancel: CancelFlag,
}

impl BatchDeleter {
    pub fn new(storage: Arc<dyn Storage>, batch_size: u32, heartbeat: Arc<dyn Heartbeat>) -> Self {
        Self {
            storage,
            batch_size: batch_size.max(1),
            heartbeat,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Delete every row of `kind` owned by the connector. Returns rows deleted.
    pub async fn delete_for_connector(&self, kind: EntityKind, connector: &ConnectorId) -> Result<u64> {
        let step = format!("delete {kind} for {connector}");
        let mut total = 0u64;
        loop {
            self.cancel.check(&step)?;
            let n = self
                .storage
                .batch_delete_by_connector(kind, connector, self.batch_size)
                .await?;
            if n == 0 {
                break;
            }
            total += n;
            self.heartbeat.record(&step, total);
            tracing::debug!("🗑️ {step}: {total} rows so far");
        }
        if total > 0 {
            tracing::info!("🗑️ Deleted {total} {kind} rows for {connector}");
        }
        Ok(total)
    }

    /// Purge every entity kind. Kinds are independent, so they run concurrently;
    /// the first error wins.
    pub async fn delete_all_for_connector(&self, connector: &ConnectorId) -> Result<u64> {
        let counts = futures::future::try_join_all(
            EntityKind::ALL
                .iter()
                .map(|kind| self.delete_for_connector(*kind, connector)),
        )
        .await?;
        let total = counts.iter().sum();
        tracing::info!("✅ Purged {total} rows for {connector}");
        Ok(total)
    }
}
