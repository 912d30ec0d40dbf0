//! Synchronous, ledger-guarded event publication for low-volume events
//! that are emitted inline with a workflow step (connector reset, task updates).

use std::sync::Arc;

use paysync_core::error::Result;
use paysync_core::traits::{MessageBus, Storage};
use paysync_core::types::{outbox_types, ConnectorId, EventId, EventMessage, EventSent};

use crate::outbox::bus_event_type;

pub struct EventSender {
    storage: Arc<dyn Storage>,
    bus: Arc<dyn MessageBus>,
}

impl EventSender {
    pub fn new(storage: Arc<dyn Storage>, bus: Arc<dyn MessageBus>) -> Self {
        Self { storage, bus }
    }

    /// Publish the event built by `build` unless `id` is already in the sent
    /// ledger. Returns `true` if a message went out.
    ///
    /// Delivery is at-least-once: if the publish succeeds and the ledger write
    /// then fails, a retry of the enclosing step (with the same `id`) publishes
    /// again. The message always carries `id.idempotency_key`, so consumers can
    /// drop that duplicate. The outbox path does not have this gap.
    pub async fn send_event<F>(&self, id: &EventId, build: F) -> Result<bool>
    where
        F: FnOnce() -> Result<EventMessage> + Send,
    {
        if self.storage.events_sent_exists(id).await? {
            tracing::debug!("⏭️ Event {id} already sent");
            return Ok(false);
        }

        let mut message = build()?;
        message.idempotency_key = id.idempotency_key.clone();
        self.bus.publish(&message).await?;
        self.storage.events_sent_upsert(&EventSent::now(id.clone())).await?;
        tracing::info!("📨 Event {} sent ({})", id, message.event_type);
        Ok(true)
    }

    /// Announce that a connector's checkpoints were wiped.
    pub async fn send_connector_reset(&self, connector: &ConnectorId, at: chrono::DateTime<chrono::Utc>) -> Result<bool> {
        let id = EventId::new(
            format!("{}-{}", connector, at.timestamp_micros()),
            Some(connector.clone()),
        );
        let event_type = bus_event_type(outbox_types::CONNECTOR_RESET).unwrap_or(outbox_types::CONNECTOR_RESET);
        let payload = serde_json::json!({
            "connector_id": connector.to_string(),
            "at": at.to_rfc3339(),
        });
        self.send_event(&id, || Ok(EventMessage::new(id.idempotency_key.clone(), event_type, payload)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MemoryBus;
    use crate::persistence::SyncDb;
    use paysync_core::error::SyncError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn sender() -> (Arc<SyncDb>, Arc<MemoryBus>, EventSender) {
        let db = Arc::new(SyncDb::open_in_memory().unwrap());
        let bus = Arc::new(MemoryBus::new());
        (db.clone(), bus.clone(), EventSender::new(db, bus))
    }

    #[tokio::test]
    async fn test_second_send_is_noop() {
        let (db, bus, sender) = sender();
        let id = EventId::new("task-42-updated", Some(ConnectorId::new("dummypay")));
        let builds = AtomicU32::new(0);
        let build = || {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(EventMessage::new("ignored", "UPDATED_TASK", serde_json::json!({"id": 42})))
        };

        assert!(sender.send_event(&id, build).await.unwrap());
        assert!(!sender.send_event(&id, build).await.unwrap());
        assert_eq!(bus.count(), 1);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(bus.published()[0].idempotency_key, "task-42-updated");
        assert!(db.events_sent_exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_publish_leaves_no_ledger_row() {
        let (db, bus, sender) = sender();
        let id = EventId::new("k", None);
        bus.set_fail_all(true);
        let err = sender
            .send_event(&id, || Ok(EventMessage::new("k", "UPDATED_TASK", serde_json::json!({}))))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!db.events_sent_exists(&id).await.unwrap());

        bus.set_fail_all(false);
        assert!(sender
            .send_event(&id, || Ok(EventMessage::new("k", "UPDATED_TASK", serde_json::json!({}))))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_builder_error_propagates() {
        let (_db, bus, sender) = sender();
        let err = sender
            .send_event(&EventId::new("b", None), || Err(SyncError::InvalidArgument("no payload".into())))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "INVALID_ARGUMENT");
        assert_eq!(bus.count(), 0);
    }

    #[tokio::test]
    async fn test_connector_reset_event() {
        let (_db, bus, sender) = sender();
        let connector = ConnectorId::new("dummypay");
        let at = chrono::Utc::now();
        assert!(sender.send_connector_reset(&connector, at).await.unwrap());
        assert!(!sender.send_connector_reset(&connector, at).await.unwrap());
        let msg = &bus.published()[0];
        assert_eq!(msg.event_type, "CONNECTOR_RESET");
        assert!(msg.idempotency_key.starts_with(&connector.to_string()));
    }
}
