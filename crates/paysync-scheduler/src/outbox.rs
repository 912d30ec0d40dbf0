//! Outbox publisher: drains pending events to the message bus.
//!
//! Successes are settled in one atomic storage call (mark processed +
//! record in the sent ledger). Failures are settled one by one: the retry
//! counter goes up, and a row that is past its budget or can never succeed
//! becomes a dead letter that polling no longer returns. Processed rows stay
//! until the retention loop removes them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use paysync_core::error::{Result, SyncError};
use paysync_core::traits::{MessageBus, Storage};
use paysync_core::types::{outbox_types, EventId, EventMessage, EventSent, OutboxEvent};

use crate::retry::Schedule;

/// Bus-facing name for an outbox event type. `None` means the row can never be published.
pub fn bus_event_type(outbox_type: &str) -> Option<&'static str> {
    match outbox_type {
        outbox_types::ACCOUNT_SAVED => Some("SAVED_ACCOUNT"),
        outbox_types::BALANCE_SAVED => Some("SAVED_BALANCE"),
        outbox_types::BANK_ACCOUNT_SAVED => Some("SAVED_BANK_ACCOUNT"),
        outbox_types::PAYMENT_SAVED => Some("SAVED_PAYMENT"),
        outbox_types::PAYMENT_DELETED => Some("DELETED_PAYMENT"),
        outbox_types::CONNECTOR_RESET => Some("CONNECTOR_RESET"),
        outbox_types::TASK_UPDATED => Some("UPDATED_TASK"),
        _ => None,
    }
}

/// Transport message for an outbox row. Errors here are never retryable.
pub fn build_message(event: &OutboxEvent) -> Result<EventMessage> {
    let event_type = bus_event_type(&event.event_type).ok_or_else(|| {
        SyncError::InvalidArgument(format!("unknown outbox event type '{}'", event.event_type))
    })?;
    let payload: serde_json::Value = serde_json::from_slice(&event.payload)?;
    if !payload.is_object() {
        return Err(SyncError::InvalidArgument(format!(
            "payload of {} is not a JSON object",
            event.id
        )));
    }
    Ok(EventMessage::new(event.id.idempotency_key.clone(), event_type, payload))
}

/// Counts from one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub polled: usize,
    pub published: usize,
    /// Failed but left pending for the next poll.
    pub retried: usize,
    pub dead_lettered: usize,
}

pub struct OutboxPublisher {
    storage: Arc<dyn Storage>,
    bus: Arc<dyn MessageBus>,
    max_retries: u32,
}

impl OutboxPublisher {
    pub fn new(storage: Arc<dyn Storage>, bus: Arc<dyn MessageBus>, max_retries: u32) -> Self {
        Self { storage, bus, max_retries }
    }

    /// Poll up to `limit` pending rows, oldest first, and try to deliver each.
    pub async fn publish_pending(&self, limit: u32) -> Result<PublishReport> {
        let events = self.storage.outbox_poll_pending(limit).await?;
        if events.is_empty() {
            return Ok(PublishReport::default());
        }

        let mut report = PublishReport { polled: events.len(), ..Default::default() };
        let mut delivered: Vec<EventId> = Vec::new();
        let mut failed: Vec<(OutboxEvent, SyncError)> = Vec::new();

        for event in events {
            let outcome = match build_message(&event) {
                Ok(msg) => self.bus.publish(&msg).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => delivered.push(event.id.clone()),
                Err(e) => failed.push((event, e)),
            }
        }

        let mut settle_error = None;
        if !delivered.is_empty() {
            let sent: Vec<EventSent> = delivered.iter().cloned().map(EventSent::now).collect();
            match self
                .storage
                .outbox_mark_processed_and_record_sent(&delivered, &sent)
                .await
            {
                Ok(()) => report.published = delivered.len(),
                Err(e) => {
                    tracing::error!("❌ Failed to settle {} delivered events: {e}", delivered.len());
                    settle_error = Some(e);
                }
            }
        }

        for (event, cause) in failed {
            let retry_count = event.retry_count + 1;
            let dead_letter = !cause.is_retryable() || retry_count > self.max_retries;
            if let Err(e) = self
                .storage
                .outbox_mark_failed(&event.id, retry_count, dead_letter, &cause.to_string())
                .await
            {
                tracing::error!("❌ Failed to record failure of {}: {e}", event.id);
                settle_error.get_or_insert(e);
                continue;
            }
            if dead_letter {
                report.dead_lettered += 1;
                tracing::warn!(
                    "💀 Outbox event {} ({}) dead-lettered after {} attempts [{}]: {cause}",
                    event.id,
                    event.event_type,
                    retry_count,
                    cause.reason()
                );
            } else {
                report.retried += 1;
                tracing::debug!("🔁 Outbox event {} failed (attempt {retry_count}): {cause}", event.id);
            }
        }

        tracing::info!(
            "📤 Outbox poll: {} published, {} retrying, {} dead-lettered via {}",
            report.published,
            report.retried,
            report.dead_lettered,
            self.bus.name()
        );

        match settle_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Retention: drop processed history older than `retention`.
    pub async fn cleanup(&self, retention: Duration) -> Result<u64> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| SyncError::InvalidArgument(format!("retention: {e}")))?;
        let removed = self
            .storage
            .outbox_delete_old_processed(Utc::now() - retention)
            .await?;
        tracing::info!("🧹 Outbox retention removed {removed} rows");
        Ok(removed)
    }

    pub async fn dead_letters(&self, limit: u32) -> Result<Vec<OutboxEvent>> {
        self.storage.outbox_dead_letters(limit).await
    }

    /// Put a dead letter back in the queue with a fresh retry budget.
    pub async fn requeue(&self, id: &EventId) -> Result<bool> {
        let requeued = self.storage.outbox_requeue(id).await?;
        if requeued {
            tracing::info!("♻️ Outbox event {id} requeued");
        }
        Ok(requeued)
    }
}

/// Spawn-friendly publisher loop. Errors are logged; the next tick retries.
pub async fn spawn_outbox_publisher(publisher: Arc<OutboxPublisher>, schedule: Schedule, limit: u32) {
    tracing::info!("📤 Outbox publisher started (every {:?})", schedule.period());
    let mut interval = schedule.interval();
    loop {
        interval.tick().await;
        if let Err(e) = publisher.publish_pending(limit).await {
            tracing::warn!("⚠️ Outbox poll failed [{}]: {e}", e.reason());
        }
    }
}

/// Spawn-friendly retention loop, independent of the publish path.
pub async fn spawn_retention_cleanup(publisher: Arc<OutboxPublisher>, schedule: Schedule, retention: Duration) {
    tracing::info!("🧹 Outbox retention started (every {:?}, keep {:?})", schedule.period(), retention);
    let mut interval = schedule.interval();
    loop {
        interval.tick().await;
        if let Err(e) = publisher.cleanup(retention).await {
            tracing::warn!("⚠️ Outbox retention failed [{}]: {e}", e.reason());
        }
    }
}
