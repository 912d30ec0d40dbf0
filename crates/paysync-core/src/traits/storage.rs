//! Storage contract.
//!
//! Upserts are idempotent and keyed by natural reference. Every domain upsert
//! that notifies downstream writes its outbox rows in the same transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    Account, Balance, ConnectorId, ConnectorRecord, EntityKind, EventId, EventSent, FetchState,
    Instance, Other, OutboxEvent, Payment, StateId, TaskTree, WebhookConfig,
};

#[async_trait]
pub trait Storage: Send + Sync {
    // ─── Connectors ───

    /// Persist a connector row and its task tree atomically.
    async fn connectors_install(&self, connector: &ConnectorRecord, tree: &TaskTree) -> Result<()>;
    /// `NotFound` if the connector does not exist.
    async fn connectors_get(&self, id: &ConnectorId) -> Result<ConnectorRecord>;
    async fn connectors_list(&self) -> Result<Vec<ConnectorRecord>>;
    async fn connectors_schedule_for_deletion(&self, id: &ConnectorId) -> Result<()>;
    async fn connectors_delete(&self, id: &ConnectorId) -> Result<()>;
    async fn tasks_tree_get(&self, id: &ConnectorId) -> Result<TaskTree>;

    // ─── Fetched data (outbox rows written in the same transaction) ───

    /// Upserts internal or external accounts; the outbox event type follows
    /// each account's type.
    async fn accounts_upsert(&self, connector: &ConnectorId, accounts: &[Account]) -> Result<()>;
    async fn accounts_list(&self, connector: &ConnectorId) -> Result<Vec<Account>>;
    async fn balances_upsert(&self, connector: &ConnectorId, balances: &[Balance]) -> Result<()>;
    async fn payments_upsert(&self, connector: &ConnectorId, payments: &[Payment]) -> Result<()>;
    /// Deletes payments by reference, returning how many existed.
    async fn payments_delete(&self, connector: &ConnectorId, references: &[String]) -> Result<u64>;
    async fn others_upsert(&self, connector: &ConnectorId, name: &str, others: &[Other]) -> Result<()>;
    async fn count_by_connector(&self, kind: EntityKind, connector: &ConnectorId) -> Result<u64>;

    // ─── Checkpoints ───

    async fn states_get(&self, id: &StateId) -> Result<Option<FetchState>>;
    async fn states_store(&self, id: &StateId, state: &FetchState) -> Result<()>;
    async fn states_delete_for_connector(&self, connector: &ConnectorId) -> Result<u64>;

    // ─── Webhooks and run instances ───

    async fn webhook_configs_store(&self, connector: &ConnectorId, configs: &[WebhookConfig]) -> Result<()>;
    async fn webhook_configs_get(&self, connector: &ConnectorId) -> Result<Vec<WebhookConfig>>;
    async fn instances_start(&self, instance: &Instance) -> Result<()>;
    async fn instances_finish(&self, id: &str, finished_at: DateTime<Utc>, error: Option<&str>) -> Result<()>;
    /// The unfinished instance for this connector, if any.
    async fn instances_running(&self, connector: &ConnectorId) -> Result<Option<Instance>>;
    async fn instances_latest(&self, connector: &ConnectorId) -> Result<Option<Instance>>;

    // ─── Outbox ───

    /// Skips events whose key is already in the sent ledger and pending duplicates.
    async fn outbox_insert(&self, events: &[OutboxEvent]) -> Result<()>;
    /// Pending rows, oldest first.
    async fn outbox_poll_pending(&self, limit: u32) -> Result<Vec<OutboxEvent>>;
    /// Deletes the outbox rows and records the ledger rows in one transaction.
    async fn outbox_mark_processed_and_record_sent(&self, ids: &[EventId], sent: &[EventSent]) -> Result<()>;
    /// Stores the new retry count; `dead_letter` moves the row to `Failed`.
    async fn outbox_mark_failed(&self, id: &EventId, new_retry_count: u32, dead_letter: bool, cause: &str) -> Result<()>;
    /// Retention: drops processed history older than `cutoff`.
    async fn outbox_delete_old_processed(&self, cutoff: DateTime<Utc>) -> Result<u64>;
    async fn outbox_get(&self, id: &EventId) -> Result<Option<OutboxEvent>>;
    async fn outbox_dead_letters(&self, limit: u32) -> Result<Vec<OutboxEvent>>;
    /// Resets a dead letter to pending with a zero retry count. `false` if no such dead letter.
    async fn outbox_requeue(&self, id: &EventId) -> Result<bool>;

    // ─── Sent ledger ───

    async fn events_sent_exists(&self, id: &EventId) -> Result<bool>;
    async fn events_sent_upsert(&self, record: &EventSent) -> Result<()>;

    // ─── Purge ───

    /// Deletes at most `batch_size` rows of `kind` owned by the connector.
    async fn batch_delete_by_connector(&self, kind: EntityKind, connector: &ConnectorId, batch_size: u32) -> Result<u64>;
}
