//! Domain types shared by the scheduler, the reliability layer and plugins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, SyncError};

// ─── Connector identity ─────────────────────────────────────

/// A configured instance of a provider integration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectorId {
    pub provider: String,
    pub reference: Uuid,
}

impl ConnectorId {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            reference: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.reference)
    }
}

impl FromStr for ConnectorId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let (provider, reference) = s
            .split_once(':')
            .ok_or_else(|| SyncError::InvalidArgument(format!("malformed connector id '{s}'")))?;
        if provider.is_empty() {
            return Err(SyncError::InvalidArgument(format!("connector id '{s}' has no provider")));
        }
        let reference = Uuid::parse_str(reference)
            .map_err(|e| SyncError::InvalidArgument(format!("connector id '{s}': {e}")))?;
        Ok(Self {
            provider: provider.to_string(),
            reference,
        })
    }
}

/// Stored connector row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorRecord {
    pub id: ConnectorId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub config: serde_json::Value,
    pub webhook_base_url: Option<String>,
    pub scheduled_for_deletion: bool,
}

// ─── Task tree ──────────────────────────────────────────────

/// Closed set of task kinds a provider can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    FetchAccounts,
    FetchBalances,
    FetchExternalAccounts,
    FetchPayments,
    FetchOthers,
    CreateWebhooks,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::FetchAccounts => "FETCH_ACCOUNTS",
            TaskType::FetchBalances => "FETCH_BALANCES",
            TaskType::FetchExternalAccounts => "FETCH_EXTERNAL_ACCOUNTS",
            TaskType::FetchPayments => "FETCH_PAYMENTS",
            TaskType::FetchOthers => "FETCH_OTHERS",
            TaskType::CreateWebhooks => "CREATE_WEBHOOKS",
        }
    }

    /// Whether the task runs a cursor loop (everything but webhook creation).
    pub fn is_paginated(&self) -> bool {
        !matches!(self, TaskType::CreateWebhooks)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of a provider-declared task tree. Immutable after install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNode {
    pub task_type: TaskType,
    /// Disambiguates several `FetchOthers` nodes.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub children: Vec<TaskNode>,
}

impl TaskNode {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            name: String::new(),
            children: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_children(mut self, children: Vec<TaskNode>) -> Self {
        self.children = children;
        self
    }

    /// `TASK_KIND` or `TASK_KIND:name`, used inside state references.
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            self.task_type.as_str().to_string()
        } else {
            format!("{}:{}", self.task_type.as_str(), self.name)
        }
    }
}

pub type TaskTree = Vec<TaskNode>;

/// Total number of nodes in a tree, children included.
pub fn tree_size(tree: &[TaskNode]) -> usize {
    tree.iter().map(|n| 1 + tree_size(&n.children)).sum()
}

// ─── Pagination ─────────────────────────────────────────────

/// Checkpoint of one cursor loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchState {
    /// Opaque provider-owned cursor. `None` before the first page.
    pub cursor: Option<Vec<u8>>,
    pub has_more: bool,
}

/// Key of a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateId {
    pub connector_id: ConnectorId,
    pub reference: String,
}

/// Serialized parent item handed to a child task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FromPayload {
    /// Reference of the parent item.
    pub id: String,
    pub payload: Vec<u8>,
}

impl FromPayload {
    pub fn from_item<T: FetchedItem>(item: &T) -> Result<Self> {
        Ok(Self {
            id: item.reference(),
            payload: serde_json::to_vec(item)?,
        })
    }

    /// Decode the parent item back into a concrete type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[derive(Debug, Clone)]
pub struct FetchNextRequest {
    pub from_payload: Option<FromPayload>,
    pub state: Option<Vec<u8>>,
    pub page_size: u32,
}

/// One page returned by a plugin.
#[derive(Debug, Clone)]
pub struct FetchPage<T> {
    pub items: Vec<T>,
    /// References the provider reports as removed. Only honoured for payments.
    pub deleted: Vec<String>,
    pub new_state: Option<Vec<u8>>,
    pub has_more: bool,
}

impl<T> FetchPage<T> {
    pub fn last(items: Vec<T>, new_state: Option<Vec<u8>>) -> Self {
        Self { items, deleted: Vec::new(), new_state, has_more: false }
    }

    pub fn more(items: Vec<T>, new_state: Option<Vec<u8>>) -> Self {
        Self { items, deleted: Vec::new(), new_state, has_more: true }
    }
}

/// Anything a fetch task yields. The reference is the dedup key and the
/// seed for child payloads.
pub trait FetchedItem: Serialize + Send + Sync {
    fn reference(&self) -> String;
}

// ─── Fetched entities ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    Internal,
    External,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Internal => "INTERNAL",
            AccountType::External => "EXTERNAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub reference: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub default_asset: Option<String>,
    #[serde(default = "default_account_type")]
    pub account_type: AccountType,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

fn default_account_type() -> AccountType { AccountType::Internal }

impl FetchedItem for Account {
    fn reference(&self) -> String {
        self.reference.clone()
    }
}

/// Balance snapshot. Amounts are integers in minor units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub account_reference: String,
    pub asset: String,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

impl FetchedItem for Balance {
    fn reference(&self) -> String {
        format!("{}/{}", self.account_reference, self.asset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentType {
    PayIn,
    Payout,
    Transfer,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub reference: String,
    pub created_at: DateTime<Utc>,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    pub amount: i64,
    pub asset: String,
    #[serde(default)]
    pub source_account_reference: Option<String>,
    #[serde(default)]
    pub destination_account_reference: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl FetchedItem for Payment {
    fn reference(&self) -> String {
        self.reference.clone()
    }
}

/// Provider-specific entity fetched by a named `FetchOthers` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Other {
    pub id: String,
    pub value: serde_json::Value,
}

impl FetchedItem for Other {
    fn reference(&self) -> String {
        self.id.clone()
    }
}

// ─── Plugin requests ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub name: String,
    pub url_path: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub connector_id: ConnectorId,
}

#[derive(Debug, Clone, Default)]
pub struct InstallResponse {
    pub tasks_tree: TaskTree,
    /// Base URL the provider should call back on, if it supports webhooks.
    pub webhook_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UninstallRequest {
    pub connector_id: ConnectorId,
    pub webhook_configs: Vec<WebhookConfig>,
}

#[derive(Debug, Clone)]
pub struct CreateWebhooksRequest {
    pub connector_id: ConnectorId,
    pub from_payload: Option<FromPayload>,
    pub webhook_base_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct CreateWebhooksResponse {
    pub configs: Vec<WebhookConfig>,
}

// ─── Events ─────────────────────────────────────────────────

/// Globally unique identity of one logical event occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId {
    pub idempotency_key: String,
    pub connector_id: Option<ConnectorId>,
}

impl EventId {
    pub fn new(idempotency_key: impl Into<String>, connector_id: Option<ConnectorId>) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            connector_id,
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.connector_id {
            Some(c) => write!(f, "{}@{}", self.idempotency_key, c),
            None => f.write_str(&self.idempotency_key),
        }
    }
}

/// Outbox event types written by storage alongside domain rows.
pub mod outbox_types {
    pub const ACCOUNT_SAVED: &str = "ACCOUNT_SAVED";
    pub const BALANCE_SAVED: &str = "BALANCE_SAVED";
    pub const BANK_ACCOUNT_SAVED: &str = "BANK_ACCOUNT_SAVED";
    pub const PAYMENT_SAVED: &str = "PAYMENT_SAVED";
    pub const PAYMENT_DELETED: &str = "PAYMENT_DELETED";
    pub const CONNECTOR_RESET: &str = "CONNECTOR_RESET";
    pub const TASK_UPDATED: &str = "TASK_UPDATED";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processed,
    /// Dead letter: excluded from polling until requeued.
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processed => "PROCESSED",
            OutboxStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for OutboxStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PROCESSED" => Ok(OutboxStatus::Processed),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(SyncError::Storage(format!("unknown outbox status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    pub event_type: String,
    pub entity_id: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl OutboxEvent {
    /// A fresh pending event whose key is derived from its content.
    pub fn pending(
        event_type: &str,
        entity_id: impl Into<String>,
        connector_id: Option<ConnectorId>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: EventId::new(idempotency_key(event_type, &payload), connector_id),
            event_type: event_type.to_string(),
            entity_id: entity_id.into(),
            payload,
            created_at: Utc::now(),
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_retry_at: None,
            error: None,
        }
    }
}

/// Ledger row written after a successful publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSent {
    pub id: EventId,
    pub sent_at: DateTime<Utc>,
}

impl EventSent {
    pub fn now(id: EventId) -> Self {
        Self { id, sent_at: Utc::now() }
    }

    pub fn connector_id(&self) -> Option<&ConnectorId> {
        self.id.connector_id.as_ref()
    }
}

/// Transport message handed to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub idempotency_key: String,
    pub date: DateTime<Utc>,
    pub app: String,
    pub version: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
}

pub const EVENT_APP: &str = "payments";
pub const EVENT_VERSION: &str = "v3";

impl EventMessage {
    pub fn new(idempotency_key: impl Into<String>, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            date: Utc::now(),
            app: EVENT_APP.to_string(),
            version: EVENT_VERSION.to_string(),
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Content-derived idempotency key: hex SHA-256 over the event kind and payload.
pub fn idempotency_key(kind: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

// ─── Runs and purgeable data ────────────────────────────────

/// One execution of a connector's sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub connector_id: ConnectorId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Instance {
    pub fn start(connector_id: ConnectorId) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            connector_id,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.finished_at.is_none()
    }
}

/// Every per-connector table the batch deleter purges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Accounts,
    Balances,
    Payments,
    Others,
    States,
    WebhookConfigs,
    Instances,
    TaskTrees,
    EventsSent,
    OutboxEvents,
    EntityRevisions,
}

impl EntityKind {
    pub const ALL: [EntityKind; 11] = [
        EntityKind::Accounts,
        EntityKind::Balances,
        EntityKind::Payments,
        EntityKind::Others,
        EntityKind::States,
        EntityKind::WebhookConfigs,
        EntityKind::Instances,
        EntityKind::TaskTrees,
        EntityKind::EventsSent,
        EntityKind::OutboxEvents,
        EntityKind::EntityRevisions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Accounts => "accounts",
            EntityKind::Balances => "balances",
            EntityKind::Payments => "payments",
            EntityKind::Others => "others",
            EntityKind::States => "states",
            EntityKind::WebhookConfigs => "webhook_configs",
            EntityKind::Instances => "instances",
            EntityKind::TaskTrees => "connector_tasks_tree",
            EntityKind::EventsSent => "events_sent",
            EntityKind::OutboxEvents => "outbox_events",
            EntityKind::EntityRevisions => "entity_revisions",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
