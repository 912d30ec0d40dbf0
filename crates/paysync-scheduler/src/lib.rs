//! # PaySync Scheduler
//!
//! Drives connector synchronization and event publication.
//!
//! ## Architecture
//! ```text
//! ConnectorManager (per connector)
//!   ├── install → plugin task tree → SyncDb
//!   ├── run_cycle → SyncEngine
//!   │     └── task tree, depth first, page by page
//!   │           ├── upsert page + outbox rows (one transaction)
//!   │           ├── checkpoint cursor
//!   │           └── children per fetched item
//!   ├── reset → drop checkpoints → EventSender (CONNECTOR_RESET)
//!   └── uninstall → BatchDeleter (bounded batches + heartbeat)
//!
//! OutboxPublisher (tokio interval)
//!   ├── poll PENDING rows, oldest first
//!   ├── publish → MessageBus (log | webhook | memory)
//!   ├── success → PROCESSED + events_sent ledger
//!   └── failure → retry count++ → FAILED when exhausted
//! ```

pub mod deleter;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod outbox;
pub mod persistence;
pub mod retry;
pub mod workflow;

pub use deleter::BatchDeleter;
pub use dispatch::{build_bus, LogBus, MemoryBus, WebhookBus};
pub use engine::{CycleReport, EngineOptions, FetchStatus, SyncEngine};
pub use events::EventSender;
pub use outbox::{spawn_outbox_publisher, spawn_retention_cleanup, OutboxPublisher, PublishReport};
pub use persistence::SyncDb;
pub use retry::{execute_idempotent_step, RetryPolicy, Schedule};
pub use workflow::{spawn_sync_loop, ConnectorManager, ManagerSettings};
