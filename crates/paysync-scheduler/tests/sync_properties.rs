//! Cross-module properties of the sync engine and the outbox, run against an
//! on-disk store that is reopened to stand in for a process restart.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use paysync_connectors::dummypay::{DummyPay, DummyPayConfig};
use paysync_core::error::{Result, SyncError};
use paysync_core::traits::{Plugin, Storage};
use paysync_core::types::{
    outbox_types, Account, AccountType, Balance, ConnectorId, ConnectorRecord, EntityKind,
    FetchNextRequest, FetchPage, FromPayload, OutboxEvent, OutboxStatus, StateId, TaskNode, TaskType,
};
use paysync_scheduler::engine::state_reference;
use paysync_scheduler::{EngineOptions, MemoryBus, OutboxPublisher, SyncDb, SyncEngine};

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("paysync-it-{tag}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn temp_db(tag: &str) -> PathBuf {
    temp_dir(tag).join("paysync.db")
}

async fn installed(db: &SyncDb, provider: &str, tree: &[TaskNode]) -> ConnectorId {
    let id = ConnectorId::new(provider);
    let record = ConnectorRecord {
        id: id.clone(),
        name: format!("{provider}-{}", id.reference),
        created_at: Utc::now(),
        config: serde_json::json!({}),
        webhook_base_url: None,
        scheduled_for_deletion: false,
    };
    db.connectors_install(&record, &tree.to_vec()).await.unwrap();
    id
}

fn options(page_size: u32) -> EngineOptions {
    EngineOptions { page_size, ..Default::default() }
}

// ─── Sync engine ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_three_pages_of_two_accounts() {
    let dir = temp_dir("pages");
    let accounts: Vec<_> = (0..6)
        .map(|i| serde_json::json!({"id": format!("a{i}"), "opening_date": "2024-01-01T00:00:00Z"}))
        .collect();
    std::fs::write(dir.join("accounts.json"), serde_json::to_vec(&accounts).unwrap()).unwrap();

    let path = dir.join("paysync.db");
    let tree = vec![TaskNode::new(TaskType::FetchAccounts)];
    let id = {
        let db = Arc::new(SyncDb::open(&path).unwrap());
        let id = installed(&db, "dummypay", &tree).await;
        let plugin = Arc::new(DummyPay::new(DummyPayConfig { directory: dir.clone() }));
        let engine = SyncEngine::new(id.clone(), plugin, db.clone(), options(2));
        let report = engine.run_cycle(&tree).await.unwrap();
        assert_eq!(report.pages, 3);
        assert_eq!(report.items, 6);
        id
    };

    // Reopened store: six unique rows and the third page's cursor.
    let db = SyncDb::open(&path).unwrap();
    assert_eq!(db.count_by_connector(EntityKind::Accounts, &id).await.unwrap(), 6);
    let state = db
        .states_get(&StateId {
            connector_id: id.clone(),
            reference: state_reference(&tree[0], "0", None),
        })
        .await
        .unwrap()
        .unwrap();
    assert!(!state.has_more);
    let cursor: serde_json::Value = serde_json::from_slice(&state.cursor.unwrap()).unwrap();
    assert_eq!(cursor["next"], 6);
    assert_eq!(db.count_by_connector(EntityKind::OutboxEvents, &id).await.unwrap(), 6);
}

/// Balances paginate per parent; each cursor names the parent that owns it,
/// and a cursor handed to the wrong parent is an error.
struct PerParentBalances;

#[async_trait]
impl Plugin for PerParentBalances {
    fn name(&self) -> &str {
        "per-parent"
    }

    async fn fetch_next_balances(&self, req: FetchNextRequest) -> Result<FetchPage<Balance>> {
        let parent = req.from_payload.ok_or_else(|| SyncError::InvalidArgument("no parent".into()))?;
        let page: u32 = match req.state {
            None => 0,
            Some(bytes) => {
                let s = String::from_utf8(bytes).map_err(|e| SyncError::InvalidArgument(e.to_string()))?;
                let (owner, page) = s
                    .split_once('#')
                    .ok_or_else(|| SyncError::InvalidArgument(s.clone()))?;
                if owner != parent.id {
                    return Err(SyncError::InvalidArgument(format!(
                        "{} received cursor of {owner}",
                        parent.id
                    )));
                }
                page.parse().map_err(|_| SyncError::InvalidArgument(s.clone()))?
            }
        };
        // Yield between pages so concurrent loops interleave.
        tokio::time::sleep(Duration::from_millis(2)).await;
        let balance = Balance {
            account_reference: parent.id.clone(),
            asset: format!("P{page}/2"),
            amount: page as i64,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };
        let next = format!("{}#{}", parent.id, page + 1).into_bytes();
        // Parent "a" has three pages, every other parent one.
        let pages = if parent.id == "a" { 3 } else { 1 };
        if page + 1 < pages {
            Ok(FetchPage::more(vec![balance], Some(next)))
        } else {
            Ok(FetchPage::last(vec![balance], Some(next)))
        }
    }
}

fn parent(reference: &str) -> FromPayload {
    let account = Account {
        reference: reference.into(),
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        name: None,
        default_asset: None,
        account_type: AccountType::Internal,
        metadata: Default::default(),
        raw: serde_json::Value::Null,
    };
    FromPayload::from_item(&account).unwrap()
}

#[tokio::test]
async fn test_child_cursors_are_isolated_under_concurrency() {
    let db = Arc::new(SyncDb::open(&temp_db("isolation")).unwrap());
    let child = TaskNode::new(TaskType::FetchBalances);
    let tree = vec![TaskNode::new(TaskType::FetchAccounts).with_children(vec![child.clone()])];
    let id = installed(&db, "per-parent", &tree).await;
    let engine = SyncEngine::new(id.clone(), Arc::new(PerParentBalances), db.clone(), options(10));

    let (a, b) = tokio::join!(
        engine.execute_task(&child, "0.0", Some(parent("a"))),
        engine.execute_task(&child, "0.0", Some(parent("b"))),
    );
    assert_eq!(a.unwrap().pages, 3);
    assert_eq!(b.unwrap().pages, 1);

    let cursor_of = |owner: &str| {
        let db = db.clone();
        let id = id.clone();
        let reference = state_reference(&child, "0.0", Some(&parent(owner)));
        async move {
            let state = db
                .states_get(&StateId { connector_id: id, reference })
                .await
                .unwrap()
                .unwrap();
            String::from_utf8(state.cursor.unwrap()).unwrap()
        }
    };
    assert_eq!(cursor_of("a").await, "a#3");
    assert_eq!(cursor_of("b").await, "b#1");
    assert_eq!(db.count_by_connector(EntityKind::Balances, &id).await.unwrap(), 4);

    // Resuming either child reads only its own cursor.
    let again = engine.execute_task(&child, "0.0", Some(parent("b"))).await.unwrap();
    assert_eq!(again.pages, 1);
}

// ─── Outbox ──────────────────────────────────────────────────────────────────

async fn three_pending(db: &SyncDb, id: &ConnectorId) -> Vec<OutboxEvent> {
    let events: Vec<OutboxEvent> = (1..=3)
        .map(|i| {
            let payload = serde_json::to_vec(&serde_json::json!({"reference": format!("pay-{i}")})).unwrap();
            OutboxEvent::pending(outbox_types::PAYMENT_SAVED, format!("pay-{i}"), Some(id.clone()), payload)
        })
        .collect();
    db.outbox_insert(&events).await.unwrap();
    events
}

#[tokio::test]
async fn test_partial_failure_then_dead_letter_across_restarts() {
    let path = temp_db("outbox");
    let max_retries = 2;
    let (id, events) = {
        let db = Arc::new(SyncDb::open(&path).unwrap());
        let id = installed(&db, "dummypay", &[TaskNode::new(TaskType::FetchPayments)]).await;
        let events = three_pending(&db, &id).await;
        let bus = Arc::new(MemoryBus::new());
        bus.fail_key(&events[1].id.idempotency_key);
        let publisher = OutboxPublisher::new(db.clone(), bus.clone(), max_retries);

        let report = publisher.publish_pending(10).await.unwrap();
        assert_eq!((report.published, report.retried), (2, 1));
        (id, events)
    };

    // Restart: only event 2 is still pending, with one recorded failure.
    let db = Arc::new(SyncDb::open(&path).unwrap());
    assert!(db.events_sent_exists(&events[0].id).await.unwrap());
    assert!(db.events_sent_exists(&events[2].id).await.unwrap());
    assert!(!db.events_sent_exists(&events[1].id).await.unwrap());
    let pending = db.outbox_poll_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, events[1].id);
    assert_eq!(pending[0].retry_count, 1);

    let bus = Arc::new(MemoryBus::new());
    bus.fail_key(&events[1].id.idempotency_key);
    let publisher = OutboxPublisher::new(db.clone(), bus.clone(), max_retries);
    for _ in 0..max_retries {
        publisher.publish_pending(10).await.unwrap();
    }

    let row = db.outbox_get(&events[1].id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.retry_count, max_retries + 1);
    assert!(db.outbox_poll_pending(10).await.unwrap().is_empty());

    // Recovery of the transport does not resurrect a dead letter.
    bus.recover(&events[1].id.idempotency_key);
    assert_eq!(publisher.publish_pending(10).await.unwrap().polled, 0);
    assert_eq!(bus.count(), 0);
    assert_eq!(publisher.dead_letters(10).await.unwrap().len(), 1);

    // Until an operator requeues it.
    assert!(publisher.requeue(&events[1].id).await.unwrap());
    assert_eq!(publisher.publish_pending(10).await.unwrap().published, 1);
    assert_eq!(db.count_by_connector(EntityKind::EventsSent, &id).await.unwrap(), 3);
}

#[tokio::test]
async fn test_processed_events_are_never_polled_again() {
    let path = temp_db("processed");
    let db = Arc::new(SyncDb::open(&path).unwrap());
    let id = installed(&db, "dummypay", &[TaskNode::new(TaskType::FetchPayments)]).await;
    let events = three_pending(&db, &id).await;
    let bus = Arc::new(MemoryBus::new());
    let publisher = OutboxPublisher::new(db.clone(), bus.clone(), 3);
    assert_eq!(publisher.publish_pending(10).await.unwrap().published, 3);
    drop(publisher);
    drop(db);

    let db = Arc::new(SyncDb::open(&path).unwrap());
    assert!(db.outbox_poll_pending(10).await.unwrap().is_empty());
    // Re-inserting the same events after delivery is a no-op.
    db.outbox_insert(&events).await.unwrap();
    assert!(db.outbox_poll_pending(10).await.unwrap().is_empty());
    assert_eq!(bus.count(), 3);
}
