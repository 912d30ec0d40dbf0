//! End-to-end lifecycle of a file-backed `dummypay` connector against an
//! on-disk SQLite store: install, sync, publish, reset, purge, uninstall.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use paysync_connectors::StaticRegistry;
use paysync_core::traits::{NoopHeartbeat, Storage};
use paysync_core::types::{ConnectorId, EntityKind};
use paysync_scheduler::{
    BatchDeleter, ConnectorManager, ManagerSettings, MemoryBus, OutboxPublisher, RetryPolicy, SyncDb,
};

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("paysync-it-{tag}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Writes `accounts` accounts, each with two balances.
fn write_dummypay_files(dir: &PathBuf, accounts: usize) {
    let accs: Vec<_> = (0..accounts)
        .map(|i| {
            serde_json::json!({
                "id": format!("acc-{i:03}"),
                "name": format!("Account {i}"),
                "currency": "EUR/2",
                "opening_date": "2024-03-01T09:00:00Z",
            })
        })
        .collect();
    let balances: Vec<_> = (0..accounts)
        .flat_map(|i| {
            ["EUR/2", "USD/2"].into_iter().map(move |asset| {
                serde_json::json!({
                    "account_id": format!("acc-{i:03}"),
                    "amount_in_minors": 1000 + i as i64,
                    "currency": asset,
                })
            })
        })
        .collect();
    std::fs::write(dir.join("accounts.json"), serde_json::to_vec(&accs).unwrap()).unwrap();
    std::fs::write(dir.join("balances.json"), serde_json::to_vec(&balances).unwrap()).unwrap();
}

struct Harness {
    db: Arc<SyncDb>,
    bus: Arc<MemoryBus>,
    manager: ConnectorManager,
    publisher: OutboxPublisher,
    data_dir: PathBuf,
}

fn harness(tag: &str, accounts: usize) -> Harness {
    let root = temp_dir(tag);
    let data_dir = root.join("dummypay");
    std::fs::create_dir_all(&data_dir).unwrap();
    write_dummypay_files(&data_dir, accounts);

    let db = Arc::new(SyncDb::open(&root.join("paysync.db")).unwrap());
    let bus = Arc::new(MemoryBus::new());
    let settings = ManagerSettings {
        retry: RetryPolicy { max_attempts: 1, ..Default::default() },
        ..Default::default()
    };
    let manager = ConnectorManager::new(
        db.clone(),
        Arc::new(StaticRegistry::new()),
        bus.clone(),
        settings,
        Arc::new(NoopHeartbeat),
    );
    let publisher = OutboxPublisher::new(db.clone(), bus.clone(), 3);
    Harness { db, bus, manager, publisher, data_dir }
}

async fn install(h: &Harness, name: &str) -> ConnectorId {
    h.manager
        .install("dummypay", name, serde_json::json!({ "directory": h.data_dir }))
        .await
        .unwrap()
}

async fn rows(db: &SyncDb, id: &ConnectorId) -> u64 {
    let mut total = 0;
    for kind in EntityKind::ALL {
        total += db.count_by_connector(kind, id).await.unwrap();
    }
    total
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_install_sync_publish_uninstall() {
    let h = harness("lifecycle", 4);
    let id = install(&h, "dummy-main").await;
    assert_eq!(h.manager.list().await.unwrap().len(), 1);

    let report = h.manager.run_cycle(&id).await.unwrap();
    // 4 accounts + 8 balances
    assert_eq!(report.items, 12);
    assert_eq!(h.db.count_by_connector(EntityKind::Accounts, &id).await.unwrap(), 4);
    assert_eq!(h.db.count_by_connector(EntityKind::Balances, &id).await.unwrap(), 8);
    let latest = h.db.instances_latest(&id).await.unwrap().unwrap();
    assert!(latest.finished_at.is_some());
    assert!(latest.error.is_none());

    let published = h.publisher.publish_pending(100).await.unwrap();
    assert_eq!(published.published, 12);
    let types: Vec<String> = h.bus.published().into_iter().map(|m| m.event_type).collect();
    assert_eq!(types.iter().filter(|t| *t == "SAVED_ACCOUNT").count(), 4);
    assert_eq!(types.iter().filter(|t| *t == "SAVED_BALANCE").count(), 8);

    // The accounts scan starts over so balances are read again; nothing changed.
    let again = h.manager.run_cycle(&id).await.unwrap();
    assert_eq!(again.items, 12);
    assert_eq!(h.publisher.publish_pending(100).await.unwrap().polled, 0);

    let purged = h.manager.uninstall(&id).await.unwrap();
    assert!(purged >= 12);
    assert_eq!(rows(&h.db, &id).await, 0);
    assert!(h.manager.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reset_rescans_without_republishing() {
    let h = harness("reset", 3);
    let id = install(&h, "dummy-reset").await;
    h.manager.run_cycle(&id).await.unwrap();
    h.publisher.publish_pending(100).await.unwrap();
    let before = h.bus.count();

    h.manager.reset(&id).await.unwrap();
    assert_eq!(h.bus.count(), before + 1);
    assert_eq!(h.bus.published().last().unwrap().event_type, "CONNECTOR_RESET");

    // Identical data hashes to keys already in the sent ledger.
    let report = h.manager.run_cycle(&id).await.unwrap();
    assert_eq!(report.items, 9);
    assert_eq!(h.publisher.publish_pending(100).await.unwrap().polled, 0);
    assert_eq!(h.bus.count(), before + 1);
}

#[tokio::test]
async fn test_changed_upstream_data_is_republished() {
    let h = harness("changed", 2);
    let id = install(&h, "dummy-changed").await;
    h.manager.run_cycle(&id).await.unwrap();
    h.publisher.publish_pending(100).await.unwrap();

    write_dummypay_files(&h.data_dir, 3);
    let report = h.manager.run_cycle(&id).await.unwrap();
    assert_eq!(report.items, 9);
    assert_eq!(
        h.publisher.publish_pending(100).await.unwrap().published,
        3,
        "one new account and its two balances"
    );
}

/// Rewrites the EUR balance of `acc-000`, leaving every other row as written
/// by `write_dummypay_files`.
fn set_first_balance(dir: &PathBuf, amount: i64) {
    let path = dir.join("balances.json");
    let mut balances: Vec<serde_json::Value> =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    balances[0]["amount_in_minors"] = serde_json::json!(amount);
    std::fs::write(&path, serde_json::to_vec(&balances).unwrap()).unwrap();
}

fn balance_amounts(bus: &MemoryBus) -> Vec<i64> {
    bus.published()
        .into_iter()
        .filter(|m| m.event_type == "SAVED_BALANCE" && m.payload["account_reference"] == "acc-000")
        .filter(|m| m.payload["asset"] == "EUR/2")
        .map(|m| m.payload["amount"].as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_balance_change_of_known_account_is_published() {
    let h = harness("balance-change", 2);
    let id = install(&h, "dummy-balances").await;
    h.manager.run_cycle(&id).await.unwrap();
    h.publisher.publish_pending(100).await.unwrap();
    assert_eq!(balance_amounts(&h.bus), vec![1000]);

    set_first_balance(&h.data_dir, 1500);
    h.manager.run_cycle(&id).await.unwrap();
    let report = h.publisher.publish_pending(100).await.unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(balance_amounts(&h.bus), vec![1000, 1500]);
}

#[tokio::test]
async fn test_balance_flipping_back_is_delivered_every_time() {
    let h = harness("balance-flip", 1);
    let id = install(&h, "dummy-flip").await;
    for amount in [100, 200, 100] {
        set_first_balance(&h.data_dir, amount);
        h.manager.run_cycle(&id).await.unwrap();
        h.publisher.publish_pending(100).await.unwrap();
    }
    // Downstream ends on the value upstream ends on.
    assert_eq!(balance_amounts(&h.bus), vec![100, 200, 100]);
    assert_eq!(h.db.count_by_connector(EntityKind::Balances, &id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_batch_delete_complete_for_any_batch_size() {
    for batch_size in [1u32, 7, 1000] {
        let h = harness(&format!("purge-{batch_size}"), 9);
        let target = install(&h, "dummy-target").await;
        let bystander = install(&h, "dummy-bystander").await;
        h.manager.run_cycle(&target).await.unwrap();
        h.manager.run_cycle(&bystander).await.unwrap();
        // Half the outbox delivered, so both outbox rows and ledger rows exist.
        h.publisher.publish_pending(27).await.unwrap();

        let bystander_rows = rows(&h.db, &bystander).await;
        assert!(rows(&h.db, &target).await > 0);

        let beats = Arc::new(Mutex::new(0u32));
        let sink = beats.clone();
        let heartbeat = move |_step: &str, _progress: u64| *sink.lock().unwrap() += 1;
        let deleter = BatchDeleter::new(h.db.clone(), batch_size, Arc::new(heartbeat));
        deleter.delete_all_for_connector(&target).await.unwrap();

        assert_eq!(rows(&h.db, &target).await, 0, "batch size {batch_size}");
        assert_eq!(rows(&h.db, &bystander).await, bystander_rows, "batch size {batch_size}");
        assert!(*beats.lock().unwrap() > 0);
    }
}

#[tokio::test]
async fn test_duplicate_connector_name_is_rejected() {
    let h = harness("dupe", 1);
    install(&h, "same-name").await;
    let err = h
        .manager
        .install("dummypay", "same-name", serde_json::json!({ "directory": h.data_dir }))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "FAILED_PRECONDITION");
}
