//! Connector lifecycle: install, run sync cycles, reset, uninstall.
//!
//! ## Architecture
//! ```text
//! install(provider, name, config)
//!   → registry.create → plugin.install → registry.check_tree
//!     → store connector + task tree
//! run_cycle(id)
//!   → guard (not running, not being deleted) → instance start
//!     → SyncEngine.run_cycle(tree) → instance finish (with error, if any)
//! uninstall(id)
//!   → schedule for deletion → plugin.uninstall(webhook configs)
//!     → BatchDeleter over every entity kind → delete connector row
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use paysync_core::cancel::CancelFlag;
use paysync_core::config::PaySyncConfig;
use paysync_core::error::{ErrorKind, Result, SyncError};
use paysync_core::traits::{Heartbeat, MessageBus, Plugin, PluginRegistry, Storage};
use paysync_core::types::{
    ConnectorId, ConnectorRecord, InstallRequest, Instance, UninstallRequest,
};

use crate::deleter::BatchDeleter;
use crate::engine::{CycleReport, EngineOptions, FetchStatus, SyncEngine};
use crate::events::EventSender;
use crate::retry::{execute_idempotent_step, RetryPolicy, Schedule};

/// Knobs the manager passes down to engines and deleters.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub page_size: u32,
    pub call_timeout: Duration,
    pub delete_batch_size: u32,
    pub retry: RetryPolicy,
}

impl ManagerSettings {
    pub fn from_config(config: &PaySyncConfig) -> Self {
        Self {
            page_size: config.scheduler.page_size,
            call_timeout: config.scheduler.call_timeout(),
            delete_batch_size: config.deleter.batch_size,
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&PaySyncConfig::default())
    }
}

/// Owns every installed connector's lifecycle.
pub struct ConnectorManager {
    storage: Arc<dyn Storage>,
    registry: Arc<dyn PluginRegistry>,
    events: EventSender,
    settings: ManagerSettings,
    heartbeat: Arc<dyn Heartbeat>,
    /// Connectors with a cycle in flight in this process, with their cancel flag.
    active: Mutex<HashMap<ConnectorId, CancelFlag>>,
    /// Last engine per connector, kept for status queries.
    engines: Mutex<HashMap<ConnectorId, Arc<SyncEngine>>>,
}

impl ConnectorManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<dyn PluginRegistry>,
        bus: Arc<dyn MessageBus>,
        settings: ManagerSettings,
        heartbeat: Arc<dyn Heartbeat>,
    ) -> Self {
        Self {
            events: EventSender::new(storage.clone(), bus),
            storage,
            registry,
            settings,
            heartbeat,
            active: Mutex::new(HashMap::new()),
            engines: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Create the plugin, ask it for its task tree and persist both.
    pub async fn install(&self, provider: &str, name: &str, config: serde_json::Value) -> Result<ConnectorId> {
        let id = ConnectorId::new(provider);
        let plugin = self.registry.create(provider, &id, &config)?;
        let resp = execute_idempotent_step(&format!("install {id}"), &self.settings.retry, || {
            plugin.install(InstallRequest { connector_id: id.clone() })
        })
        .await?;

        if resp.tasks_tree.is_empty() {
            return Err(SyncError::FailedPrecondition(format!(
                "provider '{provider}' returned an empty task tree"
            )));
        }
        self.registry.check_tree(provider, &resp.tasks_tree)?;

        let record = ConnectorRecord {
            id: id.clone(),
            name: name.to_string(),
            created_at: Utc::now(),
            config,
            webhook_base_url: resp.webhook_base_url,
            scheduled_for_deletion: false,
        };
        self.storage.connectors_install(&record, &resp.tasks_tree).await?;
        tracing::info!(
            "🔌 Connector installed: '{}' ({}), {} tasks",
            name,
            id,
            paysync_core::types::tree_size(&resp.tasks_tree)
        );
        Ok(id)
    }

    pub async fn list(&self) -> Result<Vec<ConnectorRecord>> {
        self.storage.connectors_list().await
    }

    fn plugin_for(&self, record: &ConnectorRecord) -> Result<Arc<dyn Plugin>> {
        self.registry.create(&record.id.provider, &record.id, &record.config)
    }

    /// Run one full sync cycle for the connector.
    pub async fn run_cycle(&self, id: &ConnectorId) -> Result<CycleReport> {
        let record = self.storage.connectors_get(id).await?;
        if record.scheduled_for_deletion {
            return Err(SyncError::FailedPrecondition(format!(
                "connector {id} is scheduled for deletion"
            )));
        }

        let cancel = self.claim(id)?;
        let result = self.run_claimed(&record, cancel).await;
        self.release(id);
        result
    }

    async fn run_claimed(&self, record: &ConnectorRecord, cancel: CancelFlag) -> Result<CycleReport> {
        let id = &record.id;
        if let Some(stale) = self.storage.instances_running(id).await? {
            // Not running in this process, so whoever started it is gone.
            tracing::warn!("⚠️ Closing abandoned instance {} of {}", stale.id, id);
            self.storage
                .instances_finish(&stale.id, Utc::now(), Some("abandoned"))
                .await?;
        }

        let tree = self.storage.tasks_tree_get(id).await?;
        let options = EngineOptions {
            page_size: self.registry.page_size(&id.provider).unwrap_or(self.settings.page_size),
            call_timeout: self.settings.call_timeout,
            webhook_base_url: record.webhook_base_url.clone(),
        };
        let engine = Arc::new(
            SyncEngine::new(id.clone(), self.plugin_for(record)?, self.storage.clone(), options)
                .with_cancel(cancel),
        );
        if let Ok(mut engines) = self.engines.lock() {
            engines.insert(id.clone(), engine.clone());
        }

        let instance = Instance::start(id.clone());
        self.storage.instances_start(&instance).await?;
        let result = engine.run_cycle(&tree).await;
        let error = result.as_ref().err().map(|e| format!("{}: {e}", e.reason()));
        self.storage
            .instances_finish(&instance.id, Utc::now(), error.as_deref())
            .await?;
        result
    }

    fn claim(&self, id: &ConnectorId) -> Result<CancelFlag> {
        let mut active = self
            .active
            .lock()
            .map_err(|e| SyncError::Storage(format!("active set poisoned: {e}")))?;
        if active.contains_key(id) {
            return Err(SyncError::FailedPrecondition(format!(
                "connector {id} is busy with a sync cycle, reset or uninstall"
            )));
        }
        let flag = CancelFlag::new();
        active.insert(id.clone(), flag.clone());
        Ok(flag)
    }

    fn release(&self, id: &ConnectorId) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(id);
        }
    }

    pub fn is_running(&self, id: &ConnectorId) -> bool {
        self.active.lock().map(|a| a.contains_key(id)).unwrap_or(false)
    }

    /// Progress of the most recent cycle run by this process.
    pub fn fetch_status(&self, id: &ConnectorId) -> Option<FetchStatus> {
        self.engines
            .lock()
            .ok()
            .and_then(|e| e.get(id).map(|engine| engine.fetch_status()))
    }

    /// Wipe every checkpoint so the next cycle rescans from scratch, and
    /// announce it downstream. Holds the connector's claim, so no cycle can
    /// start while checkpoints are being dropped.
    pub async fn reset(&self, id: &ConnectorId) -> Result<u64> {
        self.storage.connectors_get(id).await?;
        self.claim(id).map_err(|e| e.context("cannot reset"))?;
        let result = self.reset_claimed(id).await;
        self.release(id);
        result
    }

    async fn reset_claimed(&self, id: &ConnectorId) -> Result<u64> {
        let removed = self.storage.states_delete_for_connector(id).await?;
        if let Some(engine) = self.engines.lock().ok().and_then(|e| e.get(id).cloned()) {
            engine.reset_fetch_status();
        }

        let at = Utc::now();
        execute_idempotent_step(&format!("reset event {id}"), &self.settings.retry, || {
            self.events.send_connector_reset(id, at)
        })
        .await?;
        tracing::info!("🔄 Connector {id} reset ({removed} checkpoints removed)");
        Ok(removed)
    }

    /// Tear the connector down and purge all of its data.
    pub async fn uninstall(&self, id: &ConnectorId) -> Result<u64> {
        let record = self.storage.connectors_get(id).await?;
        self.storage.connectors_schedule_for_deletion(id).await?;

        // Cancel whatever holds the claim; it lets go at its next page boundary.
        let deadline = tokio::time::Instant::now() + self.settings.call_timeout * 2;
        loop {
            if let Some(flag) = self.active.lock().ok().and_then(|a| a.get(id).cloned()) {
                flag.cancel();
            }
            match self.claim(id) {
                Ok(_) => break,
                Err(e) if e.kind() != ErrorKind::FailedPrecondition => return Err(e),
                Err(_) if tokio::time::Instant::now() >= deadline => {
                    return Err(SyncError::Transient(format!(
                        "sync cycle for {id} did not stop; retry the uninstall"
                    )));
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
        let result = self.uninstall_claimed(&record).await;
        self.release(id);
        result
    }

    async fn uninstall_claimed(&self, record: &ConnectorRecord) -> Result<u64> {
        let id = &record.id;
        let plugin = self.plugin_for(record)?;
        let webhook_configs = self.storage.webhook_configs_get(id).await?;
        let uninstalled = execute_idempotent_step(&format!("uninstall {id}"), &self.settings.retry, || {
            plugin.uninstall(UninstallRequest {
                connector_id: id.clone(),
                webhook_configs: webhook_configs.clone(),
            })
        })
        .await;
        match uninstalled {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Unimplemented => {
                tracing::debug!("Provider {} has no uninstall hook", id.provider);
            }
            Err(e) => return Err(e),
        }

        let deleter = BatchDeleter::new(
            self.storage.clone(),
            self.settings.delete_batch_size,
            self.heartbeat.clone(),
        );
        let purged = execute_idempotent_step(&format!("purge {id}"), &self.settings.retry, || {
            deleter.delete_all_for_connector(id)
        })
        .await?;

        self.storage.connectors_delete(id).await?;
        if let Ok(mut engines) = self.engines.lock() {
            engines.remove(id);
        }
        tracing::info!("🔌 Connector uninstalled: '{}' ({}), {purged} rows purged", record.name, id);
        Ok(purged)
    }
}

/// Run the connector's sync cycle on a fixed schedule until it is removed.
pub async fn spawn_sync_loop(manager: Arc<ConnectorManager>, id: ConnectorId, schedule: Schedule) {
    tracing::info!("⏰ Sync loop started for {} (every {:?})", id, schedule.period());
    let mut interval = schedule.interval();
    loop {
        interval.tick().await;
        let policy = manager.settings.retry.clone();
        let result = execute_idempotent_step(&format!("sync {id}"), &policy, || manager.run_cycle(&id)).await;
        match result {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!("⏹️ Sync loop for {id} stopped: connector removed");
                return;
            }
            Err(e) if e.kind() == ErrorKind::FailedPrecondition && !manager.is_running(&id) => {
                if let Ok(record) = manager.storage.connectors_get(&id).await
                    && record.scheduled_for_deletion
                {
                    tracing::info!("⏹️ Sync loop for {id} stopped: connector being deleted");
                    return;
                }
                tracing::warn!("⚠️ Sync of {id} skipped [{}]: {e}", e.reason());
            }
            Err(e) => tracing::warn!("⚠️ Sync of {id} failed [{}]: {e}", e.reason()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MemoryBus;
    use crate::persistence::SyncDb;
    use async_trait::async_trait;
    use paysync_core::traits::NoopHeartbeat;
    use paysync_core::types::{
        Account, AccountType, EntityKind, FetchNextRequest, FetchPage, InstallResponse, TaskNode,
        TaskTree, TaskType,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    struct OnePage {
        uninstalls: AtomicU32,
    }

    #[async_trait]
    impl Plugin for OnePage {
        fn name(&self) -> &str {
            "onepage"
        }

        async fn install(&self, _req: InstallRequest) -> Result<InstallResponse> {
            Ok(InstallResponse {
                tasks_tree: vec![TaskNode::new(TaskType::FetchAccounts)],
                webhook_base_url: None,
            })
        }

        async fn uninstall(&self, _req: UninstallRequest) -> Result<()> {
            self.uninstalls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn fetch_next_accounts(&self, _req: FetchNextRequest) -> Result<FetchPage<Account>> {
            let acc = Account {
                reference: "acc-1".into(),
                created_at: Utc::now(),
                name: None,
                default_asset: None,
                account_type: AccountType::Internal,
                metadata: Default::default(),
                raw: serde_json::Value::Null,
            };
            Ok(FetchPage::last(vec![acc], None))
        }
    }

    struct Registry(Arc<OnePage>);

    impl PluginRegistry for Registry {
        fn create(&self, provider: &str, _id: &ConnectorId, _config: &serde_json::Value) -> Result<Arc<dyn Plugin>> {
            match provider {
                "onepage" => Ok(self.0.clone()),
                other => Err(SyncError::InvalidArgument(format!("unknown provider '{other}'"))),
            }
        }

        fn page_size(&self, _provider: &str) -> Option<u32> {
            Some(10)
        }

        fn providers(&self) -> Vec<&'static str> {
            vec!["onepage"]
        }
    }

    fn manager() -> (Arc<SyncDb>, Arc<OnePage>, ConnectorManager) {
        let db = Arc::new(SyncDb::open_in_memory().unwrap());
        let plugin = Arc::new(OnePage { uninstalls: AtomicU32::new(0) });
        let manager = ConnectorManager::new(
            db.clone(),
            Arc::new(Registry(plugin.clone())),
            Arc::new(MemoryBus::new()),
            ManagerSettings { retry: RetryPolicy { max_attempts: 1, ..Default::default() }, ..Default::default() },
            Arc::new(NoopHeartbeat),
        );
        (db, plugin, manager)
    }

    #[tokio::test]
    async fn test_install_run_and_uninstall() {
        let (db, plugin, manager) = manager();
        let id = manager.install("onepage", "main", serde_json::json!({})).await.unwrap();

        let report = manager.run_cycle(&id).await.unwrap();
        assert_eq!(report.items, 1);
        assert!(db.instances_running(&id).await.unwrap().is_none());
        assert_eq!(manager.fetch_status(&id).unwrap().total_items(), 1);

        let purged = manager.uninstall(&id).await.unwrap();
        assert!(purged > 0);
        assert_eq!(plugin.uninstalls.load(Ordering::SeqCst), 1);
        for kind in EntityKind::ALL {
            assert_eq!(db.count_by_connector(kind, &id).await.unwrap(), 0, "{kind}");
        }
        assert_eq!(manager.run_cycle(&id).await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_rejected() {
        let (_db, _plugin, manager) = manager();
        let err = manager.install("nope", "x", serde_json::Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_refuses_connector_being_deleted() {
        let (db, _plugin, manager) = manager();
        let id = manager.install("onepage", "main", serde_json::json!({})).await.unwrap();
        db.connectors_schedule_for_deletion(&id).await.unwrap();
        let err = manager.run_cycle(&id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_claim_guards_concurrent_cycles() {
        let (_db, _plugin, manager) = manager();
        let id = manager.install("onepage", "main", serde_json::json!({})).await.unwrap();
        let _flag = manager.claim(&id).unwrap();
        assert_eq!(manager.run_cycle(&id).await.unwrap_err().kind(), ErrorKind::FailedPrecondition);
        manager.release(&id);
        assert!(manager.run_cycle(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_instance_is_closed() {
        let (db, _plugin, manager) = manager();
        let id = manager.install("onepage", "main", serde_json::json!({})).await.unwrap();
        let stale = Instance::start(id.clone());
        db.instances_start(&stale).await.unwrap();

        manager.run_cycle(&id).await.unwrap();
        assert!(db.instances_running(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_waits_for_the_claim() {
        let (db, _plugin, manager) = manager();
        let id = manager.install("onepage", "main", serde_json::json!({})).await.unwrap();
        manager.run_cycle(&id).await.unwrap();

        // A cycle holds the claim: reset must not touch its checkpoints.
        let _flag = manager.claim(&id).unwrap();
        let err = manager.reset(&id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
        assert_eq!(db.count_by_connector(EntityKind::States, &id).await.unwrap(), 1);
        manager.release(&id);

        assert_eq!(manager.reset(&id).await.unwrap(), 1);
        assert!(!manager.is_running(&id));
        assert!(manager.run_cycle(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_uninstall_gives_up_on_a_cycle_that_never_stops() {
        let db = Arc::new(SyncDb::open_in_memory().unwrap());
        let plugin = Arc::new(OnePage { uninstalls: AtomicU32::new(0) });
        let manager = ConnectorManager::new(
            db.clone(),
            Arc::new(Registry(plugin.clone())),
            Arc::new(MemoryBus::new()),
            ManagerSettings {
                call_timeout: Duration::from_millis(100),
                retry: RetryPolicy { max_attempts: 1, ..Default::default() },
                ..Default::default()
            },
            Arc::new(NoopHeartbeat),
        );
        let id = manager.install("onepage", "main", serde_json::json!({})).await.unwrap();
        manager.run_cycle(&id).await.unwrap();

        let flag = manager.claim(&id).unwrap();
        let err = manager.uninstall(&id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(flag.is_cancelled());
        assert_eq!(plugin.uninstalls.load(Ordering::SeqCst), 0);
        assert_eq!(db.count_by_connector(EntityKind::Accounts, &id).await.unwrap(), 1);

        // Once the holder lets go, the retried uninstall completes.
        manager.release(&id);
        manager.uninstall(&id).await.unwrap();
        assert_eq!(db.count_by_connector(EntityKind::Accounts, &id).await.unwrap(), 0);
        assert!(!manager.is_running(&id));
    }

    #[tokio::test]
    async fn test_install_rejects_undeclared_tasks() {
        let db = Arc::new(SyncDb::open_in_memory().unwrap());
        let plugin = Arc::new(OnePage { uninstalls: AtomicU32::new(0) });
        let manager = ConnectorManager::new(
            db.clone(),
            Arc::new(AccountsOnly(Registry(plugin))),
            Arc::new(MemoryBus::new()),
            ManagerSettings::default(),
            Arc::new(NoopHeartbeat),
        );
        // OnePage declares FETCH_ACCOUNTS, which this registry does not allow.
        let err = manager.install("onepage", "main", serde_json::json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
        assert!(manager.list().await.unwrap().is_empty());
    }

    struct AccountsOnly(Registry);

    impl PluginRegistry for AccountsOnly {
        fn create(&self, provider: &str, id: &ConnectorId, config: &serde_json::Value) -> Result<Arc<dyn Plugin>> {
            self.0.create(provider, id, config)
        }

        fn page_size(&self, provider: &str) -> Option<u32> {
            self.0.page_size(provider)
        }

        fn providers(&self) -> Vec<&'static str> {
            self.0.providers()
        }

        fn check_tree(&self, provider: &str, tree: &TaskTree) -> Result<()> {
            match tree.iter().find(|n| n.task_type != TaskType::FetchBalances) {
                Some(n) => Err(SyncError::FailedPrecondition(format!(
                    "provider '{provider}' does not declare {}",
                    n.label()
                ))),
                None => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_reset_clears_checkpoints() {
        let (db, _plugin, manager) = manager();
        let id = manager.install("onepage", "main", serde_json::json!({})).await.unwrap();
        manager.run_cycle(&id).await.unwrap();
        assert_eq!(db.count_by_connector(EntityKind::States, &id).await.unwrap(), 1);

        assert_eq!(manager.reset(&id).await.unwrap(), 1);
        assert_eq!(db.count_by_connector(EntityKind::States, &id).await.unwrap(), 0);
        assert_eq!(manager.fetch_status(&id).unwrap().total_items(), 0);
        assert_eq!(db.count_by_connector(EntityKind::EventsSent, &id).await.unwrap(), 1);
    }
}
