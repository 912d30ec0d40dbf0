//! Sync Engine: walks a connector's task tree and drives its plugin page by page.
//!
//! ```text
//!   worklist (LIFO)          plugin                storage
//!   ┌──────────────┐   fetch_next_*(cursor)   ┌──────────────┐
//!   │ job: node,   │ ───────────────────────▶ │ upsert items │
//!   │ parent, cur  │ ◀── items, cursor, more  │ + outbox     │
//!   └──────────────┘                          │ checkpoint   │
//!     ▲   push continuation (if more)         └──────────────┘
//!     └── push one child job per (item × child node), on top
//! ```
//!
//! Children of page N run before page N+1 of their parent is requested, so
//! the engine never holds more than one parent page in memory. Each child job
//! owns its own checkpoint, keyed by node path and parent reference.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use paysync_core::cancel::CancelFlag;
use paysync_core::error::{Result, SyncError};
use paysync_core::traits::{Plugin, Storage};
use paysync_core::types::{
    AccountType, ConnectorId, CreateWebhooksRequest, FetchNextRequest, FetchPage, FetchState,
    FetchedItem, FromPayload, StateId, TaskNode, TaskTree, TaskType,
};

/// Per-connector engine settings.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub page_size: u32,
    pub call_timeout: Duration,
    pub webhook_base_url: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            page_size: 25,
            call_timeout: Duration::from_secs(30),
            webhook_base_url: None,
        }
    }
}

/// Progress of one cursor loop, keyed by its state reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchProgress {
    pub pages_fetched: u64,
    pub total_items: u64,
    pub has_more: bool,
}

/// Snapshot of every cursor loop this engine has touched.
#[derive(Debug, Clone, Default)]
pub struct FetchStatus {
    pub tasks: BTreeMap<String, FetchProgress>,
}

impl FetchStatus {
    pub fn total_items(&self) -> u64 {
        self.tasks.values().map(|p| p.total_items).sum()
    }

    pub fn total_pages(&self) -> u64 {
        self.tasks.values().map(|p| p.pages_fetched).sum()
    }
}

/// What one cycle (or one task subtree) did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub pages: u64,
    pub items: u64,
    /// Cursor loops started, including every per-item child instance.
    pub tasks_run: u64,
    pub webhooks_created: u64,
    pub elapsed: Duration,
}

impl CycleReport {
    fn absorb(&mut self, other: CycleReport) {
        self.pages += other.pages;
        self.items += other.items;
        self.tasks_run += other.tasks_run;
        self.webhooks_created += other.webhooks_created;
    }
}

/// One pending unit of work: the next page of one node for one parent item.
struct Job<'t> {
    node: &'t TaskNode,
    path: String,
    parent: Option<FromPayload>,
    state_ref: String,
    /// Cursor for the next request. Only meaningful once `loaded`.
    cursor: Option<Vec<u8>>,
    /// Whether the stored checkpoint has been read for this loop.
    loaded: bool,
    page: u64,
}

impl<'t> Job<'t> {
    fn new(node: &'t TaskNode, path: String, parent: Option<FromPayload>) -> Self {
        let state_ref = state_reference(node, &path, parent.as_ref());
        Self {
            node,
            path,
            parent,
            state_ref,
            cursor: None,
            loaded: false,
            page: 0,
        }
    }
}

/// `<node-path>/<TASK_KIND>[:<name>]`, suffixed with `-<parent reference>` for child instances.
pub fn state_reference(node: &TaskNode, path: &str, parent: Option<&FromPayload>) -> String {
    match parent {
        Some(p) => format!("{path}/{}-{}", node.label(), p.id),
        None => format!("{path}/{}", node.label()),
    }
}

/// Outcome of one page, independent of the item type.
struct PageOutcome {
    seeds: Vec<FromPayload>,
    count: usize,
    new_state: Option<Vec<u8>>,
    has_more: bool,
}

impl PageOutcome {
    fn from_page<T: FetchedItem>(page: &FetchPage<T>, with_seeds: bool) -> Result<Self> {
        let seeds = if with_seeds {
            page.items.iter().map(FromPayload::from_item).collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        Ok(Self {
            seeds,
            count: page.items.len(),
            new_state: page.new_state.clone(),
            has_more: page.has_more,
        })
    }
}

/// The task-tree interpreter for one connector.
pub struct SyncEngine {
    connector_id: ConnectorId,
    plugin: Arc<dyn Plugin>,
    storage: Arc<dyn Storage>,
    options: EngineOptions,
    cancel: CancelFlag,
    status: Mutex<BTreeMap<String, FetchProgress>>,
}

impl SyncEngine {
    pub fn new(
        connector_id: ConnectorId,
        plugin: Arc<dyn Plugin>,
        storage: Arc<dyn Storage>,
        options: EngineOptions,
    ) -> Self {
        Self {
            connector_id,
            plugin,
            storage,
            options,
            cancel: CancelFlag::new(),
            status: Mutex::new(BTreeMap::new()),
        }
    }

    /// Share an externally owned cancellation flag.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn connector_id(&self) -> &ConnectorId {
        &self.connector_id
    }

    /// Run every root node in declaration order. Fails fast on the first error;
    /// checkpoints already written are kept so the next cycle resumes from them.
    pub async fn run_cycle(&self, tree: &TaskTree) -> Result<CycleReport> {
        let started = Instant::now();
        tracing::info!(
            "🔄 Sync cycle started for {} ({} root tasks)",
            self.connector_id,
            tree.len()
        );

        let mut report = CycleReport::default();
        for (idx, node) in tree.iter().enumerate() {
            match self.execute_task(node, &idx.to_string(), None).await {
                Ok(r) => report.absorb(r),
                Err(e) => {
                    tracing::warn!(
                        "⚠️ Sync cycle aborted for {} at {} [{}]: {e}",
                        self.connector_id,
                        node.label(),
                        e.reason()
                    );
                    return Err(e);
                }
            }
        }

        report.elapsed = started.elapsed();
        tracing::info!(
            "✅ Sync cycle finished for {}: {} tasks, {} pages, {} items in {}ms",
            self.connector_id,
            report.tasks_run,
            report.pages,
            report.items,
            report.elapsed.as_millis()
        );
        Ok(report)
    }

    /// Run one node (and every child it instantiates) to completion.
    /// `node_path` identifies the node's position in the tree, e.g. "0" or "1.0".
    pub async fn execute_task(
        &self,
        node: &TaskNode,
        node_path: &str,
        parent: Option<FromPayload>,
    ) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let mut worklist = vec![Job::new(node, node_path.to_string(), parent)];

        while let Some(mut job) = worklist.pop() {
            self.cancel.check(&format!("sync of {} at {}", self.connector_id, job.state_ref))?;

            if !job.node.task_type.is_paginated() {
                report.tasks_run += 1;
                report.webhooks_created += self.create_webhooks(&job).await? as u64;
                continue;
            }

            if !job.loaded {
                let stored = self.load_state(&job.state_ref).await?;
                // A finished scan with children starts over so every known
                // parent feeds its children again; leaf scans stay incremental.
                job.cursor = match stored {
                    Some(s) if s.has_more || job.node.children.is_empty() => s.cursor,
                    _ => None,
                };
                job.loaded = true;
                report.tasks_run += 1;
            }

            let req = FetchNextRequest {
                from_payload: job.parent.clone(),
                state: job.cursor.clone(),
                page_size: self.options.page_size,
            };
            let outcome = self.fetch_page(job.node, req).await.map_err(|e| {
                tracing::warn!("⚠️ {} failed [{}]: {e}", job.state_ref, e.reason());
                e.context(&job.state_ref)
            })?;

            job.page += 1;
            report.pages += 1;
            report.items += outcome.count as u64;
            tracing::debug!(
                "📄 {} page {}: {} items, has_more={}",
                job.state_ref,
                job.page,
                outcome.count,
                outcome.has_more
            );

            if outcome.has_more && (outcome.new_state.is_none() || outcome.new_state == job.cursor) {
                return Err(SyncError::FailedPrecondition(format!(
                    "{}: has_more is set but the cursor did not advance",
                    job.state_ref
                )));
            }

            self.checkpoint(&job.state_ref, &outcome).await?;
            self.record_progress(&job.state_ref, &outcome);

            let node = job.node;
            let path = job.path.as_str();
            let children: Vec<Job<'_>> = outcome
                .seeds
                .iter()
                .flat_map(|seed| {
                    node.children.iter().enumerate().map(move |(i, child)| {
                        Job::new(child, format!("{path}.{i}"), Some(seed.clone()))
                    })
                })
                .collect();

            if outcome.has_more {
                job.cursor = outcome.new_state;
                worklist.push(job);
            }
            // Reversed so the first item's first child is popped next.
            worklist.extend(children.into_iter().rev());
        }

        Ok(report)
    }

    /// Current progress of every loop this engine has run.
    pub fn fetch_status(&self) -> FetchStatus {
        let tasks = self
            .status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone());
        FetchStatus { tasks }
    }

    /// Forget in-memory progress (stored checkpoints are untouched).
    pub fn reset_fetch_status(&self) {
        match self.status.lock() {
            Ok(mut s) => s.clear(),
            Err(e) => e.into_inner().clear(),
        }
    }

    // ─── Page handling ──────────────────────────────────────

    async fn fetch_page(&self, node: &TaskNode, req: FetchNextRequest) -> Result<PageOutcome> {
        let with_seeds = !node.children.is_empty();
        let connector = &self.connector_id;
        match node.task_type {
            TaskType::FetchAccounts => {
                let page = self.call(self.plugin.fetch_next_accounts(req)).await?;
                self.storage.accounts_upsert(connector, &page.items).await?;
                PageOutcome::from_page(&page, with_seeds)
            }
            TaskType::FetchExternalAccounts => {
                let mut page = self.call(self.plugin.fetch_next_external_accounts(req)).await?;
                for acc in &mut page.items {
                    acc.account_type = AccountType::External;
                }
                self.storage.accounts_upsert(connector, &page.items).await?;
                PageOutcome::from_page(&page, with_seeds)
            }
            TaskType::FetchBalances => {
                let page = self.call(self.plugin.fetch_next_balances(req)).await?;
                self.storage.balances_upsert(connector, &page.items).await?;
                PageOutcome::from_page(&page, with_seeds)
            }
            TaskType::FetchPayments => {
                let page = self.call(self.plugin.fetch_next_payments(req)).await?;
                self.storage.payments_upsert(connector, &page.items).await?;
                if !page.deleted.is_empty() {
                    let n = self.storage.payments_delete(connector, &page.deleted).await?;
                    tracing::debug!("🗑️ {n} payments removed upstream for {connector}");
                }
                PageOutcome::from_page(&page, with_seeds)
            }
            TaskType::FetchOthers => {
                let name = if node.name.is_empty() { "default" } else { node.name.as_str() };
                let page = self.call(self.plugin.fetch_next_others(name, req)).await?;
                self.storage.others_upsert(connector, name, &page.items).await?;
                PageOutcome::from_page(&page, with_seeds)
            }
            TaskType::CreateWebhooks => Err(SyncError::InvalidArgument(
                "CREATE_WEBHOOKS is not a paginated task".into(),
            )),
        }
    }

    async fn create_webhooks(&self, job: &Job<'_>) -> Result<usize> {
        let base = self.options.webhook_base_url.clone().ok_or_else(|| {
            SyncError::FailedPrecondition(format!(
                "{}: connector has no webhook base url",
                job.state_ref
            ))
        })?;
        let resp = self
            .call(self.plugin.create_webhooks(CreateWebhooksRequest {
                connector_id: self.connector_id.clone(),
                from_payload: job.parent.clone(),
                webhook_base_url: base,
            }))
            .await
            .map_err(|e| e.context(&job.state_ref))?;
        self.storage
            .webhook_configs_store(&self.connector_id, &resp.configs)
            .await?;
        tracing::info!(
            "🪝 {} webhook configs stored for {}",
            resp.configs.len(),
            self.connector_id
        );
        Ok(resp.configs.len())
    }

    /// Plugin call bounded by the per-call timeout; a timeout is transient.
    async fn call<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.options.call_timeout, fut).await?
    }

    async fn load_state(&self, reference: &str) -> Result<Option<FetchState>> {
        self.storage
            .states_get(&StateId {
                connector_id: self.connector_id.clone(),
                reference: reference.to_string(),
            })
            .await
    }

    async fn checkpoint(&self, reference: &str, outcome: &PageOutcome) -> Result<()> {
        let state = FetchState {
            cursor: outcome.new_state.clone(),
            has_more: outcome.has_more,
        };
        self.storage
            .states_store(
                &StateId {
                    connector_id: self.connector_id.clone(),
                    reference: reference.to_string(),
                },
                &state,
            )
            .await?;
        tracing::debug!("💾 Checkpoint {reference} (has_more={})", state.has_more);
        Ok(())
    }

    fn record_progress(&self, reference: &str, outcome: &PageOutcome) {
        let mut status = match self.status.lock() {
            Ok(s) => s,
            Err(e) => e.into_inner(),
        };
        let entry = status.entry(reference.to_string()).or_default();
        entry.pages_fetched += 1;
        entry.total_items += outcome.count as u64;
        entry.has_more = outcome.has_more;
    }
}
