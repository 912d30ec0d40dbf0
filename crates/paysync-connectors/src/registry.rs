//! Plugin registry: maps provider names to plugin factories.
//!
//! Every provider is a static entry; `StaticRegistry` builds plugins from it.

use std::sync::Arc;

use paysync_core::error::{Result, SyncError};
use paysync_core::traits::{Plugin, PluginRegistry};
use paysync_core::types::{ConnectorId, TaskNode, TaskTree, TaskType};

use crate::dummypay::{self, DummyPay, DummyPayConfig};

/// What a provider can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    FetchAccounts,
    FetchBalances,
    FetchExternalAccounts,
    FetchPayments,
    FetchOthers,
    CreateWebhooks,
}

impl Capability {
    /// Capability a task of this type needs.
    pub fn for_task(task_type: TaskType) -> Self {
        match task_type {
            TaskType::FetchAccounts => Capability::FetchAccounts,
            TaskType::FetchBalances => Capability::FetchBalances,
            TaskType::FetchExternalAccounts => Capability::FetchExternalAccounts,
            TaskType::FetchPayments => Capability::FetchPayments,
            TaskType::FetchOthers => Capability::FetchOthers,
            TaskType::CreateWebhooks => Capability::CreateWebhooks,
        }
    }
}

type Factory = fn(&ConnectorId, &serde_json::Value) -> Result<Arc<dyn Plugin>>;

/// Static definition of one provider.
#[derive(Clone)]
pub struct PluginDef {
    pub name: &'static str,
    /// Page size the engine asks this provider for.
    pub page_size: u32,
    pub capabilities: &'static [Capability],
    pub factory: Factory,
}

impl PluginDef {
    pub fn supports(&self, task_type: TaskType) -> bool {
        self.capabilities.contains(&Capability::for_task(task_type))
    }

    /// First node, depth first, whose task this provider does not declare.
    pub fn first_unsupported<'a>(&self, tree: &'a [TaskNode]) -> Option<&'a TaskNode> {
        tree.iter().find_map(|node| {
            if self.supports(node.task_type) {
                self.first_unsupported(&node.children)
            } else {
                Some(node)
            }
        })
    }
}

impl std::fmt::Debug for PluginDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDef")
            .field("name", &self.name)
            .field("page_size", &self.page_size)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

// ─── Provider Definitions ────────────────────────────────────────────────────

fn create_dummypay(_id: &ConnectorId, config: &serde_json::Value) -> Result<Arc<dyn Plugin>> {
    Ok(Arc::new(DummyPay::new(DummyPayConfig::from_value(config)?)))
}

static PLUGINS: &[PluginDef] = &[PluginDef {
    name: dummypay::NAME,
    page_size: 25,
    capabilities: &[Capability::FetchAccounts, Capability::FetchBalances],
    factory: create_dummypay,
}];

/// All known provider definitions.
pub fn available_plugins() -> &'static [PluginDef] {
    PLUGINS
}

/// Look up a provider definition by name.
pub fn get_plugin_def(name: &str) -> Option<&'static PluginDef> {
    PLUGINS.iter().find(|p| p.name == name)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StaticRegistry;

impl StaticRegistry {
    pub fn new() -> Self {
        Self
    }
}

impl PluginRegistry for StaticRegistry {
    fn create(&self, provider: &str, connector_id: &ConnectorId, config: &serde_json::Value) -> Result<Arc<dyn Plugin>> {
        let def = get_plugin_def(provider)
            .ok_or_else(|| SyncError::InvalidArgument(format!("unknown provider '{provider}'")))?;
        (def.factory)(connector_id, config)
    }

    fn page_size(&self, provider: &str) -> Option<u32> {
        get_plugin_def(provider).map(|p| p.page_size)
    }

    fn providers(&self) -> Vec<&'static str> {
        PLUGINS.iter().map(|p| p.name).collect()
    }

    fn check_tree(&self, provider: &str, tree: &TaskTree) -> Result<()> {
        let def = get_plugin_def(provider)
            .ok_or_else(|| SyncError::InvalidArgument(format!("unknown provider '{provider}'")))?;
        match def.first_unsupported(tree) {
            Some(node) => Err(SyncError::FailedPrecondition(format!(
                "provider '{provider}' does not declare {}",
                node.label()
            ))),
            None => Ok(()),
        }
    }
}
