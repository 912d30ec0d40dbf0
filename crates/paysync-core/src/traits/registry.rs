//! Provider lookup.

use std::sync::Arc;

use crate::error::Result;
use crate::traits::plugin::Plugin;
use crate::types::{ConnectorId, TaskTree};

/// Resolves a provider name into a live plugin instance.
pub trait PluginRegistry: Send + Sync {
    /// `InvalidArgument` for unknown providers or unusable config.
    fn create(
        &self,
        provider: &str,
        connector_id: &ConnectorId,
        config: &serde_json::Value,
    ) -> Result<Arc<dyn Plugin>>;

    /// Provider-preferred page size, if it declares one.
    fn page_size(&self, provider: &str) -> Option<u32>;

    fn providers(&self) -> Vec<&'static str>;

    /// `FailedPrecondition` if the tree schedules a task the provider does not declare.
    fn check_tree(&self, _provider: &str, _tree: &TaskTree) -> Result<()> {
        Ok(())
    }
}
