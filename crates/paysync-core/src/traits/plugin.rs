//! Provider plugin contract.
//!
//! Every method has a default body returning `Unimplemented`, so a provider
//! only overrides what it supports. The scheduler treats that error as a
//! permanent capability gap, never as something to retry.

use async_trait::async_trait;

use crate::error::{Result, SyncError};
use crate::types::{
    Account, Balance, CreateWebhooksRequest, CreateWebhooksResponse, FetchNextRequest, FetchPage,
    InstallRequest, InstallResponse, Other, Payment, UninstallRequest,
};

fn unimplemented<T>(op: &str) -> Result<T> {
    Err(SyncError::Unimplemented(op.to_string()))
}

#[async_trait]
pub trait Plugin: Send + Sync {
    /// Provider name, e.g. "dummypay".
    fn name(&self) -> &str;

    /// Returns the task tree the scheduler will walk for this connector.
    async fn install(&self, _req: InstallRequest) -> Result<InstallResponse> {
        unimplemented("install")
    }

    async fn uninstall(&self, _req: UninstallRequest) -> Result<()> {
        unimplemented("uninstall")
    }

    async fn fetch_next_accounts(&self, _req: FetchNextRequest) -> Result<FetchPage<Account>> {
        unimplemented("fetch_next_accounts")
    }

    async fn fetch_next_balances(&self, _req: FetchNextRequest) -> Result<FetchPage<Balance>> {
        unimplemented("fetch_next_balances")
    }

    async fn fetch_next_external_accounts(
        &self,
        _req: FetchNextRequest,
    ) -> Result<FetchPage<Account>> {
        unimplemented("fetch_next_external_accounts")
    }

    async fn fetch_next_payments(&self, _req: FetchNextRequest) -> Result<FetchPage<Payment>> {
        unimplemented("fetch_next_payments")
    }

    /// `name` is the `FetchOthers` node name.
    async fn fetch_next_others(
        &self,
        _name: &str,
        _req: FetchNextRequest,
    ) -> Result<FetchPage<Other>> {
        unimplemented("fetch_next_others")
    }

    async fn create_webhooks(&self, _req: CreateWebhooksRequest) -> Result<CreateWebhooksResponse> {
        unimplemented("create_webhooks")
    }
}
