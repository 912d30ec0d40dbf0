//! DummyPay: a file-backed provider for local runs and tests.
//!
//! Reads `accounts.json` and `balances.json` from a directory:
//! ```text
//! accounts.json: [{"id", "name", "currency", "opening_date"}]
//! balances.json: [{"account_id", "amount_in_minors", "currency"}]
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use paysync_core::error::{Result, SyncError};
use paysync_core::traits::Plugin;
use paysync_core::types::{
    Account, AccountType, Balance, FetchNextRequest, FetchPage, InstallRequest, InstallResponse,
    Payment, TaskNode, TaskType, UninstallRequest,
};

pub const NAME: &str = "dummypay";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DummyPayConfig {
    pub directory: PathBuf,
}

impl DummyPayConfig {
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|e| SyncError::InvalidArgument(format!("dummypay config: {e}")))?;
        if config.directory.as_os_str().is_empty() {
            return Err(SyncError::InvalidArgument("dummypay config: directory is required".into()));
        }
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    currency: Option<String>,
    opening_date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    account_id: String,
    amount_in_minors: i64,
    currency: String,
}

/// Index of the next account to return.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Cursor {
    next: usize,
}

pub struct DummyPay {
    directory: PathBuf,
}

impl DummyPay {
    pub fn new(config: DummyPayConfig) -> Self {
        Self { directory: config.directory }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Missing file reads as an empty list.
    async fn read_list<T: serde::de::DeserializeOwned>(&self, file: &str) -> Result<Vec<T>> {
        let path = self.directory.join(file);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SyncError::from(e).context(&format!("read {}", path.display()))),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::from(e).context(&path.display().to_string()))
    }
}

#[async_trait]
impl Plugin for DummyPay {
    fn name(&self) -> &str {
        NAME
    }

    async fn install(&self, _req: InstallRequest) -> Result<InstallResponse> {
        Ok(InstallResponse {
            tasks_tree: vec![TaskNode::new(TaskType::FetchAccounts)
                .with_children(vec![TaskNode::new(TaskType::FetchBalances)])],
            webhook_base_url: None,
        })
    }

    async fn uninstall(&self, _req: UninstallRequest) -> Result<()> {
        Ok(())
    }

    async fn fetch_next_accounts(&self, req: FetchNextRequest) -> Result<FetchPage<Account>> {
        let cursor: Cursor = match &req.state {
            Some(bytes) if !bytes.is_empty() => serde_json::from_slice(bytes)?,
            _ => Cursor::default(),
        };
        let raw: Vec<RawAccount> = self.read_list("accounts.json").await?;
        let page_size = req.page_size.max(1) as usize;
        let start = cursor.next.min(raw.len());
        let end = (start + page_size).min(raw.len());

        let items = raw[start..end]
            .iter()
            .map(|a| Account {
                reference: a.id.clone(),
                created_at: a.opening_date,
                name: a.name.clone(),
                default_asset: a.currency.clone(),
                account_type: AccountType::Internal,
                metadata: Default::default(),
                raw: serde_json::Value::Null,
            })
            .collect();
        let state = serde_json::to_vec(&Cursor { next: end })?;
        tracing::debug!("dummypay accounts [{start}..{end}) of {}", raw.len());

        if end < raw.len() {
            Ok(FetchPage::more(items, Some(state)))
        } else {
            Ok(FetchPage::last(items, Some(state)))
        }
    }

    async fn fetch_next_balances(&self, req: FetchNextRequest) -> Result<FetchPage<Balance>> {
        let parent = req.from_payload.as_ref().ok_or_else(|| {
            SyncError::InvalidArgument("dummypay balances need a parent account".into())
        })?;
        let account: Account = parent.decode()?;
        let raw: Vec<RawBalance> = self.read_list("balances.json").await?;
        let items = raw
            .into_iter()
            .filter(|b| b.account_id == account.reference)
            .map(|b| Balance {
                account_reference: b.account_id,
                asset: b.currency,
                amount: b.amount_in_minors,
                // Stamped with the account's opening date so a re-read hashes the same.
                created_at: account.created_at,
            })
            .collect();
        Ok(FetchPage::last(items, None))
    }

    async fn fetch_next_payments(&self, _req: FetchNextRequest) -> Result<FetchPage<Payment>> {
        Ok(FetchPage::last(Vec::new(), None))
    }
}
