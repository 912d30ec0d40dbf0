//! Message bus transports: where published events actually go.
//! Supports: tracing log sink, HTTP webhook, in-memory recorder.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use paysync_core::config::{BusConfig, BusKind};
use paysync_core::error::{Result, SyncError};
use paysync_core::traits::MessageBus;
use paysync_core::types::EventMessage;

/// Build the configured transport.
pub fn build_bus(config: &BusConfig) -> Result<Arc<dyn MessageBus>> {
    match config.kind {
        BusKind::Log => Ok(Arc::new(LogBus)),
        BusKind::Webhook => {
            let url = config
                .url
                .clone()
                .ok_or_else(|| SyncError::InvalidArgument("bus.url is required for the webhook bus".into()))?;
            Ok(Arc::new(WebhookBus::new(url, config.headers.clone())))
        }
    }
}

/// Writes every event to the log. Always accepts.
pub struct LogBus;

#[async_trait]
impl MessageBus for LogBus {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, message: &EventMessage) -> Result<()> {
        tracing::info!(
            "📨 {} {} ({})",
            message.event_type,
            message.idempotency_key,
            message.payload
        );
        Ok(())
    }
}

/// POSTs each event as JSON, carrying the idempotency key as a header so
/// the receiver can drop duplicates.
pub struct WebhookBus {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
}

impl WebhookBus {
    pub fn new(url: String, headers: HashMap<String, String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            headers,
        }
    }
}

#[async_trait]
impl MessageBus for WebhookBus {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn publish(&self, message: &EventMessage) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", message.idempotency_key.as_str())
            .json(message)
            .timeout(Duration::from_secs(10));
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            tracing::debug!("✅ Webhook accepted {} ({status})", message.idempotency_key);
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        let detail = format!("webhook {} returned {status}: {body}", self.url);
        match status.as_u16() {
            401 => Err(SyncError::Unauthenticated(detail)),
            403 => Err(SyncError::PermissionDenied(detail)),
            408 | 429 => Err(SyncError::Transient(detail)),
            s if (400..500).contains(&s) => Err(SyncError::InvalidArgument(detail)),
            _ => Err(SyncError::Transient(detail)),
        }
    }
}

/// Records messages in memory. Individual keys (or everything) can be made
/// to fail with a transient error.
#[derive(Default)]
pub struct MemoryBus {
    published: Mutex<Vec<EventMessage>>,
    failing_keys: Mutex<HashSet<String>>,
    fail_all: Mutex<bool>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every publish for `key` fails until [`recover`](Self::recover) is called.
    pub fn fail_key(&self, key: &str) {
        if let Ok(mut keys) = self.failing_keys.lock() {
            keys.insert(key.to_string());
        }
    }

    pub fn recover(&self, key: &str) {
        if let Ok(mut keys) = self.failing_keys.lock() {
            keys.remove(key);
        }
    }

    pub fn set_fail_all(&self, fail: bool) {
        if let Ok(mut f) = self.fail_all.lock() {
            *f = fail;
        }
    }

    pub fn published(&self) -> Vec<EventMessage> {
        self.published.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.published.lock().map(|m| m.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(&self, message: &EventMessage) -> Result<()> {
        let fail_all = self.fail_all.lock().map(|f| *f).unwrap_or(false);
        let fail_key = self
            .failing_keys
            .lock()
            .map(|k| k.contains(&message.idempotency_key))
            .unwrap_or(false);
        if fail_all || fail_key {
            return Err(SyncError::Transient(format!(
                "memory bus rejected {}",
                message.idempotency_key
            )));
        }
        self.published
            .lock()
            .map_err(|e| SyncError::Transient(format!("memory bus poisoned: {e}")))?
            .push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_bus_records_and_fails_on_demand() {
        let bus = MemoryBus::new();
        let msg = EventMessage::new("k1", "SAVED_PAYMENT", serde_json::json!({}));
        bus.publish(&msg).await.unwrap();
        assert_eq!(bus.count(), 1);

        bus.fail_key("k1");
        let err = bus.publish(&msg).await.unwrap_err();
        assert!(err.is_retryable());
        bus.recover("k1");
        bus.publish(&msg).await.unwrap();
        assert_eq!(bus.published().len(), 2);
    }

    #[tokio::test]
    async fn test_log_bus_accepts() {
        let msg = EventMessage::new("k", "CONNECTOR_RESET", serde_json::json!({"a": 1}));
        assert!(LogBus.publish(&msg).await.is_ok());
    }

    #[test]
    fn test_build_bus_from_config() {
        let bus = build_bus(&BusConfig::default()).unwrap();
        assert_eq!(bus.name(), "log");

        let cfg = BusConfig { kind: BusKind::Webhook, url: None, headers: HashMap::new() };
        assert!(build_bus(&cfg).is_err());

        let cfg = BusConfig {
            kind: BusKind::Webhook,
            url: Some("http://127.0.0.1:9/events".into()),
            headers: HashMap::new(),
        };
        assert_eq!(build_bus(&cfg).unwrap().name(), "webhook");
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_transient() {
        let bus = WebhookBus::new("http://127.0.0.1:9/events".into(), HashMap::new());
        let msg = EventMessage::new("k", "SAVED_ACCOUNT", serde_json::json!({}));
        let err = bus.publish(&msg).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
