//! SQLite-backed storage for connectors, fetched data, checkpoints and the
//! event outbox. Survives restarts; a single connection behind a mutex.
//!
//! Every domain upsert writes its outbox rows inside the same transaction,
//! so a committed write always has a pending event.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction};

use paysync_core::error::{Result, SyncError};
use paysync_core::traits::Storage;
use paysync_core::types::{
    outbox_types, Account, AccountType, Balance, ConnectorId, ConnectorRecord, EntityKind, EventId,
    EventSent, FetchState, Instance, Other, OutboxEvent, OutboxStatus, Payment, StateId, TaskTree,
    WebhookConfig,
};

/// SQLite implementation of [`Storage`].
pub struct SyncDb {
    conn: Mutex<Connection>,
}

impl SyncDb {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| SyncError::Storage(format!("DB open: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::with_connection(conn)
    }

    /// Fresh database in memory. Used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SyncError::Storage(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            -- Installed connectors
            CREATE TABLE IF NOT EXISTS connectors (
                id TEXT PRIMARY KEY,             -- provider:uuid
                provider TEXT NOT NULL,
                name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                config TEXT NOT NULL DEFAULT 'null',
                webhook_base_url TEXT,
                scheduled_for_deletion INTEGER NOT NULL DEFAULT 0
            );

            -- Task tree returned by the provider on install
            CREATE TABLE IF NOT EXISTS connector_tasks_tree (
                connector_id TEXT PRIMARY KEY,
                tasks TEXT NOT NULL              -- JSON TaskTree
            );

            CREATE TABLE IF NOT EXISTS accounts (
                connector_id TEXT NOT NULL,
                reference TEXT NOT NULL,
                created_at TEXT NOT NULL,
                name TEXT,
                default_asset TEXT,
                account_type TEXT NOT NULL,      -- 'INTERNAL', 'EXTERNAL'
                metadata TEXT NOT NULL DEFAULT '{}',
                raw TEXT NOT NULL DEFAULT 'null',
                PRIMARY KEY (connector_id, reference)
            );

            CREATE TABLE IF NOT EXISTS balances (
                connector_id TEXT NOT NULL,
                account_reference TEXT NOT NULL,
                asset TEXT NOT NULL,
                amount INTEGER NOT NULL,         -- minor units
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (connector_id, account_reference, asset)
            );

            CREATE TABLE IF NOT EXISTS payments (
                connector_id TEXT NOT NULL,
                reference TEXT NOT NULL,
                data TEXT NOT NULL,              -- JSON Payment
                created_at TEXT NOT NULL,
                PRIMARY KEY (connector_id, reference)
            );

            -- Entities fetched by named FETCH_OTHERS tasks
            CREATE TABLE IF NOT EXISTS others (
                connector_id TEXT NOT NULL,
                name TEXT NOT NULL,
                id TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (connector_id, name, id)
            );

            -- Pagination checkpoints
            CREATE TABLE IF NOT EXISTS states (
                connector_id TEXT NOT NULL,
                reference TEXT NOT NULL,
                cursor BLOB,
                has_more INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (connector_id, reference)
            );

            CREATE TABLE IF NOT EXISTS webhook_configs (
                connector_id TEXT NOT NULL,
                name TEXT NOT NULL,
                url_path TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (connector_id, name)
            );

            -- One row per sync cycle
            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                connector_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                error TEXT
            );

            -- Transactional outbox
            CREATE TABLE IF NOT EXISTS outbox_events (
                idempotency_key TEXT NOT NULL,
                connector_id TEXT NOT NULL DEFAULT '',
                event_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                payload BLOB NOT NULL,
                created_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',   -- PENDING, PROCESSED, FAILED
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_retry_at TEXT,
                error TEXT,
                PRIMARY KEY (idempotency_key, connector_id)
            );
            CREATE INDEX IF NOT EXISTS idx_outbox_status_created
                ON outbox_events (status, created_at);

            -- Last content written per entity; the revision feeds the outbox key
            CREATE TABLE IF NOT EXISTS entity_revisions (
                connector_id TEXT NOT NULL,
                entity TEXT NOT NULL,            -- 'accounts', 'balances', 'payments'
                entity_id TEXT NOT NULL,
                content_key TEXT NOT NULL,
                revision INTEGER NOT NULL,
                PRIMARY KEY (connector_id, entity, entity_id)
            );

            -- Sent ledger (idempotency + audit)
            CREATE TABLE IF NOT EXISTS events_sent (
                idempotency_key TEXT NOT NULL,
                connector_id TEXT NOT NULL DEFAULT '',
                sent_at TEXT NOT NULL,
                PRIMARY KEY (idempotency_key, connector_id)
            );
         ",
            )
            .map_err(|e| SyncError::Storage(format!("Migration: {e}")))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SyncError::Storage(format!("DB lock poisoned: {e}")))
    }
}

// ─── Row helpers ───────────────────────────────────────────

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| SyncError::Storage(format!("bad timestamp '{s}': {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// Outbox and ledger rows store "no connector" as the empty string.
fn connector_col(id: &Option<ConnectorId>) -> String {
    id.as_ref().map(|c| c.to_string()).unwrap_or_default()
}

fn parse_connector_col(s: &str) -> Result<Option<ConnectorId>> {
    if s.is_empty() {
        Ok(None)
    } else {
        s.parse().map(Some)
    }
}

/// Item JSON with the owning connector attached, used as the outbox payload.
fn event_payload<T: serde::Serialize>(connector: &ConnectorId, item: &T) -> Result<Vec<u8>> {
    let mut value = serde_json::to_value(item)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("connector_id".into(), serde_json::Value::String(connector.to_string()));
    }
    Ok(serde_json::to_vec(&value)?)
}

/// Entity an outbox event describes, so saves and deletes share one revision line.
fn entity_family(event_type: &str) -> &str {
    match event_type {
        outbox_types::ACCOUNT_SAVED | outbox_types::BANK_ACCOUNT_SAVED => "accounts",
        outbox_types::BALANCE_SAVED => "balances",
        outbox_types::PAYMENT_SAVED | outbox_types::PAYMENT_DELETED => "payments",
        other => other,
    }
}

/// Drops events whose content equals the last one written for the same entity
/// and suffixes the rest with the entity's next revision. A value that returns
/// to an earlier state (100 → 200 → 100) gets a key it never had before.
fn revise_events_tx(tx: &Transaction<'_>, events: Vec<OutboxEvent>) -> Result<Vec<OutboxEvent>> {
    let mut last = tx.prepare_cached(
        "SELECT content_key, revision FROM entity_revisions
         WHERE connector_id = ?1 AND entity = ?2 AND entity_id = ?3",
    )?;
    let mut store = tx.prepare_cached(
        "INSERT INTO entity_revisions (connector_id, entity, entity_id, content_key, revision)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (connector_id, entity, entity_id) DO UPDATE SET
            content_key = excluded.content_key,
            revision = excluded.revision",
    )?;
    let mut revised = Vec::with_capacity(events.len());
    for mut ev in events {
        let connector = connector_col(&ev.id.connector_id);
        let entity = entity_family(&ev.event_type);
        let previous: Option<(String, i64)> = last
            .query_row(rusqlite::params![connector, entity, ev.entity_id], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        let revision = match previous {
            Some((content, _)) if content == ev.id.idempotency_key => continue,
            Some((_, rev)) => rev + 1,
            None => 1,
        };
        store.execute(rusqlite::params![
            connector,
            entity,
            ev.entity_id,
            ev.id.idempotency_key,
            revision
        ])?;
        ev.id.idempotency_key = format!("{}.{revision}", ev.id.idempotency_key);
        revised.push(ev);
    }
    Ok(revised)
}

fn insert_outbox_tx(tx: &Transaction<'_>, events: &[OutboxEvent]) -> Result<()> {
    let mut sent = tx.prepare_cached(
        "SELECT 1 FROM events_sent WHERE idempotency_key = ?1 AND connector_id = ?2",
    )?;
    let mut insert = tx.prepare_cached(
        "INSERT INTO outbox_events
         (idempotency_key, connector_id, event_type, entity_id, payload, created_at, status, retry_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (idempotency_key, connector_id) DO NOTHING",
    )?;
    for ev in events {
        let connector = connector_col(&ev.id.connector_id);
        if sent.exists(rusqlite::params![ev.id.idempotency_key, connector])? {
            continue;
        }
        insert.execute(rusqlite::params![
            ev.id.idempotency_key,
            connector,
            ev.event_type,
            ev.entity_id,
            ev.payload,
            ts(&ev.created_at),
            ev.status.as_str(),
            ev.retry_count,
        ])?;
    }
    Ok(())
}

type OutboxRow = (
    String,
    String,
    String,
    String,
    Vec<u8>,
    String,
    String,
    u32,
    Option<String>,
    Option<String>,
);

const OUTBOX_COLUMNS: &str = "idempotency_key, connector_id, event_type, entity_id, payload, created_at, status, retry_count, last_retry_at, error";

fn outbox_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn outbox_from_row(r: OutboxRow) -> Result<OutboxEvent> {
    let (key, connector, event_type, entity_id, payload, created_at, status, retry_count, last_retry_at, error) = r;
    Ok(OutboxEvent {
        id: EventId::new(key, parse_connector_col(&connector)?),
        event_type,
        entity_id,
        payload,
        created_at: parse_ts(&created_at)?,
        status: status.parse()?,
        retry_count,
        last_retry_at: parse_opt_ts(last_retry_at)?,
        error,
    })
}

fn query_outbox(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<OutboxEvent>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, outbox_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(outbox_from_row).collect()
}

type ConnectorRow = (String, String, String, String, Option<String>, bool);

fn connector_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectorRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get::<_, i32>(5)? != 0,
    ))
}

fn connector_from_row(r: ConnectorRow) -> Result<ConnectorRecord> {
    let (id, name, created_at, config, webhook_base_url, scheduled_for_deletion) = r;
    Ok(ConnectorRecord {
        id: id.parse()?,
        name,
        created_at: parse_ts(&created_at)?,
        config: serde_json::from_str(&config)?,
        webhook_base_url,
        scheduled_for_deletion,
    })
}

type InstanceRow = (String, String, String, Option<String>, Option<String>);

fn instance_from_row(r: InstanceRow) -> Result<Instance> {
    let (id, connector_id, started_at, finished_at, error) = r;
    Ok(Instance {
        id,
        connector_id: connector_id.parse()?,
        started_at: parse_ts(&started_at)?,
        finished_at: parse_opt_ts(finished_at)?,
        error,
    })
}

fn query_instance(conn: &Connection, sql: &str, connector: &ConnectorId) -> Result<Option<Instance>> {
    let row: Option<InstanceRow> = conn
        .query_row(sql, [connector.to_string()], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })
        .optional()?;
    row.map(instance_from_row).transpose()
}

#[async_trait]
impl Storage for SyncDb {
    // ─── Connectors ──────────────────────────────────────────

    async fn connectors_install(&self, connector: &ConnectorRecord, tree: &TaskTree) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO connectors (id, provider, name, created_at, config, webhook_base_url, scheduled_for_deletion)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (id) DO UPDATE SET config = excluded.config, webhook_base_url = excluded.webhook_base_url",
            rusqlite::params![
                connector.id.to_string(),
                connector.id.provider,
                connector.name,
                ts(&connector.created_at),
                connector.config.to_string(),
                connector.webhook_base_url,
                connector.scheduled_for_deletion as i32,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                SyncError::FailedPrecondition(format!("connector name '{}' already in use", connector.name))
            }
            other => other.into(),
        })?;
        tx.execute(
            "INSERT OR REPLACE INTO connector_tasks_tree (connector_id, tasks) VALUES (?1, ?2)",
            rusqlite::params![connector.id.to_string(), serde_json::to_string(tree)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn connectors_get(&self, id: &ConnectorId) -> Result<ConnectorRecord> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, name, created_at, config, webhook_base_url, scheduled_for_deletion
                 FROM connectors WHERE id = ?1",
                [id.to_string()],
                connector_row,
            )
            .optional()?
            .ok_or_else(|| SyncError::NotFound(format!("connector {id}")))?;
        connector_from_row(row)
    }

    async fn connectors_list(&self) -> Result<Vec<ConnectorRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, created_at, config, webhook_base_url, scheduled_for_deletion
             FROM connectors ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], connector_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(connector_from_row).collect()
    }

    async fn connectors_schedule_for_deletion(&self, id: &ConnectorId) -> Result<()> {
        let n = self.conn()?.execute(
            "UPDATE connectors SET scheduled_for_deletion = 1 WHERE id = ?1",
            [id.to_string()],
        )?;
        if n == 0 {
            return Err(SyncError::NotFound(format!("connector {id}")));
        }
        Ok(())
    }

    async fn connectors_delete(&self, id: &ConnectorId) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM connectors WHERE id = ?1", [id.to_string()])?;
        Ok(())
    }

    async fn tasks_tree_get(&self, id: &ConnectorId) -> Result<TaskTree> {
        let conn = self.conn()?;
        let json: String = conn
            .query_row(
                "SELECT tasks FROM connector_tasks_tree WHERE connector_id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| SyncError::NotFound(format!("task tree for {id}")))?;
        Ok(serde_json::from_str(&json)?)
    }

    // ─── Fetched data ────────────────────────────────────────

    async fn accounts_upsert(&self, connector: &ConnectorId, accounts: &[Account]) -> Result<()> {
        if accounts.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut events = Vec::with_capacity(accounts.len());
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO accounts
                 (connector_id, reference, created_at, name, default_asset, account_type, metadata, raw)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (connector_id, reference) DO UPDATE SET
                    name = excluded.name,
                    default_asset = excluded.default_asset,
                    account_type = excluded.account_type,
                    metadata = excluded.metadata,
                    raw = excluded.raw",
            )?;
            for acc in accounts {
                stmt.execute(rusqlite::params![
                    connector.to_string(),
                    acc.reference,
                    ts(&acc.created_at),
                    acc.name,
                    acc.default_asset,
                    acc.account_type.as_str(),
                    serde_json::to_string(&acc.metadata)?,
                    acc.raw.to_string(),
                ])?;
                let kind = match acc.account_type {
                    AccountType::Internal => outbox_types::ACCOUNT_SAVED,
                    AccountType::External => outbox_types::BANK_ACCOUNT_SAVED,
                };
                events.push(OutboxEvent::pending(
                    kind,
                    acc.reference.clone(),
                    Some(connector.clone()),
                    event_payload(connector, acc)?,
                ));
            }
        }
        let events = revise_events_tx(&tx, events)?;
        insert_outbox_tx(&tx, &events)?;
        tx.commit()?;
        Ok(())
    }

    async fn accounts_list(&self, connector: &ConnectorId) -> Result<Vec<Account>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT reference, created_at, name, default_asset, account_type, metadata, raw
             FROM accounts WHERE connector_id = ?1 ORDER BY created_at, reference",
        )?;
        let rows = stmt
            .query_map([connector.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(reference, created_at, name, default_asset, account_type, metadata, raw)| {
                Ok(Account {
                    reference,
                    created_at: parse_ts(&created_at)?,
                    name,
                    default_asset,
                    account_type: if account_type == "EXTERNAL" {
                        AccountType::External
                    } else {
                        AccountType::Internal
                    },
                    metadata: serde_json::from_str(&metadata)?,
                    raw: serde_json::from_str(&raw)?,
                })
            })
            .collect()
    }

    async fn balances_upsert(&self, connector: &ConnectorId, balances: &[Balance]) -> Result<()> {
        if balances.is_empty() {
            return Ok(());
        }
        let now = ts(&Utc::now());
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut events = Vec::with_capacity(balances.len());
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO balances (connector_id, account_reference, asset, amount, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (connector_id, account_reference, asset) DO UPDATE SET
                    amount = excluded.amount,
                    updated_at = excluded.updated_at",
            )?;
            for b in balances {
                stmt.execute(rusqlite::params![
                    connector.to_string(),
                    b.account_reference,
                    b.asset,
                    b.amount,
                    ts(&b.created_at),
                    now,
                ])?;
                events.push(OutboxEvent::pending(
                    outbox_types::BALANCE_SAVED,
                    format!("{}/{}", b.account_reference, b.asset),
                    Some(connector.clone()),
                    event_payload(connector, b)?,
                ));
            }
        }
        let events = revise_events_tx(&tx, events)?;
        insert_outbox_tx(&tx, &events)?;
        tx.commit()?;
        Ok(())
    }

    async fn payments_upsert(&self, connector: &ConnectorId, payments: &[Payment]) -> Result<()> {
        if payments.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut events = Vec::with_capacity(payments.len());
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO payments (connector_id, reference, data, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (connector_id, reference) DO UPDATE SET data = excluded.data",
            )?;
            for p in payments {
                stmt.execute(rusqlite::params![
                    connector.to_string(),
                    p.reference,
                    serde_json::to_string(p)?,
                    ts(&p.created_at),
                ])?;
                events.push(OutboxEvent::pending(
                    outbox_types::PAYMENT_SAVED,
                    p.reference.clone(),
                    Some(connector.clone()),
                    event_payload(connector, p)?,
                ));
            }
        }
        let events = revise_events_tx(&tx, events)?;
        insert_outbox_tx(&tx, &events)?;
        tx.commit()?;
        Ok(())
    }

    async fn payments_delete(&self, connector: &ConnectorId, references: &[String]) -> Result<u64> {
        if references.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut events = Vec::new();
        {
            let mut stmt = tx.prepare_cached(
                "DELETE FROM payments WHERE connector_id = ?1 AND reference = ?2",
            )?;
            for reference in references {
                if stmt.execute(rusqlite::params![connector.to_string(), reference])? == 0 {
                    continue;
                }
                let payload = serde_json::json!({
                    "connector_id": connector.to_string(),
                    "reference": reference,
                });
                events.push(OutboxEvent::pending(
                    outbox_types::PAYMENT_DELETED,
                    reference.clone(),
                    Some(connector.clone()),
                    serde_json::to_vec(&payload)?,
                ));
            }
        }
        let deleted = events.len() as u64;
        let events = revise_events_tx(&tx, events)?;
        insert_outbox_tx(&tx, &events)?;
        tx.commit()?;
        Ok(deleted)
    }

    async fn others_upsert(&self, connector: &ConnectorId, name: &str, others: &[Other]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO others (connector_id, name, id, value) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for o in others {
                stmt.execute(rusqlite::params![connector.to_string(), name, o.id, o.value.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn count_by_connector(&self, kind: EntityKind, connector: &ConnectorId) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE connector_id = ?1", kind.as_str());
        let n: i64 = self
            .conn()?
            .query_row(&sql, [connector.to_string()], |row| row.get(0))?;
        Ok(n as u64)
    }

    // ─── Checkpoints ─────────────────────────────────────────

    async fn states_get(&self, id: &StateId) -> Result<Option<FetchState>> {
        let conn = self.conn()?;
        let state = conn
            .query_row(
                "SELECT cursor, has_more FROM states WHERE connector_id = ?1 AND reference = ?2",
                rusqlite::params![id.connector_id.to_string(), id.reference],
                |row| {
                    Ok(FetchState {
                        cursor: row.get(0)?,
                        has_more: row.get::<_, i32>(1)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    async fn states_store(&self, id: &StateId, state: &FetchState) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO states (connector_id, reference, cursor, has_more, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (connector_id, reference) DO UPDATE SET
                cursor = excluded.cursor,
                has_more = excluded.has_more,
                updated_at = excluded.updated_at",
            rusqlite::params![
                id.connector_id.to_string(),
                id.reference,
                state.cursor,
                state.has_more as i32,
                ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    async fn states_delete_for_connector(&self, connector: &ConnectorId) -> Result<u64> {
        let n = self
            .conn()?
            .execute("DELETE FROM states WHERE connector_id = ?1", [connector.to_string()])?;
        Ok(n as u64)
    }

    // ─── Webhooks and run instances ──────────────────────────

    async fn webhook_configs_store(&self, connector: &ConnectorId, configs: &[WebhookConfig]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO webhook_configs (connector_id, name, url_path, metadata)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for c in configs {
                stmt.execute(rusqlite::params![
                    connector.to_string(),
                    c.name,
                    c.url_path,
                    serde_json::to_string(&c.metadata)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn webhook_configs_get(&self, connector: &ConnectorId) -> Result<Vec<WebhookConfig>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, url_path, metadata FROM webhook_configs WHERE connector_id = ?1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map([connector.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(name, url_path, metadata)| {
                Ok(WebhookConfig {
                    name,
                    url_path,
                    metadata: serde_json::from_str(&metadata)?,
                })
            })
            .collect()
    }

    async fn instances_start(&self, instance: &Instance) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO instances (id, connector_id, started_at, finished_at, error) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                instance.id,
                instance.connector_id.to_string(),
                ts(&instance.started_at),
                instance.finished_at.as_ref().map(ts),
                instance.error,
            ],
        )?;
        Ok(())
    }

    async fn instances_finish(&self, id: &str, finished_at: DateTime<Utc>, error: Option<&str>) -> Result<()> {
        self.conn()?.execute(
            "UPDATE instances SET finished_at = ?2, error = ?3 WHERE id = ?1",
            rusqlite::params![id, ts(&finished_at), error],
        )?;
        Ok(())
    }

    async fn instances_running(&self, connector: &ConnectorId) -> Result<Option<Instance>> {
        let conn = self.conn()?;
        query_instance(
            &conn,
            "SELECT id, connector_id, started_at, finished_at, error FROM instances
             WHERE connector_id = ?1 AND finished_at IS NULL
             ORDER BY started_at DESC LIMIT 1",
            connector,
        )
    }

    async fn instances_latest(&self, connector: &ConnectorId) -> Result<Option<Instance>> {
        let conn = self.conn()?;
        query_instance(
            &conn,
            "SELECT id, connector_id, started_at, finished_at, error FROM instances
             WHERE connector_id = ?1 ORDER BY started_at DESC LIMIT 1",
            connector,
        )
    }

    // ─── Outbox ──────────────────────────────────────────────

    async fn outbox_insert(&self, events: &[OutboxEvent]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        insert_outbox_tx(&tx, events)?;
        tx.commit()?;
        Ok(())
    }

    async fn outbox_poll_pending(&self, limit: u32) -> Result<Vec<OutboxEvent>> {
        let conn = self.conn()?;
        query_outbox(
            &conn,
            &format!(
                "SELECT {OUTBOX_COLUMNS} FROM outbox_events
                 WHERE status = 'PENDING' ORDER BY created_at ASC, rowid ASC LIMIT ?1"
            ),
            [limit],
        )
    }

    async fn outbox_mark_processed_and_record_sent(&self, ids: &[EventId], sent: &[EventSent]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            // Processed rows stay until retention removes them.
            let mut processed = tx.prepare_cached(
                "UPDATE outbox_events SET status = 'PROCESSED', error = NULL
                 WHERE idempotency_key = ?1 AND connector_id = ?2",
            )?;
            for id in ids {
                processed.execute(rusqlite::params![id.idempotency_key, connector_col(&id.connector_id)])?;
            }
            let mut record = tx.prepare_cached(
                "INSERT INTO events_sent (idempotency_key, connector_id, sent_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (idempotency_key, connector_id) DO NOTHING",
            )?;
            for s in sent {
                record.execute(rusqlite::params![
                    s.id.idempotency_key,
                    connector_col(&s.id.connector_id),
                    ts(&s.sent_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn outbox_mark_failed(&self, id: &EventId, new_retry_count: u32, dead_letter: bool, cause: &str) -> Result<()> {
        let status = if dead_letter { OutboxStatus::Failed } else { OutboxStatus::Pending };
        let n = self.conn()?.execute(
            "UPDATE outbox_events
             SET retry_count = ?3, status = ?4, last_retry_at = ?5, error = ?6
             WHERE idempotency_key = ?1 AND connector_id = ?2",
            rusqlite::params![
                id.idempotency_key,
                connector_col(&id.connector_id),
                new_retry_count,
                status.as_str(),
                ts(&Utc::now()),
                cause,
            ],
        )?;
        if n == 0 {
            return Err(SyncError::NotFound(format!("outbox event {id}")));
        }
        Ok(())
    }

    async fn outbox_delete_old_processed(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff = ts(&cutoff);
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let outbox = tx.execute(
            "DELETE FROM outbox_events WHERE status = 'PROCESSED' AND created_at < ?1",
            [&cutoff],
        )?;
        let sent = tx.execute("DELETE FROM events_sent WHERE sent_at < ?1", [&cutoff])?;
        tx.commit()?;
        Ok((outbox + sent) as u64)
    }

    async fn outbox_get(&self, id: &EventId) -> Result<Option<OutboxEvent>> {
        let conn = self.conn()?;
        let mut rows = query_outbox(
            &conn,
            &format!(
                "SELECT {OUTBOX_COLUMNS} FROM outbox_events
                 WHERE idempotency_key = ?1 AND connector_id = ?2"
            ),
            rusqlite::params![id.idempotency_key, connector_col(&id.connector_id)],
        )?;
        Ok(rows.pop())
    }

    async fn outbox_dead_letters(&self, limit: u32) -> Result<Vec<OutboxEvent>> {
        let conn = self.conn()?;
        query_outbox(
            &conn,
            &format!(
                "SELECT {OUTBOX_COLUMNS} FROM outbox_events
                 WHERE status = 'FAILED' ORDER BY created_at ASC, rowid ASC LIMIT ?1"
            ),
            [limit],
        )
    }

    async fn outbox_requeue(&self, id: &EventId) -> Result<bool> {
        let n = self.conn()?.execute(
            "UPDATE outbox_events SET status = 'PENDING', retry_count = 0
             WHERE idempotency_key = ?1 AND connector_id = ?2 AND status = 'FAILED'",
            rusqlite::params![id.idempotency_key, connector_col(&id.connector_id)],
        )?;
        Ok(n > 0)
    }

    // ─── Sent ledger ─────────────────────────────────────────

    async fn events_sent_exists(&self, id: &EventId) -> Result<bool> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM events_sent WHERE idempotency_key = ?1 AND connector_id = ?2",
        )?;
        Ok(stmt.exists(rusqlite::params![id.idempotency_key, connector_col(&id.connector_id)])?)
    }

    async fn events_sent_upsert(&self, record: &EventSent) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO events_sent (idempotency_key, connector_id, sent_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (idempotency_key, connector_id) DO UPDATE SET sent_at = excluded.sent_at",
            rusqlite::params![
                record.id.idempotency_key,
                connector_col(&record.id.connector_id),
                ts(&record.sent_at),
            ],
        )?;
        Ok(())
    }

    // ─── Purge ───────────────────────────────────────────────

    async fn batch_delete_by_connector(&self, kind: EntityKind, connector: &ConnectorId, batch_size: u32) -> Result<u64> {
        let table = kind.as_str();
        let sql = format!(
            "DELETE FROM {table} WHERE rowid IN
             (SELECT rowid FROM {table} WHERE connector_id = ?1 LIMIT ?2)"
        );
        let n = self
            .conn()?
            .execute(&sql, rusqlite::params![connector.to_string(), batch_size])?;
        Ok(n as u64)
    }
}
