//! PaySync CLI: run the sync workers or drive one-shot connector operations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use paysync_connectors::StaticRegistry;
use paysync_core::config::PaySyncConfig;
use paysync_core::traits::{NoopHeartbeat, Storage};
use paysync_core::types::{ConnectorId, EntityKind, EventId};
use paysync_scheduler::{
    build_bus, spawn_outbox_publisher, spawn_retention_cleanup, spawn_sync_loop, ConnectorManager,
    ManagerSettings, OutboxPublisher, Schedule, SyncDb,
};

#[derive(Parser)]
#[command(
    name = "paysync",
    version,
    about = "Connector synchronization scheduler with a transactional event outbox"
)]
struct Cli {
    /// Config file (defaults to ~/.paysync/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the outbox publisher, retention and every configured connector's sync loop
    Run,
    /// Install a connector
    Install {
        provider: String,
        #[arg(long)]
        name: String,
        /// Provider config as JSON
        #[arg(long, default_value = "{}")]
        config: String,
    },
    /// Run one sync cycle
    Sync { connector: String },
    /// Uninstall a connector and purge its data
    Uninstall { connector: String },
    /// Drop a connector's checkpoints so the next cycle rescans
    Reset { connector: String },
    /// Outbox maintenance
    Outbox {
        #[command(subcommand)]
        action: OutboxCommand,
    },
    /// Show a connector's last run and stored row counts
    Status { connector: String },
    /// List installed connectors
    List,
}

#[derive(Subcommand)]
enum OutboxCommand {
    /// Publish one batch of pending events
    Publish,
    /// List dead-lettered events
    DeadLetters {
        #[arg(long, default_value = "50")]
        limit: u32,
    },
    /// Put a dead-lettered event back in the queue
    Requeue {
        key: String,
        #[arg(long)]
        connector: Option<String>,
    },
    /// Delete processed events past the retention window
    Cleanup,
}

struct App {
    config: PaySyncConfig,
    db: Arc<SyncDb>,
    manager: Arc<ConnectorManager>,
    publisher: Arc<OutboxPublisher>,
}

impl App {
    fn open(config: PaySyncConfig) -> Result<Self> {
        let db_path = config.storage.resolved_path();
        let db = Arc::new(
            SyncDb::open(&db_path).with_context(|| format!("open store {}", db_path.display()))?,
        );
        let bus = build_bus(&config.bus)?;
        let manager = Arc::new(ConnectorManager::new(
            db.clone(),
            Arc::new(StaticRegistry::new()),
            bus.clone(),
            ManagerSettings::from_config(&config),
            Arc::new(NoopHeartbeat),
        ));
        let publisher = Arc::new(OutboxPublisher::new(db.clone(), bus, config.outbox.max_retries));
        Ok(Self { config, db, manager, publisher })
    }

    fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.config.outbox.retention_days) * 86_400)
    }
}

fn load_config(path: Option<&str>) -> Result<PaySyncConfig> {
    let config = match path {
        Some(p) => {
            let p = PathBuf::from(shellexpand::tilde(p).into_owned());
            PaySyncConfig::load_from(&p).with_context(|| format!("load {}", p.display()))?
        }
        None => PaySyncConfig::load()?,
    };
    Ok(config)
}

fn connector_id(s: &str) -> Result<ConnectorId> {
    s.parse::<ConnectorId>()
        .with_context(|| format!("'{s}' is not a connector id (expected provider:uuid)"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "paysync=debug,paysync_scheduler=debug,paysync_connectors=debug"
    } else {
        "paysync=info,paysync_scheduler=info,paysync_connectors=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let app = App::open(load_config(cli.config.as_deref())?)?;

    match cli.command {
        Command::Run => run(app).await?,
        Command::Install { provider, name, config } => {
            let config: serde_json::Value =
                serde_json::from_str(&config).context("--config must be valid JSON")?;
            let id = app.manager.install(&provider, &name, config).await?;
            println!("✅ Installed {name}: {id}");
        }
        Command::Sync { connector } => {
            let report = app.manager.run_cycle(&connector_id(&connector)?).await?;
            println!(
                "✅ {} pages, {} items, {} tasks in {}ms",
                report.pages,
                report.items,
                report.tasks_run,
                report.elapsed.as_millis()
            );
        }
        Command::Uninstall { connector } => {
            let purged = app.manager.uninstall(&connector_id(&connector)?).await?;
            println!("🗑️ Uninstalled {connector} ({purged} rows purged)");
        }
        Command::Reset { connector } => {
            let removed = app.manager.reset(&connector_id(&connector)?).await?;
            println!("🔄 Reset {connector} ({removed} checkpoints removed)");
        }
        Command::Outbox { action } => outbox(&app, action).await?,
        Command::Status { connector } => status(&app, &connector_id(&connector)?).await?,
        Command::List => {
            for c in app.manager.list().await? {
                let flag = if c.scheduled_for_deletion { " (deleting)" } else { "" };
                println!("{}  {}{}", c.id, c.name, flag);
            }
        }
    }
    Ok(())
}

async fn run(app: App) -> Result<()> {
    let outbox = &app.config.outbox;
    tokio::spawn(spawn_outbox_publisher(
        app.publisher.clone(),
        Schedule::Every(Duration::from_secs(outbox.poll_interval_secs)),
        outbox.batch_limit,
    ));
    tokio::spawn(spawn_retention_cleanup(
        app.publisher.clone(),
        Schedule::Every(Duration::from_secs(outbox.cleanup_interval_secs)),
        app.retention(),
    ));

    let installed = app.manager.list().await?;
    for entry in &app.config.connectors {
        let id = match installed.iter().find(|c| c.name == entry.name) {
            Some(existing) => existing.id.clone(),
            None => app
                .manager
                .install(&entry.provider, &entry.name, entry.config.clone())
                .await
                .with_context(|| format!("install connector '{}'", entry.name))?,
        };
        tokio::spawn(spawn_sync_loop(
            app.manager.clone(),
            id,
            Schedule::Every(Duration::from_secs(entry.poll_interval_secs)),
        ));
    }

    tracing::info!(
        "🚀 PaySync v{} running: {} connectors, outbox every {}s",
        env!("CARGO_PKG_VERSION"),
        app.config.connectors.len(),
        outbox.poll_interval_secs
    );
    tokio::signal::ctrl_c().await?;
    tracing::info!("👋 Shutting down");
    Ok(())
}

async fn outbox(app: &App, action: OutboxCommand) -> Result<()> {
    match action {
        OutboxCommand::Publish => {
            let r = app.publisher.publish_pending(app.config.outbox.batch_limit).await?;
            println!(
                "📤 polled {}, published {}, retrying {}, dead-lettered {}",
                r.polled, r.published, r.retried, r.dead_lettered
            );
        }
        OutboxCommand::DeadLetters { limit } => {
            for ev in app.publisher.dead_letters(limit).await? {
                println!(
                    "💀 {}  {}  retries={}  {}",
                    ev.id,
                    ev.event_type,
                    ev.retry_count,
                    ev.error.as_deref().unwrap_or("-")
                );
            }
        }
        OutboxCommand::Requeue { key, connector } => {
            let connector = connector.as_deref().map(connector_id).transpose()?;
            let id = EventId::new(key, connector);
            if app.publisher.requeue(&id).await? {
                println!("🔁 Requeued {id}");
            } else {
                anyhow::bail!("no dead-lettered event {id}");
            }
        }
        OutboxCommand::Cleanup => {
            let n = app.publisher.cleanup(app.retention()).await?;
            println!("🧹 Removed {n} processed events");
        }
    }
    Ok(())
}

async fn status(app: &App, id: &ConnectorId) -> Result<()> {
    let record = app.db.connectors_get(id).await?;
    println!("🔌 {} ({})", record.name, record.id);
    match app.db.instances_latest(id).await? {
        Some(run) => println!(
            "   last run: {} → {}  {}",
            run.started_at.to_rfc3339(),
            run.finished_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "running".into()),
            run.error.as_deref().unwrap_or("ok")
        ),
        None => println!("   never synced"),
    }
    for kind in EntityKind::ALL {
        let n = app.db.count_by_connector(kind, id).await?;
        if n > 0 {
            println!("   {:<22} {n}", kind.as_str());
        }
    }
    Ok(())
}
