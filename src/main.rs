//! vigil CLI - continuous synthetic monitoring server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use vigil::alert::{AlertSink, ChatAlertSink, EscalationClient};
use vigil::api::{self, AppState};
use vigil::artifact::ArtifactStore;
use vigil::config::{self, Config};
use vigil::domain::{self, DomainMonitor};
use vigil::heartbeat::HeartbeatScheduler;
use vigil::retention::RetentionSweeper;
use vigil::runner::RunnerPool;
use vigil::scheduler::Scheduler;
use vigil::store::Store;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Continuous synthetic monitoring server", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "vigil.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server: Registry API, Scheduler, Runner Pool, Domain Monitor,
    /// heartbeat, and retention sweep.
    Serve,

    /// Configuration file management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Tenant and API key administration
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate a configuration file
    Validate,
    /// Write a minimal starter configuration file
    Init,
}

#[derive(Subcommand)]
enum AdminAction {
    /// Create a new tenant
    CreateTenant {
        /// Display name for the tenant
        name: String,
    },
    /// Create a new API key for an existing tenant, printing the raw token once
    CreateKey {
        /// Tenant id the key belongs to
        tenant_id: uuid::Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve => serve(&cli.config).await,
        Commands::Config { action } => match action {
            ConfigAction::Validate => validate_config(&cli.config),
            ConfigAction::Init => init_config(&cli.config),
        },
        Commands::Admin { action } => admin(&cli.config, action).await,
    }
}

async fn serve(config_path: &std::path::Path) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!("loaded configuration from {}", config_path.display());

    let store = Store::connect(&config.store.sqlite_path())
        .await
        .context("failed to open store")?;
    let artifacts = ArtifactStore::new(config.store.artifacts_dir());

    let alert: Arc<dyn AlertSink> = Arc::new(ChatAlertSink::new(config.alert_transport.clone()));
    let escalation = config.escalation.clone().map(|cfg| Arc::new(EscalationClient::new(cfg)));

    let domains = domain::config::load_domains(&config.domains_config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load domain monitor configuration, starting with an empty list");
        Vec::new()
    });
    let (domains_tx, domains_rx) = tokio::sync::watch::channel(domains);

    #[cfg(unix)]
    DomainMonitor::spawn_reload_listener(config.domains_config_path.clone(), domains_tx)
        .context("failed to install SIGHUP domain reload listener")?;
    #[cfg(not(unix))]
    drop(domains_tx);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let state = Arc::new(AppState::new(
        store.clone(),
        artifacts.clone(),
        Arc::clone(&alert),
        escalation.clone(),
        config.auth.clone(),
        &config.store,
        &config.heartbeat,
    ));
    let router = api::build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "registry API listening");

    let mut server_shutdown_rx = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown_rx.changed().await;
            })
            .await
    });

    let runner_pool = Arc::new(RunnerPool::new(
        store.clone(),
        artifacts.clone(),
        Arc::clone(&alert),
        escalation.clone(),
        config.sandbox.clone(),
        &config.scheduler,
    ));
    let mut runner_handles = runner_pool.spawn_workers();
    runner_handles.push(runner_pool.spawn_lease_reclaimer());

    let scheduler = Scheduler::new(store.clone(), config.scheduler.clone());
    let scheduler_rx = shutdown_rx.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_rx).await });

    let mut domain_monitor =
        DomainMonitor::new(store.clone(), Arc::clone(&alert), escalation.clone(), config.sandbox.clone(), domains_rx);
    let domain_rx = shutdown_rx.clone();
    let domain_task = tokio::spawn(async move { domain_monitor.run(domain_rx).await });

    let heartbeat = HeartbeatScheduler::new(store.clone(), Arc::clone(&alert), config.heartbeat.clone());
    let heartbeat_rx = shutdown_rx.clone();
    let heartbeat_task = tokio::spawn(async move { heartbeat.run(heartbeat_rx).await });

    let retention = RetentionSweeper::new(store.clone(), artifacts.clone(), config.store.clone());
    let retention_rx = shutdown_rx.clone();
    let retention_task = tokio::spawn(async move { retention.run(retention_rx).await });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping background loops");
    let _ = shutdown_tx.send(true);

    for handle in runner_handles {
        handle.abort();
    }
    let _ = scheduler_task.await;
    let _ = domain_task.await;
    let _ = heartbeat_task.await;
    let _ = retention_task.await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "registry API server exited with an error"),
        Err(e) => warn!(error = %e, "registry API server task panicked"),
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn validate_config(config_path: &std::path::Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid.");
            println!();
            println!("listen_addr: {}", config.listen_addr);
            println!("store.data_dir: {}", config.store.data_dir.display());
            println!("store.run_retention_days: {}", config.store.run_retention_days);
            println!("store.artifact_retention_days: {}", config.store.artifact_retention_days);
            println!("scheduler.worker_count: {}", config.scheduler.worker_count);
            println!("scheduler.global_max_parallel: {}", config.scheduler.global_max_parallel);
            println!("heartbeat.timezone: {}", config.heartbeat.timezone);
            println!("heartbeat.anchors: {}", config.heartbeat.anchors.join(", "));
            println!("escalation: {}", if config.escalation.is_some() { "configured" } else { "disabled" });
            println!("domains_config_path: {}", config.domains_config_path.display());

            match domain::config::load_domains(&config.domains_config_path) {
                Ok(domains) => println!("domains: {} loaded", domains.len()),
                Err(e) => println!("domains: failed to load ({e})"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    }
}

fn init_config(config_path: &std::path::Path) -> Result<()> {
    if config_path.exists() {
        eprintln!("{} already exists. Remove it first or edit manually.", config_path.display());
        std::process::exit(1);
    }

    let sample = r#"# vigil configuration file
listen_addr = "0.0.0.0:8080"
domains_config_path = "domains.toml"

[store]
data_dir = "./data"
run_retention_days = 90
artifact_retention_days = 14
max_source_bytes = 262144

[scheduler]
tick_seconds = 1
global_max_parallel = 20
per_tenant_max_parallel = 4
worker_count = 4

[sandbox]
browser_executable_path = "${VIGIL_BROWSER_PATH:-/usr/bin/chromium}"
python_interpreter = "python3"
node_interpreter = "node"
grace_seconds = 5

[alert_transport]
api_base_url = "https://chat.example.com/webhook"
api_token = "${VIGIL_ALERT_TOKEN}"
chunk_max_chars = 4096

[heartbeat]
timezone = "UTC"
anchors = ["09:00"]
slowest_n = 5

[auth]
admin_token = "${VIGIL_ADMIN_TOKEN}"
monitor_token = "${VIGIL_MONITOR_TOKEN}"
"#;

    std::fs::write(config_path, sample)?;
    println!("Created {}", config_path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  vigil serve");
    Ok(())
}

async fn admin(config_path: &std::path::Path, action: AdminAction) -> Result<()> {
    let config: Config = config::load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let store = Store::connect(&config.store.sqlite_path()).await.context("failed to open store")?;

    match action {
        AdminAction::CreateTenant { name } => {
            let tenant = store.create_tenant(&name).await?;
            println!("created tenant {} ({})", tenant.id, tenant.name);
        }
        AdminAction::CreateKey { tenant_id } => {
            let (_key, raw_token) = store.create_api_key(tenant_id).await?;
            println!("created API key for tenant {tenant_id}");
            println!("token (shown once): {raw_token}");
        }
    }
    Ok(())
}
