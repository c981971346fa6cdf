//! ldapbridge - LDAP authentication bridge
//!
//! Operator tool for the directory bridge: validates configuration, reports
//! endpoint health, runs one-shot authentication attempts and keeps the
//! failure detector running with a Prometheus endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ldapbridge_auth::{
    AuthEngine, DirectoryClient, FallbackCache, LdapDirectoryClient, MemoryPermissionTable,
    PermissionTable,
};
use ldapbridge_core::config::{BridgeConfig, LoggingConfig};
use ldapbridge_core::types::AuthDecision;
use ldapbridge_core::ConfigStore;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ldapbridge")]
#[command(author = "ldapbridge Team")]
#[command(version = ldapbridge_core::VERSION)]
#[command(about = "Directory authentication bridge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true, env = "LDAPBRIDGE_CONFIG")]
    config: Option<String>,

    /// Override a setting, e.g. --set ldap.servers=ldap://dc1
    #[arg(long = "set", global = true, value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LDAPBRIDGE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print the effective settings
    CheckConfig,

    /// Probe every endpoint and print the health report
    Status,

    /// Run one authentication attempt
    Auth {
        #[arg(short, long)]
        username: String,

        #[arg(short, long, env = "LDAPBRIDGE_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Run the failure detector and report health periodically
    Monitor {
        /// Serve Prometheus metrics on this address
        #[arg(long, env = "LDAPBRIDGE_METRICS_ADDR")]
        metrics_addr: Option<SocketAddr>,

        /// Seconds between health reports
        #[arg(long, default_value_t = 10)]
        report_interval: u64,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::default(),
    };
    config.apply_env()?;

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.json_logs {
        config.logging.format = "json".to_string();
    }
    init_logging(&config.logging);

    for assignment in &cli.overrides {
        let (key, value) = assignment
            .split_once('=')
            .with_context(|| format!("expected KEY=VALUE, got {}", assignment))?;
        config.ldap.set(key.trim(), value)?;
    }

    match cli.command {
        Commands::CheckConfig => check_config(config),
        Commands::Status => status(config).await,
        Commands::Auth { username, password } => authenticate(config, &username, &password).await,
        Commands::Monitor {
            metrics_addr,
            report_interval,
        } => monitor(config, metrics_addr, report_interval).await,
        Commands::Version => {
            println!("ldapbridge {}", ldapbridge_core::VERSION);
            Ok(())
        }
    }
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

async fn build_engine(config: &BridgeConfig) -> anyhow::Result<AuthEngine> {
    let store = Arc::new(ConfigStore::new(config.ldap.clone())?);
    let client: Arc<dyn DirectoryClient> = Arc::new(LdapDirectoryClient::new());
    let table: Arc<dyn PermissionTable> = Arc::new(MemoryPermissionTable::new());

    let cache = match &config.ldap.fallback_cache_path {
        Some(path) => FallbackCache::open(path)
            .await
            .with_context(|| format!("opening fallback cache {}", path.display()))?,
        None => FallbackCache::in_memory(),
    };

    Ok(AuthEngine::new(store, client, table, Arc::new(cache)))
}

fn check_config(config: BridgeConfig) -> anyhow::Result<()> {
    let store = ConfigStore::new(config.ldap)?;
    for (key, value) in store.dump() {
        println!("{} = {}", key, value);
    }

    let snapshot = store.snapshot();
    if snapshot.enabled && snapshot.endpoints.is_empty() {
        warn!("Directory authentication is enabled but no servers are configured");
    }
    println!("configuration OK ({} endpoint(s))", snapshot.endpoints.len());
    Ok(())
}

async fn status(config: BridgeConfig) -> anyhow::Result<()> {
    let engine = build_engine(&config).await?;
    let status = engine.refresh_health().await;
    print!("{}", status.to_info_section());

    match engine.active_endpoint() {
        Ok(endpoint) => {
            println!("ldap_active_endpoint:{}", endpoint);
            Ok(())
        }
        Err(e) => bail!("no directory endpoint is reachable: {}", e),
    }
}

async fn authenticate(config: BridgeConfig, username: &str, password: &str) -> anyhow::Result<()> {
    let engine = build_engine(&config).await?;

    match engine.authenticate(username, password).await {
        AuthDecision::Accepted(grant) => {
            println!("accepted via {}", grant.source.as_str());
            println!("rules: {}", grant.permissions);
            Ok(())
        }
        AuthDecision::Denied(reason) => {
            println!("{}", reason.client_message());
            bail!("denied ({})", reason.as_str())
        }
    }
}

async fn monitor(
    config: BridgeConfig,
    metrics_addr: Option<SocketAddr>,
    report_interval: u64,
) -> anyhow::Result<()> {
    if let Some(addr) = metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing Prometheus exporter")?;
        info!("Serving metrics on http://{}/metrics", addr);
    }

    let engine = build_engine(&config).await?;
    engine.refresh_health().await;
    let detector = engine.spawn_failure_detector();

    let mut ticker = tokio::time::interval(Duration::from_secs(report_interval.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                print!("{}", engine.status().to_info_section());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    detector.shutdown().await;
    Ok(())
}
