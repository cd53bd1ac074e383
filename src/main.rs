use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use resto_print_daemon::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use resto_print_daemon::config::{self, AppConfig};
use resto_print_daemon::connectivity::ConnectivityMonitor;
use resto_print_daemon::errors;
use resto_print_daemon::health::HealthMonitor;
use resto_print_daemon::ingest::OrderIngest;
use resto_print_daemon::notification::{self, LogTransport, NotificationService, SmtpTransport};
use resto_print_daemon::offline_queue::OfflineQueue;
use resto_print_daemon::print_manager::PrintManager;
use resto_print_daemon::printer;
use resto_print_daemon::recovery::RecoveryManager;
use resto_print_daemon::store::Store;
use resto_print_daemon::api;

/// Restaurant print-service daemon: resilient ESC/POS receipt printing
/// with offline queueing, automatic recovery, and self-healing.
#[derive(Parser, Debug)]
#[command(name = "resto-print-daemon", version, about)]
struct Cli {
    /// Path to a TOML config file layered under environment variables.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Overrides RESTO_DB_PATH / the default SQLite database location.
    #[arg(long)]
    db_path: Option<std::path::PathBuf>,

    /// Address the operator/monitoring HTTP surface binds to.
    #[arg(long)]
    bind: Option<String>,
}

fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("resto-print-daemon")
        .join("logs");
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "daemon.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(tracing_subscriber::fmt::layer().with_ansi(true))
        .init();

    guard
}

/// Layers an optional TOML file's values under the environment (env wins on
/// any key both set). The config layer the ambient stack adds beyond
/// `AppConfig::from_env` alone (`SPEC_FULL.md`'s configuration section).
fn load_config(cli: &Cli) -> errors::Result<AppConfig> {
    let mut config = if let Some(path) = &cli.config {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            errors::DaemonError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        toml::from_str(&contents)
            .map_err(|e| errors::DaemonError::Config(format!("invalid config file {}: {e}", path.display())))?
    } else {
        AppConfig::default()
    };

    config.apply_env(cli.db_path.clone())?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _log_guard = init_logging();

    info!("resto-print-daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "misconfiguration, cannot start");
            std::process::exit(2);
        }
    };
    info!(db_path = %config.db_path.display(), "configuration loaded");

    let store = match Store::open(&config.db_path).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot open database, exiting");
            std::process::exit(2);
        }
    };

    let printer = match printer::build_adapter(&config) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "cannot build printer adapter, exiting");
            std::process::exit(2);
        }
    };

    let offline_queue = Arc::new(OfflineQueue::new(store.clone()));

    let transport: Arc<dyn notification::NotificationTransport> = if config.smtp.host.is_some() {
        match SmtpTransport::new(&config.smtp) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                warn!(error = %e, "SMTP configured but invalid, falling back to log transport");
                Arc::new(LogTransport)
            }
        }
    } else {
        Arc::new(LogTransport)
    };
    let notifications = Arc::new(NotificationService::with_transport(
        store.clone(),
        config.notification_enabled,
        config.smtp.to_addresses.clone(),
        transport,
    ));
    notifications.spawn();

    let circuit_registry = Arc::new(CircuitBreakerRegistry::new());
    let printer_breaker = circuit_registry
        .get_or_create("printer", CircuitBreakerConfig::PRINTER)
        .await;
    circuit_registry
        .get_or_create("external_api", CircuitBreakerConfig::EXTERNAL_API)
        .await;
    circuit_registry
        .get_or_create("smtp", CircuitBreakerConfig::SMTP)
        .await;
    circuit_registry
        .get_or_create("database", CircuitBreakerConfig::DATABASE)
        .await;

    let print_manager = Arc::new(PrintManager::with_breaker(
        store.clone(),
        printer.clone(),
        offline_queue.clone(),
        notifications.clone(),
        printer_breaker,
    ));
    if let Err(e) = print_manager.retry_manager().rehydrate().await {
        warn!(error = %e, "failed to rehydrate dead-letter queue from persisted attempts");
    }
    print_manager.start().await;

    let connectivity = Arc::new(ConnectivityMonitor::new(printer.clone(), store.clone()));
    let _connectivity_handle = connectivity.spawn();

    let health = Arc::new(HealthMonitor::new(store.clone()));
    let _health_handle = health.spawn();
    let _public_url_handle = health.clone().spawn_public_url_probe(
        config.public_domain.clone(),
        Duration::from_secs(config.public_url_timeout_secs),
        Duration::from_secs(config.public_url_check_interval_secs),
    );

    let recovery = Arc::new(RecoveryManager::new(
        store.clone(),
        offline_queue.clone(),
        printer.clone(),
        print_manager.clone(),
        notifications.clone(),
    ));
    let _recovery_trigger_handle = recovery.spawn_trigger(&connectivity);

    let ingest = Arc::new(OrderIngest::new(
        store.clone(),
        offline_queue.clone(),
        connectivity.clone(),
        notifications.clone(),
        config.clone(),
    ));

    let api_state = api::ApiState {
        ingest,
        print_manager: print_manager.clone(),
        offline_queue: offline_queue.clone(),
        recovery,
        circuit_registry,
        health,
        notifications,
        start_time: Instant::now(),
    };

    let bind_addr = cli.bind.unwrap_or_else(|| config.api_bind_addr.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = api::start_api_server(&bind_addr, api_state).await {
            error!(error = %e, "operator HTTP API server exited with an error");
        }
    });

    info!("resto-print-daemon ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install ctrl-c handler");
    }
    info!("shutdown signal received, draining");

    print_manager.stop().await;
    server_handle.abort();

    info!("resto-print-daemon stopped");
}
