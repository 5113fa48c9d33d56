//! Lifeline server
//!
//! Sweeps a local SQLite check-in store on an interval: escalates overdue
//! check-ins and retries failed contact deliveries. It exposes no network
//! interface of its own.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use lifeline_core::config;
use lifeline_core::escalation::{EscalationNotifier, Escalator};
use lifeline_core::store::CheckInRepository;
use lifeline_server::notify::LogNotifier;
use lifeline_server::{Reconciler, ServerDatabase};

#[derive(Parser, Debug)]
#[command(name = "lifeline-server")]
#[command(version, about = "Lifeline server - escalation sweep over a local SQLite store")]
struct Args {
    /// Path to a JSON settings file, applied over the global one.
    #[arg(long, env = "LIFELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Path to SQLite database file.
    #[arg(long, env = "LIFELINE_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Seconds between escalation sweeps.
    #[arg(long)]
    sweep_interval: Option<u64>,

    /// Seconds after the response deadline during which a code is still accepted.
    #[arg(long)]
    grace_period: Option<u64>,

    /// Attempts per contact channel before a delivery is given up.
    #[arg(long)]
    max_delivery_attempts: Option<u32>,

    /// Mark overdue check-ins as missed without contacting anyone.
    #[arg(long)]
    suppress_notifications: bool,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "LIFELINE_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "LIFELINE_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = config::load_config(args.config.as_deref())?;
    if let Some(secs) = args.sweep_interval {
        settings.reconciler.sweep_interval_secs = secs;
    }
    if let Some(secs) = args.grace_period {
        settings.checkins.grace_period_secs = secs;
    }
    if let Some(n) = args.max_delivery_attempts {
        settings.reconciler.max_delivery_attempts = n;
    }
    if let Some(level) = &args.log_level {
        settings.server.log_level.clone_from(level);
    }
    settings.notifications.suppress |= args.suppress_notifications;
    settings.validate()?;

    #[cfg(feature = "metrics")]
    let metrics_endpoint = args.metrics_endpoint.as_deref();
    #[cfg(not(feature = "metrics"))]
    let metrics_endpoint: Option<&str> = None;

    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    let log_filter = format!(
        "lifeline_server={level},lifeline_core={level}",
        level = settings.server.log_level
    );
    let _metrics_guard = lifeline_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        args.log_json,
        metrics_endpoint,
        env!("CARGO_PKG_NAME"),
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        sweep_interval_secs = settings.reconciler.sweep_interval_secs,
        grace_period_secs = settings.checkins.grace_period_secs,
        suppress = settings.notifications.suppress,
        "Starting lifeline-server"
    );

    let db_path = match args.db_path.or_else(|| settings.server.database_path.clone()) {
        Some(path) => path,
        None => config::database_path()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine data directory"))?,
    };
    info!(path = %db_path.display(), "Opening server database");
    let db = ServerDatabase::open(&db_path).await?;

    let repo = CheckInRepository::new(Arc::new(db.clone()));
    let notifier = build_notifier(&settings)?;
    let escalator = Escalator::new(repo, notifier).with_suppressed(settings.notifications.suppress);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reconciler = Reconciler::new(
        escalator,
        db,
        settings.reconciler.max_delivery_attempts,
    );
    let sweep_handle = reconciler.spawn(
        Duration::from_secs(settings.reconciler.sweep_interval_secs),
        shutdown_rx,
    );

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!("Escalation sweep running");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = sweep_handle.await;

    info!("Server stopped");
    Ok(())
}

#[cfg(feature = "http-dispatch")]
fn build_notifier(settings: &config::Config) -> anyhow::Result<Arc<dyn EscalationNotifier>> {
    let notifications = &settings.notifications;
    if notifications.email_gateway_url.is_none() && notifications.sms_gateway_url.is_none() {
        info!("No gateway configured, escalations are logged only");
        return Ok(Arc::new(LogNotifier));
    }
    let notifier = lifeline_server::notify::HttpGatewayNotifier::new(
        notifications.email_gateway_url.clone(),
        notifications.sms_gateway_url.clone(),
    )?;
    Ok(Arc::new(notifier))
}

#[cfg(not(feature = "http-dispatch"))]
#[allow(clippy::unnecessary_wraps)]
fn build_notifier(settings: &config::Config) -> anyhow::Result<Arc<dyn EscalationNotifier>> {
    let notifications = &settings.notifications;
    if notifications.email_gateway_url.is_some() || notifications.sms_gateway_url.is_some() {
        tracing::warn!("Gateway URLs set but the `http-dispatch` feature is not compiled in");
    }
    Ok(Arc::new(LogNotifier))
}
