//! SSO/CSO Sentinel: binary entrypoint
//! Loads config, starts the poll scheduler, and serves /health, /sources, /metrics.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sso_sentinel::api::{create_router, AppState};
use sso_sentinel::health::HealthRegistry;
use sso_sentinel::ingest::config::load_config_default;
use sso_sentinel::ingest::providers::echo_sso::EchoSsoClient;
use sso_sentinel::ingest::scheduler::{spawn_scheduler, SchedulerCtx};
use sso_sentinel::ingest::sink::{EventSink, JsonLinesSink, LogSink};
use sso_sentinel::poller::Poller;
use sso_sentinel::state_store::JsonFileStateStore;
use sso_sentinel::telemetry::Telemetry;

/// Compact logs by default; `SENTINEL_LOG_JSON=1` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sso_sentinel=info,ingest=info,warn"));

    let json = std::env::var("SENTINEL_LOG_JSON")
        .ok()
        .is_some_and(|v| v == "1");

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = load_config_default().context("loading poller config")?;
    let sources = cfg.resolved_sources();
    tracing::info!(
        sources = sources.len(),
        interval_secs = cfg.scheduler.interval_secs,
        "starting sentinel"
    );

    let telemetry = Telemetry::init(cfg.scheduler.interval_secs)?;

    let mut pollers = Vec::with_capacity(sources.len());
    for src in sources {
        tracing::info!(source = %src.name, endpoint = %src.echo.endpoint, "registering source");
        let client = EchoSsoClient::from_config(src.name.clone(), src.echo)
            .with_context(|| format!("building ECHO client for {}", src.name))?;
        pollers.push(Poller::new(Arc::new(client), src.severity));
    }

    let sink: Arc<dyn EventSink> = match std::env::var("SENTINEL_EVENTS_PATH") {
        Ok(p) if !p.trim().is_empty() => Arc::new(JsonLinesSink::new(p)),
        _ => Arc::new(LogSink),
    };

    let health = Arc::new(HealthRegistry::new());
    let ctx = Arc::new(SchedulerCtx::new(
        Arc::new(JsonFileStateStore::new(cfg.scheduler.state_dir.clone())),
        sink,
        health.clone(),
        cfg.health.clone(),
        cfg.scheduler.interval_secs,
    ));
    let _tasks = spawn_scheduler(pollers, ctx);

    let app = create_router(AppState {
        health,
        metrics: Some(telemetry.handle),
    });

    let bind = std::env::var("SENTINEL_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(%bind, "operator endpoints listening");
    axum::serve(listener, app).await.context("http server")?;
    Ok(())
}
